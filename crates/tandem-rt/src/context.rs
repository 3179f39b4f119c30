// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-thread execution context.
//!
//! A thread running a task carries its parker and a handle to the runtime
//! that spawned it. Threads the runtime did not create get a bare parker on
//! first use, so every primitive also works from plain `std::thread`s; those
//! threads are invisible to the liveness monitor.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{raise, Fatal};
use crate::park::{Parker, Wake, WaitOp};
use crate::runtime::Shared;
use crate::spawn::TaskId;

#[derive(Clone)]
pub(crate) struct TaskContext {
    pub id: TaskId,
    pub shared: Arc<Shared>,
}

#[derive(Clone)]
struct Current {
    parker: Arc<Parker>,
    task: Option<TaskContext>,
}

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

fn current() -> Current {
    CURRENT.with(|cell| {
        cell.borrow_mut()
            .get_or_insert_with(|| Current {
                parker: Parker::new(),
                task: None,
            })
            .clone()
    })
}

/// The calling thread's parker.
pub(crate) fn parker() -> Arc<Parker> {
    current().parker
}

/// The task context of the calling thread, if it runs inside a runtime.
pub(crate) fn task() -> Option<TaskContext> {
    CURRENT.with(|cell| cell.borrow().as_ref().and_then(|c| c.task.clone()))
}

/// Id of the task running on this thread.
pub fn current_task() -> Option<TaskId> {
    task().map(|t| t.id)
}

/// Restores the previous context when dropped.
pub(crate) struct EnterGuard {
    prev: Option<Current>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|cell| *cell.borrow_mut() = prev);
    }
}

/// Install `parker` and `task` as the calling thread's context.
pub(crate) fn enter(parker: Arc<Parker>, task: TaskContext) -> EnterGuard {
    let prev = CURRENT.with(|cell| {
        cell.borrow_mut().replace(Current {
            parker,
            task: Some(task),
        })
    });
    EnterGuard { prev }
}

/// Suspend the calling thread on `op`.
///
/// Inside a runtime the task gives up its processor slot while parked and
/// takes one back before returning. If the runtime declared a deadlock while
/// we were parked, the task fails here.
pub(crate) fn block(op: WaitOp, deadline: Option<Instant>) -> Wake {
    let Current { parker, task } = current();
    let Some(task) = task else {
        return parker.park(op, deadline);
    };

    task.shared.procs.release();
    let wake = parker.park(op, deadline);
    task.shared.procs.acquire();

    if task.shared.is_deadlocked() {
        raise(Fatal::Deadlock);
    }
    wake
}
