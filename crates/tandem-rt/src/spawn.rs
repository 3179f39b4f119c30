// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Spawn/join/detach.
//!
//! One OS thread per task. The thread runs the closure under `catch_unwind`
//! while holding a processor slot, so a panicking task (including a `Fatal`
//! usage violation) fails alone and its handle reports why.
//!
//! There is no cancel: a task blocked on a channel can only be resumed by a
//! peer completing the operation. Cooperative stopping goes through
//! `StopSignal`.

use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::context::{self, TaskContext};
use crate::error::JoinError;
use crate::park::{deadline_after, lock, Parker, Wake, WaitList, WaitOp};
use crate::registry::Outcome;
use crate::runtime::Shared;

/// Process-unique task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

struct CompletionState<T> {
    result: Option<Result<T, JoinError>>,
    done: bool,
    waiters: WaitList,
}

/// Result slot shared between the running task and its handle.
struct Completion<T> {
    state: Mutex<CompletionState<T>>,
}

impl<T> Completion<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState {
                result: None,
                done: false,
                waiters: WaitList::new(),
            }),
        }
    }

    fn set(&self, result: Result<T, JoinError>) {
        let mut st = lock(&self.state);
        st.result = Some(result);
        st.done = true;
        st.waiters.notify_all();
    }

    /// Park until done or until `deadline`. Returns whether it is done.
    fn wait(&self, task: TaskId, deadline: Option<std::time::Instant>) -> bool {
        let parker = context::parker();
        let mut st = lock(&self.state);
        loop {
            if st.done {
                return true;
            }
            st.waiters.register(&parker);
            drop(st);
            let wake = context::block(WaitOp::TaskJoin { task }, deadline);
            st = lock(&self.state);
            st.waiters.unregister(&parker);
            if wake == Wake::TimedOut && !st.done {
                return false;
            }
        }
    }
}

/// Affine task handle.
///
/// Must be consumed via `join()` or `detach()`; dropping it otherwise panics.
pub struct TaskHandle<T> {
    id: TaskId,
    completion: Arc<Completion<T>>,
    consumed: bool,
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the task to complete, returning its result.
    pub fn join(mut self) -> Result<T, JoinError> {
        self.consumed = true;
        self.completion.wait(self.id, None);
        lock(&self.completion.state)
            .result
            .take()
            .unwrap_or_else(|| {
                Err(JoinError::Panicked(
                    "task completed without producing a result".to_string(),
                ))
            })
    }

    /// Bounded wait. Returns `true` if the task finished within `timeout`;
    /// the handle stays usable either way.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.completion.wait(self.id, Some(deadline_after(timeout)))
    }

    /// Check if the task has completed (non-blocking).
    pub fn is_finished(&self) -> bool {
        lock(&self.completion.state).done
    }

    /// Fire-and-forget. The task keeps running (or stays blocked).
    pub fn detach(mut self) {
        self.consumed = true;
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if !self.consumed && !thread::panicking() {
            panic!(
                "TaskHandle for {} dropped without being joined or detached",
                self.id
            );
        }
    }
}

/// Spawn a task thread on `shared`. Registration happens before the thread
/// starts, so the task is visible (as runnable) immediately.
pub(crate) fn spawn_task<T, F>(
    shared: &Arc<Shared>,
    name: Option<String>,
    origin: &'static Location<'static>,
    f: F,
) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let id = TaskId::next();
    let parker = Parker::new();
    let completion = Arc::new(Completion::new());

    shared
        .registry
        .register(id, name.clone(), origin, parker.clone());
    tracing::debug!(task = %id, name = name.as_deref().unwrap_or(""), %origin, "task spawned");

    let ctx = TaskContext {
        id,
        shared: shared.clone(),
    };
    let slot = completion.clone();
    let thread_name = name.unwrap_or_else(|| format!("tandem-{}", id.0));
    let body = move || {
        let shared = ctx.shared.clone();
        let _guard = context::enter(parker, ctx);
        shared.procs.acquire();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
        shared.procs.release();

        let (result, outcome) = match result {
            Ok(val) => (Ok(val), Outcome::Completed),
            Err(payload) => {
                let err = JoinError::from_panic(payload);
                tracing::warn!(task = %id, error = %err, "task failed");
                (Err(err), Outcome::Failed)
            }
        };
        shared.registry.deregister(id, outcome);
        slot.set(result);
    };

    if let Err(e) = thread::Builder::new().name(thread_name).spawn(body) {
        // Thread creation failed: report it through the handle.
        shared.registry.deregister(id, Outcome::Failed);
        completion.set(Err(JoinError::Panicked(format!(
            "failed to spawn task thread: {}",
            e
        ))));
    }

    TaskHandle {
        id,
        completion,
        consumed: false,
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{Fatal, JoinError};
    use crate::{channel, Runtime, RuntimeConfig};
    use std::time::Duration;

    fn rt() -> Runtime {
        Runtime::new(RuntimeConfig::default().with_procs(2))
    }

    #[test]
    fn spawn_and_join() {
        let h = rt().spawn(|| 42);
        assert_eq!(h.join().unwrap(), 42);
    }

    #[test]
    fn spawn_and_detach() {
        let h = rt().spawn(|| {
            std::thread::sleep(Duration::from_millis(10));
        });
        h.detach();
    }

    #[test]
    fn spawn_panic_returns_join_error() {
        let h = rt().spawn(|| -> i32 { panic!("boom") });
        match h.join() {
            Err(JoinError::Panicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn usage_violation_fails_only_that_task() {
        let rt = rt();
        let ch = channel::buffered::<i32>(1);
        ch.close();
        let tx = ch.sender();
        let h = rt.spawn(move || tx.send(1));
        match h.join() {
            Err(JoinError::Fatal(Fatal::SendOnClosed { channel })) => assert_eq!(channel, ch.id()),
            other => panic!("expected SendOnClosed, got {:?}", other),
        }
        assert_eq!(rt.stats().failed, 1);
    }

    #[test]
    fn wait_timeout_on_blocked_task() {
        let rt = rt();
        let ch = channel::unbuffered::<i32>();
        let rx = ch.receiver();
        let h = rt.spawn(move || rx.recv());
        assert!(!h.wait_timeout(Duration::from_millis(20)));
        assert!(!h.is_finished());
        ch.send(3);
        assert_eq!(h.join().unwrap(), Some(3));
    }

    #[test]
    #[should_panic(expected = "dropped without being joined or detached")]
    fn dropping_handle_panics() {
        let h = rt().spawn(|| ());
        drop(h);
    }
}
