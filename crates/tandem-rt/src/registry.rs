// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Live task registry.
//!
//! Tasks register at spawn and deregister at exit. The registry never decides
//! anything by itself; it answers two questions: "what is every live task
//! doing right now" (snapshots, for introspection) and "is every live task
//! parked with nobody left to wake it" (scans, for the liveness monitor).

use std::collections::BTreeMap;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::park::{lock, Parker, WaitOp};
use crate::spawn::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Failed,
}

/// What a live task is doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    /// Running, or waiting for a processor slot.
    Runnable,
    /// Parked on a blocking operation.
    Blocked {
        op: WaitOp,
        blocked_ms: u64,
        /// A deadline will resume it even if no peer does.
        timed: bool,
    },
}

impl TaskState {
    pub fn is_blocked(&self) -> bool {
        matches!(self, TaskState::Blocked { .. })
    }

    /// Blocked with no deadline.
    pub fn is_parked_forever(&self) -> bool {
        matches!(self, TaskState::Blocked { timed: false, .. })
    }

    pub fn wait_op(&self) -> Option<&WaitOp> {
        match self {
            TaskState::Blocked { op, .. } => Some(op),
            TaskState::Runnable => None,
        }
    }
}

/// Point-in-time view of one live task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: Option<String>,
    /// `file:line` of the spawn call.
    pub origin: String,
    pub state: TaskState,
    pub age_ms: u64,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
    pub live: usize,
}

struct Entry {
    name: Option<String>,
    origin: &'static Location<'static>,
    parker: Arc<Parker>,
    started: Instant,
}

/// Result of one liveness scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Scan {
    /// Every live task parked untimed with no wake pending.
    pub all_stuck: bool,
    /// `(task, parker epoch)` for every live task, in id order.
    pub epochs: Vec<(TaskId, u64)>,
}

#[derive(Default)]
pub(crate) struct Registry {
    tasks: Mutex<BTreeMap<TaskId, Entry>>,
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        id: TaskId,
        name: Option<String>,
        origin: &'static Location<'static>,
        parker: Arc<Parker>,
    ) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
        lock(&self.tasks).insert(
            id,
            Entry {
                name,
                origin,
                parker,
                started: Instant::now(),
            },
        );
    }

    pub fn deregister(&self, id: TaskId, outcome: Outcome) {
        lock(&self.tasks).remove(&id);
        match outcome {
            Outcome::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
            Outcome::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        tracing::debug!(task = %id, ?outcome, "task exited");
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let now = Instant::now();
        lock(&self.tasks)
            .iter()
            .map(|(id, e)| {
                let probe = e.parker.probe();
                let state = match probe.blocked {
                    Some(b) => TaskState::Blocked {
                        op: b.op,
                        blocked_ms: now.saturating_duration_since(b.since).as_millis() as u64,
                        timed: b.deadline.is_some(),
                    },
                    None => TaskState::Runnable,
                };
                TaskSnapshot {
                    id: *id,
                    name: e.name.clone(),
                    origin: format!("{}:{}", e.origin.file(), e.origin.line()),
                    state,
                    age_ms: now.saturating_duration_since(e.started).as_millis() as u64,
                }
            })
            .collect()
    }

    pub fn scan(&self) -> Scan {
        let tasks = lock(&self.tasks);
        let mut all_stuck = !tasks.is_empty();
        let mut epochs = Vec::with_capacity(tasks.len());
        for (id, e) in tasks.iter() {
            let probe = e.parker.probe();
            all_stuck &= probe.is_stuck();
            epochs.push((*id, probe.epoch));
        }
        Scan { all_stuck, epochs }
    }

    /// Wake every live task.
    pub fn unpark_all(&self) {
        let parkers: Vec<Arc<Parker>> = lock(&self.tasks).values().map(|e| e.parker.clone()).collect();
        for p in parkers {
            p.unpark();
        }
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            spawned: self.spawned.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            live: lock(&self.tasks).len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::park::WaitOp;

    #[test]
    fn register_and_deregister() {
        let reg = Registry::new();
        let id = TaskId::next();
        reg.register(id, Some("t".into()), Location::caller(), Parker::new());
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].state, TaskState::Runnable);
        assert_eq!(snap[0].name.as_deref(), Some("t"));
        assert!(snap[0].origin.contains("registry.rs"));

        reg.deregister(id, Outcome::Completed);
        assert!(reg.snapshot().is_empty());
        let stats = reg.stats();
        assert_eq!((stats.spawned, stats.completed, stats.live), (1, 1, 0));
    }

    #[test]
    fn empty_registry_is_not_stuck() {
        assert!(!Registry::new().scan().all_stuck);
    }

    #[test]
    fn scan_sees_parked_task() {
        let reg = Registry::new();
        let parker = Parker::new();
        reg.register(TaskId::next(), None, Location::caller(), parker.clone());
        assert!(!reg.scan().all_stuck);

        let p = parker.clone();
        let t = std::thread::spawn(move || p.park(WaitOp::Sleep, None));
        while parker.probe().blocked.is_none() {
            std::thread::yield_now();
        }
        let first = reg.scan();
        assert!(first.all_stuck);
        assert_eq!(first, reg.scan());
        assert!(reg.snapshot()[0].state.is_parked_forever());

        reg.unpark_all();
        t.join().unwrap();
        assert!(!reg.scan().all_stuck);
    }
}
