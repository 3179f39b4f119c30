// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime: hosts tasks on OS threads and watches for whole-runtime deadlock.
//!
//! Every task holds one of `procs` processor slots while it runs and gives it
//! back whenever it parks, so the slot count bounds parallelism without ever
//! being the reason a program cannot make progress.
//!
//! While a root task (`block_on`) is active, a monitor thread scans the
//! registry every watchdog interval. If every live task is parked without a
//! deadline and nothing changed between two scans, no task can ever wake
//! another: the runtime is deadlocked. Parked tasks are then woken and fail
//! with `Fatal::Deadlock`, and `block_on` reports the snapshot taken at
//! detection time.

use std::fmt;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;

use crate::config::RuntimeConfig;
use crate::context::{self, TaskContext};
use crate::error::{ConfigError, Fatal, JoinError, RuntimeError};
use crate::introspect::Profile;
use crate::park::{lock, Parker};
use crate::registry::{Outcome, Registry, RuntimeStats, Scan, TaskSnapshot};
use crate::spawn::{spawn_task, TaskHandle, TaskId};

/// Counting semaphore over processor slots.
pub(crate) struct Processors {
    limit: usize,
    busy: Mutex<usize>,
    cvar: Condvar,
}

impl Processors {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            busy: Mutex::new(0),
            cvar: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut busy = lock(&self.busy);
        while *busy >= self.limit {
            busy = self.cvar.wait(busy).unwrap_or_else(PoisonError::into_inner);
        }
        *busy += 1;
    }

    pub fn release(&self) {
        let mut busy = lock(&self.busy);
        *busy = busy.saturating_sub(1);
        self.cvar.notify_one();
    }
}

/// State behind every `Runtime` clone and every task context.
pub(crate) struct Shared {
    pub config: RuntimeConfig,
    pub procs: Processors,
    pub registry: Registry,
    deadlocked: AtomicBool,
    deadlock: Mutex<Option<Vec<TaskSnapshot>>>,
    root_active: AtomicBool,
}

impl Shared {
    pub fn is_deadlocked(&self) -> bool {
        self.deadlocked.load(Ordering::Acquire)
    }

    /// Two scans one interval apart, both all-stuck and identical.
    fn stuck_across(&self, interval: Duration, pause: impl FnOnce(Duration) -> bool) -> bool {
        let first: Scan = self.registry.scan();
        if !first.all_stuck {
            return false;
        }
        if !pause(interval) {
            return false;
        }
        let second = self.registry.scan();
        second.all_stuck && second == first
    }

    fn declare_deadlock(&self) {
        let blocked = self.registry.snapshot();
        tracing::error!(tasks = blocked.len(), "all tasks are asleep - deadlock!");
        for task in &blocked {
            if let Some(op) = task.state.wait_op() {
                tracing::error!(task = %task.id, origin = %task.origin, %op, "blocked");
            }
        }
        *lock(&self.deadlock) = Some(blocked);
        self.deadlocked.store(true, Ordering::Release);
        self.registry.unpark_all();
    }

    fn take_deadlock(&self) -> Vec<TaskSnapshot> {
        lock(&self.deadlock).take().unwrap_or_default()
    }
}

/// Result of `Runtime::liveness`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Some task is running, runnable, or parked with a deadline.
    Progressing,
    /// Every live task is parked and none can wake another.
    Deadlocked,
}

/// Stop flag the monitor sleeps on, so shutdown does not wait out an interval.
struct MonitorStop {
    stopped: Mutex<bool>,
    cvar: Condvar,
}

impl MonitorStop {
    /// Sleep for `d`. Returns `false` if stopped meanwhile.
    fn pause(&self, d: Duration) -> bool {
        let stopped = lock(&self.stopped);
        let (stopped, _) = self
            .cvar
            .wait_timeout_while(stopped, d, |s| !*s)
            .unwrap_or_else(PoisonError::into_inner);
        !*stopped
    }

    fn stop(&self) {
        *lock(&self.stopped) = true;
        self.cvar.notify_all();
    }
}

struct Monitor {
    stop: Arc<MonitorStop>,
    thread: JoinHandle<()>,
}

impl Monitor {
    fn start(shared: &Arc<Shared>) -> Option<Self> {
        let stop = Arc::new(MonitorStop {
            stopped: Mutex::new(false),
            cvar: Condvar::new(),
        });
        let weak = Arc::downgrade(shared);
        let interval = shared.config.watchdog_interval;
        let flag = stop.clone();
        match thread::Builder::new()
            .name("tandem-monitor".to_string())
            .spawn(move || monitor_loop(weak, flag, interval))
        {
            Ok(thread) => Some(Self { stop, thread }),
            Err(e) => {
                tracing::warn!(error = %e, "liveness monitor not started");
                None
            }
        }
    }

    fn shutdown(self) {
        self.stop.stop();
        let _ = self.thread.join();
    }
}

fn monitor_loop(shared: Weak<Shared>, stop: Arc<MonitorStop>, interval: Duration) {
    while stop.pause(interval) {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.stuck_across(interval, |d| stop.pause(d)) {
            shared.declare_deadlock();
            return;
        }
    }
}

/// Handle to a runtime. Clones share the same tasks and processors.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("procs", &self.shared.procs.limit)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let procs = Processors::new(config.effective_procs());
        Self {
            shared: Arc::new(Shared {
                config,
                procs,
                registry: Registry::new(),
                deadlocked: AtomicBool::new(false),
                deadlock: Mutex::new(None),
                root_active: AtomicBool::new(false),
            }),
        }
    }

    /// Runtime configured from the `TANDEM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        RuntimeConfig::from_env().map(Self::new)
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Number of processor slots.
    pub fn procs(&self) -> usize {
        self.shared.procs.limit
    }

    /// Run `f` as the root task on the calling thread.
    ///
    /// Returns when `f` returns; other tasks are not waited for. Fails with
    /// `RuntimeError::Deadlock` if every task, the root included, ended up
    /// parked for good.
    #[track_caller]
    pub fn block_on<T, F>(&self, f: F) -> Result<T, RuntimeError>
    where
        F: FnOnce() -> T,
    {
        let shared = &self.shared;
        if shared
            .root_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RuntimeError::Nested);
        }
        shared.deadlocked.store(false, Ordering::Release);
        lock(&shared.deadlock).take();

        let id = TaskId::next();
        let parker = Parker::new();
        shared
            .registry
            .register(id, Some("root".to_string()), Location::caller(), parker.clone());
        let monitor = if shared.config.deadlock_detection {
            Monitor::start(shared)
        } else {
            None
        };

        let result = {
            let _guard = context::enter(
                parker,
                TaskContext {
                    id,
                    shared: shared.clone(),
                },
            );
            shared.procs.acquire();
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            shared.procs.release();
            result
        };

        let outcome = if result.is_ok() {
            Outcome::Completed
        } else {
            Outcome::Failed
        };
        shared.registry.deregister(id, outcome);
        if let Some(monitor) = monitor {
            monitor.shutdown();
        }
        shared.root_active.store(false, Ordering::Release);

        result.map_err(|payload| match JoinError::from_panic(payload) {
            JoinError::Fatal(Fatal::Deadlock) => RuntimeError::Deadlock {
                blocked: shared.take_deadlock(),
            },
            JoinError::Fatal(fatal) => RuntimeError::Fatal(fatal),
            JoinError::Panicked(msg) => RuntimeError::Panicked(msg),
        })
    }

    /// Spawn a task. The caller's location is recorded as its origin.
    #[track_caller]
    pub fn spawn<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        spawn_task(&self.shared, None, Location::caller(), f)
    }

    #[track_caller]
    pub fn spawn_named<T, F>(&self, name: impl Into<String>, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        spawn_task(&self.shared, Some(name.into()), Location::caller(), f)
    }

    /// Every live task and what it is blocked on.
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.shared.registry.snapshot()
    }

    pub fn profile(&self) -> Profile {
        Profile::from_snapshot(&self.snapshot())
    }

    /// On-demand deadlock check. Blocks the caller for one watchdog interval
    /// and fails nobody.
    pub fn liveness(&self) -> Liveness {
        let interval = self.shared.config.watchdog_interval;
        let stuck = self.shared.stuck_across(interval, |d| {
            thread::sleep(d);
            true
        });
        if stuck {
            Liveness::Deadlocked
        } else {
            Liveness::Progressing
        }
    }

    pub fn stats(&self) -> RuntimeStats {
        self.shared.registry.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::error::RuntimeError;

    fn rt() -> Runtime {
        Runtime::new(RuntimeConfig::default().with_procs(2))
    }

    #[test]
    fn block_on_returns_value() {
        assert_eq!(rt().block_on(|| 7).unwrap(), 7);
    }

    #[test]
    fn root_sees_its_own_context() {
        let rt = rt();
        let inside = rt.block_on(context::current_task).unwrap();
        assert!(inside.is_some());
        assert!(context::current_task().is_none());
    }

    #[test]
    fn nested_block_on_is_rejected() {
        let rt = rt();
        let inner = rt.clone();
        let result = rt.block_on(move || inner.block_on(|| ()).map(|_| ()));
        assert!(matches!(result, Ok(Err(RuntimeError::Nested))));
    }

    #[test]
    fn root_panic_is_reported() {
        let result = rt().block_on(|| -> () { panic!("root boom") });
        match result {
            Err(RuntimeError::Panicked(msg)) => assert!(msg.contains("root boom")),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn lone_root_recv_deadlocks() {
        let rt = rt();
        let result = rt.block_on(|| {
            let ch = channel::unbuffered::<i32>();
            ch.recv()
        });
        match result {
            Err(RuntimeError::Deadlock { blocked }) => {
                assert_eq!(blocked.len(), 1);
                assert_eq!(blocked[0].name.as_deref(), Some("root"));
            }
            other => panic!("expected Deadlock, got {:?}", other),
        }
        // The runtime is usable again afterwards.
        assert_eq!(rt.block_on(|| 1).unwrap(), 1);
    }

    #[test]
    fn single_processor_still_progresses() {
        let rt = Runtime::new(RuntimeConfig::default().with_procs(1));
        let total = rt
            .block_on(|| {
                let (tx, rx) = channel::unbuffered::<u32>().split();
                let h = rt.spawn(move || {
                    for i in 0..10 {
                        tx.send(i);
                    }
                    tx.close();
                });
                let sum: u32 = rx.into_iter().sum();
                h.join().unwrap();
                sum
            })
            .unwrap();
        assert_eq!(total, 45);
    }

    #[test]
    fn liveness_sees_parked_pair() {
        let rt = rt();
        let a = channel::unbuffered::<()>();
        let b = channel::unbuffered::<()>();
        let (ra, rb) = (a.receiver(), b.receiver());
        let h1 = rt.spawn(move || ra.recv());
        let h2 = rt.spawn(move || rb.recv());
        while rt.snapshot().iter().any(|t| !t.state.is_blocked()) {
            std::thread::yield_now();
        }
        assert_eq!(rt.liveness(), Liveness::Deadlocked);
        a.close();
        b.close();
        assert_eq!(h1.join().unwrap(), None);
        assert_eq!(h2.join().unwrap(), None);
        assert_eq!(rt.liveness(), Liveness::Progressing);
    }

    #[test]
    fn processors_bound_parallelism() {
        let procs = Arc::new(Processors::new(1));
        procs.acquire();
        let p = procs.clone();
        let t = std::thread::spawn(move || {
            p.acquire();
            p.release();
        });
        std::thread::sleep(Duration::from_millis(10));
        assert!(!t.is_finished());
        procs.release();
        t.join().unwrap();
    }
}
