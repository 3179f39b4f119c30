// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Parking: the one way a task suspends.
//!
//! Each thread owns a `Parker` (a wake token plus what the thread is blocked
//! on). Primitives keep a `WaitList` of parkers inside their own lock and
//! unpark all of them on every state change; waiters re-check their condition
//! in a loop, so spurious wakeups are harmless.
//!
//! The parker state is what the registry reads for introspection and what the
//! liveness monitor reads to decide whether a task is stuck.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::channel::ChannelId;
use crate::group::GroupId;
use crate::spawn::TaskId;

/// Lock, recovering the guard if another task panicked while holding it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The blocking operation a parked task is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WaitOp {
    Send { channel: ChannelId },
    Recv { channel: ChannelId },
    Select { channels: Vec<ChannelId> },
    GroupJoin { group: GroupId },
    TaskJoin { task: TaskId },
    Sleep,
}

impl fmt::Display for WaitOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitOp::Send { channel } => write!(f, "chan send ({})", channel),
            WaitOp::Recv { channel } => write!(f, "chan receive ({})", channel),
            WaitOp::Select { channels } if channels.is_empty() => write!(f, "select (no cases)"),
            WaitOp::Select { channels } => {
                write!(f, "select (")?;
                for (i, c) in channels.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", c)?;
                }
                write!(f, ")")
            }
            WaitOp::GroupJoin { group } => write!(f, "group join ({})", group),
            WaitOp::TaskJoin { task } => write!(f, "task join ({})", task),
            WaitOp::Sleep => write!(f, "sleep"),
        }
    }
}

/// Why `park` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Notified,
    TimedOut,
}

/// What a parked thread is doing, as seen from outside.
#[derive(Debug, Clone)]
pub(crate) struct Blocked {
    pub op: WaitOp,
    pub since: Instant,
    pub deadline: Option<Instant>,
}

/// Point-in-time view of a parker, read by the registry.
#[derive(Debug, Clone)]
pub(crate) struct ParkProbe {
    pub blocked: Option<Blocked>,
    pub notified: bool,
    /// Bumped on every park entry, park exit, and unpark.
    pub epoch: u64,
}

impl ParkProbe {
    /// Parked with no deadline and no wake pending: nothing but another task
    /// can ever resume it.
    pub fn is_stuck(&self) -> bool {
        !self.notified
            && self
                .blocked
                .as_ref()
                .map(|b| b.deadline.is_none())
                .unwrap_or(false)
    }
}

struct ParkState {
    notified: bool,
    blocked: Option<Blocked>,
    epoch: u64,
}

/// Per-thread wake token.
pub(crate) struct Parker {
    state: Mutex<ParkState>,
    cvar: Condvar,
}

impl fmt::Debug for Parker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let probe = self.probe();
        f.debug_struct("Parker")
            .field("blocked", &probe.blocked.map(|b| b.op))
            .field("notified", &probe.notified)
            .finish()
    }
}

impl Parker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ParkState {
                notified: false,
                blocked: None,
                epoch: 0,
            }),
            cvar: Condvar::new(),
        })
    }

    /// Set the wake token. A later `park` returns immediately.
    pub fn unpark(&self) {
        let mut st = lock(&self.state);
        st.notified = true;
        st.epoch += 1;
        self.cvar.notify_one();
    }

    /// Sleep until unparked or until `deadline`. Consumes the wake token.
    pub fn park(&self, op: WaitOp, deadline: Option<Instant>) -> Wake {
        let mut st = lock(&self.state);
        st.epoch += 1;
        if st.notified {
            st.notified = false;
            return Wake::Notified;
        }
        st.blocked = Some(Blocked {
            op,
            since: Instant::now(),
            deadline,
        });

        let wake = loop {
            if st.notified {
                break Wake::Notified;
            }
            match deadline {
                None => {
                    st = self.cvar.wait(st).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Wake::TimedOut;
                    }
                    st = self
                        .cvar
                        .wait_timeout(st, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        };

        st.notified = false;
        st.blocked = None;
        st.epoch += 1;
        wake
    }

    pub fn probe(&self) -> ParkProbe {
        let st = lock(&self.state);
        ParkProbe {
            blocked: st.blocked.clone(),
            notified: st.notified,
            epoch: st.epoch,
        }
    }
}

/// Parkers waiting on one primitive. Lives inside that primitive's lock.
#[derive(Debug, Default)]
pub(crate) struct WaitList {
    waiters: Vec<Arc<Parker>>,
}

impl WaitList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, parker: &Arc<Parker>) {
        if !self.waiters.iter().any(|w| Arc::ptr_eq(w, parker)) {
            self.waiters.push(parker.clone());
        }
    }

    pub fn unregister(&mut self, parker: &Arc<Parker>) {
        self.waiters.retain(|w| !Arc::ptr_eq(w, parker));
    }

    pub fn notify_all(&self) {
        for w in &self.waiters {
            w.unpark();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }
}

/// Deadline `d` from now, saturating far in the future instead of overflowing.
pub(crate) fn deadline_after(d: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(d)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}
