// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleep and one-shot timers.
//!
//! Both are timed parks, so a sleeping task never looks stuck to the
//! liveness monitor.

use std::time::Duration;

use crate::channel::{self, Receiver};
use crate::context;
use crate::park::{deadline_after, Wake, WaitOp};

/// Sleep the current task for the given duration.
///
/// Releases the task's processor slot while asleep.
pub fn sleep(duration: Duration) {
    let deadline = deadline_after(duration);
    while context::block(WaitOp::Sleep, Some(deadline)) != Wake::TimedOut {}
}

/// Create a one-shot timer that fires after `duration`.
///
/// Returns a `Receiver<()>` that receives `()` after the delay. The timer
/// never blocks on delivery (capacity 1), so dropping the receiver is fine.
/// Inside a runtime the timer runs as a task of that runtime.
#[track_caller]
pub fn after(duration: Duration) -> Receiver<()> {
    let (tx, rx) = channel::buffered(1).split();
    let fire = move || {
        sleep(duration);
        tx.send(());
    };
    match context::task() {
        Some(task) => crate::Runtime::from_shared(task.shared)
            .spawn_named("timer", fire)
            .detach(),
        None => {
            std::thread::spawn(fire);
        }
    }
    rx
}

/// Timeout error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

impl std::fmt::Display for TimedOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation timed out")
    }
}

impl std::error::Error for TimedOut {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn sleep_short() {
        let start = Instant::now();
        sleep(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(9));
    }

    #[test]
    fn after_fires() {
        let rx = after(Duration::from_millis(10));
        assert_eq!(rx.recv(), Some(()));
    }

    #[test]
    fn after_does_not_fire_early() {
        let rx = after(Duration::from_millis(200));
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), Err(TimedOut));
    }
}
