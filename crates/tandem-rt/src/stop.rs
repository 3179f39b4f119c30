// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative stop signal.
//!
//! A unit channel that is only ever closed, never sent on. Closing it wakes
//! every task selecting on it. Nothing stops on its own: a task has to
//! include the signal in its selects to be stoppable at all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::channel::{self, Channel, Receiver};

/// Broadcast stop flag shared between a controller and its tasks.
#[derive(Debug, Clone)]
pub struct StopSignal {
    channel: Channel<()>,
    stopped: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            channel: channel::unbuffered(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request a stop. Idempotent; returns `true` for the call that did it.
    pub fn stop(&self) -> bool {
        let first = self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.channel.close();
        }
        first
    }

    /// Check if a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Receiver that yields `None` once stopped. Use it as a select case.
    pub fn receiver(&self) -> Receiver<()> {
        self.channel.receiver()
    }

    /// Park until stopped.
    pub fn wait(&self) {
        while self.channel.recv().is_some() {}
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
