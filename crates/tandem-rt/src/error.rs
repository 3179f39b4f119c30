// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error types.
//!
//! `Fatal` is the typed panic payload for usage violations: it terminates the
//! offending task and is recovered as `JoinError::Fatal` by whoever joins it.
//! Everything else is an ordinary `Result` error.

use thiserror::Error;

use crate::channel::ChannelId;
use crate::group::GroupId;
use crate::registry::TaskSnapshot;

/// Unrecoverable misuse of a coordination primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fatal {
    #[error("send on closed channel {channel}")]
    SendOnClosed { channel: ChannelId },
    #[error("close of closed channel {channel}")]
    CloseOfClosed { channel: ChannelId },
    #[error("member {member} of group {group} signalled completion twice")]
    DoubleDone { group: GroupId, member: usize },
    #[error("all tasks are asleep - deadlock!")]
    Deadlock,
}

/// Terminate the current task with a usage violation.
///
/// Never call while holding an internal lock: the unwind would poison it.
#[track_caller]
pub(crate) fn raise(fatal: Fatal) -> ! {
    tracing::debug!(error = %fatal, "raising fatal error");
    std::panic::panic_any(fatal)
}

/// Error returned by `TaskHandle::join()` when the task did not complete.
#[derive(Debug, Clone, Error)]
pub enum JoinError {
    /// Task panicked with the given message.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// Task was terminated by a usage violation or a declared deadlock.
    #[error("task failed: {0}")]
    Fatal(Fatal),
}

impl JoinError {
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        match payload.downcast::<Fatal>() {
            Ok(fatal) => JoinError::Fatal(*fatal),
            Err(payload) => JoinError::Panicked(panic_message(payload.as_ref())),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Failure of `Runtime::block_on`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Every live task was parked with no way to make progress.
    #[error("all tasks are asleep - deadlock! ({} tasks blocked)", blocked.len())]
    Deadlock { blocked: Vec<TaskSnapshot> },
    #[error("root task failed: {0}")]
    Fatal(Fatal),
    #[error("root task panicked: {0}")]
    Panicked(String),
    #[error("block_on called while a root task is already running")]
    Nested,
}

/// Invalid runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: expected a non-negative integer, got {value:?}")]
    NotANumber { var: &'static str, value: String },
    #[error("{var}: expected on/off, got {value:?}")]
    NotASwitch { var: &'static str, value: String },
    #[error("watchdog interval must be at least 1ms")]
    ZeroInterval,
}
