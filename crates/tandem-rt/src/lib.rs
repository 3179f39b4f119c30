// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tandem: in-process task coordination runtime.
//!
//! Tasks are OS threads multiplexed over a configurable number of processor
//! slots. They coordinate only through the primitives here; there is no
//! ambient global state, so every component takes its `Runtime` explicitly.
//!
//! Components:
//! - runtime/spawn: task lifecycle, processors, whole-runtime deadlock check
//! - channel/select: bounded and rendezvous channels, multi-way waits
//! - time: sleep and one-shot timers
//! - pipeline: source/transform/sink stages over channels
//! - group: fan-out with exactly-once completion and join
//! - turn: strict A/B turn alternation over token channels
//! - stop: opt-in cooperative stop signal
//! - registry/introspect: live task snapshots and profiles
//!
//! Blocked operations never time out on their own. A task parked on a
//! channel nobody will ever serve stays parked: a leak, visible in
//! `Runtime::snapshot()` but not repaired. Only when every task is parked
//! that way does the runtime step in and fail them all with a deadlock.

pub mod channel;
pub mod config;
mod context;
pub mod error;
pub mod group;
pub mod introspect;
mod park;
pub mod pipeline;
pub mod registry;
pub mod runtime;
pub mod select;
pub mod spawn;
pub mod stop;
pub mod time;
pub mod turn;

pub use channel::{buffered, unbuffered, Channel, ChannelId, Receiver, Sender};
pub use config::RuntimeConfig;
pub use context::current_task;
pub use error::{ConfigError, Fatal, JoinError, RuntimeError};
pub use group::{Done, Group, GroupId};
pub use introspect::{Profile, ProfileGroup};
pub use park::WaitOp;
pub use pipeline::{Stage, StageError, StageReport};
pub use registry::{RuntimeStats, TaskSnapshot, TaskState};
pub use runtime::{Liveness, Runtime};
pub use select::{Select, Selected};
pub use spawn::{TaskHandle, TaskId};
pub use stop::StopSignal;
pub use time::TimedOut;
pub use turn::{Alternation, Alternator, Flow, Handoff, Side};
