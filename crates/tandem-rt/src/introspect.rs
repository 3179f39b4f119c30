// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task profiles.
//!
//! Built from a registry snapshot: live tasks grouped by spawn origin and by
//! what they are doing, largest group first. Rendered as text for people and
//! as JSON for tools.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::registry::{TaskSnapshot, TaskState};
use crate::spawn::TaskId;

/// Tasks sharing one origin and one state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileGroup {
    pub count: usize,
    pub origin: String,
    /// `runnable`, or the blocking operation.
    pub state: String,
    /// Longest time any member has been parked.
    pub max_blocked_ms: u64,
    pub tasks: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub total: usize,
    pub groups: Vec<ProfileGroup>,
}

fn state_label(state: &TaskState) -> String {
    match state {
        TaskState::Runnable => "runnable".to_string(),
        TaskState::Blocked {
            op, timed: false, ..
        } => op.to_string(),
        TaskState::Blocked { op, timed: true, .. } => format!("{} [timed]", op),
    }
}

impl Profile {
    pub fn from_snapshot(snapshot: &[TaskSnapshot]) -> Self {
        let mut groups: BTreeMap<(String, String), ProfileGroup> = BTreeMap::new();
        for task in snapshot {
            let state = state_label(&task.state);
            let blocked_ms = match task.state {
                TaskState::Blocked { blocked_ms, .. } => blocked_ms,
                TaskState::Runnable => 0,
            };
            let group = groups
                .entry((task.origin.clone(), state.clone()))
                .or_insert_with(|| ProfileGroup {
                    count: 0,
                    origin: task.origin.clone(),
                    state,
                    max_blocked_ms: 0,
                    tasks: Vec::new(),
                });
            group.count += 1;
            group.max_blocked_ms = group.max_blocked_ms.max(blocked_ms);
            group.tasks.push(task.id);
        }

        let mut groups: Vec<ProfileGroup> = groups.into_values().collect();
        // Stable sort keeps origin order among equal counts.
        groups.sort_by(|a, b| b.count.cmp(&a.count));
        Self {
            total: snapshot.len(),
            groups,
        }
    }

    /// Tasks parked without a deadline for at least `min_blocked`.
    ///
    /// In a runtime that is still making progress these are the likely
    /// leaks: nothing but a peer can wake them, and none has.
    pub fn leak_suspects(snapshot: &[TaskSnapshot], min_blocked: Duration) -> Vec<TaskSnapshot> {
        let min_ms = min_blocked.as_millis() as u64;
        snapshot
            .iter()
            .filter(|t| match t.state {
                TaskState::Blocked {
                    timed: false,
                    blocked_ms,
                    ..
                } => blocked_ms >= min_ms,
                _ => false,
            })
            .cloned()
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "task profile: total {}", self.total)?;
        for g in &self.groups {
            writeln!(f)?;
            writeln!(f, "{} @ {}", g.count, g.origin)?;
            if g.max_blocked_ms > 0 {
                writeln!(f, "#\t{}, {}ms", g.state, g.max_blocked_ms)?;
            } else {
                writeln!(f, "#\t{}", g.state)?;
            }
            let ids: Vec<String> = g.tasks.iter().map(|t| t.to_string()).collect();
            writeln!(f, "#\t{}", ids.join(" "))?;
        }
        Ok(())
    }
}
