// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! CLI command implementations.

pub mod leaks;
pub mod patterns;

use tandem_rt::{RuntimeError, TaskSnapshot};

use crate::output;

/// Print a task list, one line per task.
pub fn print_tasks(tasks: &[TaskSnapshot]) {
    for t in tasks {
        let what = match t.state.wait_op() {
            Some(op) => op.to_string(),
            None => "runnable".to_string(),
        };
        let name = t.name.as_deref().unwrap_or("-");
        eprintln!(
            "  {} {:<12} {} @ {}",
            output::task_id(&t.id.to_string()),
            name,
            output::blocked(&what),
            t.origin
        );
    }
}

/// Report a failed `block_on` and pick the exit code.
pub fn report_failure(err: &RuntimeError) -> i32 {
    eprintln!("{}: {}", output::error_label(), err);
    match err {
        RuntimeError::Deadlock { blocked } => {
            print_tasks(blocked);
            2
        }
        RuntimeError::Fatal(_) => 2,
        RuntimeError::Panicked(_) | RuntimeError::Nested => 1,
    }
}
