// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! CLI output formatting with colors and styling.
//!
//! Respects NO_COLOR and FORCE_COLOR environment variables.
//! Colors are automatically disabled when output is piped.

use colored::{ColoredString, Colorize};

/// Initialize color support based on environment.
/// Call once at startup.
pub fn init() {
    // colored crate handles NO_COLOR automatically,
    // but we add explicit FORCE_COLOR support
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    } else if std::env::var("FORCE_COLOR").is_ok() {
        colored::control::set_override(true);
    }
}

// === Error Output ===

pub fn error_label() -> ColoredString {
    "error".red().bold()
}

pub fn note_label() -> ColoredString {
    "note".cyan()
}

// === Banners ===

pub fn banner_ok(what: &str) -> String {
    format!(
        "{} {} {}",
        "===".dimmed(),
        format!("{} OK", what).green().bold(),
        "===".dimmed()
    )
}

pub fn banner_fail(what: &str) -> String {
    format!(
        "{} {} {}",
        "===".dimmed(),
        format!("{} FAILED", what).red().bold(),
        "===".dimmed()
    )
}

// === Task Output ===

pub fn task_id(id: &str) -> ColoredString {
    id.blue()
}

pub fn blocked(op: &str) -> ColoredString {
    op.yellow()
}

pub fn timed_out() -> ColoredString {
    "timed out".yellow().bold()
}

pub fn leaked_count(n: usize) -> ColoredString {
    if n > 0 {
        format!("{} leaked", n).red()
    } else {
        format!("{} leaked", n).green()
    }
}

// === Help Output ===

pub fn title(name: &str) -> ColoredString {
    name.bold()
}

pub fn version(v: &str) -> ColoredString {
    v.dimmed()
}

pub fn section_header(header: &str) -> ColoredString {
    header.yellow().bold()
}

pub fn command(name: &str) -> ColoredString {
    name.green()
}

pub fn arg(name: &str) -> ColoredString {
    name.cyan()
}

pub fn separator(width: usize) -> ColoredString {
    "─".repeat(width).dimmed()
}
