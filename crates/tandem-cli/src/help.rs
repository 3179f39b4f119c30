// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Help text for CLI commands.

use crate::output;

pub fn print_usage() {
    println!(
        "{} {} - Channels, stages, groups and turns on real threads",
        output::title("Tandem"),
        output::version(env!("CARGO_PKG_VERSION"))
    );
    println!();
    println!(
        "{}: {} {} {}",
        output::section_header("Usage"),
        output::command("tandem"),
        output::arg("<command>"),
        output::arg("[flags]")
    );
    println!();
    println!("{}", output::section_header("Patterns:"));
    println!("  {}     Square 0..=max through a three-stage pipeline", output::command("pipeline"));
    println!("  {}    Two tasks taking turns printing numbers and letters", output::command("alternate"));
    println!("  {}       Launch a group of tasks and join them", output::command("fanout"));
    println!();
    println!("{}", output::section_header("Failure modes:"));
    println!("  {}         Select times out, then a late send leaks", output::command("leak"));
    println!("  {}     Send and receive on one task (fails)", output::command("deadlock"));
    println!("  {}      Park tasks on a quit signal and dump the profile", output::command("profile"));
    println!();
    println!("  {}         Show this help", output::command("help"));
    println!("  {}      Show version", output::command("version"));
    println!();
    println!("{}", output::section_header("Flags:"));
    println!("  {} {}     Processor slots (default: all CPUs)", output::arg("--procs"), output::arg("<n>"));
    println!("  {} {}     Tasks to launch (fanout, profile; default 5)", output::arg("--tasks"), output::arg("<n>"));
    println!("  {} {}       Last pipeline input (default 100)", output::arg("--max"), output::arg("<n>"));
    println!("  {} {}   Time unit for leak (default 10)", output::arg("--unit-ms"), output::arg("<ms>"));
    println!("  {}            Machine-readable output", output::arg("--json"));
    println!();
    println!("{}", output::section_header("Environment:"));
    println!("  TANDEM_PROCS, TANDEM_DEADLOCK=off, TANDEM_WATCHDOG_MS, TANDEM_LOG=<filter>");
}

pub fn print_command_usage(cmd: &str) {
    let flags = match cmd {
        "pipeline" => "[--max <n>] [--procs <n>] [--json]",
        "alternate" => "[--procs <n>] [--json]",
        "fanout" => "[--tasks <n>] [--procs <n>]",
        "leak" => "[--unit-ms <ms>] [--procs <n>] [--json]",
        "deadlock" => "[--procs <n>]",
        "profile" => "[--tasks <n>] [--procs <n>] [--json]",
        _ => {
            print_usage();
            return;
        }
    };
    eprintln!(
        "{}: {} {} {}",
        output::section_header("Usage"),
        output::command("tandem"),
        output::command(cmd),
        output::arg(flags)
    );
}
