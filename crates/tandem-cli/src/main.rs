// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tandem CLI - runs the coordination patterns as small programs.

mod commands;
mod help;
mod output;

use std::env;
use std::process;

use tandem_rt::{Fatal, Runtime, RuntimeConfig};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Human,
    Json,
}

/// Flags shared by every command. Flags override `TANDEM_*` variables.
#[derive(Debug, Clone)]
pub struct Options {
    pub procs: Option<usize>,
    pub tasks: usize,
    pub max: u64,
    pub unit_ms: u64,
    pub format: Format,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            procs: None,
            tasks: 5,
            max: 100,
            unit_ms: 10,
            format: Format::Human,
        }
    }
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let mut opts = Options::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .ok_or_else(|| format!("{} needs a value", flag))
                .and_then(|v| {
                    v.parse::<u64>()
                        .map_err(|_| format!("{} expects a number, got '{}'", flag, v))
                })
        };
        match arg.as_str() {
            "--json" => opts.format = Format::Json,
            "--procs" => opts.procs = Some(value("--procs")? as usize),
            "--tasks" => opts.tasks = value("--tasks")? as usize,
            "--max" => opts.max = value("--max")?,
            "--unit-ms" => opts.unit_ms = value("--unit-ms")?.max(1),
            other => return Err(format!("unknown flag '{}'", other)),
        }
    }
    Ok(opts)
}

fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var("TANDEM_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Usage violations are reported through `block_on`; keep the default hook
/// for everything else.
fn quiet_fatal_panics() {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if info.payload().downcast_ref::<Fatal>().is_none() {
            default(info);
        }
    }));
}

fn runtime(opts: &Options) -> Runtime {
    let mut config = match RuntimeConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", output::error_label(), e);
            process::exit(2);
        }
    };
    if let Some(procs) = opts.procs {
        config = config.with_procs(procs);
    }
    Runtime::new(config)
}

fn main() {
    output::init();
    init_logging();
    quiet_fatal_panics();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        help::print_usage();
        return;
    }

    let cmd = args[1].as_str();
    match cmd {
        "help" | "--help" | "-h" => {
            help::print_usage();
            return;
        }
        "version" | "--version" | "-V" => {
            println!("tandem {}", env!("CARGO_PKG_VERSION"));
            return;
        }
        _ => {}
    }

    let opts = match parse_options(&args[2..]) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("{}: {}", output::error_label(), e);
            help::print_command_usage(cmd);
            process::exit(2);
        }
    };
    let rt = runtime(&opts);
    tracing::debug!(procs = rt.procs(), command = cmd, "runtime ready");

    let code = match cmd {
        "pipeline" => commands::patterns::cmd_pipeline(&rt, &opts),
        "alternate" => commands::patterns::cmd_alternate(&rt, &opts),
        "fanout" => commands::patterns::cmd_fanout(&rt, &opts),
        "leak" => commands::leaks::cmd_leak(&rt, &opts),
        "deadlock" => commands::leaks::cmd_deadlock(&rt, &opts),
        "profile" => commands::leaks::cmd_profile(&rt, &opts),
        other => {
            eprintln!("{}: unknown command '{}'", output::error_label(), other);
            help::print_usage();
            2
        }
    };
    process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_flags() {
        let opts = parse_options(&args(&["--procs", "1", "--tasks", "9", "--json"])).unwrap();
        assert_eq!(opts.procs, Some(1));
        assert_eq!(opts.tasks, 9);
        assert_eq!(opts.format, Format::Json);
        assert_eq!(opts.max, 100);
    }

    #[test]
    fn rejects_bad_flags() {
        assert!(parse_options(&args(&["--max"])).is_err());
        assert!(parse_options(&args(&["--max", "lots"])).is_err());
        assert!(parse_options(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn unit_is_at_least_one_ms() {
        let opts = parse_options(&args(&["--unit-ms", "0"])).unwrap();
        assert_eq!(opts.unit_ms, 1);
    }
}
