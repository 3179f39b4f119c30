// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Failure modes: a leaked sender, a whole-program deadlock, and the task
//! profile that makes parked tasks visible.

use std::time::{Duration, Instant};

use serde::Serialize;
use tandem_rt::{time, unbuffered, Profile, Runtime, Select, Selected, StopSignal, TaskSnapshot};

use super::{print_tasks, report_failure};
use crate::{output, Format, Options};

#[derive(Serialize)]
struct LeakReport {
    timed_out: bool,
    sender_completed: bool,
    leaked: Vec<TaskSnapshot>,
}

/// Wait one unit for a reply that is sent after fifteen. The select gives
/// up, and the late sender parks on a rendezvous nobody will ever attend.
pub fn cmd_leak(rt: &Runtime, opts: &Options) -> i32 {
    let unit = Duration::from_millis(opts.unit_ms);
    let result = rt.block_on(|| {
        let (tx, rx) = unbuffered::<&'static str>().split();
        let sender = rt.spawn_named("late-sender", move || {
            time::sleep(unit * 15);
            tx.send("late reply");
        });

        let outcome = Select::new().recv(&rx, |v| v).try_select(unit);
        if let Selected::Ready(reply) = &outcome {
            tracing::warn!(?reply, "reply arrived before the timeout");
        }

        let sender_completed = sender.wait_timeout(unit * 30);
        let leaked = Profile::leak_suspects(&rt.snapshot(), unit * 5);
        sender.detach();
        LeakReport {
            timed_out: outcome.is_timed_out(),
            sender_completed,
            leaked,
        }
    });

    let report = match result {
        Ok(r) => r,
        Err(e) => return report_failure(&e),
    };
    match opts.format {
        Format::Human => {
            if report.timed_out {
                println!("select: {} after {:?}", output::timed_out(), unit);
            } else {
                println!("select: received a reply");
            }
            println!(
                "late-sender completed: {}",
                if report.sender_completed { "yes" } else { "no" }
            );
            println!("{}", output::leaked_count(report.leaked.len()));
            print_tasks(&report.leaked);
            if !report.leaked.is_empty() {
                eprintln!(
                    "{}: leaked tasks stay parked until the process exits",
                    output::note_label()
                );
            }
        }
        Format::Json => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}: {}", output::error_label(), e);
                return 1;
            }
        },
    }
    0
}

/// Send and then receive on one rendezvous channel from the same task.
pub fn cmd_deadlock(rt: &Runtime, _opts: &Options) -> i32 {
    if !rt.config().deadlock_detection {
        eprintln!(
            "{}: deadlock detection is off; this will hang",
            output::note_label()
        );
    }
    let result = rt.block_on(|| {
        let ch = unbuffered::<u32>();
        ch.send(1);
        ch.recv()
    });
    match result {
        Ok(v) => {
            eprintln!("{}: received {:?} without a peer", output::error_label(), v);
            1
        }
        Err(e) => {
            eprintln!("{}", output::banner_fail("Run"));
            report_failure(&e)
        }
    }
}

/// Park `--tasks` workers on a stop signal, dump the profile, release them.
pub fn cmd_profile(rt: &Runtime, opts: &Options) -> i32 {
    let n = opts.tasks;
    let result = rt.block_on(|| {
        let stop = StopSignal::new();
        let workers: Vec<_> = (0..n)
            .map(|_| {
                let stop = stop.clone();
                rt.spawn_named("parked", move || stop.wait())
            })
            .collect();

        let deadline = Instant::now() + Duration::from_secs(5);
        let parked = || {
            rt.snapshot()
                .iter()
                .filter(|t| t.name.as_deref() == Some("parked") && t.state.is_parked_forever())
                .count()
        };
        while parked() < n && Instant::now() < deadline {
            time::sleep(Duration::from_millis(1));
        }
        let profile = rt.profile();

        stop.stop();
        let mut failed = 0;
        for w in workers {
            if let Err(e) = w.join() {
                tracing::error!(error = %e, "parked worker failed");
                failed += 1;
            }
        }
        (profile, failed)
    });

    let (profile, failed) = match result {
        Ok(r) => r,
        Err(e) => return report_failure(&e),
    };
    match opts.format {
        Format::Human => {
            println!("{}", output::separator(40));
            print!("{}", profile);
            println!("{}", output::separator(40));
        }
        Format::Json => match profile.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}: {}", output::error_label(), e);
                return 1;
            }
        },
    }
    if failed > 0 {
        eprintln!("{}", output::banner_fail("Release"));
        return 1;
    }
    eprintln!("{}", output::banner_ok(&format!("{} tasks released", n)));
    0
}
