// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Coordination patterns: pipeline, alternate, fanout.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tandem_rt::{buffered, Alternator, Flow, Group, Handoff, Runtime, Side, Stage};
use thiserror::Error;

use super::report_failure;
use crate::{output, Format, Options};

#[derive(Debug, Error)]
#[error("{0} squared does not fit in 64 bits")]
struct Overflow(u64);

/// Square 0..=max: counter -> squarer -> printer.
pub fn cmd_pipeline(rt: &Runtime, opts: &Options) -> i32 {
    let max = opts.max;
    let format = opts.format;
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    let result = rt.block_on(|| -> Result<(), String> {
        let (nums_tx, nums_rx) = buffered::<u64>(100).split();
        let (sq_tx, sq_rx) = buffered::<u64>(200).split();
        let src = Stage::new(rt).named("counter").source(0..=max, nums_tx);
        let squarer = Stage::new(rt)
            .named("squarer")
            .transform(nums_rx, sq_tx, |x| x.checked_mul(x).ok_or(Overflow(x)));
        let printer = Stage::new(rt).named("printer").sink(sq_rx, move |v| match format {
            Format::Human => println!("{}", v),
            Format::Json => {
                if let Ok(mut out) = sink.lock() {
                    out.push(v);
                }
            }
        });

        // A failed squarer never closes the printer's input: report the
        // failure and leave both stranded stages behind.
        let failure = match squarer.join() {
            Ok(Ok(report)) => {
                tracing::debug!(?report, "squarer finished");
                None
            }
            Ok(Err(e)) => Some(match std::error::Error::source(&e) {
                Some(cause) => format!("{}: {}", e, cause),
                None => e.to_string(),
            }),
            Err(e) => Some(e.to_string()),
        };
        if let Some(msg) = failure {
            src.detach();
            printer.detach();
            return Err(msg);
        }
        src.join().map_err(|e| e.to_string())?;
        printer.join().map(|_| ()).map_err(|e| e.to_string())
    });

    match result {
        Ok(Ok(())) => {
            if format == Format::Json {
                let squares = collected.lock().map(|v| v.clone()).unwrap_or_default();
                match serde_json::to_string(&squares) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("{}: {}", output::error_label(), e);
                        return 1;
                    }
                }
            }
            0
        }
        Ok(Err(msg)) => {
            eprintln!("{}: {}", output::error_label(), msg);
            eprintln!("{}", output::banner_fail("Pipeline"));
            1
        }
        Err(e) => report_failure(&e),
    }
}

#[derive(Serialize)]
struct AlternateReport {
    output: String,
    numbers: usize,
    letters: usize,
    handoffs: u64,
}

#[derive(Default)]
struct Transcript {
    text: String,
    numbers: usize,
    letters: usize,
}

/// Numbers and letters taking turns: `12AB34CD...YZ2728`.
pub fn cmd_alternate(rt: &Runtime, opts: &Options) -> i32 {
    const LETTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";

    let transcript = Arc::new(Mutex::new(Transcript::default()));
    let (nums, lets) = (transcript.clone(), transcript.clone());
    let result = rt.block_on(|| {
        let mut n = 1u32;
        let mut letters = LETTERS.chars();
        let alt = Alternator::new(rt, Handoff::Rendezvous).start(
            Side::A,
            move |_| {
                if let Ok(mut t) = nums.lock() {
                    t.text.push_str(&format!("{}{}", n, n + 1));
                    t.numbers += 2;
                }
                n += 2;
                Flow::Pass
            },
            // Stops on the turn it finds the alphabet used up, so the
            // numbers side gets one more turn than the letters side.
            move |_| match (letters.next(), letters.next()) {
                (Some(a), Some(b)) => {
                    if let Ok(mut t) = lets.lock() {
                        t.text.push(a);
                        t.text.push(b);
                        t.letters += 2;
                    }
                    Flow::Pass
                }
                _ => Flow::Stop,
            },
        );
        alt.join();
        alt.handoffs()
    });

    let handoffs = match result {
        Ok(h) => h,
        Err(e) => return report_failure(&e),
    };
    let Transcript {
        text,
        numbers,
        letters,
    } = match transcript.lock() {
        Ok(mut t) => std::mem::take(&mut *t),
        Err(_) => Transcript::default(),
    };
    match opts.format {
        Format::Human => println!("{}", text),
        Format::Json => {
            let report = AlternateReport {
                output: text,
                numbers,
                letters,
                handoffs,
            };
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("{}: {}", output::error_label(), e);
                    return 1;
                }
            }
        }
    }
    0
}

/// Launch `--tasks` greeters and wait for all of them.
pub fn cmd_fanout(rt: &Runtime, opts: &Options) -> i32 {
    let n = opts.tasks;
    let result = rt.block_on(|| {
        let group = Group::new(rt);
        group.launch(n, |i, done| {
            println!("hello from task {}", i);
            done.mark_done();
        });
        group.join();
    });
    match result {
        Ok(()) => {
            eprintln!("{}", output::banner_ok(&format!("{} tasks joined", n)));
            0
        }
        Err(e) => report_failure(&e),
    }
}
