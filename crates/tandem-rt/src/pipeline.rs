// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Pipeline stages.
//!
//! A stage is a task between at most one input receiver and at most one
//! output sender. It forwards until its input is closed and drained, then
//! closes its output. A source closes its output once its items run out.
//!
//! A failed transform ends the stage with `StageError` and leaves the output
//! open: whoever reads downstream stays parked. The failure itself travels
//! out of band, through the stage's `TaskHandle`.
//!
//! With a `StopSignal` attached, every receive and send of the stage also
//! selects on the signal; a stopped stage closes its output and reports
//! `stopped`.

use serde::Serialize;
use thiserror::Error;

use crate::channel::{Receiver, Sender};
use crate::runtime::Runtime;
use crate::select::Select;
use crate::spawn::TaskHandle;
use crate::stop::StopSignal;

/// What a stage did before it ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub received: u64,
    pub sent: u64,
    /// Ended by its stop signal rather than by running out of input.
    pub stopped: bool,
}

#[derive(Debug, Error)]
pub enum StageError<E: std::error::Error + 'static> {
    /// Transform failed on the `item`-th received value (0-based).
    #[error("transform failed on item {item}")]
    Transform {
        item: u64,
        #[source]
        source: E,
    },
}

enum Step<T> {
    Item(T),
    Closed,
    Stopped,
}

fn next<T>(input: &Receiver<T>, stop: Option<&StopSignal>) -> Step<T> {
    let Some(stop) = stop else {
        return input.recv().map_or(Step::Closed, Step::Item);
    };
    if stop.is_stopped() {
        return Step::Stopped;
    }
    let halt = stop.receiver();
    Select::new()
        .recv(input, |v| v.map_or(Step::Closed, Step::Item))
        .recv(&halt, |_| Step::Stopped)
        .wait()
}

/// Returns `false` if stopped before the value went out.
fn forward<T>(out: &Sender<T>, value: T, stop: Option<&StopSignal>) -> bool {
    let Some(stop) = stop else {
        out.send(value);
        return true;
    };
    if stop.is_stopped() {
        return false;
    }
    let halt = stop.receiver();
    Select::new()
        .send(out, value, || true)
        .recv(&halt, |_| false)
        .wait()
}

/// Stage builder. Each terminal method spawns the stage task.
#[derive(Debug, Clone)]
pub struct Stage {
    rt: Runtime,
    name: Option<String>,
    stop: Option<StopSignal>,
}

impl Stage {
    pub fn new(rt: &Runtime) -> Self {
        Self {
            rt: rt.clone(),
            name: None,
            stop: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stop_on(mut self, signal: &StopSignal) -> Self {
        self.stop = Some(signal.clone());
        self
    }

    #[track_caller]
    fn spawn<T, F>(self, kind: &str, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Option<StopSignal>) -> T + Send + 'static,
    {
        let name = self.name.unwrap_or_else(|| kind.to_string());
        let stop = self.stop;
        self.rt.spawn_named(name, move || f(stop))
    }

    /// Emit `items` in order, then close `out`.
    #[track_caller]
    pub fn source<T, I>(self, items: I, out: Sender<T>) -> TaskHandle<StageReport>
    where
        T: Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let items = items.into_iter();
        self.spawn("source", move |stop| {
            let mut report = StageReport::default();
            for item in items {
                if !forward(&out, item, stop.as_ref()) {
                    report.stopped = true;
                    break;
                }
                report.sent += 1;
            }
            out.close();
            report
        })
    }

    /// Apply `f` to every input value and send the result downstream.
    #[track_caller]
    pub fn transform<I, O, E, F>(
        self,
        input: Receiver<I>,
        out: Sender<O>,
        mut f: F,
    ) -> TaskHandle<Result<StageReport, StageError<E>>>
    where
        I: Send + 'static,
        O: Send + 'static,
        E: std::error::Error + Send + 'static,
        F: FnMut(I) -> Result<O, E> + Send + 'static,
    {
        self.spawn("transform", move |stop| {
            let mut report = StageReport::default();
            loop {
                let value = match next(&input, stop.as_ref()) {
                    Step::Item(v) => v,
                    Step::Closed => break,
                    Step::Stopped => {
                        report.stopped = true;
                        break;
                    }
                };
                let item = report.received;
                report.received += 1;
                let mapped = match f(value) {
                    Ok(v) => v,
                    Err(source) => {
                        tracing::warn!(item, error = %source, "transform failed; output left open");
                        return Err(StageError::Transform { item, source });
                    }
                };
                if !forward(&out, mapped, stop.as_ref()) {
                    report.stopped = true;
                    break;
                }
                report.sent += 1;
            }
            out.close();
            Ok(report)
        })
    }

    /// Hand every input value to `f` until the input is closed and drained.
    #[track_caller]
    pub fn sink<T, F>(self, input: Receiver<T>, mut f: F) -> TaskHandle<StageReport>
    where
        T: Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        self.spawn("sink", move |stop| {
            let mut report = StageReport::default();
            loop {
                match next(&input, stop.as_ref()) {
                    Step::Item(v) => {
                        report.received += 1;
                        f(v);
                    }
                    Step::Closed => break,
                    Step::Stopped => {
                        report.stopped = true;
                        break;
                    }
                }
            }
            report
        })
    }

    /// Sink that gathers everything it receives, in arrival order.
    #[track_caller]
    pub fn collect<T>(self, input: Receiver<T>) -> TaskHandle<Vec<T>>
    where
        T: Send + 'static,
    {
        self.spawn("collect", move |stop| {
            let mut items = Vec::new();
            while let Step::Item(v) = next(&input, stop.as_ref()) {
                items.push(v);
            }
            items
        })
    }
}
