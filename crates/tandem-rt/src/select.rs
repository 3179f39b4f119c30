// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Select: wait on several channel operations, optionally with a timeout.
//!
//! Cases are attempted starting at a random offset so no channel is
//! systematically preferred. When nothing is ready the task parks on every
//! involved channel at once and retries on any state change; there is no
//! polling loop.
//!
//! A receive case on a closed channel is ready and yields `None`. A send case
//! on a closed channel is a usage violation. An abandoned send case (another
//! case won, or the timeout fired) never delivers its value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::channel::{ChannelId, Receiver, Sender, TryRecvError, TrySendError, Watch};
use crate::context;
use crate::error::{raise, Fatal};
use crate::park::{deadline_after, Parker, Wake, WaitOp};

/// Outcome of `Select::try_select`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selected<R> {
    /// One case completed; its handler's result.
    Ready(R),
    /// The timeout elapsed before any case was ready.
    TimedOut,
}

impl<R> Selected<R> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Selected::TimedOut)
    }

    pub fn ready(self) -> Option<R> {
        match self {
            Selected::Ready(r) => Some(r),
            Selected::TimedOut => None,
        }
    }
}

/// Hand-off marker for a parked select.
///
/// On a rendezvous channel a sender may only complete when a receiver is
/// waiting. A parked select counts as one once a sender claims it: the
/// claim names the channel, and the select then takes that channel's value
/// before anything else. A select is claimed by at most one channel at a
/// time.
pub(crate) struct Claim {
    by: AtomicU64,
}

impl Claim {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            by: AtomicU64::new(0),
        })
    }

    /// Claim for `channel`. Fails if another channel got here first.
    pub(crate) fn claim(&self, channel: ChannelId) -> bool {
        self.by
            .compare_exchange(0, channel.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn take(&self) -> Option<ChannelId> {
        match self.by.swap(0, Ordering::AcqRel) {
            0 => None,
            id => Some(ChannelId(id)),
        }
    }
}

/// Registration of a select on all of its channels, undone on drop so a
/// task failing while parked leaves nothing behind.
struct Watching<'a> {
    channels: Vec<(&'a dyn Watch, bool)>,
    parker: Arc<Parker>,
    claim: Arc<Claim>,
}

impl<'a> Watching<'a> {
    fn new<R>(cases: &[Case<'a, R>], parker: Arc<Parker>, claim: Arc<Claim>) -> Self {
        let channels: Vec<_> = cases.iter().map(|c| (c.channel, c.receiving)).collect();
        for &(channel, receiving) in &channels {
            channel.watch(&parker, receiving.then_some(&claim));
        }
        Self {
            channels,
            parker,
            claim,
        }
    }
}

impl Drop for Watching<'_> {
    fn drop(&mut self) {
        for &(channel, receiving) in &self.channels {
            channel.unwatch(&self.parker, receiving.then_some(&self.claim));
        }
    }
}

type Attempt<'a, R> = Box<dyn FnMut() -> Option<R> + 'a>;

struct Case<'a, R> {
    channel: &'a dyn Watch,
    receiving: bool,
    attempt: Attempt<'a, R>,
}

/// A set of receive/send cases that all produce an `R`.
pub struct Select<'a, R> {
    cases: Vec<Case<'a, R>>,
}

impl<R> Default for Select<'_, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, R> Select<'a, R> {
    pub fn new() -> Self {
        Self { cases: Vec::new() }
    }

    /// Add a receive case. `f` gets `Some(value)`, or `None` if the channel
    /// is closed and drained.
    pub fn recv<T, F>(mut self, rx: &'a Receiver<T>, f: F) -> Self
    where
        T: 'a,
        F: FnOnce(Option<T>) -> R + 'a,
    {
        let inner = &*rx.inner;
        let mut f = Some(f);
        self.cases.push(Case {
            channel: inner,
            receiving: true,
            attempt: Box::new(move || {
                let value = match inner.try_recv() {
                    Ok(v) => Some(v),
                    Err(TryRecvError::Closed) => None,
                    Err(TryRecvError::Empty) => return None,
                };
                f.take().map(|f| f(value))
            }),
        });
        self
    }

    /// Add a send case. On a rendezvous channel it is ready only while a
    /// receiver is parked in a blocking `recv`.
    pub fn send<T, F>(mut self, tx: &'a Sender<T>, value: T, f: F) -> Self
    where
        T: 'a,
        F: FnOnce() -> R + 'a,
    {
        let inner = &*tx.inner;
        let mut value = Some(value);
        let mut f = Some(f);
        self.cases.push(Case {
            channel: inner,
            receiving: false,
            attempt: Box::new(move || {
                let v = value.take()?;
                match inner.try_send(v) {
                    Ok(()) => f.take().map(|f| f()),
                    Err(TrySendError::Full(v)) => {
                        value = Some(v);
                        None
                    }
                    Err(TrySendError::Closed(_)) => raise(Fatal::SendOnClosed {
                        channel: inner.id(),
                    }),
                }
            }),
        });
        self
    }

    fn channels(&self) -> Vec<ChannelId> {
        self.cases.iter().map(|c| c.channel.id()).collect()
    }

    /// Try every case once, starting at a random offset.
    fn attempt_all(&mut self) -> Option<R> {
        let n = self.cases.len();
        if n == 0 {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..n);
        (0..n).find_map(|i| (self.cases[(start + i) % n].attempt)())
    }

    /// Block until one case completes.
    pub fn wait(mut self) -> R {
        match self.run(None) {
            Selected::Ready(r) => r,
            // No deadline: `run` only returns once a case completed.
            Selected::TimedOut => unreachable!("select without timeout timed out"),
        }
    }

    /// Wait for one case, or report `TimedOut` after `timeout`.
    pub fn try_select(mut self, timeout: Duration) -> Selected<R> {
        self.run(Some(timeout))
    }

    /// Complete a ready case without blocking.
    pub fn poll(mut self) -> Option<R> {
        self.attempt_all()
    }

    /// Take the value a sender handed over through `claim`, if any.
    fn attempt_claimed(&mut self, claim: &Claim) -> Option<R> {
        let channel = claim.take()?;
        self.cases
            .iter_mut()
            .filter(|c| c.receiving && c.channel.id() == channel)
            .find_map(|c| (c.attempt)())
    }

    fn run(&mut self, timeout: Option<Duration>) -> Selected<R> {
        if let Some(r) = self.attempt_all() {
            return Selected::Ready(r);
        }

        let deadline = timeout.map(deadline_after);
        let op = WaitOp::Select {
            channels: self.channels(),
        };
        let claim = Claim::new();
        let watching = Watching::new(&self.cases, context::parker(), claim.clone());

        let ready = loop {
            // Registered before re-checking, so no state change is missed.
            if let Some(r) = self.attempt_claimed(&claim).or_else(|| self.attempt_all()) {
                break Some(r);
            }
            if context::block(op.clone(), deadline) == Wake::TimedOut {
                break None;
            }
        };
        drop(watching);

        match ready {
            Some(r) => Selected::Ready(r),
            // One last look: a value may have been handed over or landed as
            // the deadline hit. Nothing can claim us once unregistered.
            None => match self.attempt_claimed(&claim).or_else(|| self.attempt_all()) {
                Some(r) => Selected::Ready(r),
                None => Selected::TimedOut,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use std::time::Instant;

    #[test]
    fn select_single_channel() {
        let ch = channel::buffered(10);
        ch.send(42);
        let rx = ch.receiver();
        let got = Select::new().recv(&rx, |v| v).wait();
        assert_eq!(got, Some(42));
    }

    #[test]
    fn select_multiple_channels() {
        let (tx1, rx1) = channel::buffered(10).split();
        let (_tx2, rx2) = channel::buffered::<i32>(10).split();
        tx1.send(99);
        let got = Select::new()
            .recv(&rx1, |v| (0, v))
            .recv(&rx2, |v| (1, v))
            .wait();
        assert_eq!(got, (0, Some(99)));
    }

    #[test]
    fn select_heterogeneous_cases() {
        let (tx, rx) = channel::buffered::<&str>(1).split();
        let (stop_tx, stop_rx) = channel::buffered::<()>(1).split();
        stop_tx.close();
        tx.send("work");
        // Both ready: either may win, but each maps into the same type.
        let got = Select::new()
            .recv(&rx, |v| v.map(str::to_string))
            .recv(&stop_rx, |_| Some("stop".to_string()))
            .wait();
        assert!(matches!(got.as_deref(), Some("work") | Some("stop")));
    }

    #[test]
    fn select_poll_returns_none_when_empty() {
        let (_tx, rx) = channel::buffered::<i32>(10).split();
        assert_eq!(Select::new().recv(&rx, |v| v).poll(), None);
    }

    #[test]
    fn select_closed_is_ready_with_none() {
        let (tx, rx) = channel::buffered::<i32>(10).split();
        tx.close();
        assert_eq!(Select::new().recv(&rx, |v| v).wait(), None);
    }

    #[test]
    fn select_times_out() {
        let (_tx, rx) = channel::unbuffered::<i32>().split();
        let start = Instant::now();
        let got = Select::new()
            .recv(&rx, |v| v)
            .try_select(Duration::from_millis(20));
        assert!(got.is_timed_out());
        assert!(start.elapsed() >= Duration::from_millis(19));
    }

    #[test]
    fn select_wakes_on_late_send() {
        let (tx, rx) = channel::buffered::<i32>(1).split();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.send(5);
        });
        let got = Select::new()
            .recv(&rx, |v| v)
            .try_select(Duration::from_secs(5));
        assert_eq!(got, Selected::Ready(Some(5)));
        t.join().unwrap();
    }

    #[test]
    fn select_send_case_fills_buffer() {
        let (tx, rx) = channel::buffered::<i32>(1).split();
        let got = Select::new().send(&tx, 8, || "sent").wait();
        assert_eq!(got, "sent");
        assert_eq!(rx.recv(), Some(8));
    }

    #[test]
    fn select_send_case_on_full_buffer_times_out() {
        let (tx, rx) = channel::buffered::<i32>(1).split();
        tx.send(1);
        let got = Select::new()
            .send(&tx, 2, || ())
            .try_select(Duration::from_millis(10));
        assert!(got.is_timed_out());
        // The abandoned value was never delivered.
        assert_eq!(rx.recv(), Some(1));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn select_send_to_parked_receiver() {
        let (tx, rx) = channel::unbuffered::<i32>().split();
        let t = std::thread::spawn(move || rx.recv());
        let got = Select::new()
            .send(&tx, 11, || true)
            .try_select(Duration::from_secs(5));
        assert_eq!(got, Selected::Ready(true));
        assert_eq!(t.join().unwrap(), Some(11));
    }

    #[test]
    fn select_send_pairs_with_select_recv_on_rendezvous() {
        let (tx, rx) = channel::unbuffered::<i32>().split();
        let t = std::thread::spawn(move || {
            Select::new()
                .send(&tx, 4, || "sent")
                .try_select(Duration::from_secs(5))
        });
        let got = Select::new()
            .recv(&rx, |v| v)
            .try_select(Duration::from_secs(5));
        assert_eq!(got, Selected::Ready(Some(4)));
        assert_eq!(t.join().unwrap(), Selected::Ready("sent"));
    }

    #[test]
    fn late_select_recv_wakes_parked_select_send() {
        let (tx, rx) = channel::unbuffered::<i32>().split();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            Select::new()
                .recv(&rx, |v| v)
                .try_select(Duration::from_secs(5))
        });
        let sent = Select::new()
            .send(&tx, 9, || true)
            .try_select(Duration::from_secs(5));
        assert_eq!(sent, Selected::Ready(true));
        assert_eq!(t.join().unwrap(), Selected::Ready(Some(9)));
    }

    #[test]
    fn handed_over_value_is_taken_before_other_cases() {
        let (tx, rx) = channel::unbuffered::<i32>().split();
        let (_other_tx, other_rx) = channel::buffered::<i32>(1).split();
        for i in 0..20 {
            let tx = tx.clone();
            let t = std::thread::spawn(move || {
                Select::new()
                    .send(&tx, i, || ())
                    .try_select(Duration::from_secs(5))
            });
            let got = Select::new()
                .recv(&rx, |v| v)
                .recv(&other_rx, |_| None)
                .try_select(Duration::from_secs(5));
            assert_eq!(got, Selected::Ready(Some(i)));
            assert_eq!(t.join().unwrap(), Selected::Ready(()));
        }
    }
}

