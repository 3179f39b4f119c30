// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Turn alternation between two tasks.
//!
//! Sides A and B each own an inbound token channel. A side parks on its own
//! token, acts once, then sends the token to the other side. Only one token
//! exists, so turns alternate strictly.
//!
//! A side ends the alternation by returning `Flow::Stop` instead of passing.
//! It then marks the alternation's group done; the other side stays parked on
//! its token receive for good, which is the expected leak of this pattern.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::channel::{self, Channel};
use crate::group::{Done, Group};
use crate::park::lock;
use crate::runtime::Runtime;
use crate::spawn::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }

    fn encode(side: Option<Side>) -> u8 {
        match side {
            None => 0,
            Some(Side::A) => 1,
            Some(Side::B) => 2,
        }
    }

    fn decode(v: u8) -> Option<Side> {
        match v {
            1 => Some(Side::A),
            2 => Some(Side::B),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => write!(f, "A"),
            Side::B => write!(f, "B"),
        }
    }
}

/// What a side does after acting on its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Hand the turn to the other side.
    Pass,
    /// Keep the token and end the alternation.
    Stop,
}

/// Token channel capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handoff {
    /// Capacity 0: the passer waits until the other side takes the turn.
    #[default]
    Rendezvous,
    /// Capacity 1: the passer drops the token in the slot and moves on.
    Slot,
}

impl Handoff {
    fn channel(self) -> Channel<()> {
        match self {
            Handoff::Rendezvous => channel::unbuffered(),
            Handoff::Slot => channel::buffered(1),
        }
    }
}

struct Turns {
    handoffs: AtomicU64,
    holder: AtomicU8,
    stopped_by: AtomicU8,
}

#[derive(Debug)]
pub struct Alternator {
    rt: Runtime,
    handoff: Handoff,
}

impl Alternator {
    pub fn new(rt: &Runtime, handoff: Handoff) -> Self {
        Self {
            rt: rt.clone(),
            handoff,
        }
    }

    /// Spawn both sides and give the first turn to `first`.
    ///
    /// Each side is called with its own 0-based turn number. With a
    /// rendezvous handoff this returns once `first` has taken the turn.
    #[track_caller]
    pub fn start<FA, FB>(self, first: Side, a: FA, b: FB) -> Alternation
    where
        FA: FnMut(u64) -> Flow + Send + 'static,
        FB: FnMut(u64) -> Flow + Send + 'static,
    {
        let tokens = [self.handoff.channel(), self.handoff.channel()];
        let turns = Arc::new(Turns {
            handoffs: AtomicU64::new(0),
            holder: AtomicU8::new(Side::encode(Some(first))),
            stopped_by: AtomicU8::new(Side::encode(None)),
        });
        let group = Group::new(&self.rt);
        // One token for the alternation: whichever side stops marks it.
        let done = Arc::new(Mutex::new(Some(group.add())));
        let ta = self.spawn_side(Side::A, &tokens, &turns, &done, a);
        let tb = self.spawn_side(Side::B, &tokens, &turns, &done, b);

        tokens[first.index()].send(());
        Alternation {
            group,
            turns,
            tasks: [ta, tb],
        }
    }

    #[track_caller]
    fn spawn_side<F>(
        &self,
        side: Side,
        tokens: &[Channel<()>; 2],
        turns: &Arc<Turns>,
        done: &Arc<Mutex<Option<Done>>>,
        mut act: F,
    ) -> TaskId
    where
        F: FnMut(u64) -> Flow + Send + 'static,
    {
        let inbound = tokens[side.index()].receiver();
        let outbound = tokens[side.other().index()].sender();
        let turns = turns.clone();
        let done = done.clone();
        let handle = self.rt.spawn_named(format!("side-{}", side), move || {
            let mut turn = 0;
            while inbound.recv().is_some() {
                turns.holder.store(Side::encode(Some(side)), Ordering::Release);
                let flow = act(turn);
                turn += 1;
                match flow {
                    Flow::Pass => {
                        turns.handoffs.fetch_add(1, Ordering::AcqRel);
                        outbound.send(());
                    }
                    Flow::Stop => {
                        turns
                            .stopped_by
                            .store(Side::encode(Some(side)), Ordering::Release);
                        tracing::debug!(%side, turn, "alternation stopped");
                        let token = lock(&done).take();
                        if let Some(token) = token {
                            token.mark_done();
                        }
                        return;
                    }
                }
            }
        });
        let id = handle.id();
        handle.detach();
        id
    }
}

/// Running alternation.
pub struct Alternation {
    group: Group,
    turns: Arc<Turns>,
    tasks: [TaskId; 2],
}

impl fmt::Debug for Alternation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Alternation")
            .field("handoffs", &self.handoffs())
            .field("holder", &self.holder())
            .field("stopped_by", &self.stopped_by())
            .finish()
    }
}

impl Alternation {
    /// Park until one side stops.
    pub fn join(&self) {
        self.group.join();
    }

    pub fn join_timeout(&self, timeout: Duration) -> bool {
        self.group.join_timeout(timeout)
    }

    /// Completed passes. The initial seed is not one.
    pub fn handoffs(&self) -> u64 {
        self.turns.handoffs.load(Ordering::Acquire)
    }

    /// Side that most recently took the turn.
    pub fn holder(&self) -> Side {
        Side::decode(self.turns.holder.load(Ordering::Acquire)).unwrap_or(Side::A)
    }

    pub fn stopped_by(&self) -> Option<Side> {
        Side::decode(self.turns.stopped_by.load(Ordering::Acquire))
    }

    pub fn task(&self, side: Side) -> TaskId {
        self.tasks[side.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeConfig;
    use std::time::Instant;

    fn rt() -> Runtime {
        Runtime::new(RuntimeConfig::default().with_procs(2))
    }

    /// Shared transcript of who acted, in order.
    fn recorder() -> (Arc<Mutex<Vec<Side>>>, impl Fn(Side) + Clone + Send + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |side| lock(&sink).push(side))
    }

    #[test]
    fn turns_alternate_strictly() {
        let rt = rt();
        let (log, record) = recorder();
        let (ra, rb) = (record.clone(), record);
        let alt = Alternator::new(&rt, Handoff::Rendezvous).start(
            Side::A,
            move |turn| {
                ra(Side::A);
                if turn == 5 {
                    Flow::Stop
                } else {
                    Flow::Pass
                }
            },
            move |_| {
                rb(Side::B);
                Flow::Pass
            },
        );
        alt.join();
        let log = lock(&log).clone();
        assert_eq!(log.len(), 11);
        for pair in log.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert_eq!(alt.handoffs(), 10);
        assert_eq!(alt.holder(), Side::A);
        assert_eq!(alt.stopped_by(), Some(Side::A));
    }

    #[test]
    fn second_side_can_go_first() {
        let rt = rt();
        let alt = Alternator::new(&rt, Handoff::Slot).start(
            Side::B,
            |_| Flow::Pass,
            |turn| if turn == 2 { Flow::Stop } else { Flow::Pass },
        );
        alt.join();
        assert_eq!(alt.handoffs(), 4);
        assert_eq!(alt.holder(), Side::B);
        assert_ne!(alt.task(Side::A), alt.task(Side::B));
    }

    #[test]
    fn letters_and_numbers() {
        const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        let rt = rt();
        let out = Arc::new(Mutex::new(String::new()));
        let (num_out, let_out) = (out.clone(), out.clone());
        let mut next_number = 1;
        let mut next_letter = 0;
        let alt = Alternator::new(&rt, Handoff::Rendezvous).start(
            Side::A,
            move |_| {
                let mut s = lock(&num_out);
                s.push_str(&format!("{}{}", next_number, next_number + 1));
                next_number += 2;
                Flow::Pass
            },
            move |_| {
                if next_letter >= ALPHABET.len() {
                    return Flow::Stop;
                }
                let mut s = lock(&let_out);
                s.push(ALPHABET[next_letter] as char);
                s.push(ALPHABET[next_letter + 1] as char);
                next_letter += 2;
                Flow::Pass
            },
        );
        alt.join();
        let out = lock(&out).clone();
        assert!(out.starts_with("12AB34CD"));
        assert!(out.ends_with("2526YZ2728"));
        assert_eq!(out.chars().filter(|c| c.is_ascii_uppercase()).count(), 26);
        assert_eq!(alt.handoffs(), 27);
        assert_eq!(alt.stopped_by(), Some(Side::B));
        // The numbers side passed its last turn and is parked for good.
        let numbers_parked = || {
            rt.snapshot()
                .iter()
                .any(|t| t.id == alt.task(Side::A) && t.state.is_parked_forever())
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while !numbers_parked() {
            assert!(Instant::now() < deadline, "numbers side never parked");
            std::thread::yield_now();
        }
    }
}
