// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels.
//!
//! A bounded FIFO mailbox shared by every task holding a handle. Capacity 0
//! is a rendezvous: the sender parks until a receiver has taken the value.
//!
//! Closing is explicit and belongs to the producer side; `Receiver` has no
//! `close`. Sending on a closed channel or closing twice terminates the
//! calling task with a `Fatal` error. Receiving on a closed channel drains
//! what is buffered, then yields `None`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use crate::context;
use crate::error::{raise, Fatal};
use crate::park::{lock, Parker, WaitList, WaitOp};
use crate::select::{Claim, Select, Selected};
use crate::time::TimedOut;

/// Process-unique channel identity, shown in task snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl ChannelId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ChannelId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan#{}", self.0)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// Buffer is full (or, unbuffered, no receiver is waiting).
    Full(T),
    /// Channel is closed.
    Closed(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// No message available right now.
    Empty,
    /// Closed and drained.
    Closed,
}

/// Create a buffered channel with capacity `n`. `buffered(0)` is `unbuffered()`.
pub fn buffered<T>(n: usize) -> Channel<T> {
    Channel {
        inner: Arc::new(Inner {
            id: ChannelId::next(),
            cap: n,
            state: Mutex::new(State {
                buf: VecDeque::with_capacity(n.max(1)),
                closed: false,
                receivers_parked: 0,
                selecting: Vec::new(),
                sender_parked: false,
                pushed: 0,
                taken: 0,
                waiters: WaitList::new(),
            }),
        }),
    }
}

/// Create an unbuffered (rendezvous) channel.
pub fn unbuffered<T>() -> Channel<T> {
    buffered(0)
}

struct State<T> {
    /// Buffered values; for capacity 0, at most the one value in hand-off.
    buf: VecDeque<T>,
    closed: bool,
    /// Blocking receivers currently parked.
    receivers_parked: usize,
    /// Parked selects with a receive case here (rendezvous channels only).
    /// A sender that claims one may hand it a value without a blocking
    /// receiver around.
    selecting: Vec<Arc<Claim>>,
    /// Rendezvous only: the value in hand-off belongs to a blocking sender
    /// that has not returned yet. Closing the channel fails that send
    /// instead of delivering it.
    sender_parked: bool,
    /// Values ever pushed / taken; a rendezvous sender waits on its ticket.
    pushed: u64,
    taken: u64,
    waiters: WaitList,
}

pub(crate) struct Inner<T> {
    id: ChannelId,
    cap: usize,
    state: Mutex<State<T>>,
}

impl<T> Inner<T> {
    fn has_room(&self, st: &State<T>) -> bool {
        if self.cap == 0 {
            st.buf.is_empty()
        } else {
            st.buf.len() < self.cap
        }
    }

    fn push(&self, st: &mut State<T>, value: T) -> u64 {
        st.buf.push_back(value);
        st.pushed += 1;
        st.waiters.notify_all();
        st.pushed
    }

    fn pop(&self, st: &mut State<T>) -> Option<T> {
        if self.cap == 0 && st.closed && st.sender_parked {
            return None;
        }
        let value = st.buf.pop_front()?;
        st.taken += 1;
        st.waiters.notify_all();
        Some(value)
    }

    fn send(&self, value: T) {
        let parker = context::parker();
        let mut st = lock(&self.state);
        let ticket = loop {
            if st.closed {
                drop(st);
                raise(Fatal::SendOnClosed { channel: self.id });
            }
            if self.has_room(&st) {
                st.sender_parked = self.cap == 0;
                break self.push(&mut st, value);
            }
            st = self.park(st, &parker, WaitOp::Send { channel: self.id });
        };

        // Rendezvous: the send completes when a receiver takes the value.
        if self.cap == 0 {
            while st.taken < ticket {
                if st.closed {
                    // Still in hand-off, so it is the only value buffered.
                    let value = st.buf.pop_front();
                    st.pushed -= 1;
                    st.sender_parked = false;
                    drop(st);
                    drop(value);
                    raise(Fatal::SendOnClosed { channel: self.id });
                }
                st = self.park(st, &parker, WaitOp::Send { channel: self.id });
            }
        }
    }

    fn recv(&self) -> Option<T> {
        let parker = context::parker();
        let mut st = lock(&self.state);
        loop {
            if let Some(value) = self.pop(&mut st) {
                return Some(value);
            }
            if st.closed {
                return None;
            }
            st = self.park(st, &parker, WaitOp::Recv { channel: self.id });
        }
    }

    /// Register, release the lock, park, relock. The registration is undone
    /// even if the task fails while parked.
    fn park<'a>(
        &'a self,
        mut st: MutexGuard<'a, State<T>>,
        parker: &Arc<Parker>,
        op: WaitOp,
    ) -> MutexGuard<'a, State<T>> {
        let receiving = matches!(op, WaitOp::Recv { .. });
        if receiving {
            st.receivers_parked += 1;
            if self.cap == 0 && st.receivers_parked == 1 {
                // Wake select send cases waiting for a receiver to show up.
                st.waiters.notify_all();
            }
        }
        st.waiters.register(parker);
        drop(st);
        let parked = Parked {
            inner: self,
            parker: parker.clone(),
            receiving,
        };
        context::block(op, None);
        drop(parked);
        lock(&self.state)
    }

    pub(crate) fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut st = lock(&self.state);
        if st.closed {
            return Err(TrySendError::Closed(value));
        }
        let ready = if self.cap == 0 {
            st.buf.is_empty()
                && (st.receivers_parked > 0
                    || st.selecting.iter().any(|claim| claim.claim(self.id)))
        } else {
            st.buf.len() < self.cap
        };
        if !ready {
            return Err(TrySendError::Full(value));
        }
        st.sender_parked = false;
        self.push(&mut st, value);
        Ok(())
    }

    pub(crate) fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut st = lock(&self.state);
        match self.pop(&mut st) {
            Some(value) => Ok(value),
            None if st.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    fn close(&self) {
        let mut st = lock(&self.state);
        if st.closed {
            drop(st);
            raise(Fatal::CloseOfClosed { channel: self.id });
        }
        st.closed = true;
        st.waiters.notify_all();
        tracing::debug!(channel = %self.id, pending = st.buf.len(), "channel closed");
    }
}

/// Undoes a blocking operation's registration when dropped.
struct Parked<'a, T> {
    inner: &'a Inner<T>,
    parker: Arc<Parker>,
    receiving: bool,
}

impl<T> Drop for Parked<'_, T> {
    fn drop(&mut self) {
        let mut st = lock(&self.inner.state);
        st.waiters.unregister(&self.parker);
        if self.receiving {
            st.receivers_parked -= 1;
        }
    }
}

/// Type-erased registration used by `Select` to park on several channels.
///
/// `claim` is passed for receive cases only.
pub(crate) trait Watch {
    fn id(&self) -> ChannelId;
    fn watch(&self, parker: &Arc<Parker>, claim: Option<&Arc<Claim>>);
    fn unwatch(&self, parker: &Arc<Parker>, claim: Option<&Arc<Claim>>);
}

impl<T> Watch for Inner<T> {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn watch(&self, parker: &Arc<Parker>, claim: Option<&Arc<Claim>>) {
        let mut st = lock(&self.state);
        if let (Some(claim), 0) = (claim, self.cap) {
            // A new receiver: senders parked so far get another try.
            st.waiters.notify_all();
            st.selecting.push(claim.clone());
        }
        st.waiters.register(parker);
    }

    fn unwatch(&self, parker: &Arc<Parker>, claim: Option<&Arc<Claim>>) {
        let mut st = lock(&self.state);
        if let Some(claim) = claim {
            if let Some(i) = st.selecting.iter().position(|c| Arc::ptr_eq(c, claim)) {
                st.selecting.swap_remove(i);
            }
        }
        st.waiters.unregister(parker);
    }
}

/// Shared, bidirectional channel handle.
pub struct Channel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("cap", &self.inner.cap)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> Channel<T> {
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap
    }

    /// Buffered values. Always 0 for a rendezvous channel.
    pub fn len(&self) -> usize {
        if self.inner.cap == 0 {
            0
        } else {
            lock(&self.inner.state).buf.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Blocking send. Parks while the buffer is full, or until a receiver
    /// takes the value on a rendezvous channel.
    pub fn send(&self, value: T) {
        self.inner.send(value)
    }

    /// Blocking receive. `None` once closed and drained.
    pub fn recv(&self) -> Option<T> {
        self.inner.recv()
    }

    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.inner.try_send(value)
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.inner.try_recv()
    }

    pub fn close(&self) {
        self.inner.close()
    }

    pub fn sender(&self) -> Sender<T> {
        Sender {
            inner: self.inner.clone(),
        }
    }

    pub fn receiver(&self) -> Receiver<T> {
        Receiver {
            inner: self.inner.clone(),
        }
    }

    /// Directional halves, for handing to producer and consumer roles.
    pub fn split(self) -> (Sender<T>, Receiver<T>) {
        (self.sender(), self.receiver())
    }
}

/// Sending half of a channel. Holds the closing right.
pub struct Sender<T> {
    pub(crate) inner: Arc<Inner<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sender").field(&self.inner.id).finish()
    }
}

impl<T> Sender<T> {
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap
    }

    /// Blocking send (see `Channel::send`).
    pub fn send(&self, value: T) {
        self.inner.send(value)
    }

    /// Non-blocking send attempt.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.inner.try_send(value)
    }

    /// Mark the channel closed. Must happen at most once, after the last send.
    pub fn close(&self) {
        self.inner.close()
    }
}

/// Receiving half of a channel.
pub struct Receiver<T> {
    pub(crate) inner: Arc<Inner<T>>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Receiver {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Receiver").field(&self.inner.id).finish()
    }
}

impl<T> Receiver<T> {
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Blocking receive. `None` once closed and drained.
    pub fn recv(&self) -> Option<T> {
        self.inner.recv()
    }

    /// Non-blocking receive attempt.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.inner.try_recv()
    }

    /// Receive with timeout. `Ok(None)` means closed and drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>, TimedOut> {
        match Select::new().recv(self, |v| v).try_select(timeout) {
            Selected::Ready(v) => Ok(v),
            Selected::TimedOut => Err(TimedOut),
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Iterate until the channel is closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { rx: self }
    }
}

pub struct Iter<'a, T> {
    rx: &'a Receiver<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.recv()
    }
}

pub struct IntoIter<T> {
    rx: Receiver<T>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.recv()
    }
}

impl<T> IntoIterator for Receiver<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter { rx: self }
    }
}

impl<'a, T> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
