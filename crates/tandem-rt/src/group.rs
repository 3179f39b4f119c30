// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fan-out/join groups.
//!
//! A group tracks one completion flag per member and a count of members still
//! outstanding. Each member gets a `Done` token; `join` parks until every
//! token has been marked.
//!
//! A token dropped unmarked (including by a member that panicked) leaves its
//! member outstanding forever, so `join` never returns. That is logged, not
//! repaired.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::context;
use crate::error::{raise, Fatal};
use crate::park::{deadline_after, lock, Wake, WaitList, WaitOp};
use crate::runtime::Runtime;
use crate::spawn::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl GroupId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        GroupId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

struct GroupState {
    done: Vec<bool>,
    outstanding: usize,
    waiters: WaitList,
}

struct GroupInner {
    id: GroupId,
    state: Mutex<GroupState>,
}

impl GroupInner {
    fn complete(&self, member: usize) {
        let mut st = lock(&self.state);
        if st.done.get(member).copied().unwrap_or(true) {
            drop(st);
            raise(Fatal::DoubleDone {
                group: self.id,
                member,
            });
        }
        st.done[member] = true;
        st.outstanding -= 1;
        if st.outstanding == 0 {
            tracing::debug!(group = %self.id, members = st.done.len(), "group complete");
            st.waiters.notify_all();
        }
    }

    /// Park until nothing is outstanding or until `deadline`.
    fn wait(&self, deadline: Option<std::time::Instant>) -> bool {
        let parker = context::parker();
        let mut st = lock(&self.state);
        loop {
            if st.outstanding == 0 {
                return true;
            }
            st.waiters.register(&parker);
            drop(st);
            let wake = context::block(WaitOp::GroupJoin { group: self.id }, deadline);
            st = lock(&self.state);
            st.waiters.unregister(&parker);
            if wake == Wake::TimedOut && st.outstanding > 0 {
                return false;
            }
        }
    }
}

/// Completion token for one group member.
///
/// `mark_done` consumes it, so a member cannot signal twice.
pub struct Done {
    group: Arc<GroupInner>,
    member: usize,
    marked: bool,
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done")
            .field("group", &self.group.id)
            .field("member", &self.member)
            .finish()
    }
}

impl Done {
    pub fn group(&self) -> GroupId {
        self.group.id
    }

    pub fn member(&self) -> usize {
        self.member
    }

    pub fn mark_done(mut self) {
        self.marked = true;
        self.group.complete(self.member);
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if !self.marked {
            tracing::warn!(
                group = %self.group.id,
                member = self.member,
                "completion token dropped unmarked; join will never return"
            );
        }
    }
}

/// Launches members on a runtime and joins them.
#[derive(Clone)]
pub struct Group {
    rt: Runtime,
    inner: Arc<GroupInner>,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.inner.id)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl Group {
    pub fn new(rt: &Runtime) -> Self {
        Self {
            rt: rt.clone(),
            inner: Arc::new(GroupInner {
                id: GroupId::next(),
                state: Mutex::new(GroupState {
                    done: Vec::new(),
                    outstanding: 0,
                    waiters: WaitList::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> GroupId {
        self.inner.id
    }

    /// Register one more member and hand out its token.
    pub fn add(&self) -> Done {
        let mut st = lock(&self.inner.state);
        let member = st.done.len();
        st.done.push(false);
        st.outstanding += 1;
        Done {
            group: self.inner.clone(),
            member,
            marked: false,
        }
    }

    /// Spawn `n` members running `f(index, done)`. The member tasks are
    /// detached; completion is observed through `join` only.
    #[track_caller]
    pub fn launch<F>(&self, n: usize, f: F) -> Vec<TaskId>
    where
        F: Fn(usize, Done) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut ids = Vec::with_capacity(n);
        for index in 0..n {
            let done = self.add();
            let f = f.clone();
            let handle = self
                .rt
                .spawn_named(format!("{}[{}]", self.inner.id, index), move || f(index, done));
            ids.push(handle.id());
            handle.detach();
        }
        tracing::debug!(group = %self.inner.id, n, "group launched");
        ids
    }

    /// Park until every member has marked done.
    pub fn join(&self) {
        self.inner.wait(None);
    }

    /// Bounded `join`. Returns whether the group completed in time.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        self.inner.wait(Some(deadline_after(timeout)))
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.inner.state).outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JoinError;
    use crate::RuntimeConfig;
    use std::sync::atomic::AtomicUsize;

    fn rt() -> Runtime {
        Runtime::new(RuntimeConfig::default().with_procs(2))
    }

    #[test]
    fn empty_group_joins_immediately() {
        let g = Group::new(&rt());
        assert_eq!(g.outstanding(), 0);
        g.join();
    }

    #[test]
    fn launch_and_join() {
        let rt = rt();
        let g = Group::new(&rt);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let ids = g.launch(8, move |_, done| {
            h.fetch_add(1, Ordering::SeqCst);
            done.mark_done();
        });
        assert_eq!(ids.len(), 8);
        g.join();
        assert_eq!(hits.load(Ordering::SeqCst), 8);
        assert_eq!(g.outstanding(), 0);
    }

    #[test]
    fn indices_are_distinct() {
        let rt = rt();
        let g = Group::new(&rt);
        let (tx, rx) = crate::channel::buffered::<usize>(5).split();
        g.launch(5, move |i, done| {
            tx.send(i);
            done.mark_done();
        });
        g.join();
        let mut seen: Vec<usize> = (0..5).filter_map(|_| rx.recv()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn unmarked_member_blocks_join() {
        let g = Group::new(&rt());
        let first = g.add();
        let _second = g.add();
        first.mark_done();
        assert_eq!(g.outstanding(), 1);
        assert!(!g.join_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn dropped_token_never_completes() {
        let g = Group::new(&rt());
        drop(g.add());
        assert!(!g.join_timeout(Duration::from_millis(10)));
        assert_eq!(g.outstanding(), 1);
    }

    #[test]
    fn double_completion_is_fatal() {
        let rt = rt();
        let g = Group::new(&rt);
        let mut done = g.add();
        done.marked = true;
        let inner = done.group.clone();
        let h = rt.spawn(move || {
            inner.complete(0);
            inner.complete(0);
        });
        match h.join() {
            Err(JoinError::Fatal(Fatal::DoubleDone { group, member })) => {
                assert_eq!(group, g.id());
                assert_eq!(member, 0);
            }
            other => panic!("expected DoubleDone, got {:?}", other),
        }
        // The first completion counted exactly once.
        assert_eq!(g.outstanding(), 0);
    }
}
