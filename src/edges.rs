//! Denormalization edge queue.
//!
//! An edge says "these children changed under this parent". Edges are
//! produced by the read path and the refresh tasks and consumed by a
//! single drain loop, which serializes updates per parent. The buffer
//! coalesces edges of the same kind and parent so a burst of lookups
//! against one work costs one deserialize of that work instead of many.

use std::collections::{BTreeSet, HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// What relationship an edge updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Add/refresh works on an author.
    Author,
    /// Add/refresh editions on a work.
    Work,
    /// A background author refresh finished; carries no children.
    RefreshDone,
}

/// A parent/child relationship update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub kind: EdgeKind,
    pub parent_id: i64,
    pub child_ids: BTreeSet<i64>,
}

impl Edge {
    pub fn author(author_id: i64, work_ids: impl IntoIterator<Item = i64>) -> Self {
        Edge {
            kind: EdgeKind::Author,
            parent_id: author_id,
            child_ids: work_ids.into_iter().collect(),
        }
    }

    pub fn work(work_id: i64, book_ids: impl IntoIterator<Item = i64>) -> Self {
        Edge {
            kind: EdgeKind::Work,
            parent_id: work_id,
            child_ids: book_ids.into_iter().collect(),
        }
    }

    pub fn refresh_done(author_id: i64) -> Self {
        Edge {
            kind: EdgeKind::RefreshDone,
            parent_id: author_id,
            child_ids: BTreeSet::new(),
        }
    }
}

#[derive(Default)]
struct Inner {
    /// FIFO of pending (kind, parent) slots.
    queue: VecDeque<(EdgeKind, i64)>,
    /// Child sets for queued author/work slots, merged on push.
    pending: HashMap<(EdgeKind, i64), BTreeSet<i64>>,
    /// Total children waiting across all slots.
    size: usize,
    closed: bool,
}

/// Thread-safe coalescing FIFO of [`Edge`]s.
///
/// The presence check and child-set merge happen under one lock, so a
/// concurrent push for an already-queued parent is a set union, not a
/// duplicate entry. Pops are FIFO by first-push order; per-child
/// ordering inside a merged slot is sacrificed for set semantics.
#[derive(Default)]
pub struct EdgeBuffer {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl EdgeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an edge, merging into an already-queued slot when one
    /// exists. Returns how many children were newly added. Pushes after
    /// [`close`](Self::close) are dropped.
    pub fn push(&self, edge: Edge) -> usize {
        let mut guard = self.inner.lock();
        if guard.closed {
            return 0;
        }
        let inner = &mut *guard;

        let added = match edge.kind {
            EdgeKind::RefreshDone => {
                // Completion markers are never merged.
                inner.queue.push_back((edge.kind, edge.parent_id));
                0
            }
            EdgeKind::Author | EdgeKind::Work => {
                use std::collections::hash_map::Entry;
                let slot = (edge.kind, edge.parent_id);
                match inner.pending.entry(slot) {
                    Entry::Occupied(mut occupied) => {
                        let existing = occupied.get_mut();
                        let before = existing.len();
                        existing.extend(edge.child_ids);
                        existing.len() - before
                    }
                    Entry::Vacant(vacant) => {
                        let added = edge.child_ids.len();
                        inner.queue.push_back(slot);
                        vacant.insert(edge.child_ids);
                        added
                    }
                }
            }
        };
        inner.size += added;
        drop(guard);

        self.notify.notify_one();
        added
    }

    /// Dequeue the next edge in FIFO order, waiting if the buffer is
    /// empty. Returns `None` once the buffer is closed and drained.
    pub async fn pop(&self) -> Option<Edge> {
        loop {
            // Register interest before checking, so a push between the
            // check and the await still wakes us.
            let notified = self.notify.notified();

            {
                let mut inner = self.inner.lock();
                if let Some((kind, parent_id)) = inner.queue.pop_front() {
                    let child_ids = match kind {
                        EdgeKind::RefreshDone => BTreeSet::new(),
                        _ => inner.pending.remove(&(kind, parent_id)).unwrap_or_default(),
                    };
                    inner.size -= child_ids.len();
                    return Some(Edge {
                        kind,
                        parent_id,
                        child_ids,
                    });
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Total children currently waiting. Used for metrics and shutdown
    /// quiescence.
    pub fn len(&self) -> usize {
        self.inner.lock().size
    }

    /// True when no slots are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Stop accepting pushes and wake consumers so they can drain and
    /// exit.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }
}
