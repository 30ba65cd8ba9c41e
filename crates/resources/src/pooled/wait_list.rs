//! Slab-backed wait nodes and the two admission queues threaded through them
//!
//! Nodes live in a [`Slab`]; vacated slots are reused by the next waiter, so
//! a steady-state limiter stops allocating once the slab has grown to its
//! peak queue depth. Each queue is a doubly linked list of slab keys, which
//! keeps removal of a canceled waiter O(1).

use std::task::Waker;

use slab::Slab;

/// How a queued waiter was resolved
///
/// `Signaled` and `Disposed` nodes were unlinked by the resolving side.
/// A `Canceled` node is still linked; whoever consumes it unlinks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum NodeOutcome {
    Pending,
    Signaled,
    Canceled,
    Disposed,
}

#[derive(Debug)]
pub(super) struct WaitNode {
    prioritized: bool,
    prev: Option<usize>,
    next: Option<usize>,
    pub(super) outcome: NodeOutcome,
    pub(super) waker: Option<Waker>,
}

#[derive(Debug, Default)]
struct Lane {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl Lane {
    fn push_back(&mut self, nodes: &mut Slab<WaitNode>, key: usize) {
        nodes[key].prev = self.tail;
        nodes[key].next = None;
        match self.tail {
            Some(tail) => nodes[tail].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        self.len += 1;
    }

    fn pop_front(&mut self, nodes: &mut Slab<WaitNode>) -> Option<usize> {
        let key = self.head?;
        self.unlink(nodes, key);
        Some(key)
    }

    fn unlink(&mut self, nodes: &mut Slab<WaitNode>, key: usize) {
        let (prev, next) = {
            let node = &mut nodes[key];
            (node.prev.take(), node.next.take())
        };
        match prev {
            Some(prev) => nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => nodes[next].prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }
}

/// Waiters of one pooled limiter, guarded by its lock
#[derive(Debug, Default)]
pub(super) struct WaitList {
    nodes: Slab<WaitNode>,
    /// Prioritized (in-flight) waiters, unbounded
    prioritized: Lane,
    /// Regular (incoming) waiters, bounded by the limiter
    regular: Lane,
}

impl WaitList {
    pub(super) fn regular_len(&self) -> usize {
        self.regular.len
    }

    pub(super) fn len(&self) -> usize {
        self.prioritized.len + self.regular.len
    }

    /// Rent a node and append it to the matching queue
    pub(super) fn enqueue(&mut self, prioritized: bool) -> usize {
        let key = self.nodes.insert(WaitNode {
            prioritized,
            prev: None,
            next: None,
            outcome: NodeOutcome::Pending,
            waker: None,
        });
        if prioritized {
            self.prioritized.push_back(&mut self.nodes, key);
        } else {
            self.regular.push_back(&mut self.nodes, key);
        }
        key
    }

    pub(super) fn node_mut(&mut self, key: usize) -> &mut WaitNode {
        &mut self.nodes[key]
    }

    /// Resolve the first waiter, prioritized before regular
    ///
    /// Returns `None` when nobody is waiting.
    pub(super) fn signal_next(&mut self) -> Option<Option<Waker>> {
        let key = self
            .prioritized
            .pop_front(&mut self.nodes)
            .or_else(|| self.regular.pop_front(&mut self.nodes))?;
        let node = &mut self.nodes[key];
        node.outcome = NodeOutcome::Signaled;
        Some(node.waker.take())
    }

    /// Mark a pending waiter canceled; it stays linked until consumed
    ///
    /// Returns the outcome the node held before the call.
    pub(super) fn cancel(&mut self, key: usize) -> NodeOutcome {
        let node = &mut self.nodes[key];
        let previous = node.outcome;
        if previous == NodeOutcome::Pending {
            node.outcome = NodeOutcome::Canceled;
        }
        previous
    }

    /// Take a resolved node's outcome and give the node back to the pool
    ///
    /// A canceled node is unlinked from whichever queue still holds it.
    /// `recycle` is false while the limiter is being torn down, in which case
    /// the pool itself is released once the last node is consumed.
    pub(super) fn consume(&mut self, key: usize, recycle: bool) -> NodeOutcome {
        let outcome = self.nodes[key].outcome;
        if outcome == NodeOutcome::Canceled {
            if self.nodes[key].prioritized {
                self.prioritized.unlink(&mut self.nodes, key);
            } else {
                self.regular.unlink(&mut self.nodes, key);
            }
        }
        self.nodes.remove(key);

        if !recycle && self.nodes.is_empty() {
            self.nodes = Slab::new();
        }
        outcome
    }

    /// Resolve every queued waiter as disposed, returning their wakers
    pub(super) fn dispose_all(&mut self) -> Vec<Waker> {
        let mut wakers = Vec::with_capacity(self.len());
        for lane in [&mut self.prioritized, &mut self.regular] {
            while let Some(key) = lane.pop_front(&mut self.nodes) {
                let node = &mut self.nodes[key];
                node.outcome = NodeOutcome::Disposed;
                wakers.extend(node.waker.take());
            }
        }
        wakers
    }

    /// Slab slots currently allocated, occupied or free
    #[cfg(test)]
    pub(super) fn pool_capacity(&self) -> usize {
        self.nodes.capacity()
    }

    #[cfg(test)]
    fn outcome(&self, key: usize) -> NodeOutcome {
        self.nodes[key].outcome
    }
}
