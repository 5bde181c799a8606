use crate::buffer::handle::{BlockHandle, BlockInner};
use crossbeam_queue::SegQueue;
use std::sync::{Arc, Weak};

/// Queue entry pairing a non-owning handle reference with the handle's
/// eviction timestamp at enqueue time.
///
/// Nodes never extend handle lifetime. Multiple nodes for the same handle
/// may coexist in the queue; only the one carrying the handle's current
/// timestamp is live, all older ones are dead.
pub(crate) struct BufferEvictionNode {
    handle: Weak<BlockHandle>,
    timestamp: u64,
}

impl BufferEvictionNode {
    #[inline]
    pub(crate) fn new(handle: Weak<BlockHandle>, timestamp: u64) -> Self {
        BufferEvictionNode { handle, timestamp }
    }

    /// Whether the referenced handle still exists.
    ///
    /// This is the only validity check the purger applies: a node whose
    /// timestamp is outdated must stay in the queue, because its handle may
    /// be pinned right now and dropping the node could lose the handle's
    /// only chance to be observed by eviction later.
    #[inline]
    pub(crate) fn is_alive(&self) -> bool {
        self.handle.strong_count() > 0
    }

    /// Whether this node still permits unloading its handle.
    /// Must be called with the handle lock held.
    #[inline]
    pub(crate) fn can_unload(&self, handle: &BlockHandle, inner: &BlockInner) -> bool {
        if self.timestamp != handle.eviction_timestamp() {
            // handle was used in between
            return false;
        }
        handle.can_unload(inner)
    }

    /// Upgrades to a strong reference if the handle is still alive and this
    /// node is still the latest one enqueued for it. Callers re-validate
    /// under the handle lock before unloading.
    #[inline]
    pub(crate) fn try_get_block_handle(&self) -> Option<Arc<BlockHandle>> {
        let handle = self.handle.upgrade()?;
        if self.timestamp != handle.eviction_timestamp() {
            // a newer node supersedes this one
            return None;
        }
        Some(handle)
    }
}

/// Unbounded lock-free MPMC queue of eviction nodes.
///
/// Ordering across producers is not strict; eviction treats the queue as an
/// unordered multiset with bulk access, which is what makes the overall
/// policy LRU-approximate.
pub(crate) struct EvictionQueue {
    q: SegQueue<BufferEvictionNode>,
}

impl EvictionQueue {
    #[inline]
    pub(crate) fn new() -> Self {
        EvictionQueue { q: SegQueue::new() }
    }

    #[inline]
    pub(crate) fn try_enqueue(&self, node: BufferEvictionNode) {
        self.q.push(node);
    }

    #[inline]
    pub(crate) fn enqueue_bulk(&self, nodes: impl IntoIterator<Item = BufferEvictionNode>) {
        for node in nodes {
            self.q.push(node);
        }
    }

    #[inline]
    pub(crate) fn try_dequeue(&self) -> Option<BufferEvictionNode> {
        self.q.pop()
    }

    /// Dequeues up to `max` nodes into `buf` and returns the number taken.
    #[inline]
    pub(crate) fn try_dequeue_bulk(&self, buf: &mut Vec<BufferEvictionNode>, max: usize) -> usize {
        let mut taken = 0;
        while taken < max {
            match self.q.pop() {
                Some(node) => {
                    buf.push(node);
                    taken += 1;
                }
                None => break,
            }
        }
        taken
    }

    /// Best-effort size; may be stale under concurrent access.
    #[inline]
    pub(crate) fn size_approx(&self) -> usize {
        self.q.len()
    }
}
