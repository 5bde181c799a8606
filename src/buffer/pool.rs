use crate::buffer::evict::{BufferEvictionNode, EvictionQueue};
use crate::buffer::file_buffer::FileBuffer;
use crate::buffer::handle::BlockHandle;
use crate::buffer::temp::TemporaryMemoryManager;
use crate::buffer::usage::{BufferPoolReservation, MemoryTag, MemoryUsage};
use crate::error::{Error, Result};
use byte_unit::Byte;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use scopeguard::defer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const DEFAULT_MAX_MEM_SIZE: Byte = Byte::from_u64(1024 * 1024 * 1024); // by default 1GB
pub const DEFAULT_INSERT_INTERVAL: usize = 1024;
pub const DEFAULT_PURGE_SIZE_MULTIPLIER: usize = 2;
pub const DEFAULT_EARLY_OUT_MULTIPLIER: usize = 4;
pub const DEFAULT_ALIVE_NODE_MULTIPLIER: usize = 4;

/// Outcome of one eviction pass.
///
/// The reservation books `extra_memory` for the caller. On failure it has
/// already been resized to zero, so dropping it is a no-op.
pub struct EvictionResult {
    pub success: bool,
    pub reservation: BufferPoolReservation,
}

/// Buffer pool with concurrent LRU-approximate eviction.
///
/// The pool enforces a global memory budget over blocks owned by external
/// subsystems. It never holds a strong reference to a block handle; the
/// eviction queue stores weak nodes stamped with the handle's use counter.
///
/// 1. Unpinning a handle enqueues a node. Any older node for the same
///    handle becomes dead without touching the queue, because its stamp no
///    longer matches.
///
/// 2. Allocation pressure drives [`BufferPool::evict_blocks`], which books
///    the requested bytes eagerly, then walks the queue unloading blocks
///    until usage fits the limit. Dead nodes are discarded on the way.
///
/// 3. Dead nodes that eviction never reaches are compacted in bulk by a
///    cooperative purge, triggered every `insert_interval` insertions.
///    Only one purger runs at a time.
pub struct BufferPool {
    usage: Arc<MemoryUsage>,
    maximum_memory: CachePadded<AtomicUsize>,
    queue: EvictionQueue,
    temporary_memory_manager: TemporaryMemoryManager,
    /// Rises with every enqueued node, falls during eviction and purge.
    /// Drives the purge trigger cadence.
    evict_queue_insertions: CachePadded<AtomicUsize>,
    /// Estimate of invalidated nodes still in the queue.
    total_dead_nodes: CachePadded<AtomicUsize>,
    /// True while exactly one purger sweeps the queue. Also excludes the
    /// escalated dequeue in eviction from overlapping with a purge.
    purge_active: AtomicBool,
    /// Scratch buffer reused across purge iterations. Only the active
    /// purger touches it.
    purge_nodes: Mutex<Vec<BufferEvictionNode>>,
    /// Serializes limit changes.
    limit_lock: Mutex<()>,
    insert_interval: usize,
    purge_size_multiplier: usize,
    early_out_multiplier: usize,
    alive_node_multiplier: usize,
}

impl BufferPool {
    /// Creates a pool with the given memory limit and default tunables.
    #[inline]
    pub fn new(maximum_memory: usize) -> Self {
        BufferPoolConfig::default()
            .max_mem_size(maximum_memory as u64)
            .build()
    }

    /// Shared accounting, also handed to block handles at registration.
    #[inline]
    pub fn memory_usage(&self) -> &Arc<MemoryUsage> {
        &self.usage
    }

    #[inline]
    pub fn used_memory(&self) -> usize {
        self.usage.used()
    }

    #[inline]
    pub fn used_memory_by_tag(&self, tag: MemoryTag) -> usize {
        self.usage.used_by_tag(tag)
    }

    #[inline]
    pub fn max_memory(&self) -> usize {
        self.maximum_memory.load(Ordering::Relaxed)
    }

    /// Per-query memory ceiling. Currently the global limit.
    #[inline]
    pub fn query_max_memory(&self) -> usize {
        self.max_memory()
    }

    #[inline]
    pub fn temporary_memory_manager(&self) -> &TemporaryMemoryManager {
        &self.temporary_memory_manager
    }

    #[inline]
    pub fn increase_used_memory(&self, tag: MemoryTag, size: usize) {
        self.usage.increase(tag, size);
    }

    #[inline]
    pub fn decrease_used_memory(&self, tag: MemoryTag, size: usize) {
        self.usage.decrease(tag, size);
    }

    #[inline]
    pub(crate) fn total_dead_nodes(&self) -> usize {
        self.total_dead_nodes.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn queue_size_approx(&self) -> usize {
        self.queue.size_approx()
    }

    /// Enqueues an eviction node for an unpinned handle.
    ///
    /// The caller must hold the handle lock, or still own the handle
    /// exclusively (registration of a local block as managed).
    ///
    /// Returns true when the caller should trigger [`BufferPool::purge_queue`].
    #[inline]
    pub fn add_to_eviction_queue(&self, handle: &Arc<BlockHandle>) -> bool {
        debug_assert!(handle.readers() == 0);
        let ts = handle.bump_eviction_timestamp();

        self.queue
            .try_enqueue(BufferEvictionNode::new(Arc::downgrade(handle), ts));

        if ts != 1 {
            // we add a newer version, i.e., we kill exactly one previous version
            self.total_dead_nodes.fetch_add(1, Ordering::Relaxed);
        }

        self.evict_queue_insertions.fetch_add(1, Ordering::Relaxed) + 1 >= self.insert_interval
    }

    /// Unloads blocks until used memory fits `memory_limit`, with
    /// `extra_memory` booked for the caller up front.
    ///
    /// The reservation is taken before any unloading so a racing peer
    /// cannot consume the bytes this caller is about to free for itself.
    ///
    /// When `buffer` is given and an unloadable block of exactly
    /// `extra_memory` bytes is found, its buffer is handed over instead of
    /// being freed, skipping one free/alloc round-trip.
    #[inline]
    pub fn evict_blocks(
        &self,
        tag: MemoryTag,
        extra_memory: usize,
        memory_limit: usize,
        mut buffer: Option<&mut Option<FileBuffer>>,
    ) -> EvictionResult {
        let mut reservation = self.usage.reserve(tag, extra_memory);

        while self.usage.used() > memory_limit {
            // get a node to unload from the queue
            let node = match self.queue.try_dequeue() {
                Some(node) => node,
                None => {
                    // the dequeue may fail spuriously under contention, so try
                    // one more time, but more aggressively
                    match self.try_dequeue_without_concurrent_purge() {
                        Some(node) => node,
                        None => {
                            // still no success, we return
                            reservation.resize(0);
                            return EvictionResult {
                                success: false,
                                reservation,
                            };
                        }
                    }
                }
            };

            saturating_sub_atomic(&self.evict_queue_insertions, 1);

            // get a strong reference to the underlying handle
            let handle = match node.try_get_block_handle() {
                Some(handle) => handle,
                None => {
                    saturating_sub_atomic(&self.total_dead_nodes, 1);
                    continue;
                }
            };

            // we might be able to free this block: grab the lock and re-check
            let mut inner = handle.lock();
            if !node.can_unload(&handle, &inner) {
                // something changed in the mean-time, bail out
                saturating_sub_atomic(&self.total_dead_nodes, 1);
                continue;
            }

            if let Some(out) = buffer.as_deref_mut() {
                if handle.alloc_size() == extra_memory {
                    // we can re-use the memory directly
                    *out = Some(handle.unload_and_take_buffer(&mut inner));
                    return EvictionResult {
                        success: true,
                        reservation,
                    };
                }
            }

            // release the memory and mark the block as unloaded
            handle.unload(&mut inner);
        }

        EvictionResult {
            success: true,
            reservation,
        }
    }

    /// Escalated dequeue used when a plain dequeue fails: holding the purge
    /// flag rules out a concurrent purge as the cause of the failure.
    #[inline]
    fn try_dequeue_without_concurrent_purge(&self) -> Option<BufferEvictionNode> {
        // we only proceed if we can guarantee that there is no active purge
        while self
            .purge_active
            .compare_exchange_weak(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            std::hint::spin_loop();
        }

        let node = self.queue.try_dequeue();
        self.purge_active.store(false, Ordering::SeqCst);
        node
    }

    /// One bulk sweep: dequeue up to `purge_size` nodes, keep those whose
    /// handle still exists, drop the rest.
    ///
    /// Nodes with an outdated stamp but a living handle are kept on
    /// purpose: the handle may be pinned right now, and this node may be
    /// its only remaining chance to be observed by eviction.
    #[inline]
    fn purge_iteration(&self, purge_size: usize) {
        let mut purge_nodes = self.purge_nodes.lock();
        // shrink the scratch only when this purge is much smaller than the
        // previous one; growth is handled by the bulk dequeue itself
        if purge_size < purge_nodes.capacity() / 2 {
            purge_nodes.shrink_to(purge_size);
        }
        purge_nodes.clear();

        // bulk purge
        let actually_dequeued = self.queue.try_dequeue_bulk(&mut purge_nodes, purge_size);

        // retrieve all alive nodes that have been wrongly dequeued
        let mut alive_nodes = 0;
        for i in 0..actually_dequeued {
            if purge_nodes[i].is_alive() {
                purge_nodes.swap(alive_nodes, i);
                alive_nodes += 1;
            }
        }
        let dropped = actually_dequeued - alive_nodes;

        // bulk enqueue the survivors
        self.queue.enqueue_bulk(purge_nodes.drain(..alive_nodes));
        purge_nodes.clear();

        saturating_sub_atomic(&self.total_dead_nodes, dropped);
    }

    /// Cooperative queue compaction. Idempotent and safe from any thread;
    /// all threads but one early-out.
    #[inline]
    pub fn purge_queue(&self) {
        // only one thread purges the queue, all other threads early-out
        if self
            .purge_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        defer! {
            self.purge_active.store(false, Ordering::SeqCst);
        }

        // retrieve the number of insertions since the previous purge,
        // expected to be around insert_interval
        let queue_insertions = saturating_sub_atomic(&self.evict_queue_insertions, self.insert_interval);
        let purge_size = queue_insertions.saturating_mul(self.purge_size_multiplier);
        if purge_size == 0 {
            return;
        }

        let mut approx_q_size = self.queue.size_approx();

        // early-out if the queue is not big enough to justify purging,
        // we want to keep the LRU characteristic alive
        if approx_q_size < purge_size.saturating_mul(self.early_out_multiplier) {
            return;
        }

        // Purging slightly more than was inserted makes the trigger fire
        // less often than insertion would suggest. When dead nodes pile up
        // faster than that, keep sweeping until one of the exits below:
        //
        // 1. the queue shrank below the early-out bound;
        // 2. the alive/dead ratio recovered past the configured multiplier;
        // 3. the whole queue has been traversed (max_purges reaches zero,
        //    the hard bound that guarantees termination).
        let mut max_purges = approx_q_size / purge_size;
        while max_purges != 0 {
            self.purge_iteration(purge_size);

            approx_q_size = self.queue.size_approx();
            if approx_q_size < purge_size.saturating_mul(self.early_out_multiplier) {
                return;
            }

            let approx_dead_nodes = self
                .total_dead_nodes
                .load(Ordering::Relaxed)
                .min(approx_q_size);
            let approx_alive_nodes = approx_q_size - approx_dead_nodes;
            if approx_alive_nodes.saturating_mul(self.alive_node_multiplier - 1) > approx_dead_nodes
            {
                return;
            }

            max_purges -= 1;
        }
    }

    /// Changes the memory limit, evicting to fit.
    ///
    /// Eviction runs twice: once before the new limit is published to
    /// create headroom, and once after, because allocations racing with the
    /// change may have consumed it in between. On failure the previous
    /// limit stays in effect and `postscript` is carried in the error.
    #[inline]
    pub fn set_limit(&self, limit: usize, postscript: &str) -> Result<()> {
        let _limit_guard = self.limit_lock.lock();

        // try to evict until the limit is reached
        if !self
            .evict_blocks(MemoryTag::Extension, 0, limit, None)
            .success
        {
            return Err(Error::OutOfMemory {
                limit,
                postscript: postscript.to_string(),
            });
        }
        let old_limit = self.max_memory();
        // publish the new limit, then evict again
        self.maximum_memory.store(limit, Ordering::Relaxed);
        if !self
            .evict_blocks(MemoryTag::Extension, 0, limit, None)
            .success
        {
            // failed: go back to old limit
            self.maximum_memory.store(old_limit, Ordering::Relaxed);
            return Err(Error::OutOfMemory {
                limit,
                postscript: postscript.to_string(),
            });
        }
        self.temporary_memory_manager.update_memory_limit(limit);
        Ok(())
    }
}

/// Decrements `counter` by `sub`, stopping at zero instead of wrapping.
/// The insertion and dead-node counters are estimates; letting them wrap
/// would poison the purge heuristics for a long time.
#[inline]
fn saturating_sub_atomic(counter: &AtomicUsize, sub: usize) -> usize {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        let new = current.saturating_sub(sub);
        match counter.compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(prev) => return prev,
            Err(actual) => current = actual,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    max_mem_size: Byte,
    insert_interval: usize,
    purge_size_multiplier: usize,
    early_out_multiplier: usize,
    alive_node_multiplier: usize,
}

impl Default for BufferPoolConfig {
    #[inline]
    fn default() -> Self {
        BufferPoolConfig {
            max_mem_size: DEFAULT_MAX_MEM_SIZE,
            insert_interval: DEFAULT_INSERT_INTERVAL,
            purge_size_multiplier: DEFAULT_PURGE_SIZE_MULTIPLIER,
            early_out_multiplier: DEFAULT_EARLY_OUT_MULTIPLIER,
            alive_node_multiplier: DEFAULT_ALIVE_NODE_MULTIPLIER,
        }
    }
}

impl BufferPoolConfig {
    #[inline]
    pub fn max_mem_size<T>(mut self, max_mem_size: T) -> Self
    where
        Byte: From<T>,
    {
        self.max_mem_size = Byte::from(max_mem_size);
        self
    }

    /// Number of insertions after which callers are asked to purge.
    #[inline]
    pub fn insert_interval(mut self, insert_interval: usize) -> Self {
        self.insert_interval = insert_interval;
        self
    }

    /// Each purge sweeps this multiple of the insertions since the last one.
    #[inline]
    pub fn purge_size_multiplier(mut self, purge_size_multiplier: usize) -> Self {
        self.purge_size_multiplier = purge_size_multiplier;
        self
    }

    /// Queues smaller than `purge_size * early_out_multiplier` are not purged.
    #[inline]
    pub fn early_out_multiplier(mut self, early_out_multiplier: usize) -> Self {
        self.early_out_multiplier = early_out_multiplier;
        self
    }

    /// The purge loop keeps sweeping while dead nodes outnumber alive ones
    /// by this multiplier.
    #[inline]
    pub fn alive_node_multiplier(mut self, alive_node_multiplier: usize) -> Self {
        self.alive_node_multiplier = alive_node_multiplier;
        self
    }

    /// Builds the pool. Tunables are clamped so the purge heuristics stay
    /// well-defined.
    #[inline]
    pub fn build(self) -> BufferPool {
        let maximum_memory = self.max_mem_size.as_u64() as usize;
        BufferPool {
            usage: Arc::new(MemoryUsage::new()),
            maximum_memory: CachePadded::new(AtomicUsize::new(maximum_memory)),
            queue: EvictionQueue::new(),
            temporary_memory_manager: TemporaryMemoryManager::new(maximum_memory),
            evict_queue_insertions: CachePadded::new(AtomicUsize::new(0)),
            total_dead_nodes: CachePadded::new(AtomicUsize::new(0)),
            purge_active: AtomicBool::new(false),
            purge_nodes: Mutex::new(vec![]),
            limit_lock: Mutex::new(()),
            insert_interval: self.insert_interval.max(1),
            purge_size_multiplier: self.purge_size_multiplier.max(1),
            early_out_multiplier: self.early_out_multiplier.max(1),
            alive_node_multiplier: self.alive_node_multiplier.max(2),
        }
    }

    /// Builds the pool, leaks it to the heap and returns a static reference,
    /// for embedders that share one pool across the whole process lifetime.
    #[inline]
    pub fn build_static(self) -> &'static BufferPool {
        Box::leak(Box::new(self.build()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::handle::BlockState;
    use easy_parallel::Parallel;
    use rand::Rng;

    fn loaded_handle(pool: &BufferPool, tag: MemoryTag, size: usize) -> Arc<BlockHandle> {
        pool.increase_used_memory(tag, size);
        BlockHandle::new_loaded(Arc::clone(pool.memory_usage()), tag, FileBuffer::allocate(size))
    }

    #[test]
    fn test_evict_blocks_basic_unload() {
        let pool = BufferPool::new(100);
        let h1 = loaded_handle(&pool, MemoryTag::BaseTable, 40);
        assert_eq!(pool.used_memory(), 40);
        pool.add_to_eviction_queue(&h1);

        let result = pool.evict_blocks(MemoryTag::BaseTable, 0, 0, None);
        assert!(result.success);
        assert_eq!(pool.used_memory(), 0);
        assert_eq!(h1.state(), BlockState::Unloaded);
    }

    #[test]
    fn test_evict_blocks_reuses_buffer() {
        let pool = BufferPool::new(100);
        let h1 = loaded_handle(&pool, MemoryTag::BaseTable, 40);
        pool.add_to_eviction_queue(&h1);

        let mut out = None;
        let result = pool.evict_blocks(MemoryTag::BaseTable, 40, 0, Some(&mut out));
        assert!(result.success);
        let buffer = out.expect("buffer should be handed over");
        assert_eq!(buffer.alloc_size(), 40);
        assert_eq!(h1.state(), BlockState::Unloaded);
        // only the reservation remains booked
        assert_eq!(pool.used_memory(), 40);
        drop(result);
        assert_eq!(pool.used_memory(), 0);
    }

    #[test]
    fn test_stale_hint_skipped() {
        let pool = BufferPool::new(100);
        let h2 = loaded_handle(&pool, MemoryTag::HashTable, 10);
        pool.add_to_eviction_queue(&h2);
        // second add invalidates the first node
        pool.add_to_eviction_queue(&h2);
        assert_eq!(pool.total_dead_nodes(), 1);
        assert_eq!(pool.queue_size_approx(), 2);

        let result = pool.evict_blocks(MemoryTag::HashTable, 0, 0, None);
        assert!(result.success);
        assert_eq!(pool.used_memory(), 0);
        assert_eq!(h2.state(), BlockState::Unloaded);
        assert_eq!(pool.total_dead_nodes(), 0);
    }

    #[test]
    fn test_evict_blocks_fails_when_all_pinned() {
        let pool = BufferPool::new(100);
        let h = loaded_handle(&pool, MemoryTag::BaseTable, 80);
        pool.add_to_eviction_queue(&h);
        assert!(h.pin());

        let result = pool.evict_blocks(MemoryTag::BaseTable, 10, 40, None);
        assert!(!result.success);
        // the failed reservation has been released
        assert_eq!(result.reservation.size(), 0);
        drop(result);
        assert_eq!(pool.used_memory(), 80);
        assert_eq!(h.state(), BlockState::Loaded);

        // the pinned handle's node was consumed; unpinning re-adds one
        assert!(h.unpin());
        pool.add_to_eviction_queue(&h);
        let result = pool.evict_blocks(MemoryTag::BaseTable, 0, 40, None);
        assert!(result.success);
        assert_eq!(pool.used_memory(), 0);
    }

    #[test]
    fn test_set_limit_rejected_when_pinned() {
        let pool = BufferPool::new(80);
        let h = loaded_handle(&pool, MemoryTag::BaseTable, 80);
        pool.add_to_eviction_queue(&h);
        assert!(h.pin());

        let err = pool.set_limit(40, " suffix").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("40"));
        assert!(msg.contains(" suffix"));
        assert_eq!(pool.max_memory(), 80);
        assert_eq!(pool.used_memory(), 80);
    }

    #[test]
    fn test_set_limit_evicts_to_fit() {
        let pool = BufferPool::new(100);
        let h1 = loaded_handle(&pool, MemoryTag::BaseTable, 40);
        let h2 = loaded_handle(&pool, MemoryTag::BaseTable, 40);
        pool.add_to_eviction_queue(&h1);
        pool.add_to_eviction_queue(&h2);

        pool.set_limit(50, "").unwrap();
        assert_eq!(pool.max_memory(), 50);
        assert!(pool.used_memory() <= 50);
        assert_eq!(pool.query_max_memory(), 50);
    }

    #[test]
    fn test_set_limit_to_zero_unloads_everything() {
        let pool = BufferPool::new(100);
        let handles: Vec<_> = (0..5)
            .map(|_| loaded_handle(&pool, MemoryTag::ColumnData, 10))
            .collect();
        for h in &handles {
            pool.add_to_eviction_queue(h);
        }
        pool.set_limit(0, "").unwrap();
        assert_eq!(pool.used_memory(), 0);
        for h in &handles {
            assert_eq!(h.state(), BlockState::Unloaded);
        }
    }

    #[test]
    fn test_per_tag_accounting_after_eviction() {
        let pool = BufferPool::new(1000);
        let h1 = loaded_handle(&pool, MemoryTag::BaseTable, 100);
        let _h2 = loaded_handle(&pool, MemoryTag::HashTable, 200);
        pool.add_to_eviction_queue(&h1);

        assert_eq!(pool.used_memory_by_tag(MemoryTag::BaseTable), 100);
        assert_eq!(pool.used_memory_by_tag(MemoryTag::HashTable), 200);

        // evict down to the hash table block only
        let result = pool.evict_blocks(MemoryTag::BaseTable, 0, 200, None);
        assert!(result.success);
        assert_eq!(pool.used_memory_by_tag(MemoryTag::BaseTable), 0);
        assert_eq!(pool.used_memory_by_tag(MemoryTag::HashTable), 200);
        assert_eq!(pool.used_memory(), 200);
    }

    #[test]
    fn test_add_to_eviction_queue_purge_trigger() {
        let pool = BufferPoolConfig::default()
            .max_mem_size(1024u64)
            .insert_interval(4)
            .build();
        let h = loaded_handle(&pool, MemoryTag::BaseTable, 8);
        assert!(!pool.add_to_eviction_queue(&h));
        assert!(!pool.add_to_eviction_queue(&h));
        assert!(!pool.add_to_eviction_queue(&h));
        // fourth insertion reaches the interval
        assert!(pool.add_to_eviction_queue(&h));
        // and keeps asking until a purge resets the counter
        assert!(pool.add_to_eviction_queue(&h));

        pool.purge_queue();
        assert!(!pool.add_to_eviction_queue(&h));
    }

    #[test]
    fn test_purge_drops_vanished_keeps_alive() {
        // multipliers tuned so one purge call sweeps the whole queue
        let pool = BufferPoolConfig::default()
            .max_mem_size(1024u64 * 1024)
            .purge_size_multiplier(1)
            .early_out_multiplier(1)
            .build();

        const HANDLES: usize = 5000;
        let mut handles: Vec<_> = (0..HANDLES)
            .map(|_| loaded_handle(&pool, MemoryTag::BaseTable, 16))
            .collect();
        for h in &handles {
            pool.add_to_eviction_queue(h);
            pool.add_to_eviction_queue(h);
        }
        assert_eq!(pool.queue_size_approx(), 2 * HANDLES);
        assert_eq!(pool.total_dead_nodes(), HANDLES);

        // drop half of the handles; their nodes are the only purgeable ones
        handles.truncate(HANDLES / 2);

        let mut prev_size = pool.queue_size_approx();
        for _ in 0..16 {
            pool.purge_queue();
            let size = pool.queue_size_approx();
            if size == prev_size {
                break;
            }
            prev_size = size;
        }

        // survivors: both nodes of every live handle
        assert_eq!(pool.queue_size_approx(), HANDLES);
        assert_eq!(pool.total_dead_nodes(), 0);

        // every live handle can still be found and unloaded through the queue
        let result = pool.evict_blocks(MemoryTag::BaseTable, 0, 0, None);
        assert!(result.success);
        assert_eq!(pool.used_memory(), 0);
        for h in &handles {
            assert_eq!(h.state(), BlockState::Unloaded);
        }
    }

    #[test]
    fn test_purge_keeps_stale_node_of_pinned_handle() {
        let pool = BufferPoolConfig::default()
            .max_mem_size(1024u64)
            .insert_interval(1)
            .purge_size_multiplier(1)
            .early_out_multiplier(1)
            .build();
        let h = loaded_handle(&pool, MemoryTag::BaseTable, 8);
        pool.add_to_eviction_queue(&h);
        assert!(h.pin());

        // the purge must not drop the node: its handle is alive, just pinned
        pool.purge_queue();
        assert_eq!(pool.queue_size_approx(), 1);

        assert!(h.unpin());
        let result = pool.evict_blocks(MemoryTag::BaseTable, 0, 0, None);
        assert!(result.success);
        assert_eq!(h.state(), BlockState::Unloaded);
    }

    #[test]
    fn test_purge_queue_idempotent() {
        let pool = BufferPool::new(1024);
        // safe on an empty queue
        pool.purge_queue();
        pool.purge_queue();

        let h = loaded_handle(&pool, MemoryTag::BaseTable, 8);
        for _ in 0..100 {
            pool.add_to_eviction_queue(&h);
        }
        pool.purge_queue();
        let size_after_first = pool.queue_size_approx();
        pool.purge_queue();
        assert_eq!(pool.queue_size_approx(), size_after_first);
    }

    #[test]
    fn test_evict_blocks_failure_when_queue_empty() {
        let pool = BufferPool::new(100);
        pool.increase_used_memory(MemoryTag::Metadata, 60);

        // nothing in the queue to unload
        let result = pool.evict_blocks(MemoryTag::Metadata, 0, 40, None);
        assert!(!result.success);
        drop(result);
        assert_eq!(pool.used_memory(), 60);
        pool.decrease_used_memory(MemoryTag::Metadata, 60);
    }

    #[test]
    fn test_buffer_pool_config() {
        let config = BufferPoolConfig::default();
        let config_str = toml::to_string(&config).unwrap();
        let parsed: BufferPoolConfig = toml::from_str(&config_str).unwrap();
        assert_eq!(toml::to_string(&parsed).unwrap(), config_str);

        // zero tunables are clamped so the heuristics stay well-defined
        let pool = BufferPoolConfig::default()
            .max_mem_size(4096u64)
            .insert_interval(0)
            .purge_size_multiplier(0)
            .early_out_multiplier(0)
            .alive_node_multiplier(0)
            .build();
        assert_eq!(pool.max_memory(), 4096);
        let h = loaded_handle(&pool, MemoryTag::BaseTable, 8);
        assert!(pool.add_to_eviction_queue(&h));
        pool.purge_queue();
    }

    #[test]
    fn test_concurrent_pressure() {
        const NTHREADS: usize = 16;
        const ITERATIONS: usize = 200;
        const BLOCK_SIZE: usize = 4096;
        const LIMIT: usize = 8 * NTHREADS * BLOCK_SIZE / 2;

        let pool = BufferPoolConfig::default()
            .max_mem_size(LIMIT as u64)
            .insert_interval(64)
            .build_static();

        let thread_handles = Parallel::new()
            .each(0..NTHREADS, |_| {
                let mut rng = rand::rng();
                let mut local = vec![];
                for _ in 0..ITERATIONS {
                    let result =
                        pool.evict_blocks(MemoryTag::BaseTable, BLOCK_SIZE, pool.max_memory(), None);
                    if !result.success {
                        // under full pinning pressure, just retry next round
                        continue;
                    }
                    let handle = BlockHandle::new_loaded(
                        Arc::clone(pool.memory_usage()),
                        MemoryTag::BaseTable,
                        FileBuffer::allocate(BLOCK_SIZE),
                    );
                    result.reservation.commit();

                    // briefly use the block, then release it to the queue
                    assert!(handle.pin());
                    if rng.random_bool(0.5) {
                        assert!(handle.pin());
                        handle.unpin();
                    }
                    if handle.unpin() && pool.add_to_eviction_queue(&handle) {
                        pool.purge_queue();
                    }
                    local.push(handle);

                    // in-flight reservations may briefly exceed the limit
                    assert!(pool.used_memory() <= LIMIT + NTHREADS * BLOCK_SIZE);
                }
                local
            })
            .run();

        // quiesce: everything alive is unpinned and hinted, so the pool can
        // be drained completely
        let result = pool.evict_blocks(MemoryTag::BaseTable, 0, 0, None);
        assert!(result.success);
        assert_eq!(pool.used_memory(), 0);
        drop(thread_handles);
        assert_eq!(pool.used_memory(), 0);
    }
}
