use crate::buffer::file_buffer::FileBuffer;
use crate::buffer::usage::{MemoryTag, MemoryUsage};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Block bytes are not resident; the buffer slot is empty.
    Unloaded,
    /// Block bytes are resident in the owned buffer.
    Loaded,
}

/// State guarded by the handle mutex.
///
/// The Loaded to Unloaded transition happens only under this lock.
pub struct BlockInner {
    state: BlockState,
    buffer: Option<FileBuffer>,
}

impl BlockInner {
    #[inline]
    pub fn state(&self) -> BlockState {
        self.state
    }
}

/// Metadata record for one cacheable unit of memory.
///
/// The pool never holds a strong reference to a handle. External owners
/// keep the `Arc`; the eviction queue only stores `Weak` references, so a
/// handle is destroyed as soon as its last strong reference goes away.
///
/// Unloading releases exactly `alloc_size` bytes from the shared accounting,
/// under the tag the handle was registered with.
pub struct BlockHandle {
    usage: Arc<MemoryUsage>,
    tag: MemoryTag,
    alloc_size: usize,
    /// Number of active pins. A handle can be unloaded only at zero.
    readers: AtomicUsize,
    /// Monotonic use counter. Every hint enqueued for this handle captures
    /// the value at enqueue time; only the hint carrying the current value
    /// is live.
    eviction_timestamp: AtomicU64,
    inner: Mutex<BlockInner>,
}

impl BlockHandle {
    /// Registers a handle in Loaded state over an already-booked buffer.
    ///
    /// The caller must have increased the accounting by the buffer's
    /// allocation size, either directly or by committing a reservation.
    #[inline]
    pub fn new_loaded(usage: Arc<MemoryUsage>, tag: MemoryTag, buffer: FileBuffer) -> Arc<Self> {
        Arc::new(BlockHandle {
            usage,
            tag,
            alloc_size: buffer.alloc_size(),
            readers: AtomicUsize::new(0),
            eviction_timestamp: AtomicU64::new(0),
            inner: Mutex::new(BlockInner {
                state: BlockState::Loaded,
                buffer: Some(buffer),
            }),
        })
    }

    #[inline]
    pub fn alloc_size(&self) -> usize {
        self.alloc_size
    }

    #[inline]
    pub fn tag(&self) -> MemoryTag {
        self.tag
    }

    #[inline]
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    #[inline]
    pub fn state(&self) -> BlockState {
        self.inner.lock().state
    }

    #[inline]
    pub fn eviction_timestamp(&self) -> u64 {
        self.eviction_timestamp.load(Ordering::Acquire)
    }

    /// Increments the use counter and returns the new value.
    ///
    /// Any previously enqueued hint for this handle is dead afterwards.
    #[inline]
    pub(crate) fn bump_eviction_timestamp(&self) -> u64 {
        self.eviction_timestamp.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Locks the handle for state inspection or transition.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, BlockInner> {
        self.inner.lock()
    }

    /// Pins the handle for reading. Fails if the block is not loaded;
    /// reloading an unloaded block is the block manager's job.
    #[inline]
    pub fn pin(&self) -> bool {
        let inner = self.inner.lock();
        if inner.state != BlockState::Loaded {
            return false;
        }
        self.readers.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Releases one pin. Returns true when the reader count reaches zero,
    /// in which case the caller should hand the handle to the eviction queue.
    #[inline]
    pub fn unpin(&self) -> bool {
        let prev = self.readers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin without matching pin");
        prev == 1
    }

    /// Whether the block may be unloaded right now.
    #[inline]
    pub fn can_unload(&self, inner: &BlockInner) -> bool {
        inner.state == BlockState::Loaded && self.readers.load(Ordering::Acquire) == 0
    }

    /// Unloads the block and releases its memory from the accounting.
    #[inline]
    pub fn unload(&self, inner: &mut BlockInner) {
        debug_assert!(self.can_unload(inner));
        inner.buffer = None;
        inner.state = BlockState::Unloaded;
        self.usage.decrease(self.tag, self.alloc_size);
    }

    /// Unloads the block and hands its buffer to the caller for reuse.
    /// Accounting is released the same way as [`BlockHandle::unload`];
    /// the caller re-books the bytes through its own reservation.
    #[inline]
    pub fn unload_and_take_buffer(&self, inner: &mut BlockInner) -> FileBuffer {
        debug_assert!(self.can_unload(inner));
        let buffer = inner.buffer.take().expect("loaded block without buffer");
        inner.state = BlockState::Unloaded;
        self.usage.decrease(self.tag, self.alloc_size);
        buffer
    }
}

impl Drop for BlockHandle {
    #[inline]
    fn drop(&mut self) {
        // a handle destroyed while still loaded releases its booking, so
        // accounting stays equal to the sum of loaded blocks
        let inner = self.inner.get_mut();
        if inner.state == BlockState::Loaded {
            self.usage.decrease(self.tag, self.alloc_size);
        }
    }
}
