use crossbeam_utils::CachePadded;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of memory tags, used to size per-tag counter arrays.
pub const MEMORY_TAG_COUNT: usize = 8;

/// Category label for memory accounting.
///
/// Tags only partition the accounting counters. They do not affect
/// eviction priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryTag {
    BaseTable = 0,
    HashTable = 1,
    OrderBy = 2,
    Index = 3,
    ColumnData = 4,
    Metadata = 5,
    TransientScan = 6,
    Extension = 7,
}

impl MemoryTag {
    pub const ALL: [MemoryTag; MEMORY_TAG_COUNT] = [
        MemoryTag::BaseTable,
        MemoryTag::HashTable,
        MemoryTag::OrderBy,
        MemoryTag::Index,
        MemoryTag::ColumnData,
        MemoryTag::Metadata,
        MemoryTag::TransientScan,
        MemoryTag::Extension,
    ];
}

impl From<u8> for MemoryTag {
    #[inline]
    fn from(value: u8) -> Self {
        match value {
            0 => MemoryTag::BaseTable,
            1 => MemoryTag::HashTable,
            2 => MemoryTag::OrderBy,
            3 => MemoryTag::Index,
            4 => MemoryTag::ColumnData,
            5 => MemoryTag::Metadata,
            6 => MemoryTag::TransientScan,
            7 => MemoryTag::Extension,
            _ => unreachable!("invalid memory tag"),
        }
    }
}

/// Atomic memory accounting shared by the pool and all block handles.
///
/// Arithmetic is relaxed: callers that need a hard bound combine these
/// counters with an eager reservation, so exact cross-thread monotonicity
/// is not required.
pub struct MemoryUsage {
    current_memory: CachePadded<AtomicUsize>,
    memory_usage_per_tag: [CachePadded<AtomicUsize>; MEMORY_TAG_COUNT],
}

impl Default for MemoryUsage {
    #[inline]
    fn default() -> Self {
        MemoryUsage {
            current_memory: CachePadded::new(AtomicUsize::new(0)),
            memory_usage_per_tag: std::array::from_fn(|_| CachePadded::new(AtomicUsize::new(0))),
        }
    }
}

impl MemoryUsage {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn increase(&self, tag: MemoryTag, size: usize) {
        self.current_memory.fetch_add(size, Ordering::Relaxed);
        self.memory_usage_per_tag[tag as usize].fetch_add(size, Ordering::Relaxed);
    }

    #[inline]
    pub fn decrease(&self, tag: MemoryTag, size: usize) {
        self.current_memory.fetch_sub(size, Ordering::Relaxed);
        self.memory_usage_per_tag[tag as usize].fetch_sub(size, Ordering::Relaxed);
    }

    /// Returns total bytes currently booked.
    #[inline]
    pub fn used(&self) -> usize {
        self.current_memory.load(Ordering::Relaxed)
    }

    /// Returns bytes currently booked under one tag.
    #[inline]
    pub fn used_by_tag(&self, tag: MemoryTag) -> usize {
        self.memory_usage_per_tag[tag as usize].load(Ordering::Relaxed)
    }

    /// Books `size` bytes under `tag` and returns the scoped reservation.
    #[inline]
    pub fn reserve(self: &Arc<Self>, tag: MemoryTag, size: usize) -> BufferPoolReservation {
        BufferPoolReservation::new(Arc::clone(self), tag, size)
    }
}

/// Scoped booking of memory in the accountant.
///
/// The booked amount is released on drop unless the reservation was resized
/// to zero or committed. Committing keeps the booking in place, which is
/// used when the booked bytes are handed over to a block that will release
/// them itself on unload.
pub struct BufferPoolReservation {
    tag: MemoryTag,
    size: usize,
    usage: Arc<MemoryUsage>,
}

impl BufferPoolReservation {
    #[inline]
    pub(crate) fn new(usage: Arc<MemoryUsage>, tag: MemoryTag, size: usize) -> Self {
        usage.increase(tag, size);
        BufferPoolReservation { tag, size, usage }
    }

    #[inline]
    pub fn tag(&self) -> MemoryTag {
        self.tag
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Adjusts the booked amount by the delta between old and new size.
    #[inline]
    pub fn resize(&mut self, new_size: usize) {
        if new_size > self.size {
            self.usage.increase(self.tag, new_size - self.size);
        } else {
            self.usage.decrease(self.tag, self.size - new_size);
        }
        self.size = new_size;
    }

    /// Consumes the reservation, leaving its booking in place.
    #[inline]
    pub fn commit(mut self) {
        self.size = 0;
    }
}

impl Drop for BufferPoolReservation {
    #[inline]
    fn drop(&mut self) {
        if self.size != 0 {
            self.usage.decrease(self.tag, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_usage_accounting() {
        let usage = MemoryUsage::new();
        usage.increase(MemoryTag::BaseTable, 100);
        usage.increase(MemoryTag::HashTable, 50);
        assert_eq!(usage.used(), 150);
        assert_eq!(usage.used_by_tag(MemoryTag::BaseTable), 100);
        assert_eq!(usage.used_by_tag(MemoryTag::HashTable), 50);
        assert_eq!(usage.used_by_tag(MemoryTag::OrderBy), 0);

        usage.decrease(MemoryTag::BaseTable, 100);
        assert_eq!(usage.used(), 50);
        assert_eq!(usage.used_by_tag(MemoryTag::BaseTable), 0);

        // the total always equals the sum over all tags
        let per_tag_sum: usize = MemoryTag::ALL
            .iter()
            .map(|tag| usage.used_by_tag(*tag))
            .sum();
        assert_eq!(per_tag_sum, usage.used());
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let usage = Arc::new(MemoryUsage::new());
        {
            let r = usage.reserve(MemoryTag::OrderBy, 64);
            assert_eq!(r.size(), 64);
            assert_eq!(usage.used(), 64);
            assert_eq!(usage.used_by_tag(MemoryTag::OrderBy), 64);
        }
        assert_eq!(usage.used(), 0);
        assert_eq!(usage.used_by_tag(MemoryTag::OrderBy), 0);
    }

    #[test]
    fn test_reservation_resize() {
        let usage = Arc::new(MemoryUsage::new());
        let mut r = usage.reserve(MemoryTag::Index, 100);
        r.resize(40);
        assert_eq!(usage.used(), 40);
        r.resize(70);
        assert_eq!(usage.used(), 70);
        r.resize(0);
        assert_eq!(usage.used(), 0);
        drop(r);
        assert_eq!(usage.used(), 0);
    }

    #[test]
    fn test_reservation_commit_keeps_booking() {
        let usage = Arc::new(MemoryUsage::new());
        let r = usage.reserve(MemoryTag::ColumnData, 32);
        r.commit();
        assert_eq!(usage.used(), 32);
        assert_eq!(usage.used_by_tag(MemoryTag::ColumnData), 32);
    }
}
