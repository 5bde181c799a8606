use parking_lot::Mutex;

/// Fraction of the pool maximum that temporary scan reservations may occupy.
const TEMPORARY_MEMORY_RATIO: f64 = 0.6;
/// Floor granted to every registered scan, so small scans always make progress.
const MINIMUM_RESERVATION_PER_STATE: usize = 512 * 1024;

/// Manages scan-wide temporary memory reservations.
///
/// Owned by the buffer pool and alive exactly as long as it. Every
/// registered state holds a share of a budget derived from the pool
/// maximum; dropping the state releases its share. The manager never
/// blocks and performs no IO.
pub struct TemporaryMemoryManager {
    inner: Mutex<TempMemState>,
}

struct TempMemState {
    memory_limit: usize,
    reservation: usize,
    num_states: usize,
}

impl TemporaryMemoryManager {
    #[inline]
    pub(crate) fn new(maximum_memory: usize) -> Self {
        TemporaryMemoryManager {
            inner: Mutex::new(TempMemState {
                memory_limit: Self::derive_limit(maximum_memory),
                reservation: 0,
                num_states: 0,
            }),
        }
    }

    #[inline]
    fn derive_limit(maximum_memory: usize) -> usize {
        (maximum_memory as f64 * TEMPORARY_MEMORY_RATIO) as usize
    }

    /// Re-derives the temporary budget after the pool limit changed.
    /// Existing reservations are not clawed back; new requests see the
    /// updated headroom.
    #[inline]
    pub(crate) fn update_memory_limit(&self, maximum_memory: usize) {
        let mut g = self.inner.lock();
        g.memory_limit = Self::derive_limit(maximum_memory);
    }

    /// Registers a scan and books its initial reservation.
    ///
    /// The grant is the requested size capped at current headroom, but
    /// never below the per-state minimum.
    #[inline]
    pub fn register(&self, requested: usize) -> TemporaryMemoryState<'_> {
        let mut g = self.inner.lock();
        let free = g.memory_limit.saturating_sub(g.reservation);
        let granted = requested.min(free).max(MINIMUM_RESERVATION_PER_STATE);
        g.reservation += granted;
        g.num_states += 1;
        TemporaryMemoryState {
            manager: self,
            reservation: granted,
        }
    }

    /// Sum of all active reservations.
    #[inline]
    pub fn total_reservation(&self) -> usize {
        self.inner.lock().reservation
    }

    /// Number of currently registered scans.
    #[inline]
    pub fn active_states(&self) -> usize {
        self.inner.lock().num_states
    }

    #[inline]
    pub fn memory_limit(&self) -> usize {
        self.inner.lock().memory_limit
    }
}

/// Per-scan reservation guard. Deregisters on drop.
pub struct TemporaryMemoryState<'a> {
    manager: &'a TemporaryMemoryManager,
    reservation: usize,
}

impl TemporaryMemoryState<'_> {
    #[inline]
    pub fn remaining(&self) -> usize {
        self.reservation
    }

    /// Adjusts this scan's reservation. Increases are capped at the
    /// manager's headroom; decreases always succeed. Returns the size
    /// actually held afterwards.
    #[inline]
    pub fn set_remaining(&mut self, size: usize) -> usize {
        let mut g = self.manager.inner.lock();
        if size >= self.reservation {
            let free = g.memory_limit.saturating_sub(g.reservation);
            let grow = (size - self.reservation).min(free);
            g.reservation += grow;
            self.reservation += grow;
        } else {
            g.reservation -= self.reservation - size;
            self.reservation = size;
        }
        self.reservation
    }
}

impl Drop for TemporaryMemoryState<'_> {
    #[inline]
    fn drop(&mut self) {
        let mut g = self.manager.inner.lock();
        g.reservation -= self.reservation;
        g.num_states -= 1;
    }
}
