/// Owned memory backing a loaded block.
///
/// The buffer is allocated zeroed and keeps its allocation size for the
/// lifetime of the object, so accounting on unload always releases exactly
/// what was booked on load.
pub struct FileBuffer {
    data: Box<[u8]>,
}

impl FileBuffer {
    /// Allocate a zeroed buffer of given size.
    #[inline]
    pub fn allocate(size: usize) -> Self {
        FileBuffer {
            data: vec![0u8; size].into_boxed_slice(),
        }
    }

    /// Returns number of bytes this buffer occupies.
    #[inline]
    pub fn alloc_size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
