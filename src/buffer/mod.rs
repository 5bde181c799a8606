mod evict;
pub mod file_buffer;
pub mod handle;
pub mod pool;
pub mod temp;
pub mod usage;

pub use file_buffer::FileBuffer;
pub use handle::{BlockHandle, BlockState};
pub use pool::{BufferPool, BufferPoolConfig, EvictionResult};
pub use temp::{TemporaryMemoryManager, TemporaryMemoryState};
pub use usage::{BufferPoolReservation, MEMORY_TAG_COUNT, MemoryTag, MemoryUsage};
