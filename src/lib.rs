//! Buffer subsystem of the BorealDB storage engine.
//!
//! This crate provides the memory-budgeted buffer pool: block handles,
//! the lock-free eviction queue, per-tag memory accounting, cooperative
//! queue purging and dynamic limit control.

pub mod buffer;
pub mod error;

pub mod prelude {
    pub use crate::buffer::*;
    pub use crate::error::*;
}
