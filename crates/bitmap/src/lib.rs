// SPDX-License-Identifier: Apache-2.0

//! Hierarchical bitmap allocator and the bounded slot pool built on it.
//!
//! The bitmap answers find-first-zero over large bit populations by keeping
//! one summary bit per fully-occupied 256-bit slice, layered up to six
//! levels deep. The slot pool shards a population of typed slots across
//! several bitmaps so allocation scales with the CPU count.

pub mod bitmap;
pub mod error;
pub mod pool;

pub use bitmap::Bitmap;
pub use error::{AllocError, BitmapError, SlotError};
pub use pool::{PoolUsage, SlotPool};
