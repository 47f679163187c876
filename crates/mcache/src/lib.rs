// SPDX-License-Identifier: Apache-2.0

//! Bounded, self-evicting keyed object cache.
//!
//! [`Cache`] combines a sharded hash map, a recycled-item pool (free and
//! in-use lists) and two cooperating evictors: a synchronous high-watermark
//! pass serialized through a wait gate, and a background sweeper thread
//! kicked once occupancy crosses the soft limit. Items are reference
//! counted, so user code may keep handles to entries that have already
//! been deleted or recycled (lazy destruction).

pub mod cache;
pub mod error;
pub mod shard_map;

mod mcstat;

pub use cache::{Cache, CacheHooks, CacheInfo, Item};
pub use error::{CacheError, DeleteError, InsertError};
pub use shard_map::{MapInfo, ShardMap};
