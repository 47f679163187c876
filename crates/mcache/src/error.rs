// SPDX-License-Identifier: Apache-2.0

//! Errors for the sharded map and the cache.
//!
//! Important note: variants that reject an insertion hand the rejected
//! value back so callers can retry or drop it without cloning.

use std::sync::Arc;

/// Errors from [`crate::ShardMap::delete`] and [`crate::Cache::delete`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DeleteError {
    /// No entry exists under the key.
    #[error("no entry under the key")]
    NotFound,

    /// The caller's condition rejected the removal.
    #[error("removal vetoed by the caller's condition")]
    Vetoed,
}

/// Errors from [`crate::Cache::insert`].
#[derive(thiserror::Error, Debug)]
pub enum InsertError<K, V> {
    /// The item belongs to another cache or is not user-held.
    #[error("item does not belong to this cache")]
    Foreign,

    /// No key was assigned before insertion.
    #[error("item has no key assigned")]
    MissingKey,

    /// An entry already exists under the key.
    #[error("an entry already exists under the key")]
    Exists {
        /// The resident item that blocked the insertion.
        existing: Arc<crate::cache::Item<K, V>>,
    },
}

/// Errors from the remaining cache operations.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CacheError {
    /// The cache stayed full through every forced eviction attempt.
    /// Usually transient: eviction pressure may clear on its own.
    #[error("cache full and eviction reclaimed nothing")]
    Exhausted,

    /// The item belongs to another cache.
    #[error("item does not belong to this cache")]
    Foreign,

    /// The cache scale must be non-zero.
    #[error("cache scale must be non-zero")]
    ZeroScale,

    /// The background sweeper thread could not be started.
    #[error("failed to start the sweeper thread")]
    Sweeper,
}
