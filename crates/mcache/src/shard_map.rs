// SPDX-License-Identifier: Apache-2.0

//! Sharded hash map with per-bucket locks and an eviction sweep.
//!
//! Buckets are collision chains ordered newest-first: insertions go to the
//! head, so an eviction pass can spare the most recent entries simply by
//! skipping the front of each chain. Operations on distinct buckets run
//! concurrently; `total_keys` and the bucket-depth high-water mark are
//! tracked as atomics beside the chains.

use crate::error::DeleteError;
use ahash::RandomState;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Target average chain depth used to size the bucket array.
const AVG_DEPTH: u32 = 4;

struct Entry<K, V> {
    key: K,
    value: V,
}

struct Bucket<K, V> {
    chain: Mutex<VecDeque<Entry<K, V>>>,
}

/// Depth statistics for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct MapInfo {
    /// Number of resident keys.
    pub total_keys: u64,
    /// Bucket count (a power of two).
    pub buckets: u32,
    /// `total_keys / buckets`.
    pub avg_depth: u64,
    /// Deepest chain; a running high-water mark unless `detail` was set.
    pub max_depth: u64,
    /// Shallowest chain; only populated by a detail scan.
    pub min_depth: u64,
}

/// Hash map sharded into power-of-two buckets, each with its own lock.
pub struct ShardMap<K, V> {
    buckets: Box<[Bucket<K, V>]>,
    mask: usize,
    hasher: RandomState,
    total_keys: AtomicU64,
    max_depth: AtomicU64,
}

impl<K: Hash + Eq, V> ShardMap<K, V> {
    /// Build a map sized for `scale` keys at an average depth of four.
    pub fn new(scale: u32) -> Result<Self, crate::error::CacheError> {
        if scale == 0 {
            return Err(crate::error::CacheError::ZeroScale);
        }

        let bucket_count = (scale / AVG_DEPTH).max(1).next_power_of_two() as usize;
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, || Bucket {
            chain: Mutex::new(VecDeque::new()),
        });

        Ok(ShardMap {
            buckets: buckets.into_boxed_slice(),
            mask: bucket_count - 1,
            hasher: RandomState::new(),
            total_keys: AtomicU64::new(0),
            max_depth: AtomicU64::new(0),
        })
    }

    fn bucket(&self, key: &K) -> &Bucket<K, V> {
        let hash = self.hasher.hash_one(key) as usize;
        &self.buckets[hash & self.mask]
    }

    fn note_depth(&self, depth: usize) {
        let _ = self.max_depth.fetch_max(depth as u64, Ordering::SeqCst);
    }

    /// Number of resident keys.
    pub fn len(&self) -> u64 {
        self.total_keys.load(Ordering::SeqCst)
    }

    /// Whether the map holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert at the head of the key's chain.
    ///
    /// # Errors
    ///
    /// On a duplicate key the value is handed back after `found` ran on the
    /// resident entry (under the bucket lock).
    pub fn insert(&self, key: K, value: V, found: impl FnOnce(&V)) -> Result<(), V> {
        let mut chain = self.bucket(&key).chain.lock();
        self.note_depth(chain.len());

        if let Some(existing) = chain.iter().find(|e| e.key == key) {
            found(&existing.value);
            return Err(value);
        }

        chain.push_front(Entry { key, value });
        let _ = self.total_keys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Replace the entry under the key (or plain-insert when absent); the
    /// new entry goes to the head of the chain.
    ///
    /// # Errors
    ///
    /// `veto` runs on the resident entry first; returning `false` keeps it
    /// and hands the new value back.
    pub fn replace(
        &self,
        key: K,
        value: V,
        veto: impl FnOnce(&V) -> bool,
    ) -> Result<Option<V>, V> {
        let mut chain = self.bucket(&key).chain.lock();
        self.note_depth(chain.len());

        let mut old = None;
        if let Some(pos) = chain.iter().position(|e| e.key == key) {
            if !veto(&chain[pos].value) {
                return Err(value);
            }
            old = chain.remove(pos).map(|e| e.value);
            let _ = self.total_keys.fetch_sub(1, Ordering::SeqCst);
        }

        chain.push_front(Entry { key, value });
        let _ = self.total_keys.fetch_add(1, Ordering::SeqCst);
        Ok(old)
    }

    /// Run `found` on the entry under the key, holding the bucket lock.
    /// Returns whether the key was present.
    pub fn search(&self, key: &K, found: impl FnOnce(&V)) -> bool {
        let chain = self.bucket(key).chain.lock();
        self.note_depth(chain.len());

        match chain.iter().find(|e| &e.key == key) {
            Some(entry) => {
                found(&entry.value);
                true
            }
            None => false,
        }
    }

    /// Remove the entry under the key if `cond` approves.
    ///
    /// # Errors
    ///
    /// [`DeleteError::NotFound`] when absent, [`DeleteError::Vetoed`] when
    /// `cond` returned `false` (the entry stays resident).
    pub fn delete(&self, key: &K, cond: impl FnOnce(&V) -> bool) -> Result<(K, V), DeleteError> {
        let mut chain = self.bucket(key).chain.lock();
        self.note_depth(chain.len());

        let pos = chain
            .iter()
            .position(|e| &e.key == key)
            .ok_or(DeleteError::NotFound)?;
        if !cond(&chain[pos].value) {
            return Err(DeleteError::Vetoed);
        }

        let entry = chain.remove(pos).expect("position just found");
        let _ = self.total_keys.fetch_sub(1, Ordering::SeqCst);
        Ok((entry.key, entry.value))
    }

    /// Run `work` on the entry under the key while holding the bucket lock,
    /// enabling an atomic read-modify-write against concurrent operations.
    pub fn protect<R>(&self, key: &K, work: impl FnOnce(&V) -> R) -> Option<R> {
        let chain = self.bucket(key).chain.lock();
        self.note_depth(chain.len());

        chain.iter().find(|e| &e.key == key).map(|e| work(&e.value))
    }

    /// Visit every entry bucket by bucket. With `stop_on_error`, the first
    /// `Err` aborts the scan; otherwise errors are swallowed and the scan
    /// completes.
    pub fn for_each<E>(
        &self,
        stop_on_error: bool,
        mut f: impl FnMut(&K, &V) -> Result<(), E>,
    ) -> Result<(), E> {
        for bucket in &self.buckets {
            let chain = bucket.chain.lock();
            self.note_depth(chain.len());

            for entry in chain.iter() {
                let result = f(&entry.key, &entry.value);
                if stop_on_error {
                    result?;
                }
            }
        }

        Ok(())
    }

    /// Expel entries beyond a per-bucket keep count of
    /// `min(total_keys / buckets, depth)`. The newest entries sit at the
    /// chain head and are spared; `evict` returning `false` gives an entry
    /// another chance in place. Resets the depth high-water mark.
    pub fn eviction(&self, depth: u64, mut evict: impl FnMut(&K, &V) -> bool) {
        let keep = (self.len() / self.buckets.len() as u64).min(depth) as usize;
        self.max_depth.store(0, Ordering::SeqCst);

        for bucket in &self.buckets {
            let mut chain = bucket.chain.lock();
            if chain.len() <= keep {
                continue;
            }

            let candidates: Vec<Entry<K, V>> = chain.drain(keep..).collect();
            for entry in candidates {
                if evict(&entry.key, &entry.value) {
                    let _ = self.total_keys.fetch_sub(1, Ordering::SeqCst);
                } else {
                    chain.push_back(entry);
                }
            }
        }
    }

    /// Drain every entry through `f`, leaving the map empty.
    pub fn cleanup(&self, mut f: impl FnMut(K, V)) {
        for bucket in &self.buckets {
            let mut chain = bucket.chain.lock();
            while let Some(entry) = chain.pop_front() {
                let _ = self.total_keys.fetch_sub(1, Ordering::SeqCst);
                f(entry.key, entry.value);
            }
        }
    }

    /// Depth statistics. A `detail` scan walks every bucket for exact
    /// min/max; otherwise max is the running high-water mark.
    pub fn info(&self, detail: bool) -> MapInfo {
        let total = self.len();
        let buckets = self.buckets.len() as u32;
        let mut info = MapInfo {
            total_keys: total,
            buckets,
            avg_depth: total / u64::from(buckets),
            max_depth: self.max_depth.load(Ordering::SeqCst),
            min_depth: 0,
        };

        if !detail {
            return info;
        }

        let mut min = u64::MAX;
        let mut max = 0;
        for bucket in &self.buckets {
            let depth = bucket.chain.lock().len() as u64;
            min = min.min(depth);
            max = max.max(depth);
        }
        info.min_depth = min;
        info.max_depth = max;
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_search_delete_round_trip() {
        let map: ShardMap<u64, String> = ShardMap::new(64).expect("map");
        map.insert(1, "one".into(), |_| {}).expect("insert");
        map.insert(2, "two".into(), |_| {}).expect("insert");
        assert_eq!(map.len(), 2);

        let mut seen = None;
        assert!(map.search(&1, |v| seen = Some(v.clone())));
        assert_eq!(seen.as_deref(), Some("one"));

        let (k, v) = map.delete(&1, |_| true).expect("delete");
        assert_eq!((k, v.as_str()), (1, "one"));
        assert_eq!(map.delete(&1, |_| true), Err(DeleteError::NotFound));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn duplicate_insert_reports_resident_entry() {
        let map: ShardMap<u64, u32> = ShardMap::new(16).expect("map");
        map.insert(7, 70, |_| {}).expect("insert");

        let mut resident = None;
        let rejected = map.insert(7, 71, |v| resident = Some(*v));
        assert_eq!(rejected, Err(71));
        assert_eq!(resident, Some(70));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn delete_condition_can_veto() {
        let map: ShardMap<u64, u32> = ShardMap::new(16).expect("map");
        map.insert(3, 30, |_| {}).expect("insert");
        assert_eq!(map.delete(&3, |_| false), Err(DeleteError::Vetoed));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn replace_swaps_and_respects_veto() {
        let map: ShardMap<u64, u32> = ShardMap::new(16).expect("map");
        map.insert(5, 50, |_| {}).expect("insert");

        let old = map.replace(5, 51, |_| true).expect("replace");
        assert_eq!(old, Some(50));

        let rejected = map.replace(5, 52, |_| false);
        assert_eq!(rejected, Err(52));

        let mut seen = None;
        assert!(map.search(&5, |v| seen = Some(*v)));
        assert_eq!(seen, Some(51));
    }

    #[test]
    fn total_keys_matches_bucket_depths() {
        let map: ShardMap<u64, u64> = ShardMap::new(256).expect("map");
        for i in 0..300 {
            let _ = map.insert(i, i, |_| {});
        }

        let mut walked = 0;
        map.for_each::<()>(true, |_, _| {
            walked += 1;
            Ok(())
        })
        .expect("walk");
        assert_eq!(walked, map.len());
    }

    #[test]
    fn eviction_spares_newest_and_honors_veto() {
        // One bucket makes ordering observable.
        let map: ShardMap<u64, u64> = ShardMap::new(1).expect("map");
        for i in 0..10 {
            let _ = map.insert(i, i, |_| {});
        }

        // keep = min(10 / 1, 2) = 2; newest two are 9 and 8.
        let mut evicted = Vec::new();
        map.eviction(2, |_, v| {
            if *v == 5 {
                return false; // spare this one
            }
            evicted.push(*v);
            true
        });

        assert_eq!(map.len(), 3);
        assert!(!evicted.contains(&9));
        assert!(!evicted.contains(&8));
        assert!(map.search(&5, |_| {}));
        assert!(map.search(&9, |_| {}));
        assert!(!map.search(&3, |_| {}));
    }

    #[test]
    fn info_detail_scans_depths() {
        let map: ShardMap<u64, u64> = ShardMap::new(8).expect("map");
        for i in 0..32 {
            let _ = map.insert(i, i, |_| {});
        }

        let info = map.info(true);
        assert_eq!(info.total_keys, 32);
        assert!(info.max_depth >= info.min_depth);
        assert!(info.max_depth >= info.avg_depth);
    }
}
