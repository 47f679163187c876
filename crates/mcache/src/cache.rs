// SPDX-License-Identifier: Apache-2.0

//! The bounded evicting cache.

use crate::error::{CacheError, DeleteError, InsertError};
use crate::mcstat;
use crate::shard_map::ShardMap;
use corun_threading::{RawService, RawThread, Sema};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use xxhash_rust::xxh3::xxh3_64;

/// Synchronous eviction passes attempted per allocation.
const MC_RETRY: u32 = 3;
/// Cache names are truncated to this many characters before deriving the
/// ownership magic.
const NAME_MAX: usize = 8;

fn soft_limit(scale: u32) -> u64 {
    u64::from(scale) * 65 / 100
}

/// User hooks controlling item lifecycle.
pub struct CacheHooks<V> {
    /// Whether an item's payload may be reclaimed right now.
    pub freeable: Box<dyn Fn(&V) -> bool + Send + Sync>,
    /// Release payload-internal resources before the item is recycled.
    pub clean: Option<Box<dyn Fn(&V) + Send + Sync>>,
    /// Render an item for shutdown diagnostics.
    pub dump: Option<Box<dyn Fn(&V) -> String + Send + Sync>>,
}

/// One cache entry: an ownership magic, a user-held flag, the key assigned
/// before insertion, and the payload.
///
/// Items are handed out as `Arc`s; holders may keep them past deletion or
/// recycling, in which case the payload they observe belongs to the next
/// tenant. That mirrors the cache's lazy-destruction contract.
pub struct Item<K, V> {
    magic: u64,
    /// True while the item is user-held (allocated but not inserted).
    free_out: AtomicBool,
    key: Mutex<Option<K>>,
    value: V,
}

impl<K, V> Item<K, V> {
    fn new(magic: u64, value: V) -> Self {
        Item {
            magic,
            free_out: AtomicBool::new(false),
            key: Mutex::new(None),
            value,
        }
    }

    /// The payload.
    pub fn value(&self) -> &V {
        &self.value
    }
}

impl<K, V> std::fmt::Debug for Item<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("magic", &self.magic)
            .field("free_out", &self.free_out.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

struct Gate {
    evicting: bool,
    waiters: VecDeque<Arc<Sema>>,
}

/// Cache-wide counters and depth statistics for diagnostics.
#[derive(Debug, Clone)]
pub struct CacheInfo {
    /// Cache name (truncated to eight characters).
    pub name: String,
    /// Hash map statistics.
    pub map: crate::shard_map::MapInfo,
    /// Payload size in bytes.
    pub item_size: u32,
    /// Hard item cap.
    pub item_max: u32,
    /// Items parked on the free list.
    pub free_count: u64,
    /// Items parked on the in-use list.
    pub inuse_count: u64,
}

pub(crate) struct CacheCore<K, V> {
    name: String,
    magic: u64,
    scale: u32,
    map: ShardMap<K, Arc<Item<K, V>>>,
    hooks: CacheHooks<V>,
    alloc_count: AtomicU32,
    free_list: Mutex<VecDeque<Arc<Item<K, V>>>>,
    inuse_list: Mutex<VecDeque<Arc<Item<K, V>>>>,
    gate: Mutex<Gate>,
}

impl<K, V> CacheCore<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Default + Send + Sync + 'static,
{
    fn clean(&self, value: &V) {
        if let Some(clean) = &self.hooks.clean {
            clean(value);
        }
    }

    fn holds(&self) -> u64 {
        self.map.len() + self.inuse_list.lock().len() as u64
    }

    fn over_hard(&self) -> bool {
        self.holds() >= u64::from(self.scale)
    }

    fn over_soft(&self) -> bool {
        self.holds() > soft_limit(self.scale)
    }

    /// Route a map-expelled item onto the free or in-use list.
    fn park(&self, item: Arc<Item<K, V>>) {
        if (self.hooks.freeable)(&item.value) {
            self.clean(&item.value);
            self.free_list.lock().push_front(item);
        } else {
            self.inuse_list.lock().push_back(item);
        }
    }

    /// Move every currently-freeable in-use item to the free list.
    fn sweep_inuse(&self) {
        let mut inuse = self.inuse_list.lock();
        let mut idx = 0;
        while idx < inuse.len() {
            if (self.hooks.freeable)(&inuse[idx].value) {
                let item = inuse.remove(idx).expect("index in range");
                self.clean(&item.value);
                self.free_list.lock().push_front(item);
            } else {
                idx += 1;
            }
        }
    }

    /// Map-eviction predicate: freeable items move to the free list.
    fn evict_entry(&self, item: &Arc<Item<K, V>>) -> bool {
        if (self.hooks.freeable)(&item.value) {
            self.clean(&item.value);
            self.free_list.lock().push_front(item.clone());
            true
        } else {
            false
        }
    }

    /// Become the evictor, or wait for the current one. Returns whether the
    /// caller is the evictor; waiters are released FIFO by `evict_end`.
    fn evict_begin(&self) -> bool {
        let mut gate = self.gate.lock();
        if gate.evicting {
            let waiter = Arc::new(Sema::new());
            gate.waiters.push_back(waiter.clone());
            drop(gate);

            waiter.down();
            return false;
        }

        gate.evicting = true;
        true
    }

    fn evict_end(&self) {
        let mut gate = self.gate.lock();
        while let Some(waiter) = gate.waiters.pop_front() {
            waiter.up();
        }
        gate.evicting = false;
    }

    fn alloc_item(&self, sweeper: &RawThread) -> Option<Arc<Item<K, V>>> {
        // 1. Forced reclamation at the hard limit, one evictor at a time.
        let mut retry = 0;
        while self.over_hard() {
            if retry == MC_RETRY {
                tracing::error!(cache = %self.name, "eviction reclaimed nothing");
                return None;
            }
            retry += 1;

            if self.evict_begin() {
                self.sweep_inuse();
                self.map.eviction(0, |_, item| self.evict_entry(item));
                self.evict_end();
            }
        }

        // 2. Background compaction past the soft limit.
        if self.over_soft() {
            sweeper.wakeup();
        }

        // 3. Recycle from the free list.
        if let Some(item) = self.free_list.lock().pop_front() {
            *item.key.lock() = None;
            return Some(item);
        }

        // 4. Recycle the first freeable in-use item.
        {
            let mut inuse = self.inuse_list.lock();
            if let Some(pos) = inuse.iter().position(|i| (self.hooks.freeable)(&i.value)) {
                let item = inuse.remove(pos).expect("position in range");
                drop(inuse);
                self.clean(&item.value);
                *item.key.lock() = None;
                return Some(item);
            }
        }

        // 5. Fresh allocation while under the hard cap.
        let reserved = self
            .alloc_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < self.scale).then_some(count + 1)
            });
        if reserved.is_ok() {
            return Some(Arc::new(Item::new(self.magic, V::default())));
        }

        None
    }

    pub(crate) fn info(&self) -> CacheInfo {
        CacheInfo {
            name: self.name.clone(),
            map: self.map.info(true),
            item_size: size_of::<V>() as u32,
            item_max: self.scale,
            free_count: self.free_list.lock().len() as u64,
            inuse_count: self.inuse_list.lock().len() as u64,
        }
    }
}

/// The sweeper service: wakes past the soft limit, frees what it can from
/// the in-use list, then evicts from the map with geometrically decaying
/// depth until occupancy drops back under the soft limit.
impl<K, V> RawService for CacheCore<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Default + Send + Sync + 'static,
{
    fn run(&self) {
        self.sweep_inuse();

        let mut depth = u64::from(self.scale);
        while self.over_soft() && depth > 0 {
            let avg = self.map.info(false).avg_depth;
            if depth > avg {
                depth = avg;
            }

            depth >>= 1;
            self.map.eviction(depth, |_, item| self.evict_entry(item));
        }
    }

    fn need_sleep(&self) -> bool {
        !self.over_soft()
    }
}

/// A bounded keyed cache with lazy destruction and background compaction.
///
/// Dropping the cache stops the sweeper, tears the map down (routing every
/// resident item through the free/in-use lists), waits out any in-flight
/// synchronous eviction, and reports items still held open through the
/// `dump` hook.
pub struct Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Default + Send + Sync + 'static,
{
    core: Arc<CacheCore<K, V>>,
    sweeper: Option<RawThread>,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Default + Send + Sync + 'static,
{
    /// Create a cache capped at `scale` items. `name` is truncated to eight
    /// characters and seeds the per-cache ownership magic.
    ///
    /// # Errors
    ///
    /// [`CacheError::ZeroScale`] for a zero cap.
    pub fn new(name: &str, scale: u32, hooks: CacheHooks<V>) -> Result<Self, CacheError> {
        let name: String = name.chars().take(NAME_MAX).collect();
        let magic = xxh3_64(name.as_bytes());

        let core = Arc::new(CacheCore {
            name: name.clone(),
            magic,
            scale,
            map: ShardMap::new(scale)?,
            hooks,
            alloc_count: AtomicU32::new(0),
            free_list: Mutex::new(VecDeque::new()),
            inuse_list: Mutex::new(VecDeque::new()),
            gate: Mutex::new(Gate {
                evicting: false,
                waiters: VecDeque::new(),
            }),
        });

        let sweeper = RawThread::spawn(format!("{:.8}Gc", name), core.clone())
            .map_err(|e| {
                tracing::error!(cache = %name, error = %e, "sweeper thread failed");
                CacheError::Sweeper
            })?;

        mcstat::register(&core);
        Ok(Cache {
            core,
            sweeper: Some(sweeper),
        })
    }

    /// Reserve an item with a default payload, marked user-held.
    ///
    /// # Errors
    ///
    /// [`CacheError::Exhausted`] when the cache is at its hard limit and
    /// the retry eviction passes reclaimed nothing. Usually transient.
    pub fn alloc(&self) -> Result<Arc<Item<K, V>>, CacheError> {
        let sweeper = self.sweeper.as_ref().expect("sweeper runs for the cache lifetime");
        let item = self.core.alloc_item(sweeper).ok_or(CacheError::Exhausted)?;
        item.free_out.store(true, Ordering::SeqCst);
        Ok(item)
    }

    /// Release a user-held item without inserting it. Items that belong to
    /// another cache, or that are not user-held, are ignored.
    pub fn free(&self, item: &Arc<Item<K, V>>) {
        if item.magic != self.core.magic {
            return;
        }
        if item
            .free_out
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.core.clean(&item.value);
        let _ = self.core.alloc_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Assign the key the next [`Cache::insert`] will file the item under.
    ///
    /// # Errors
    ///
    /// [`CacheError::Foreign`] for an item of another cache.
    pub fn set_key(&self, item: &Arc<Item<K, V>>, key: K) -> Result<(), CacheError> {
        if item.magic != self.core.magic {
            return Err(CacheError::Foreign);
        }

        *item.key.lock() = Some(key);
        Ok(())
    }

    /// Insert a user-held item under its assigned key.
    ///
    /// # Errors
    ///
    /// [`InsertError::Exists`] carries the resident item after `found` ran
    /// on it under the bucket lock; [`InsertError::MissingKey`] when
    /// [`Cache::set_key`] was skipped; [`InsertError::Foreign`] for items
    /// of another cache or items not user-held.
    pub fn insert_with(
        &self,
        item: &Arc<Item<K, V>>,
        found: impl FnOnce(&V),
    ) -> Result<(), InsertError<K, V>> {
        if item.magic != self.core.magic || !item.free_out.load(Ordering::SeqCst) {
            return Err(InsertError::Foreign);
        }
        let key = item.key.lock().clone().ok_or(InsertError::MissingKey)?;

        let mut existing = None;
        let inserted = self.core.map.insert(key, item.clone(), |resident| {
            found(&resident.value);
            existing = Some(resident.clone());
        });

        match inserted {
            Ok(()) => {
                item.free_out.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(_rejected) => Err(InsertError::Exists {
                existing: existing.expect("duplicate insert reports the resident item"),
            }),
        }
    }

    /// Insert a user-held item under its assigned key.
    ///
    /// # Errors
    ///
    /// See [`Cache::insert_with`].
    pub fn insert(&self, item: &Arc<Item<K, V>>) -> Result<(), InsertError<K, V>> {
        self.insert_with(item, |_| {})
    }

    /// Look the key up, running `found` under the bucket lock.
    pub fn search(&self, key: &K, found: impl FnOnce(&V)) -> Option<Arc<Item<K, V>>> {
        let mut hit = None;
        let _ = self.core.map.search(key, |item| {
            found(&item.value);
            hit = Some(item.clone());
        });
        hit
    }

    /// Remove the entry under the key if `cond` approves; the removed item
    /// is parked on the free or in-use list depending on `freeable`.
    ///
    /// # Errors
    ///
    /// [`DeleteError::NotFound`] / [`DeleteError::Vetoed`].
    pub fn delete(&self, key: &K, cond: impl FnOnce(&V) -> bool) -> Result<(), DeleteError> {
        let (_key, item) = self.core.map.delete(key, |item| cond(&item.value))?;
        self.core.park(item);
        Ok(())
    }

    /// Atomic read-modify-write on the entry under the key, holding the
    /// bucket lock. Returns `None` when the key is absent.
    pub fn protect<R>(&self, key: &K, work: impl FnOnce(&V) -> R) -> Option<R> {
        self.core.map.protect(key, |item| work(&item.value))
    }

    /// Visit every resident item; the first `Err` aborts the walk.
    ///
    /// # Errors
    ///
    /// Whatever `f` returned.
    pub fn for_each<E>(&self, mut f: impl FnMut(&V) -> Result<(), E>) -> Result<(), E> {
        self.core.map.for_each(true, |_, item| f(&item.value))
    }

    /// Kick the background sweeper.
    pub fn cleanup(&self) {
        if let Some(sweeper) = &self.sweeper {
            sweeper.wakeup();
        }
    }

    /// Counters and depth statistics.
    pub fn info(&self) -> CacheInfo {
        self.core.info()
    }
}

impl<K, V> Drop for Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Default + Send + Sync + 'static,
{
    fn drop(&mut self) {
        mcstat::unregister(&self.core.name);

        // Stop the sweeper before dismantling the map under it.
        drop(self.sweeper.take());

        let core = &self.core;
        core.map.cleanup(|_, item| core.park(item));

        // Wait out any synchronous eviction still in flight.
        loop {
            {
                let gate = core.gate.lock();
                if !gate.evicting && gate.waiters.is_empty() {
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        while let Some(_item) = core.free_list.lock().pop_front() {
            let _ = core.alloc_count.fetch_sub(1, Ordering::SeqCst);
        }

        loop {
            let Some(item) = core.inuse_list.lock().pop_front() else {
                break;
            };

            if !(core.hooks.freeable)(&item.value) {
                if let Some(dump) = &core.hooks.dump {
                    tracing::error!(
                        cache = %core.name,
                        item = %dump(&item.value),
                        "item still held open at cache teardown"
                    );
                }
            }

            core.clean(&item.value);
            let _ = core.alloc_count.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Debug, Default)]
    struct Payload {
        id: AtomicU64,
        pinned: AtomicBool,
    }

    fn hooks() -> CacheHooks<Payload> {
        CacheHooks {
            freeable: Box::new(|p: &Payload| !p.pinned.load(Ordering::SeqCst)),
            clean: None,
            dump: Some(Box::new(|p: &Payload| {
                format!("id={}", p.id.load(Ordering::SeqCst))
            })),
        }
    }

    fn fill(cache: &Cache<u64, Payload>, range: std::ops::Range<u64>) {
        for key in range {
            let item = cache.alloc().expect("alloc");
            item.value().id.store(key, Ordering::SeqCst);
            cache.set_key(&item, key).expect("key");
            cache.insert(&item).expect("insert");
        }
    }

    #[test]
    fn alloc_insert_search_delete() {
        let cache: Cache<u64, Payload> = Cache::new("ctBasic", 64, hooks()).expect("cache");
        fill(&cache, 0..10);

        let hit = cache.search(&3, |_| {}).expect("resident");
        assert_eq!(hit.value().id.load(Ordering::SeqCst), 3);

        cache.delete(&3, |_| true).expect("delete");
        assert!(cache.search(&3, |_| {}).is_none());

        // The deleted item went to the free list and gets recycled.
        let recycled = cache.alloc().expect("alloc");
        assert_eq!(recycled.value().id.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn duplicate_insert_returns_resident() {
        let cache: Cache<u64, Payload> = Cache::new("ctDup", 16, hooks()).expect("cache");
        fill(&cache, 5..6);

        let item = cache.alloc().expect("alloc");
        cache.set_key(&item, 5).expect("key");
        match cache.insert(&item) {
            Err(InsertError::Exists { existing }) => {
                assert_eq!(existing.value().id.load(Ordering::SeqCst), 5);
            }
            _ => panic!("expected Exists"),
        }

        // The rejected item is still user-held and can be freed.
        cache.free(&item);
    }

    #[test]
    fn full_cache_evicts_synchronously() {
        let cache: Cache<u64, Payload> = Cache::new("ctEvict", 16, hooks()).expect("cache");
        fill(&cache, 0..16);

        // The 17th allocation forces an eviction pass and still succeeds.
        let item = cache.alloc().expect("eviction made room");
        item.value().id.store(16, Ordering::SeqCst);
        cache.set_key(&item, 16).expect("key");
        cache.insert(&item).expect("insert");

        let mut count = 0;
        cache
            .for_each::<()>(|_| {
                count += 1;
                Ok(())
            })
            .expect("walk");
        assert!(count <= 16, "hard cap violated: {count}");
        assert!(cache.search(&16, |_| {}).is_some());
    }

    #[test]
    fn pinned_items_survive_eviction_and_park_in_use() {
        let cache: Cache<u64, Payload> = Cache::new("ctPin", 8, hooks()).expect("cache");
        fill(&cache, 0..8);

        let pinned = cache.search(&0, |p| {
            p.pinned.store(true, Ordering::SeqCst);
        });
        assert!(pinned.is_some());

        // Full cache: the forced eviction must spare the pinned entry.
        let item = cache.alloc().expect("room");
        cache.set_key(&item, 100).expect("key");
        cache.insert(&item).expect("insert");
        assert!(cache.search(&0, |_| {}).is_some());

        // Deleting the pinned entry parks it on the in-use list.
        cache.delete(&0, |_| true).expect("delete");
        assert_eq!(cache.info().inuse_count, 1);
    }

    #[test]
    fn in_use_items_are_recycled_once_freeable() {
        let cache: Cache<u64, Payload> = Cache::new("ctReuse", 4, hooks()).expect("cache");
        fill(&cache, 0..4);

        let pinned = cache
            .search(&0, |p| p.pinned.store(true, Ordering::SeqCst))
            .expect("resident");

        // Forced eviction: three unpinned entries land on the free list,
        // the pinned one stays resident; deleting it parks it in-use.
        let drained: Vec<_> = (0..3).map(|_| cache.alloc().expect("free item")).collect();
        cache.delete(&0, |_| true).expect("delete");
        assert_eq!(cache.info().inuse_count, 1);
        assert_eq!(cache.info().free_count, 0);

        // Free list empty, cap reached: only the in-use scan can serve, and
        // only once the item is freeable again.
        pinned.value().pinned.store(false, Ordering::SeqCst);
        let recycled = cache.alloc().expect("recycled in-use item");
        assert_eq!(recycled.value().id.load(Ordering::SeqCst), 0);
        assert_eq!(cache.info().inuse_count, 0);

        for item in drained {
            cache.free(&item);
        }
    }

    #[test]
    fn foreign_items_are_rejected() {
        let a: Cache<u64, Payload> = Cache::new("ctOwnA", 8, hooks()).expect("cache");
        let b: Cache<u64, Payload> = Cache::new("ctOwnB", 8, hooks()).expect("cache");

        let item = a.alloc().expect("alloc");
        assert!(matches!(b.set_key(&item, 1), Err(CacheError::Foreign)));
        assert!(matches!(b.insert(&item), Err(InsertError::Foreign)));

        // Freeing through the wrong cache is a silent no-op.
        b.free(&item);
        a.free(&item);
    }

    #[test]
    fn alloc_count_respects_the_cap() {
        let cache: Cache<u64, Payload> = Cache::new("ctCap", 4, hooks()).expect("cache");

        let held: Vec<_> = (0..4).map(|_| cache.alloc().expect("alloc")).collect();
        for item in &held {
            // All four are user-held: nothing resident, nothing to evict.
            item.value().pinned.store(true, Ordering::SeqCst);
        }

        assert!(matches!(cache.alloc(), Err(CacheError::Exhausted)));
        for item in &held {
            cache.free(item);
        }
    }

    #[test]
    fn protect_runs_under_the_bucket_lock() {
        let cache: Cache<u64, Payload> = Cache::new("ctProt", 8, hooks()).expect("cache");
        fill(&cache, 1..2);

        let seen = cache.protect(&1, |p| p.id.load(Ordering::SeqCst));
        assert_eq!(seen, Some(1));
        assert_eq!(cache.protect(&9, |_| ()), None);
    }
}
