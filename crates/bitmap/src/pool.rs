// SPDX-License-Identifier: Apache-2.0

//! Bounded slot pool sharded across several bitmaps.
//!
//! Slot ownership is tracked by N sub-bitmaps so concurrent allocators
//! rarely contend on the same lock. Each sub-bitmap owns a contiguous slot
//! range recorded as prefix sums; releases locate their shard through the
//! prefix table, never through average-size arithmetic, so the oversized
//! last shard needs no special casing.

use crate::bitmap::Bitmap;
use crate::error::{AllocError, SlotError};
use corun_threading::Sema;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Upper bound on the number of sub-bitmaps.
const MAX_SHARDS: usize = 64;
/// A sub-bitmap below this population is not worth its lock.
const MIN_SHARD_BITS: usize = 256;
/// Backoff schedule: 1, 2, 4, ... 512 ms.
const BACKOFF_STEPS: u32 = 10;

/// Occupancy snapshot for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct PoolUsage {
    /// Total slot count.
    pub capacity: usize,
    /// Currently occupied slots.
    pub used: u32,
}

/// A fixed population of typed slots with sharded occupancy tracking.
///
/// `alloc` stores a value and returns its slot index; `free` takes the
/// value back out. Exhaustion backs off exponentially (sleeping through the
/// semaphore abstraction, so coroutine contexts yield instead of blocking)
/// before giving up.
pub struct SlotPool<T> {
    slots: Box<[Mutex<Option<T>>]>,
    shards: Vec<Bitmap>,
    /// `starts[i]` is the first global slot owned by shard `i`; the last
    /// shard runs to `capacity`.
    starts: Vec<usize>,
    rr: AtomicU64,
    used: AtomicU32,
}

impl<T> SlotPool<T> {
    /// Build a pool of `count` slots (must be non-zero).
    pub fn new(count: usize) -> Result<Self, crate::error::BitmapError> {
        if count == 0 {
            return Err(crate::error::BitmapError::EmptyPopulation);
        }

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MAX_SHARDS);

        let mut shard_count = (cpus * 5 / 4).clamp(1, MAX_SHARDS);
        if count / shard_count < MIN_SHARD_BITS {
            shard_count = count / MIN_SHARD_BITS;
            if count % MIN_SHARD_BITS != 0 || shard_count == 0 {
                shard_count += 1;
            }
        }

        let average = count / shard_count;
        let mut sizes = vec![average; shard_count];
        sizes[shard_count - 1] += count - average * shard_count;

        let mut shards = Vec::with_capacity(shard_count);
        let mut starts = Vec::with_capacity(shard_count);
        let mut offset = 0;
        for size in sizes {
            shards.push(Bitmap::new(size)?);
            starts.push(offset);
            offset += size;
        }

        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, || Mutex::new(None));

        Ok(SlotPool {
            slots: slots.into_boxed_slice(),
            shards,
            starts,
            rr: AtomicU64::new(0),
            used: AtomicU32::new(0),
        })
    }

    /// Total slot count.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupancy snapshot.
    pub fn usage(&self) -> PoolUsage {
        PoolUsage {
            capacity: self.slots.len(),
            used: self.used.load(Ordering::SeqCst),
        }
    }

    /// Store `value` in a free slot without blocking.
    ///
    /// # Errors
    ///
    /// Returns the value back when every shard is full.
    pub fn try_alloc(&self, value: T) -> Result<usize, AllocError<T>> {
        let mut shard = (self.rr.fetch_add(1, Ordering::SeqCst) as usize) % self.shards.len();

        for _ in 0..self.shards.len() {
            if let Some(bit) = self.shards[shard].alloc() {
                let slot = self.starts[shard] + bit;
                *self.slots[slot].lock() = Some(value);
                let _ = self.used.fetch_add(1, Ordering::SeqCst);
                return Ok(slot);
            }
            shard = (shard + 1) % self.shards.len();
        }

        Err(AllocError::Exhausted(value))
    }

    /// Store `value` in a free slot, backing off exponentially on
    /// exhaustion (1, 2, 4, ... 512 ms) before giving up.
    ///
    /// # Errors
    ///
    /// Returns the value back when the pool stays exhausted through the
    /// whole backoff schedule.
    pub fn alloc(&self, mut value: T) -> Result<usize, AllocError<T>> {
        let sema = Sema::new();
        for step in 0..BACKOFF_STEPS {
            match self.try_alloc(value) {
                Ok(slot) => return Ok(slot),
                Err(e) => value = e.into_inner(),
            }
            sema.msleep(1 << step);
        }

        Err(AllocError::Exhausted(value))
    }

    /// Take the value out of `slot` and release it.
    ///
    /// # Errors
    ///
    /// [`SlotError::OutOfRange`] for an index outside the pool.
    ///
    /// # Panics
    ///
    /// Releasing a slot that is already free is a caller bug and panics.
    pub fn free(&self, slot: usize) -> Result<T, SlotError> {
        if slot >= self.slots.len() {
            return Err(SlotError::OutOfRange {
                slot,
                capacity: self.slots.len(),
            });
        }

        let value = self.slots[slot].lock().take();

        let shard = self.starts.partition_point(|&s| s <= slot) - 1;
        if let Err(e) = self.shards[shard].free(slot - self.starts[shard]) {
            panic!("slot {slot} double free ({e})");
        }

        let _ = self.used.fetch_sub(1, Ordering::SeqCst);
        Ok(value.expect("occupied slot holds a value"))
    }
}
