// SPDX-License-Identifier: Apache-2.0

//! Errors for the bitmap allocator and slot pool.

/// Errors from [`crate::Bitmap`] construction and bit release.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BitmapError {
    /// A bitmap must cover at least one bit.
    #[error("bitmap population must be non-zero")]
    EmptyPopulation,

    /// The population needs more than the supported six layers.
    #[error("bitmap population {bits} exceeds the supported layering")]
    TooLarge {
        /// Requested population.
        bits: usize,
    },

    /// The bit index lies outside the population.
    #[error("bit {bit} is out of range (population {bits})")]
    OutOfRange {
        /// Offending bit index.
        bit: usize,
        /// Bitmap population.
        bits: usize,
    },

    /// The bit was already clear; releasing it twice is a caller bug.
    #[error("bit {bit} freed twice")]
    DoubleFree {
        /// Offending bit index.
        bit: usize,
    },
}

/// Allocation failure from [`crate::SlotPool`]; carries the value back.
#[derive(thiserror::Error, Debug)]
pub enum AllocError<T> {
    /// Every sub-bitmap stayed full through the whole backoff schedule.
    #[error("slot pool exhausted after backoff")]
    Exhausted(T),
}

impl<T> AllocError<T> {
    /// Recover the value that could not be stored.
    pub fn into_inner(self) -> T {
        match self {
            AllocError::Exhausted(value) => value,
        }
    }
}

/// Slot release failure from [`crate::SlotPool`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SlotError {
    /// The slot index lies outside the pool.
    #[error("slot {slot} is out of range (capacity {capacity})")]
    OutOfRange {
        /// Offending slot index.
        slot: usize,
        /// Pool capacity.
        capacity: usize,
    },
}
