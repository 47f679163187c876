// SPDX-License-Identifier: Apache-2.0

//! Layered find-first-zero bitmap.
//!
//! Layer `n-1` is the finest grained and holds one bit per allocatable
//! unit. Each coarser layer holds one bit per 256-bit slice of the layer
//! below, set iff that slice is entirely occupied, so an allocation walks
//! at most six short slices instead of the whole population.

use crate::error::BitmapError;
use parking_lot::Mutex;

const MAX_LAYERS: usize = 6;
const SLICE_BITS: usize = 256;
const WORD_BITS: usize = 64;
const SLICE_WORDS: usize = SLICE_BITS / WORD_BITS;

struct Layer {
    count: usize,
    words: Vec<u64>,
}

impl Layer {
    fn new(count: usize) -> Self {
        Layer {
            count,
            words: vec![0; count.div_ceil(WORD_BITS)],
        }
    }

    fn test_set(&mut self, bit: usize) -> bool {
        let mask = 1u64 << (bit % WORD_BITS);
        let word = &mut self.words[bit / WORD_BITS];
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        true
    }

    fn test_clear(&mut self, bit: usize) -> bool {
        let mask = 1u64 << (bit % WORD_BITS);
        let word = &mut self.words[bit / WORD_BITS];
        if *word & mask == 0 {
            return false;
        }
        *word &= !mask;
        true
    }

    /// First zero bit of the whole layer, if any.
    fn first_zero(&self) -> Option<usize> {
        first_zero_in(&self.words, self.count)
    }

    /// First zero bit of the 256-bit slice beginning at `start`
    /// (slice-aligned), relative to `start`.
    fn slice_first_zero(&self, start: usize) -> Option<usize> {
        let count = SLICE_BITS.min(self.count - start);
        let w0 = start / WORD_BITS;
        let w1 = self.words.len().min(w0 + SLICE_WORDS);
        first_zero_in(&self.words[w0..w1], count)
    }
}

fn first_zero_in(words: &[u64], count: usize) -> Option<usize> {
    for (i, word) in words.iter().enumerate() {
        let zeros = !word;
        if zeros != 0 {
            let pos = i * WORD_BITS + zeros.trailing_zeros() as usize;
            return (pos < count).then_some(pos);
        }
    }
    None
}

/// Hierarchical bitmap over a fixed bit population, serialized by one lock.
pub struct Bitmap {
    inner: Mutex<Vec<Layer>>,
    bits: usize,
}

impl Bitmap {
    /// Build a bitmap covering `bits` allocatable units.
    ///
    /// # Errors
    ///
    /// [`BitmapError::EmptyPopulation`] for zero bits,
    /// [`BitmapError::TooLarge`] when more than six layers would be needed.
    pub fn new(bits: usize) -> Result<Self, BitmapError> {
        if bits == 0 {
            return Err(BitmapError::EmptyPopulation);
        }

        let mut levels = 0;
        let mut remaining = bits;
        while remaining != 0 {
            levels += 1;
            remaining /= SLICE_BITS;
        }
        if levels > MAX_LAYERS {
            return Err(BitmapError::TooLarge { bits });
        }

        // layers[0] is the coarsest; layers[levels - 1] maps units 1:1.
        let mut layers = Vec::with_capacity(levels);
        let mut count = bits;
        for _ in 0..levels {
            layers.push(Layer::new(count));
            count = count.div_ceil(SLICE_BITS);
        }
        layers.reverse();

        Ok(Bitmap {
            inner: Mutex::new(layers),
            bits,
        })
    }

    /// The bit population.
    pub fn capacity(&self) -> usize {
        self.bits
    }

    /// Claim the lowest free bit, or `None` when the population is full.
    pub fn alloc(&self) -> Option<usize> {
        let mut layers = self.inner.lock();

        let mut pos = layers[0].first_zero()?;
        let mut start = 0;
        for layer in layers.iter().skip(1) {
            start = (start + pos) * SLICE_BITS;
            pos = layer
                .slice_first_zero(start)
                .expect("summary bit clear but slice is full");
        }

        let bit = start + pos;
        set_and_propagate(&mut layers, bit);
        Some(bit)
    }

    /// Release a bit claimed by [`Bitmap::alloc`].
    ///
    /// # Errors
    ///
    /// [`BitmapError::OutOfRange`] for an index outside the population,
    /// [`BitmapError::DoubleFree`] when the bit is already clear.
    pub fn free(&self, bit: usize) -> Result<(), BitmapError> {
        if bit >= self.bits {
            return Err(BitmapError::OutOfRange {
                bit,
                bits: self.bits,
            });
        }

        let mut layers = self.inner.lock();
        let finest = layers.len() - 1;
        if !layers[finest].test_clear(bit) {
            return Err(BitmapError::DoubleFree { bit });
        }

        // Walk up clearing summary bits; stop at the first parent that was
        // already clear, since its slice was already non-full.
        let mut parent_bit = bit / SLICE_BITS;
        for i in (0..finest).rev() {
            if !layers[i].test_clear(parent_bit) {
                break;
            }
            parent_bit /= SLICE_BITS;
        }

        Ok(())
    }

    #[cfg(test)]
    fn layer_count(&self) -> usize {
        self.inner.lock().len()
    }

    #[cfg(test)]
    fn layer_bit(&self, layer: usize, bit: usize) -> bool {
        let layers = self.inner.lock();
        layers[layer].words[bit / WORD_BITS] & (1u64 << (bit % WORD_BITS)) != 0
    }
}

fn set_and_propagate(layers: &mut [Layer], bit: usize) {
    let mut bit = bit;
    for i in (0..layers.len()).rev() {
        if !layers[i].test_set(bit) {
            tracing::error!(bit, layer = i, "bit already set");
            break;
        }
        if i == 0 {
            break;
        }

        let slice = bit / SLICE_BITS;
        if layers[i].slice_first_zero(slice * SLICE_BITS).is_some() {
            break;
        }
        bit = slice;
    }
}
