//! Fixed-capacity bitmaps over node-local word arrays.
//!
//! Two flavours share the same layout of `ceil(n / 64)` machine words:
//! a single-writer variant that tracks its population count, and a
//! thread-safe variant whose set/clear/get are relaxed atomics. The graph
//! engine uses them as activation sets; the sorter as portion-status
//! tables.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::numa::NumaBuf;

const WORD_BITS: usize = 64;

fn num_words(nbits: usize) -> usize {
    nbits.div_ceil(WORD_BITS)
}

fn push_set_bits(word: u64, word_idx: usize, out: &mut Vec<usize>) {
    let mut value = word;
    while value != 0 {
        let bit = value.trailing_zeros() as usize;
        out.push(word_idx * WORD_BITS + bit);
        value &= value - 1;
    }
}

/// Single-writer bitmap that keeps `num_set_bits` equal to the popcount of
/// its word array.
pub struct CountingBitmap {
    words: NumaBuf<u64>,
    nbits: usize,
    num_set_bits: usize,
}

impl CountingBitmap {
    pub fn new(nbits: usize, node: usize) -> Self {
        Self {
            words: NumaBuf::alloc(num_words(nbits), node),
            nbits,
            num_set_bits: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nbits
    }

    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    pub fn num_set_bits(&self) -> usize {
        self.num_set_bits
    }

    pub fn set(&mut self, idx: usize) {
        assert!(idx < self.nbits, "bit index {idx} out of range {}", self.nbits);
        let word = &mut self.words.as_mut_slice()[idx / WORD_BITS];
        let mask = 1u64 << (idx % WORD_BITS);
        if *word & mask == 0 {
            self.num_set_bits += 1;
            *word |= mask;
        }
    }

    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.nbits, "bit index {idx} out of range {}", self.nbits);
        self.words.as_slice()[idx / WORD_BITS] & (1u64 << (idx % WORD_BITS)) != 0
    }

    pub fn clear(&mut self) {
        self.words.as_mut_slice().fill(0);
        self.num_set_bits = 0;
    }

    pub fn copy_to(&self, other: &mut CountingBitmap) {
        assert_eq!(
            self.nbits, other.nbits,
            "copy_to requires equal capacities"
        );
        other
            .words
            .as_mut_slice()
            .copy_from_slice(self.words.as_slice());
        other.num_set_bits = self.num_set_bits;
    }

    /// Appends every set bit index to `out`, ascending.
    pub fn collect_set_bits(&self, out: &mut Vec<usize>) -> usize {
        let before = out.len();
        for (i, &word) in self.words.as_slice().iter().enumerate() {
            if word != 0 {
                push_set_bits(word, i, out);
            }
        }
        debug_assert_eq!(out.len() - before, self.num_set_bits);
        out.len() - before
    }

    /// Appends the set bits in `[begin_idx, end_idx)` to `out`.
    ///
    /// `begin_idx` must start a word.
    pub fn collect_set_bits_range(
        &self,
        begin_idx: usize,
        end_idx: usize,
        out: &mut Vec<usize>,
    ) -> usize {
        assert_eq!(
            begin_idx % WORD_BITS,
            0,
            "ranged collect must start on a word boundary"
        );
        let end_idx = end_idx.min(self.nbits);
        let word_end = num_words(end_idx).min(self.words.len());
        let before = out.len();
        for i in begin_idx / WORD_BITS..word_end {
            let word = self.words.as_slice()[i];
            if word != 0 {
                push_set_bits(word, i, out);
            }
        }
        // The last word may reach past end_idx.
        while out.len() > before && out.last().is_some_and(|&b| b >= end_idx) {
            out.pop();
        }
        out.len() - before
    }
}

/// Thread-safe bitmap. Set/clear/get are atomic with relaxed ordering;
/// callers needing cross-data visibility insert their own barriers.
pub struct AtomicBitmap {
    words: NumaBuf<AtomicU64>,
    nbits: usize,
}

impl AtomicBitmap {
    pub fn new(nbits: usize, node: usize) -> Self {
        Self {
            words: NumaBuf::alloc(num_words(nbits), node),
            nbits,
        }
    }

    pub fn len(&self) -> usize {
        self.nbits
    }

    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    pub fn set(&self, idx: usize) {
        assert!(idx < self.nbits, "bit index {idx} out of range {}", self.nbits);
        self.words.as_slice()[idx / WORD_BITS]
            .fetch_or(1u64 << (idx % WORD_BITS), Ordering::Relaxed);
    }

    pub fn clear(&self, idx: usize) {
        assert!(idx < self.nbits, "bit index {idx} out of range {}", self.nbits);
        self.words.as_slice()[idx / WORD_BITS]
            .fetch_and(!(1u64 << (idx % WORD_BITS)), Ordering::Relaxed);
    }

    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.nbits, "bit index {idx} out of range {}", self.nbits);
        self.words.as_slice()[idx / WORD_BITS].load(Ordering::Relaxed)
            & (1u64 << (idx % WORD_BITS))
            != 0
    }

    pub fn clear_all(&self) {
        for word in self.words.as_slice() {
            word.store(0, Ordering::Relaxed);
        }
    }
}
