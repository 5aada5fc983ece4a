/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Fixed-size bit array used to summarize "who has what" in gossip.
//!
//! Vote sets expose a `BitArray` with one bit per validator (set if that validator's vote is known),
//! and part sets expose one with one bit per block part. Peers exchange these arrays so that each side
//! only sends what the other is missing.

use borsh::{BorshDeserialize, BorshSerialize};
use rand::Rng;

#[derive(Clone, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BitArray {
    bits: u32,
    elems: Vec<u64>,
}

impl BitArray {
    /// Create a new `BitArray` with `bits` bits, all unset.
    pub fn new(bits: usize) -> BitArray {
        BitArray {
            bits: bits as u32,
            elems: vec![0; (bits + 63) / 64],
        }
    }

    /// Number of bits in this array.
    pub fn size(&self) -> usize {
        self.bits as usize
    }

    /// Get the bit at `index`. Out-of-range indices read as unset.
    pub fn get_index(&self, index: usize) -> bool {
        if index >= self.size() {
            return false;
        }
        self.elems[index / 64] & (1u64 << (index % 64)) > 0
    }

    /// Set the bit at `index` to `value`. Returns `false` if `index` is out of range.
    pub fn set_index(&mut self, index: usize, value: bool) -> bool {
        if index >= self.size() {
            return false;
        }
        if value {
            self.elems[index / 64] |= 1u64 << (index % 64);
        } else {
            self.elems[index / 64] &= !(1u64 << (index % 64));
        }
        true
    }

    /// Bits set in `self` but not in `other`.
    ///
    /// Only the first `min(self.size(), other.size())` bits are subtracted; bits of `self` beyond the
    /// length of `other` are kept.
    pub fn sub(&self, other: &BitArray) -> BitArray {
        let mut result = self.clone();
        for (i, elem) in other.elems.iter().enumerate().take(result.elems.len()) {
            // Mask off bits of `other` past its own length.
            let mask = if (i + 1) * 64 > other.size() {
                let valid = other.size() - i * 64;
                if valid == 0 { 0 } else { u64::MAX >> (64 - valid) }
            } else {
                u64::MAX
            };
            result.elems[i] &= !(elem & mask);
        }
        result
    }

    /// Bitwise OR, sized to the larger of the two arrays.
    pub fn or(&self, other: &BitArray) -> BitArray {
        let (mut result, smaller) = if self.size() >= other.size() {
            (self.clone(), other)
        } else {
            (other.clone(), self)
        };
        for (i, elem) in smaller.elems.iter().enumerate() {
            result.elems[i] |= elem;
        }
        result
    }

    /// Bitwise NOT over the valid bits.
    pub fn not(&self) -> BitArray {
        let mut result = self.clone();
        for elem in result.elems.iter_mut() {
            *elem = !*elem;
        }
        result.clear_trailing_bits();
        result
    }

    /// Overwrite the bits of `self` with those of `other` if both have the same size.
    pub fn update(&mut self, other: &BitArray) {
        if self.bits == other.bits {
            self.elems.copy_from_slice(&other.elems);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.elems.iter().all(|elem| *elem == 0)
    }

    pub fn is_full(&self) -> bool {
        self.count_ones() == self.size()
    }

    pub fn count_ones(&self) -> usize {
        self.elems.iter().map(|elem| elem.count_ones() as usize).sum()
    }

    /// Indices of all set bits, in increasing order.
    pub fn true_indices(&self) -> Vec<usize> {
        (0..self.size()).filter(|i| self.get_index(*i)).collect()
    }

    /// Pick the index of a random set bit, or `None` if no bit is set.
    pub fn pick_random<R: Rng>(&self, rng: &mut R) -> Option<usize> {
        let indices = self.true_indices();
        if indices.is_empty() {
            return None;
        }
        Some(indices[rng.gen_range(0..indices.len())])
    }

    fn clear_trailing_bits(&mut self) {
        let rem = self.size() % 64;
        if rem != 0 {
            if let Some(last) = self.elems.last_mut() {
                *last &= u64::MAX >> (64 - rem);
            }
        }
    }
}

impl std::fmt::Debug for BitArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BA{{{}:", self.bits)?;
        for i in 0..self.size() {
            write!(f, "{}", if self.get_index(i) { 'x' } else { '_' })?;
        }
        write!(f, "}}")
    }
}
