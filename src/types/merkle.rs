/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Binary Merkle tree over byte slices, used to commit to the parts of a block.
//!
//! Leaves are hashed as `SHA256(0x00 || leaf)` and inner nodes as `SHA256(0x01 || left || right)`. A
//! tree over `n` leaves splits at the largest power of two strictly less than `n`.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    crypto_primitives::{CryptoHasher, Digest},
    data_types::CryptoHash,
};

const LEAF_PREFIX: u8 = 0;
const INNER_PREFIX: u8 = 1;

/// Proof that a leaf is the `index`-th of `total` leaves under some root.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Proof {
    pub total: u32,
    pub index: u32,
    pub leaf_hash: CryptoHash,
    /// Sibling hashes from the leaf up to (but excluding) the root.
    pub aunts: Vec<CryptoHash>,
}

impl Proof {
    /// Check that this proof proves that `leaf` is under `root`.
    pub fn verify(&self, root: &CryptoHash, leaf: &[u8]) -> bool {
        if self.index >= self.total || leaf_hash(leaf) != self.leaf_hash {
            return false;
        }
        match compute_hash_from_aunts(
            self.index as usize,
            self.total as usize,
            self.leaf_hash,
            &self.aunts,
        ) {
            Some(computed) => computed == *root,
            None => false,
        }
    }
}

/// Compute the Merkle root of `items`. The root of zero items is the SHA256 hash of the empty string.
pub fn hash_from_byte_slices(items: &[Vec<u8>]) -> CryptoHash {
    match items.len() {
        0 => CryptoHash::digest(&[]),
        1 => leaf_hash(&items[0]),
        n => {
            let k = split_point(n);
            inner_hash(
                &hash_from_byte_slices(&items[..k]),
                &hash_from_byte_slices(&items[k..]),
            )
        }
    }
}

/// Compute the Merkle root of `items` along with one inclusion proof per item.
pub fn proofs_from_byte_slices(items: &[Vec<u8>]) -> (CryptoHash, Vec<Proof>) {
    let leaves: Vec<CryptoHash> = items.iter().map(|item| leaf_hash(item)).collect();
    let root = root_from_leaf_hashes(&leaves);
    let proofs = (0..leaves.len())
        .map(|index| Proof {
            total: leaves.len() as u32,
            index: index as u32,
            leaf_hash: leaves[index],
            aunts: aunts_of(&leaves, index),
        })
        .collect();
    (root, proofs)
}

fn root_from_leaf_hashes(leaves: &[CryptoHash]) -> CryptoHash {
    match leaves.len() {
        0 => CryptoHash::digest(&[]),
        1 => leaves[0],
        n => {
            let k = split_point(n);
            inner_hash(
                &root_from_leaf_hashes(&leaves[..k]),
                &root_from_leaf_hashes(&leaves[k..]),
            )
        }
    }
}

// Aunts are ordered from the leaf level upwards.
fn aunts_of(leaves: &[CryptoHash], index: usize) -> Vec<CryptoHash> {
    if leaves.len() <= 1 {
        return Vec::new();
    }
    let k = split_point(leaves.len());
    if index < k {
        let mut aunts = aunts_of(&leaves[..k], index);
        aunts.push(root_from_leaf_hashes(&leaves[k..]));
        aunts
    } else {
        let mut aunts = aunts_of(&leaves[k..], index - k);
        aunts.push(root_from_leaf_hashes(&leaves[..k]));
        aunts
    }
}

fn compute_hash_from_aunts(
    index: usize,
    total: usize,
    leaf: CryptoHash,
    aunts: &[CryptoHash],
) -> Option<CryptoHash> {
    match total {
        0 => None,
        1 => aunts.is_empty().then_some(leaf),
        _ => {
            let (last, rest) = aunts.split_last()?;
            let k = split_point(total);
            if index < k {
                let left = compute_hash_from_aunts(index, k, leaf, rest)?;
                Some(inner_hash(&left, last))
            } else {
                let right = compute_hash_from_aunts(index - k, total - k, leaf, rest)?;
                Some(inner_hash(last, &right))
            }
        }
    }
}

fn leaf_hash(leaf: &[u8]) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(leaf);
    CryptoHash::new(hasher.finalize().into())
}

fn inner_hash(left: &CryptoHash, right: &CryptoHash) -> CryptoHash {
    let mut hasher = CryptoHasher::new();
    hasher.update([INNER_PREFIX]);
    hasher.update(left.bytes());
    hasher.update(right.bytes());
    CryptoHash::new(hasher.finalize().into())
}

// Largest power of two strictly less than `n`. Requires `n > 1`.
fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}
