/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Blocks are gossiped in fixed-size parts.
//!
//! A proposer serializes a block, splits the bytes into [`Part`]s of [`BLOCK_PART_SIZE_BYTES`], and
//! commits to them with a Merkle root. The root and the number of parts form the block's
//! [`PartSetHeader`], which is part of its [`BlockID`](super::block::BlockID). Receivers build up a
//! [`PartSet`] one verified part at a time until it is complete.

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use super::{
    bit_array::BitArray,
    data_types::CryptoHash,
    merkle::{proofs_from_byte_slices, Proof},
};

/// Size of every block part except possibly the last.
pub const BLOCK_PART_SIZE_BYTES: usize = 65536;

/// Number of parts a block is split into, and the Merkle root of the parts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: CryptoHash,
}

impl PartSetHeader {
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_zero()
    }
}

/// A single part of a serialized block, with a proof of its inclusion in the part set.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub proof: Proof,
}

impl Part {
    pub fn validate_basic(&self) -> Result<(), PartSetError> {
        if self.bytes.len() > BLOCK_PART_SIZE_BYTES {
            return Err(PartSetError::PartTooBig {
                size: self.bytes.len(),
            });
        }
        if self.proof.index != self.index {
            return Err(PartSetError::ProofIndexMismatch {
                part_index: self.index,
                proof_index: self.proof.index,
            });
        }
        Ok(())
    }
}

/// A (possibly incomplete) set of the parts of one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartSet {
    total: u32,
    hash: CryptoHash,
    parts: Vec<Option<Part>>,
    parts_bit_array: BitArray,
    count: u32,
    byte_size: usize,
}

impl PartSet {
    /// Split `data` into parts of `part_size` bytes and build a complete `PartSet` out of them.
    pub fn new_from_data(data: &[u8], part_size: usize) -> PartSet {
        let chunks: Vec<Vec<u8>> = if data.is_empty() {
            vec![Vec::new()]
        } else {
            data.chunks(part_size).map(|chunk| chunk.to_vec()).collect()
        };
        let (root, proofs) = proofs_from_byte_slices(&chunks);
        let total = chunks.len();
        let mut parts_bit_array = BitArray::new(total);
        let parts = chunks
            .into_iter()
            .zip(proofs)
            .enumerate()
            .map(|(index, (bytes, proof))| {
                parts_bit_array.set_index(index, true);
                Some(Part {
                    index: index as u32,
                    bytes,
                    proof,
                })
            })
            .collect();
        PartSet {
            total: total as u32,
            hash: root,
            parts,
            parts_bit_array,
            count: total as u32,
            byte_size: data.len(),
        }
    }

    /// Create an empty `PartSet` that will accept the parts committed to by `header`.
    pub fn new_from_header(header: &PartSetHeader) -> PartSet {
        PartSet {
            total: header.total,
            hash: header.hash,
            parts: vec![None; header.total as usize],
            parts_bit_array: BitArray::new(header.total as usize),
            count: 0,
            byte_size: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        PartSetHeader {
            total: self.total,
            hash: self.hash,
        }
    }

    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.header() == *header
    }

    pub fn bit_array(&self) -> BitArray {
        self.parts_bit_array.clone()
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.total
    }

    pub fn get_part(&self, index: usize) -> Option<&Part> {
        self.parts.get(index).and_then(|part| part.as_ref())
    }

    /// Add `part` to this set after checking its Merkle proof.
    ///
    /// Returns `Ok(false)` if the set already has a part with the same index.
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        let index = part.index as usize;
        if part.index >= self.total {
            return Err(PartSetError::UnexpectedIndex {
                index: part.index,
                total: self.total,
            });
        }
        if self.parts[index].is_some() {
            return Ok(false);
        }
        if part.proof.total != self.total || !part.proof.verify(&self.hash, &part.bytes) {
            return Err(PartSetError::InvalidProof { index: part.index });
        }

        self.byte_size += part.bytes.len();
        self.parts[index] = Some(part);
        self.parts_bit_array.set_index(index, true);
        self.count += 1;
        Ok(true)
    }

    /// Concatenate the bytes of all parts. Returns `None` if the set is incomplete.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut bytes = Vec::with_capacity(self.byte_size);
        for part in self.parts.iter().flatten() {
            bytes.extend_from_slice(&part.bytes);
        }
        Some(bytes)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartSetError {
    #[error("part index {index} out of range for part set of {total} parts")]
    UnexpectedIndex { index: u32, total: u32 },
    #[error("invalid Merkle proof for part {index}")]
    InvalidProof { index: u32 },
    #[error("part is {size} bytes, larger than the maximum part size")]
    PartTooBig { size: usize },
    #[error("part index {part_index} does not match proof index {proof_index}")]
    ProofIndexMismatch { part_index: u32, proof_index: u32 },
}
