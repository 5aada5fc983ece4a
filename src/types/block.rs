/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of [`Block`], its [`Header`], and the [`BlockID`] that votes refer to.

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use super::{
    commit::Commit,
    data_types::{Address, ChainID, CryptoHash, Height, Timestamp},
    merkle::hash_from_byte_slices,
    part_set::{PartSet, PartSetHeader, BLOCK_PART_SIZE_BYTES},
};

/// Identifies a block: its hash plus the header of the part set it was gossiped as.
///
/// The zero `BlockID` stands for "no block". Votes carrying it are nil votes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct BlockID {
    pub hash: CryptoHash,
    pub part_set_header: PartSetHeader,
}

impl BlockID {
    pub fn new(hash: CryptoHash, part_set_header: PartSetHeader) -> BlockID {
        BlockID {
            hash,
            part_set_header,
        }
    }

    /// The nil `BlockID`.
    pub fn nil() -> BlockID {
        BlockID::default()
    }

    pub fn is_nil(&self) -> bool {
        self.hash.is_zero() && self.part_set_header.is_zero()
    }

    /// Whether this `BlockID` identifies an actual block, i.e., has a hash and a non-empty part set.
    pub fn is_complete(&self) -> bool {
        !self.hash.is_zero() && self.part_set_header.total > 0 && !self.part_set_header.hash.is_zero()
    }

    /// Check that this `BlockID` is either nil or complete.
    pub fn validate_basic(&self) -> Result<(), BlockError> {
        if self.is_nil() || self.is_complete() {
            Ok(())
        } else {
            Err(BlockError::MalformedBlockID)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Header {
    pub chain_id: ChainID,
    pub height: Height,
    pub time: Timestamp,
    pub last_block_id: BlockID,
    pub last_commit_hash: CryptoHash,
    pub data_hash: CryptoHash,
    pub validators_hash: CryptoHash,
    pub next_validators_hash: CryptoHash,
    pub app_hash: CryptoHash,
    pub proposer_address: Address,
}

impl Header {
    /// SHA256 hash of the Borsh serialization of this header. This is the hash of the block.
    pub fn hash(&self) -> CryptoHash {
        // Serializing a struct of fixed-size fields into a `Vec` cannot fail.
        let bytes = self.try_to_vec().unwrap_or_default();
        CryptoHash::digest(&bytes)
    }
}

/// A block of transactions, plus the commit that finalized the previous block.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub header: Header,
    pub data: Vec<Vec<u8>>,
    pub last_commit: Option<Commit>,
}

impl Block {
    /// Create a block at `height` containing `txs`. The header's hashes over the block's contents are
    /// filled in; fields that describe the chain state are copied from `template`.
    pub fn new(template: Header, txs: Vec<Vec<u8>>, last_commit: Option<Commit>) -> Block {
        let mut header = template;
        header.data_hash = hash_from_byte_slices(&txs);
        header.last_commit_hash = last_commit
            .as_ref()
            .map(|commit| commit.hash())
            .unwrap_or_default();
        Block {
            header,
            data: txs,
            last_commit,
        }
    }

    pub fn hash(&self) -> CryptoHash {
        self.header.hash()
    }

    pub fn height(&self) -> Height {
        self.header.height
    }

    /// Split the serialization of this block into parts of `part_size` bytes.
    pub fn make_part_set(&self, part_size: usize) -> PartSet {
        let bytes = self.try_to_vec().unwrap_or_default();
        PartSet::new_from_data(&bytes, part_size)
    }

    /// Split this block into parts of the default size and compute its `BlockID`.
    pub fn block_id_and_parts(&self) -> (BlockID, PartSet) {
        let parts = self.make_part_set(BLOCK_PART_SIZE_BYTES);
        (BlockID::new(self.hash(), parts.header()), parts)
    }

    /// Deserialize a block from the assembled bytes of a complete part set.
    pub fn from_part_set(parts: &PartSet) -> Result<Block, BlockError> {
        let bytes = parts.assemble().ok_or(BlockError::IncompletePartSet)?;
        Block::try_from_slice(&bytes).map_err(|_| BlockError::Undecodable)
    }

    /// Stateless checks of internal consistency.
    pub fn validate_basic(&self) -> Result<(), BlockError> {
        if self.header.height.int() <= 0 {
            return Err(BlockError::NonPositiveHeight);
        }
        self.header.last_block_id.validate_basic()?;
        if hash_from_byte_slices(&self.data) != self.header.data_hash {
            return Err(BlockError::WrongDataHash);
        }
        let last_commit_hash = self
            .last_commit
            .as_ref()
            .map(|commit| commit.hash())
            .unwrap_or_default();
        if last_commit_hash != self.header.last_commit_hash {
            return Err(BlockError::WrongLastCommitHash);
        }
        Ok(())
    }
}

/// Summary of a stored block, returned by [`BlockStore::load_block_meta`](crate::pluggables::BlockStore::load_block_meta).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMeta {
    pub block_id: BlockID,
    pub block_size: usize,
    pub header: Header,
    pub num_txs: usize,
}

impl BlockMeta {
    pub fn new(block: &Block, parts: &PartSet) -> BlockMeta {
        BlockMeta {
            block_id: BlockID::new(block.hash(), parts.header()),
            block_size: parts.byte_size(),
            header: block.header.clone(),
            num_txs: block.data.len(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("block ID is neither nil nor complete")]
    MalformedBlockID,
    #[error("block height must be positive")]
    NonPositiveHeight,
    #[error("data hash does not match the block's transactions")]
    WrongDataHash,
    #[error("last commit hash does not match the block's last commit")]
    WrongLastCommitHash,
    #[error("part set is not complete")]
    IncompletePartSet,
    #[error("part set bytes do not decode into a block")]
    Undecodable,
}
