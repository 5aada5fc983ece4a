/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for the storage and pool components that consensus reads from and writes to, but does not
//! own.

use std::sync::mpsc::Receiver;

use crate::types::{
    block::{Block, BlockMeta},
    commit::{Commit, ExtendedCommit},
    data_types::Height,
    evidence::DuplicateVoteEvidence,
    part_set::{Part, PartSet},
};

/// Persistent storage of committed blocks.
///
/// A block saved with `save_block` or `save_block_with_extended_commit` must be visible to every
/// `load_*` call made after the save returns, including calls made through clones of the store on other
/// threads.
pub trait BlockStore: Clone + Send + 'static {
    /// Store a committed block, its parts, and the commit that this replica saw for it.
    fn save_block(&mut self, block: &Block, parts: &PartSet, seen_commit: &Commit);

    /// Same as [`save_block`](Self::save_block), but also keeps the vote extensions of the commit.
    fn save_block_with_extended_commit(
        &mut self,
        block: &Block,
        parts: &PartSet,
        seen_extended_commit: &ExtendedCommit,
    );

    fn load_block(&self, height: Height) -> Option<Block>;

    fn load_block_meta(&self, height: Height) -> Option<BlockMeta>;

    fn load_block_part(&self, height: Height, index: u32) -> Option<Part>;

    /// The commit for the block at `height` that this replica saw when it committed the block.
    fn load_seen_commit(&self, height: Height) -> Option<Commit>;

    /// The commit for the block at `height` included in the block at `height + 1`.
    fn load_block_commit(&self, height: Height) -> Option<Commit>;

    fn load_block_extended_commit(&self, height: Height) -> Option<ExtendedCommit>;

    /// Height of the highest stored block, or zero if the store is empty.
    fn height(&self) -> Height;

    /// Height of the lowest stored block, or zero if the store is empty.
    fn base(&self) -> Height;
}

pub trait Mempool: Send + 'static {
    /// A channel that receives a notification every time the mempool becomes non-empty. Consensus
    /// calls this once, on start.
    fn txs_available(&mut self) -> Receiver<()>;
}

/// Where consensus reports the misbehavior that it detects.
pub trait EvidencePool: Clone + Send + 'static {
    fn report_conflicting_votes(&mut self, evidence: DuplicateVoteEvidence);
}
