/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The trait that the block execution layer implements to plug into consensus.
//!
//! Consensus decides *which* block is committed at each height. Everything about *what* a block
//! contains, whether its contents are acceptable, and what committing it does to the chain state is up
//! to the [`BlockExecutor`].
//!
//! Besides implementing the methods below, implementors are expected to be *deterministic*: for the same
//! arguments, `validate_block`, `process_proposal`, `apply_block`, and `verify_vote_extension` must
//! give the same answer on every replica, or replicas will disagree about which blocks are valid.

use thiserror::Error;

use crate::types::{
    block::{Block, BlockID},
    commit::ExtendedCommit,
    data_types::{Address, Height},
    state::{BlockValidationError, State},
    vote::Vote,
};

pub trait BlockExecutor: Send + 'static {
    /// Called when this replica is the proposer of a round and has no valid block to re-propose.
    ///
    /// `last_extended_commit` is the commit of the previous height, extensions included if vote
    /// extensions were enabled at that height. It is `None` at the chain's initial height.
    ///
    /// The returned block should be made with [`State::make_block`], with its time set to
    /// [`State::block_time`].
    fn create_proposal_block(
        &mut self,
        height: Height,
        state: &State,
        last_extended_commit: Option<&ExtendedCommit>,
        proposer_address: Address,
    ) -> Result<Block, BlockExecutorError>;

    /// Check that `block` is a valid next block on top of `state`. The default implementation only
    /// runs the protocol-level checks of [`State::validate_block`].
    fn validate_block(&mut self, state: &State, block: &Block) -> Result<(), BlockExecutorError> {
        Ok(state.validate_block(block)?)
    }

    /// Ask the application whether it accepts the proposed `block`. A replica prevotes nil for a
    /// rejected block.
    fn process_proposal(&mut self, block: &Block, state: &State) -> Result<bool, BlockExecutorError>;

    /// Execute the committed `block`, returning the chain state after it.
    fn apply_block(
        &mut self,
        state: &State,
        block_id: BlockID,
        block: &Block,
    ) -> Result<State, BlockExecutorError>;

    /// Execute a block whose commit was verified outside of consensus (e.g., during block sync).
    fn apply_verified_block(
        &mut self,
        state: &State,
        block_id: BlockID,
        block: &Block,
    ) -> Result<State, BlockExecutorError> {
        self.apply_block(state, block_id, block)
    }

    /// Produce the vote extension for this replica's non-nil precommit `vote` for `block`.
    fn extend_vote(
        &mut self,
        vote: &Vote,
        block: &Block,
        state: &State,
    ) -> Result<Vec<u8>, BlockExecutorError>;

    /// Check the vote extension carried by another validator's precommit.
    fn verify_vote_extension(&mut self, vote: &Vote) -> Result<(), BlockExecutorError>;
}

#[derive(Debug, Error)]
pub enum BlockExecutorError {
    #[error("{0}")]
    InvalidBlock(#[from] BlockValidationError),
    #[error("application rejected the vote extension: {reason}")]
    InvalidVoteExtension { reason: String },
    #[error("application error: {reason}")]
    App { reason: String },
}
