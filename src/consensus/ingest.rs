/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Blocks that were verified outside of consensus, e.g., by block sync, and are handed to the state
//! machine so that it can skip voting on them.

use std::time::SystemTime;

use thiserror::Error;

use crate::{
    app::{BlockExecutor, BlockExecutorError},
    events::{Event, NewBlockEvent},
    pluggables::{BlockStore, EvidencePool},
    types::{
        block::{Block, BlockID},
        commit::{Commit, CommitError, ExtendedCommit},
        data_types::{Height, Round, Timestamp},
        part_set::PartSet,
        state::{BlockValidationError, State},
        validator_set::CommitVerificationError,
    },
    votes::vote_set::VoteSet,
    wal::messages::WalMessage,
};

use super::{errors::ConsensusError, round_state::RoundStepType, state::ConsensusState};

/// A block, its parts, and the commit for it. `extended_commit` must be present iff vote extensions
/// are enabled at the block's height.
#[derive(Clone, Debug)]
pub struct VerifiedBlock {
    block: Block,
    parts: PartSet,
    commit: Commit,
    extended_commit: Option<ExtendedCommit>,
}

impl VerifiedBlock {
    /// Bundle a block with its commit, checking that they belong together.
    pub fn new(
        block: Block,
        parts: PartSet,
        commit: Commit,
        extended_commit: Option<ExtendedCommit>,
    ) -> Result<VerifiedBlock, IngestError> {
        let verified_block = VerifiedBlock {
            block,
            parts,
            commit,
            extended_commit,
        };
        verified_block.validate_basic()?;
        Ok(verified_block)
    }

    pub fn height(&self) -> Height {
        self.block.height()
    }

    pub fn block_id(&self) -> BlockID {
        BlockID::new(self.block.hash(), self.parts.header())
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn parts(&self) -> &PartSet {
        &self.parts
    }

    pub fn commit(&self) -> &Commit {
        &self.commit
    }

    pub fn extended_commit(&self) -> Option<&ExtendedCommit> {
        self.extended_commit.as_ref()
    }

    fn validate_basic(&self) -> Result<(), IngestError> {
        if !self.parts.is_complete() {
            return Err(IngestError::Validation("part set is incomplete".to_string()));
        }
        let block_id = self.block_id();
        let height = self.height();

        if let Some(extended_commit) = &self.extended_commit {
            if extended_commit.height != height {
                return Err(IngestError::Validation(format!(
                    "extended commit is for height {}, block is at {}",
                    extended_commit.height, height
                )));
            }
            if extended_commit.block_id != block_id {
                return Err(IngestError::Validation(
                    "extended commit is for a different block".to_string(),
                ));
            }
            extended_commit.to_commit().validate_basic()?;
        }

        if self.commit.height != height {
            return Err(IngestError::Validation(format!(
                "commit is for height {}, block is at {}",
                self.commit.height, height
            )));
        }
        if self.commit.block_id != block_id {
            return Err(IngestError::Validation(
                "commit is for a different block".to_string(),
            ));
        }
        Ok(self.commit.validate_basic()?)
    }

    /// Check the block against `state`, the state that it would be applied on top of.
    pub(crate) fn verify(&self, state: &State) -> Result<(), IngestError> {
        let height = self.height();
        let extensions_enabled = state.consensus_params.vote_extensions_enabled(height);
        if extensions_enabled != self.extended_commit.is_some() {
            return Err(IngestError::Validation(format!(
                "vote extensions enabled at height {} is {}, but extended commit present is {}",
                height,
                extensions_enabled,
                self.extended_commit.is_some()
            )));
        }

        state.validate_block(&self.block)?;
        state
            .validators
            .verify_commit(state.chain_id, self.block_id(), height, &self.commit)?;
        if let Some(extended_commit) = &self.extended_commit {
            extended_commit.ensure_extensions(true)?;
            state.validators.verify_commit(
                state.chain_id,
                self.block_id(),
                height,
                &extended_commit.to_commit(),
            )?;
        }
        Ok(())
    }
}

impl<E: BlockExecutor, S: BlockStore, P: EvidencePool> ConsensusState<E, S, P> {
    /// Commit `verified_block` without voting on it, and move on to the next height.
    ///
    /// The inner error means the block was refused and the state machine is unchanged. The outer
    /// error is fatal.
    pub(super) fn ingest_verified_block(
        &mut self,
        verified_block: VerifiedBlock,
    ) -> Result<Result<(), IngestError>, ConsensusError> {
        let height = verified_block.height();
        let last_block_height = self.state.last_block_height;
        if height <= last_block_height {
            return Ok(Err(IngestError::AlreadyIncluded));
        }
        if height != last_block_height + 1 {
            return Ok(Err(IngestError::HeightGap {
                expected: last_block_height + 1,
                got: height,
            }));
        }
        if let Err(err) = verified_block.verify(&self.state) {
            log::info!("Refusing to ingest block {}: {}", height, err);
            return Ok(Err(err));
        }

        let (commit_round, commit_votes) = match verified_block.commit_votes(&self.state) {
            Ok(commit_votes) => commit_votes,
            Err(err) => return Ok(Err(err)),
        };
        let block_id = verified_block.block_id();
        log::info!("Ingesting verified block {} at height {}", block_id.hash, height);

        self.update_round_step(commit_round, RoundStepType::Commit);
        self.rs.commit_round = commit_round;
        self.rs.commit_time = Timestamp::now();
        self.new_step();

        let VerifiedBlock {
            block,
            parts,
            commit,
            extended_commit,
        } = verified_block;
        match &extended_commit {
            Some(extended_commit) => self
                .block_store
                .save_block_with_extended_commit(&block, &parts, extended_commit),
            None => self.block_store.save_block(&block, &parts, &commit),
        }

        self.wal.write_sync(&WalMessage::EndHeight(height))?;

        let new_state = self
            .executor
            .apply_verified_block(&self.state, block_id, &block)?;
        self.emit(Event::NewBlock(NewBlockEvent {
            timestamp: SystemTime::now(),
            block_id,
            block,
        }));

        // The commit comes with the block rather than from this height's precommits.
        self.rs.commit_round = Round::NIL;
        self.rs.last_commit = Some(commit_votes);
        self.update_to_state(new_state)?;
        if let Err(err) = self.update_priv_validator_pub_key() {
            log::error!("Failed to refresh the private validator's public key: {}", err);
        }
        self.schedule_round_0();
        Ok(Ok(()))
    }
}

impl VerifiedBlock {
    fn commit_votes(&self, state: &State) -> Result<(Round, VoteSet), IngestError> {
        let validators = state.validators.clone();
        let votes = match &self.extended_commit {
            Some(extended_commit) => {
                VoteSet::from_extended_commit(state.chain_id, extended_commit, validators)
                    .map(|votes| (extended_commit.round, votes))
            }
            None => VoteSet::from_commit(state.chain_id, &self.commit, validators)
                .map(|votes| (self.commit.round, votes)),
        };
        votes.map_err(|err| IngestError::Validation(format!("commit does not form a vote set: {}", err)))
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("consensus has stopped")]
    Stopped,
    #[error("block is already committed")]
    AlreadyIncluded,
    #[error("block height {got} does not follow the last committed height, expected {expected}")]
    HeightGap { expected: Height, got: Height },
    #[error("invalid verified block: {0}")]
    Validation(String),
    #[error("invalid commit: {0}")]
    Commit(#[from] CommitError),
    #[error("block is not valid on top of the current state: {0}")]
    Block(#[from] BlockValidationError),
    #[error("commit verification failed: {0}")]
    CommitVerification(#[from] CommitVerificationError),
    #[error("could not apply the block: {0}")]
    Apply(#[from] BlockExecutorError),
}
