/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The chain state that consensus needs to run the next height.
//!
//! A `State` summarizes everything up to and including the last committed block: which block that
//! was, when it was made, which validators vote at the next height, and which consensus parameters are
//! in effect. Consensus only ever replaces its `State` with the one returned by
//! [`BlockExecutor::apply_block`](crate::app::BlockExecutor::apply_block).

use thiserror::Error;

use super::{
    block::{Block, BlockError, BlockID, Header},
    commit::{BlockIDFlag, Commit},
    data_types::{Address, ChainID, CryptoHash, Height, Timestamp, TotalPower},
    params::ConsensusParams,
    validator_set::{CommitVerificationError, ValidatorSet},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct State {
    pub chain_id: ChainID,
    pub initial_height: Height,

    pub last_block_height: Height,
    pub last_block_id: BlockID,
    pub last_block_time: Timestamp,

    /// Validators of the height after `last_block_height`.
    pub validators: ValidatorSet,
    /// Validators of the height after that.
    pub next_validators: ValidatorSet,
    /// Validators that signed the last block. `None` before the first block.
    pub last_validators: Option<ValidatorSet>,

    pub consensus_params: ConsensusParams,
    pub app_hash: CryptoHash,
}

impl State {
    /// The state of a chain that has not committed any block yet.
    pub fn from_genesis(
        chain_id: ChainID,
        initial_height: Height,
        genesis_time: Timestamp,
        validators: ValidatorSet,
        consensus_params: ConsensusParams,
    ) -> State {
        State {
            chain_id,
            initial_height,
            last_block_height: initial_height - 1,
            last_block_id: BlockID::nil(),
            last_block_time: genesis_time,
            next_validators: validators.copy_increment_proposer_priority(1),
            validators,
            last_validators: None,
            consensus_params,
            app_hash: CryptoHash::zero(),
        }
    }

    /// Whether no block has been committed yet.
    pub fn is_genesis(&self) -> bool {
        self.last_block_height < self.initial_height
    }

    /// Build a block for `height` on top of this state.
    pub fn make_block(
        &self,
        height: Height,
        txs: Vec<Vec<u8>>,
        last_commit: Option<Commit>,
        proposer_address: Address,
        time: Timestamp,
    ) -> Block {
        let template = Header {
            chain_id: self.chain_id,
            height,
            time,
            last_block_id: self.last_block_id,
            last_commit_hash: CryptoHash::zero(),
            data_hash: CryptoHash::zero(),
            validators_hash: self.validators.hash(),
            next_validators_hash: self.next_validators.hash(),
            app_hash: self.app_hash,
            proposer_address,
        };
        Block::new(template, txs, last_commit)
    }

    /// Height of the next block.
    pub fn next_height(&self) -> Height {
        if self.is_genesis() {
            self.initial_height
        } else {
            self.last_block_height + 1
        }
    }

    /// The time that a proposer must put in the header of the block at `height`.
    ///
    /// With proposer-based timestamps this is the proposer's clock. Otherwise the first block carries
    /// the genesis time, and every later block the weighted median time of its last commit.
    pub fn block_time(&self, height: Height, last_commit: Option<&Commit>) -> Timestamp {
        if self.consensus_params.pbts_enabled(height) {
            return Timestamp::now();
        }
        match (last_commit, &self.last_validators) {
            (Some(commit), Some(last_validators)) if height != self.initial_height => {
                median_time(commit, last_validators)
            }
            _ => self.last_block_time,
        }
    }

    /// Check that `block` can be the next block of the chain: it is internally consistent, extends the
    /// last block, carries this state's validator set hashes and app hash, includes a valid commit for
    /// the last block, has an acceptable time, and was proposed by a validator.
    pub fn validate_block(&self, block: &Block) -> Result<(), BlockValidationError> {
        block.validate_basic()?;
        let header = &block.header;

        if header.chain_id != self.chain_id {
            return Err(BlockValidationError::WrongChainID);
        }
        let expected_height = self.next_height();
        if header.height != expected_height {
            return Err(BlockValidationError::WrongHeight {
                expected: expected_height,
                got: header.height,
            });
        }
        if header.last_block_id != self.last_block_id {
            return Err(BlockValidationError::WrongLastBlockID);
        }
        if header.app_hash != self.app_hash {
            return Err(BlockValidationError::WrongAppHash);
        }
        if header.validators_hash != self.validators.hash() {
            return Err(BlockValidationError::WrongValidatorsHash);
        }
        if header.next_validators_hash != self.next_validators.hash() {
            return Err(BlockValidationError::WrongNextValidatorsHash);
        }

        match (&block.last_commit, &self.last_validators) {
            (None, _) if header.height == self.initial_height => (),
            (Some(_), _) if header.height == self.initial_height => {
                return Err(BlockValidationError::UnexpectedLastCommit)
            }
            (Some(commit), Some(last_validators)) => last_validators.verify_commit(
                self.chain_id,
                self.last_block_id,
                self.last_block_height,
                commit,
            )?,
            _ => return Err(BlockValidationError::MissingLastCommit),
        }

        if !self.validators.has_address(&header.proposer_address) {
            return Err(BlockValidationError::UnknownProposer {
                address: header.proposer_address,
            });
        }

        if header.height == self.initial_height {
            if !self.consensus_params.pbts_enabled(header.height)
                && header.time != self.last_block_time
            {
                return Err(BlockValidationError::WrongTime);
            }
            if header.time < self.last_block_time {
                return Err(BlockValidationError::TimeBeforeGenesis);
            }
        } else {
            if header.time <= self.last_block_time {
                return Err(BlockValidationError::TimeNotMonotonic);
            }
            if !self.consensus_params.pbts_enabled(header.height) {
                let expected = self.block_time(header.height, block.last_commit.as_ref());
                if header.time != expected {
                    return Err(BlockValidationError::WrongTime);
                }
            }
        }
        Ok(())
    }

    /// The state after committing the block `block_id` with `header`, whose execution produced
    /// `app_hash`. The validator set is carried over unchanged.
    pub fn advance(&self, block_id: BlockID, header: &Header, app_hash: CryptoHash) -> State {
        State {
            chain_id: self.chain_id,
            initial_height: self.initial_height,
            last_block_height: header.height,
            last_block_id: block_id,
            last_block_time: header.time,
            validators: self.next_validators.clone(),
            next_validators: self.next_validators.copy_increment_proposer_priority(1),
            last_validators: Some(self.validators.clone()),
            consensus_params: self.consensus_params,
            app_hash,
        }
    }
}

/// The median of the commit's signature timestamps, each weighted by the voting power of its signer in
/// `validators`.
pub fn median_time(commit: &Commit, validators: &ValidatorSet) -> Timestamp {
    let mut weighted: Vec<(Timestamp, u64)> = Vec::with_capacity(commit.signatures.len());
    let mut total = TotalPower::new(0);
    for sig in &commit.signatures {
        if sig.block_id_flag == BlockIDFlag::Absent {
            continue;
        }
        if let Some((_, validator)) = validators.get_by_address(&sig.validator_address) {
            total += validator.voting_power;
            weighted.push((sig.timestamp, validator.voting_power.int()));
        }
    }
    weighted.sort_by_key(|(time, _)| *time);

    let mut median = total.int() / 2;
    for (time, power) in &weighted {
        if median <= *power as u128 {
            return *time;
        }
        median -= *power as u128;
    }
    Timestamp::default()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockValidationError {
    #[error("invalid block: {0}")]
    Block(#[from] BlockError),
    #[error("block belongs to a different chain")]
    WrongChainID,
    #[error("block height is {got}, expected {expected}")]
    WrongHeight { expected: Height, got: Height },
    #[error("block does not extend the last block")]
    WrongLastBlockID,
    #[error("block app hash does not match the state's")]
    WrongAppHash,
    #[error("block validators hash does not match the state's")]
    WrongValidatorsHash,
    #[error("block next validators hash does not match the state's")]
    WrongNextValidatorsHash,
    #[error("the first block cannot carry a last commit")]
    UnexpectedLastCommit,
    #[error("block is missing its last commit")]
    MissingLastCommit,
    #[error("invalid last commit: {0}")]
    LastCommit(#[from] CommitVerificationError),
    #[error("proposer {address} is not a validator")]
    UnknownProposer { address: Address },
    #[error("block time is not the expected time")]
    WrongTime,
    #[error("block time is before the genesis time")]
    TimeBeforeGenesis,
    #[error("block time is not after the last block's time")]
    TimeNotMonotonic,
}
