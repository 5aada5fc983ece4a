/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use thiserror::Error;

use crate::{
    app::BlockExecutorError,
    privval::PrivValidatorError,
    types::{
        block::BlockError,
        data_types::{Height, Round},
        part_set::PartSetError,
    },
    votes::{height_vote_set::HeightVoteSetError, vote_set::VoteSetError},
    wal::WalError,
};

/// Errors that stop the consensus state machine.
///
/// Continuing after any of these could make this replica sign something that conflicts with what it
/// signed before, so the receive routine flushes the WAL and exits instead.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error("consensus invariant violated: {0}")]
    InvariantViolation(String),
    #[error("found a signature by this validator in the commit of block {height}")]
    SignatureFoundInPastBlocks { height: Height },
    #[error("block execution failed: {0}")]
    BlockExecutor(#[from] BlockExecutorError),
    #[error("could not get the private validator's public key: {0}")]
    PrivValidator(#[from] PrivValidatorError),
}

impl ConsensusError {
    pub(crate) fn invariant(message: impl Into<String>) -> ConsensusError {
        ConsensusError::InvariantViolation(message.into())
    }
}

/// Errors from processing a single message. Apart from [`InputError::Fatal`], these only mean that
/// the message was dropped.
#[derive(Debug, Error)]
pub(crate) enum InputError {
    #[error("proposal POL round {pol_round} is invalid for round {round}")]
    InvalidProposalPOLRound { pol_round: Round, round: Round },
    #[error("proposal is not signed by the proposer")]
    InvalidProposalSignature,
    #[error("proposal block has {total} parts, more than the maximum {max}")]
    ProposalTooManyParts { total: u32, max: u32 },
    #[error("proposal block is {size} bytes, more than the maximum {max}")]
    ProposalBlockTooBig { size: usize, max: usize },
    #[error("invalid block part: {0}")]
    Part(#[from] PartSetError),
    #[error("proposal block parts do not decode into a block: {0}")]
    Block(#[from] BlockError),
    #[error("could not add vote: {0}")]
    AddVote(#[from] HeightVoteSetError),
    #[error("could not add vote to the last commit: {0}")]
    AddLastCommitVote(#[from] VoteSetError),
    #[error("vote from unknown validator index {index}")]
    UnknownValidatorIndex { index: i32 },
    #[error("invalid vote extension: {0}")]
    VoteExtension(String),
    #[error("vote carries an extension although extensions are disabled at height {height}")]
    UnexpectedVoteExtension { height: Height },
    #[error("invalid majority claim: {0}")]
    PeerMaj23(HeightVoteSetError),
    #[error("the private validator's public key is not set")]
    PubKeyNotSet,
    #[error("this replica is not in the validator set")]
    NotAValidator,
    #[error("could not extend vote: {0}")]
    ExtendVote(BlockExecutorError),
    #[error("could not sign: {0}")]
    Sign(#[from] PrivValidatorError),
    #[error("could not flush the WAL before signing: {0}")]
    WalFlush(#[from] WalError),
    #[error(transparent)]
    Fatal(#[from] ConsensusError),
}
