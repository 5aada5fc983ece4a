/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Evidence of validator misbehavior detected by consensus.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    data_types::{Address, Height, Power, Timestamp, TotalPower},
    validator_set::ValidatorSet,
    vote::Vote,
};

/// Two conflicting votes signed by the same validator for the same height, round, and type.
///
/// The votes are stored in a canonical order (`vote_a.block_id < vote_b.block_id`), so that the same
/// pair of votes always produces the same evidence regardless of the order they were received in.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct DuplicateVoteEvidence {
    pub vote_a: Vote,
    pub vote_b: Vote,
    pub total_voting_power: TotalPower,
    pub validator_power: Power,
    pub timestamp: Timestamp,
}

impl DuplicateVoteEvidence {
    /// Create evidence out of two conflicting votes. Returns `None` if the voter is not in
    /// `validator_set`.
    pub fn new(
        vote_1: Vote,
        vote_2: Vote,
        block_time: Timestamp,
        validator_set: &ValidatorSet,
    ) -> Option<DuplicateVoteEvidence> {
        let (_, validator) = validator_set.get_by_address(&vote_1.validator_address)?;
        let (vote_a, vote_b) = if vote_1.block_id <= vote_2.block_id {
            (vote_1, vote_2)
        } else {
            (vote_2, vote_1)
        };
        Some(DuplicateVoteEvidence {
            vote_a,
            vote_b,
            total_voting_power: validator_set.total_voting_power(),
            validator_power: validator.voting_power,
            timestamp: block_time,
        })
    }

    pub fn height(&self) -> Height {
        self.vote_a.height
    }

    /// Address of the equivocating validator.
    pub fn address(&self) -> Address {
        self.vote_a.validator_address
    }

    /// Check that the two votes actually conflict.
    pub fn validate_basic(&self) -> bool {
        self.vote_a.height == self.vote_b.height
            && self.vote_a.round == self.vote_b.round
            && self.vote_a.vote_type == self.vote_b.vote_type
            && self.vote_a.validator_address == self.vote_b.validator_address
            && self.vote_a.block_id < self.vote_b.block_id
    }
}
