/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The set of validators at a height, and the weighted round-robin that picks each round's proposer.
//!
//! # Proposer selection
//!
//! Every validator carries a *proposer priority*. Each time the proposer rotates, every validator's
//! priority grows by its voting power, the validator with the highest priority becomes proposer, and
//! its priority is then reduced by the total voting power. Over time, each validator is proposer a
//! number of times proportional to its share of the voting power. Before each rotation, priorities are
//! re-centered around zero and squashed into a window of `2 * total_power` so that a validator that
//! just joined, or one with a tiny share, can neither starve nor dominate.

use std::{cmp::Ordering, collections::HashSet};

use thiserror::Error;

use super::{
    block::BlockID,
    commit::{BlockIDFlag, Commit},
    crypto_primitives::VerifyingKey,
    data_types::{Address, ChainID, CryptoHash, Height, Power, TotalPower},
    merkle::hash_from_byte_slices,
};

/// Upper bound on the total voting power of a validator set, so that proposer priorities (which are
/// bounded by a small multiple of the total) never overflow an `i64`.
pub const MAX_TOTAL_VOTING_POWER: u64 = i64::MAX as u64 / 8;

/// Priorities are kept within `PRIORITY_WINDOW_SIZE_FACTOR * total_voting_power` of each other.
const PRIORITY_WINDOW_SIZE_FACTOR: i64 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validator {
    pub address: Address,
    pub pub_key: VerifyingKey,
    pub voting_power: Power,
    pub proposer_priority: i64,
}

impl Validator {
    pub fn new(pub_key: VerifyingKey, voting_power: Power) -> Validator {
        Validator {
            address: Address::from_verifying_key(&pub_key),
            pub_key,
            voting_power,
            proposer_priority: 0,
        }
    }

    // Higher priority wins; ties go to the lower address.
    fn compare_proposer_priority(&self, other: &Validator) -> Ordering {
        self.proposer_priority
            .cmp(&other.proposer_priority)
            .then_with(|| other.address.cmp(&self.address))
    }
}

/// An ordered set of validators.
///
/// Validators are kept sorted by address. The position of a validator in this order is its
/// *validator index*, which is what votes and commit signature slots refer to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    proposer: Option<Validator>,
    total_voting_power: u64,
}

impl ValidatorSet {
    /// Create a validator set out of `validators` and select its first proposer.
    pub fn new(validators: Vec<Validator>) -> Result<ValidatorSet, ValidatorSetError> {
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }

        let mut seen = HashSet::new();
        let mut total: u64 = 0;
        for validator in &validators {
            if !seen.insert(validator.address) {
                return Err(ValidatorSetError::DuplicateValidator {
                    address: validator.address,
                });
            }
            if validator.voting_power.int() == 0 {
                return Err(ValidatorSetError::ZeroVotingPower {
                    address: validator.address,
                });
            }
            total = total
                .checked_add(validator.voting_power.int())
                .filter(|total| *total <= MAX_TOTAL_VOTING_POWER)
                .ok_or(ValidatorSetError::TotalVotingPowerTooHigh)?;
        }

        let mut validators = validators;
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        let mut validator_set = ValidatorSet {
            validators,
            proposer: None,
            total_voting_power: total,
        };
        validator_set.increment_proposer_priority(1);
        Ok(validator_set)
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn total_voting_power(&self) -> TotalPower {
        TotalPower::new(self.total_voting_power as u128)
    }

    pub fn validators(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    /// Get the index and the validator with `address`.
    pub fn get_by_address(&self, address: &Address) -> Option<(usize, &Validator)> {
        self.validators
            .binary_search_by(|validator| validator.address.cmp(address))
            .ok()
            .map(|index| (index, &self.validators[index]))
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// The current proposer.
    pub fn get_proposer(&self) -> &Validator {
        match &self.proposer {
            Some(proposer) => proposer,
            // Only reachable through a set that never rotated, which `new` rules out.
            None => self.find_proposer(),
        }
    }

    /// Hash of the ordered list of (verifying key, voting power) pairs.
    pub fn hash(&self) -> CryptoHash {
        let items: Vec<Vec<u8>> = self
            .validators
            .iter()
            .map(|validator| {
                let mut bytes = validator.pub_key.to_bytes().to_vec();
                bytes.extend_from_slice(&validator.voting_power.int().to_le_bytes());
                bytes
            })
            .collect();
        hash_from_byte_slices(&items)
    }

    /// Rotate the proposer `times` times.
    pub fn increment_proposer_priority(&mut self, times: u32) {
        if times == 0 || self.validators.is_empty() {
            return;
        }

        let diff_max = PRIORITY_WINDOW_SIZE_FACTOR * self.total_voting_power as i64;
        self.rescale_priorities(diff_max);
        self.shift_by_avg_proposer_priority();

        let mut proposer = None;
        for _ in 0..times {
            proposer = Some(self.increment_proposer_priority_once());
        }
        self.proposer = proposer;
    }

    /// A copy of this set with the proposer rotated `times` times.
    pub fn copy_increment_proposer_priority(&self, times: u32) -> ValidatorSet {
        let mut copy = self.clone();
        copy.increment_proposer_priority(times);
        copy
    }

    fn increment_proposer_priority_once(&mut self) -> Validator {
        for validator in self.validators.iter_mut() {
            validator.proposer_priority += validator.voting_power.int() as i64;
        }
        let total = self.total_voting_power as i64;
        let mostest = self
            .validators
            .iter_mut()
            .max_by(|a, b| a.compare_proposer_priority(b));
        match mostest {
            Some(mostest) => {
                mostest.proposer_priority -= total;
                mostest.clone()
            }
            None => unreachable!("validator sets are never empty"),
        }
    }

    fn find_proposer(&self) -> &Validator {
        self.validators
            .iter()
            .max_by(|a, b| a.compare_proposer_priority(b))
            .unwrap_or(&self.validators[0])
    }

    fn rescale_priorities(&mut self, diff_max: i64) {
        if diff_max <= 0 {
            return;
        }
        let max = self.validators.iter().map(|v| v.proposer_priority).max().unwrap_or(0);
        let min = self.validators.iter().map(|v| v.proposer_priority).min().unwrap_or(0);
        let diff = max - min;
        if diff > diff_max {
            let ratio = (diff + diff_max - 1) / diff_max;
            for validator in self.validators.iter_mut() {
                validator.proposer_priority /= ratio;
            }
        }
    }

    fn shift_by_avg_proposer_priority(&mut self) {
        let n = self.validators.len() as i128;
        let sum: i128 = self.validators.iter().map(|v| v.proposer_priority as i128).sum();
        let avg = (sum / n) as i64;
        for validator in self.validators.iter_mut() {
            validator.proposer_priority -= avg;
        }
    }

    /// Check that `commit` is a valid commit by this validator set for `block_id` at `height`: the
    /// slots line up with this set, every non-absent signature is valid, and the precommits for
    /// `block_id` carry more than two-thirds of the voting power.
    pub fn verify_commit(
        &self,
        chain_id: ChainID,
        block_id: BlockID,
        height: Height,
        commit: &Commit,
    ) -> Result<(), CommitVerificationError> {
        if commit.size() != self.size() {
            return Err(CommitVerificationError::WrongSetSize {
                expected: self.size(),
                got: commit.size(),
            });
        }
        if commit.height != height {
            return Err(CommitVerificationError::WrongHeight {
                expected: height,
                got: commit.height,
            });
        }
        if commit.block_id != block_id {
            return Err(CommitVerificationError::WrongBlockID);
        }

        let mut tallied = TotalPower::new(0);
        for (index, sig) in commit.signatures.iter().enumerate() {
            if sig.is_absent() {
                continue;
            }
            let validator = &self.validators[index];
            if validator.address != sig.validator_address {
                return Err(CommitVerificationError::WrongValidator { index });
            }
            let vote = commit
                .get_vote(index)
                .ok_or(CommitVerificationError::InvalidSignature { index })?;
            vote.verify(chain_id, &validator.pub_key)
                .map_err(|_| CommitVerificationError::InvalidSignature { index })?;
            if sig.block_id_flag == BlockIDFlag::Commit {
                tallied += validator.voting_power;
            }
        }

        if !tallied.exceeds_two_thirds_of(self.total_voting_power()) {
            return Err(CommitVerificationError::NotEnoughVotingPower {
                got: tallied,
                total: self.total_voting_power(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidatorSetError {
    #[error("validator set is empty")]
    Empty,
    #[error("validator {address} appears more than once")]
    DuplicateValidator { address: Address },
    #[error("validator {address} has zero voting power")]
    ZeroVotingPower { address: Address },
    #[error("total voting power exceeds the maximum")]
    TotalVotingPowerTooHigh,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommitVerificationError {
    #[error("commit has {got} signature slots, validator set has {expected} validators")]
    WrongSetSize { expected: usize, got: usize },
    #[error("commit is for height {got}, expected {expected}")]
    WrongHeight { expected: Height, got: Height },
    #[error("commit is for a different block")]
    WrongBlockID,
    #[error("commit slot {index} is signed by the wrong validator")]
    WrongValidator { index: usize },
    #[error("commit slot {index} has an invalid signature")]
    InvalidSignature { index: usize },
    #[error("commit has {got} of {total} voting power, need more than two-thirds")]
    NotEnoughVotingPower { got: TotalPower, total: TotalPower },
}
