/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The signed message a round's proposer uses to propose a block.

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use super::{
    block::{BlockError, BlockID},
    crypto_primitives::{verify_signature, VerifyingKey},
    data_types::{ChainID, Height, Round, SignatureBytes, Timestamp},
    params::SynchronyParams,
};

/// A proposal for the block identified by `block_id` at `height` and `round`.
///
/// If `pol_round` is not [`Round::NIL`], the proposer is re-proposing a block that it saw receive a
/// two-thirds prevote majority ("proof of lock") in round `pol_round`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Proposal {
    pub height: Height,
    pub round: Round,
    pub pol_round: Round,
    pub block_id: BlockID,
    pub timestamp: Timestamp,
    pub signature: SignatureBytes,
}

#[derive(BorshSerialize)]
struct CanonicalProposal {
    height: Height,
    round: Round,
    pol_round: Round,
    block_id: BlockID,
    timestamp: Timestamp,
    chain_id: ChainID,
}

impl Proposal {
    /// Create an unsigned proposal.
    pub fn new(
        height: Height,
        round: Round,
        pol_round: Round,
        block_id: BlockID,
        timestamp: Timestamp,
    ) -> Proposal {
        Proposal {
            height,
            round,
            pol_round,
            block_id,
            timestamp,
            signature: SignatureBytes::zero(),
        }
    }

    pub fn sign_bytes(&self, chain_id: ChainID) -> Vec<u8> {
        CanonicalProposal {
            height: self.height,
            round: self.round,
            pol_round: self.pol_round,
            block_id: self.block_id,
            timestamp: self.timestamp,
            chain_id,
        }
        .try_to_vec()
        .unwrap_or_default()
    }

    pub fn verify(&self, chain_id: ChainID, verifying_key: &VerifyingKey) -> bool {
        verify_signature(verifying_key, &self.sign_bytes(chain_id), &self.signature)
    }

    pub fn validate_basic(&self) -> Result<(), ProposalError> {
        if self.height.int() <= 0 {
            return Err(ProposalError::NonPositiveHeight);
        }
        if self.round.int() < 0 {
            return Err(ProposalError::NegativeRound);
        }
        if self.pol_round.int() < -1 {
            return Err(ProposalError::InvalidPOLRound);
        }
        if self.pol_round >= self.round {
            return Err(ProposalError::POLRoundNotBeforeRound);
        }
        self.block_id.validate_basic()?;
        if !self.block_id.is_complete() {
            return Err(ProposalError::IncompleteBlockID);
        }
        if self.signature.is_zero() {
            return Err(ProposalError::MissingSignature);
        }
        Ok(())
    }

    /// Whether a proposal received at `receive_time` was received in time, given the synchrony bounds
    /// in effect for the proposal's round:
    ///
    /// `timestamp - precision <= receive_time <= timestamp + message_delay(round) + precision`.
    pub fn is_timely(&self, receive_time: Timestamp, synchrony: SynchronyParams) -> bool {
        let synchrony = synchrony.in_round(self.round);
        let lower_bound = self.timestamp.saturating_sub(synchrony.precision());
        let upper_bound = self.timestamp + synchrony.message_delay() + synchrony.precision();
        receive_time >= lower_bound && receive_time <= upper_bound
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProposalError {
    #[error("proposal height must be positive")]
    NonPositiveHeight,
    #[error("proposal round must not be negative")]
    NegativeRound,
    #[error("proposal POL round must be -1 or more")]
    InvalidPOLRound,
    #[error("proposal POL round must be less than the proposal round")]
    POLRoundNotBeforeRound,
    #[error("proposal has a malformed block ID: {0}")]
    MalformedBlockID(#[from] BlockError),
    #[error("proposal block ID is incomplete")]
    IncompleteBlockID,
    #[error("proposal is not signed")]
    MissingSignature,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::types::{data_types::CryptoHash, part_set::PartSetHeader};

    fn proposal_at(timestamp: Timestamp, round: i32) -> Proposal {
        Proposal::new(
            Height::new(2),
            Round::new(round),
            Round::NIL,
            BlockID::new(
                CryptoHash::new([1; 32]),
                PartSetHeader {
                    total: 1,
                    hash: CryptoHash::new([2; 32]),
                },
            ),
            timestamp,
        )
    }

    #[test]
    fn timeliness_window_bounds() {
        let base = Timestamp::from_nanos(1_000_000_000);
        let synchrony = SynchronyParams::new(Duration::from_nanos(2), Duration::from_nanos(1));
        let proposal = proposal_at(base, 0);

        assert!(proposal.is_timely(Timestamp::from_nanos(1_000_000_001), synchrony));
        assert!(proposal.is_timely(Timestamp::from_nanos(999_999_998), synchrony));
        assert!(proposal.is_timely(Timestamp::from_nanos(1_000_000_003), synchrony));
        assert!(!proposal.is_timely(Timestamp::from_nanos(1_000_000_004), synchrony));
        assert!(!proposal.is_timely(Timestamp::from_nanos(999_999_997), synchrony));
    }

    #[test]
    fn message_delay_grows_with_round() {
        let base = Timestamp::from_nanos(1_000_000_000);
        let synchrony = SynchronyParams::new(Duration::ZERO, Duration::from_millis(100));
        let late = Timestamp::from_nanos(1_000_000_000 + 115_000_000);

        assert!(!proposal_at(base, 0).is_timely(late, synchrony));
        // 100ms * 1.1^2 = 121ms.
        assert!(proposal_at(base, 2).is_timely(late, synchrony));
    }

    #[test]
    fn pol_round_must_precede_round() {
        let mut proposal = proposal_at(Timestamp::from_nanos(1), 1);
        proposal.signature = SignatureBytes::new([3; 64]);
        assert_eq!(proposal.validate_basic(), Ok(()));

        proposal.pol_round = Round::new(1);
        assert_eq!(
            proposal.validate_basic(),
            Err(ProposalError::POLRoundNotBeforeRound)
        );

        proposal.pol_round = Round::new(-2);
        assert_eq!(proposal.validate_basic(), Err(ProposalError::InvalidPOLRound));
    }
}
