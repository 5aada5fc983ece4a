/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The state of the current height and round, as seen by the consensus state machine.
//!
//! Only the receive routine mutates the [`RoundState`]. Every other thread (the gossip threads of the
//! reactor, mostly) reads a clone of it that is published after every input the routine processes.

use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    networking::messages::NewRoundStepMessage,
    types::{
        block::{Block, BlockID},
        data_types::{Height, Round, Timestamp},
        part_set::{PartSet, PartSetHeader},
        proposal::Proposal,
        validator_set::ValidatorSet,
    },
    votes::{height_vote_set::HeightVoteSet, vote_set::VoteSet},
};

/// The steps of a round, in the order the state machine goes through them.
///
/// `(height, round, step)` triples are ordered lexicographically, and the state machine only ever moves
/// forward in that order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
pub enum RoundStepType {
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    PrevoteWait,
    Precommit,
    PrecommitWait,
    Commit,
}

impl RoundStepType {
    /// Wire number of the step, starting from 1 for `NewHeight`.
    pub const fn number(&self) -> u8 {
        match self {
            RoundStepType::NewHeight => 1,
            RoundStepType::NewRound => 2,
            RoundStepType::Propose => 3,
            RoundStepType::Prevote => 4,
            RoundStepType::PrevoteWait => 5,
            RoundStepType::Precommit => 6,
            RoundStepType::PrecommitWait => 7,
            RoundStepType::Commit => 8,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            RoundStepType::NewHeight => "NewHeight",
            RoundStepType::NewRound => "NewRound",
            RoundStepType::Propose => "Propose",
            RoundStepType::Prevote => "Prevote",
            RoundStepType::PrevoteWait => "PrevoteWait",
            RoundStepType::Precommit => "Precommit",
            RoundStepType::PrecommitWait => "PrecommitWait",
            RoundStepType::Commit => "Commit",
        }
    }
}

/// Height, round, and step, as written to the WAL and published to the reactor on every step change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RoundStateDigest {
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
}

#[derive(Clone, Debug)]
pub struct RoundState {
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
    /// When the current height's round 0 starts (or started).
    pub start_time: Timestamp,
    /// When the previous height was committed.
    pub commit_time: Timestamp,

    pub validators: ValidatorSet,
    pub proposal: Option<Proposal>,
    pub proposal_receive_time: Option<Timestamp>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,

    /// `Round::NIL` while unlocked.
    pub locked_round: Round,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,

    /// The last round in which a polka for a block was seen, and that block.
    pub valid_round: Round,
    pub valid_block: Option<Block>,
    pub valid_block_parts: Option<PartSet>,

    pub votes: HeightVoteSet,
    pub commit_round: Round,
    /// Precommits for the previous height.
    pub last_commit: Option<VoteSet>,
    pub last_validators: Option<ValidatorSet>,
    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    pub fn digest(&self) -> RoundStateDigest {
        RoundStateDigest {
            height: self.height,
            round: self.round,
            step: self.step,
        }
    }

    /// Whether `(height, round, step)` is strictly behind the current position of the state machine.
    pub fn is_behind(&self, height: Height, round: Round, step: RoundStepType) -> bool {
        (height, round, step) < (self.height, self.round, self.step)
    }

    pub fn proposal_block_id(&self) -> Option<BlockID> {
        self.proposal.as_ref().map(|proposal| proposal.block_id)
    }

    pub fn proposal_block_parts_header(&self) -> Option<PartSetHeader> {
        self.proposal_block_parts.as_ref().map(|parts| parts.header())
    }

    /// Whether the full proposal block has been received.
    pub fn is_proposal_complete(&self) -> bool {
        let (proposal, _) = match (&self.proposal, &self.proposal_block) {
            (Some(proposal), Some(block)) => (proposal, block),
            _ => return false,
        };
        if proposal.pol_round.is_nil() {
            return true;
        }
        // A re-proposal is only complete once we have also seen the polka that justifies it.
        self.votes
            .prevotes(proposal.pol_round)
            .map(|prevotes| prevotes.has_two_thirds_majority())
            .unwrap_or(false)
    }

    /// The message that tells peers where this replica is.
    pub fn new_round_step_message(&self) -> NewRoundStepMessage {
        let now = Timestamp::now();
        let seconds_since_start_time = match now.checked_duration_since(self.start_time) {
            Some(elapsed) => elapsed.as_secs() as i64,
            None => -(self
                .start_time
                .checked_duration_since(now)
                .unwrap_or(Duration::ZERO)
                .as_secs() as i64),
        };
        NewRoundStepMessage {
            height: self.height,
            round: self.round,
            step: self.step,
            seconds_since_start_time,
            last_commit_round: self
                .last_commit
                .as_ref()
                .map(|last_commit| last_commit.round())
                .unwrap_or(Round::NIL),
        }
    }

    pub fn is_locked_on(&self, block: &Block) -> bool {
        self.locked_block
            .as_ref()
            .map(|locked| locked.hash() == block.hash())
            .unwrap_or(false)
    }

    /// Whether `block` is the latest block seen with a polka in this height.
    pub fn is_valid_block(&self, block: &Block) -> bool {
        !self.valid_round.is_nil()
            && self
                .valid_block
                .as_ref()
                .map(|valid| valid.hash() == block.hash())
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_numbered_from_one() {
        assert_eq!(RoundStepType::NewHeight.number(), 1);
        assert_eq!(RoundStepType::Commit.number(), 8);
        assert!(RoundStepType::PrevoteWait < RoundStepType::Precommit);
    }

    #[test]
    fn height_round_step_order_is_lexicographic() {
        let earlier = (Height::new(1), Round::new(3), RoundStepType::Commit);
        let later = (Height::new(2), Round::new(0), RoundStepType::NewHeight);
        assert!(earlier < later);
        let earlier = (Height::new(2), Round::new(0), RoundStepType::Commit);
        let later = (Height::new(2), Round::new(1), RoundStepType::NewRound);
        assert!(earlier < later);
    }
}
