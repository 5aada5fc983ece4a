/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumeration of every message that peers exchange in consensus.
//!
//! Messages are serialized with Borsh. Each message travels on one of four logical
//! [channels](Channel), which a networking provider may use to prioritize traffic.
//!
//! Every message received from the network must pass [`Message::validate_basic`] before it is acted on.
//! A peer that sends a message that does not pass is disconnected.

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use crate::{
    consensus::round_state::RoundStepType,
    types::{
        bit_array::BitArray,
        block::{BlockError, BlockID},
        data_types::{Height, Round},
        part_set::{Part, PartSetError, PartSetHeader, BLOCK_PART_SIZE_BYTES},
        proposal::{Proposal, ProposalError},
        vote::{Vote, VoteError, VoteType},
    },
};

/// Maximum size of an encoded message, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum number of validators, and so the maximum size of a bit array of votes.
pub const MAX_VOTES_COUNT: usize = 10000;

/// Maximum size of a block, in bytes.
pub const MAX_BLOCK_SIZE_BYTES: usize = 100 * 1024 * 1024;

/// Maximum number of parts a block can be split into.
pub const MAX_BLOCK_PARTS_COUNT: usize = MAX_BLOCK_SIZE_BYTES / BLOCK_PART_SIZE_BYTES + 1;

/// Logical channels that messages are sent on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    State = 0x20,
    Data = 0x21,
    Vote = 0x22,
    VoteSetBits = 0x23,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Message {
    NewRoundStep(NewRoundStepMessage),
    NewValidBlock(NewValidBlockMessage),
    Proposal(ProposalMessage),
    ProposalPOL(ProposalPOLMessage),
    BlockPart(BlockPartMessage),
    Vote(VoteMessage),
    HasVote(HasVoteMessage),
    HasProposalBlockPart(HasProposalBlockPartMessage),
    VoteSetMaj23(VoteSetMaj23Message),
    VoteSetBits(VoteSetBitsMessage),
}

impl Message {
    /// The channel that this message should be sent on.
    pub fn channel(&self) -> Channel {
        match self {
            Message::NewRoundStep(_)
            | Message::NewValidBlock(_)
            | Message::HasVote(_)
            | Message::HasProposalBlockPart(_)
            | Message::VoteSetMaj23(_) => Channel::State,
            Message::Proposal(_) | Message::ProposalPOL(_) | Message::BlockPart(_) => Channel::Data,
            Message::Vote(_) => Channel::Vote,
            Message::VoteSetBits(_) => Channel::VoteSetBits,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.try_to_vec().unwrap_or_default()
    }

    /// Decode a message, rejecting inputs larger than [`MAX_MESSAGE_SIZE`].
    pub fn decode(bytes: &[u8]) -> Result<Message, MessageDecodeError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(MessageDecodeError::TooBig { size: bytes.len() });
        }
        Message::try_from_slice(bytes).map_err(|_| MessageDecodeError::Malformed)
    }

    /// Stateless checks of the message's fields.
    pub fn validate_basic(&self) -> Result<(), MessageValidationError> {
        match self {
            Message::NewRoundStep(msg) => msg.validate_basic(),
            Message::NewValidBlock(msg) => msg.validate_basic(),
            Message::Proposal(msg) => Ok(msg.proposal.validate_basic()?),
            Message::ProposalPOL(msg) => msg.validate_basic(),
            Message::BlockPart(msg) => msg.validate_basic(),
            Message::Vote(msg) => Ok(msg.vote.validate_basic()?),
            Message::HasVote(msg) => msg.validate_basic(),
            Message::HasProposalBlockPart(msg) => msg.validate_basic(),
            Message::VoteSetMaj23(msg) => msg.validate_basic(),
            Message::VoteSetBits(msg) => msg.validate_basic(),
        }
    }
}

/// Sent on every step change of the sender's state machine.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NewRoundStepMessage {
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
    /// May be negative if the sender's round 0 is scheduled to start in the future.
    pub seconds_since_start_time: i64,
    pub last_commit_round: Round,
}

impl NewRoundStepMessage {
    fn validate_basic(&self) -> Result<(), MessageValidationError> {
        non_negative_height(self.height)?;
        non_negative_round(self.round)?;
        if self.last_commit_round.int() < -1 {
            return Err(MessageValidationError::InvalidField {
                field: "last_commit_round",
                reason: "cannot be less than -1",
            });
        }
        Ok(())
    }

    /// Check the message against the chain's initial height, which `validate_basic` does not know.
    pub fn validate_height(&self, initial_height: Height) -> Result<(), MessageValidationError> {
        if self.height < initial_height {
            return Err(MessageValidationError::InvalidField {
                field: "height",
                reason: "lower than the initial height",
            });
        }
        if self.height == initial_height && !self.last_commit_round.is_nil() {
            return Err(MessageValidationError::InvalidField {
                field: "last_commit_round",
                reason: "must be -1 at the initial height",
            });
        }
        if self.height > initial_height && self.last_commit_round.is_nil() {
            return Err(MessageValidationError::InvalidField {
                field: "last_commit_round",
                reason: "can only be -1 at the initial height",
            });
        }
        Ok(())
    }
}

/// Sent when the sender sees a polka for a block, or commits one, so that peers know which parts of it
/// the sender has.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NewValidBlockMessage {
    pub height: Height,
    pub round: Round,
    pub block_part_set_header: PartSetHeader,
    pub block_parts: BitArray,
    pub is_commit: bool,
}

impl NewValidBlockMessage {
    fn validate_basic(&self) -> Result<(), MessageValidationError> {
        non_negative_height(self.height)?;
        non_negative_round(self.round)?;
        if self.block_part_set_header.total == 0 || self.block_part_set_header.hash.is_zero() {
            return Err(MessageValidationError::InvalidField {
                field: "block_part_set_header",
                reason: "must not be empty",
            });
        }
        if self.block_parts.size() == 0 {
            return Err(MessageValidationError::InvalidField {
                field: "block_parts",
                reason: "must not be empty",
            });
        }
        if self.block_parts.size() != self.block_part_set_header.total as usize {
            return Err(MessageValidationError::InvalidField {
                field: "block_parts",
                reason: "size differs from the part set header's total",
            });
        }
        if self.block_parts.size() > MAX_BLOCK_PARTS_COUNT {
            return Err(MessageValidationError::InvalidField {
                field: "block_parts",
                reason: "too big",
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ProposalMessage {
    pub proposal: Proposal,
}

/// Sent along with a re-proposal: the prevotes of the proposal's POL round that the sender has.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ProposalPOLMessage {
    pub height: Height,
    pub proposal_pol_round: Round,
    pub proposal_pol: BitArray,
}

impl ProposalPOLMessage {
    fn validate_basic(&self) -> Result<(), MessageValidationError> {
        non_negative_height(self.height)?;
        if self.proposal_pol_round.int() < 0 {
            return Err(MessageValidationError::NegativeField {
                field: "proposal_pol_round",
            });
        }
        bit_array_size(self.proposal_pol.size(), "proposal_pol", false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockPartMessage {
    pub height: Height,
    pub round: Round,
    pub part: Part,
}

impl BlockPartMessage {
    fn validate_basic(&self) -> Result<(), MessageValidationError> {
        non_negative_height(self.height)?;
        non_negative_round(self.round)?;
        Ok(self.part.validate_basic()?)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VoteMessage {
    pub vote: Vote,
}

/// Sent when the sender adds a vote, so that peers stop gossiping it to the sender.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct HasVoteMessage {
    pub height: Height,
    pub round: Round,
    pub vote_type: VoteType,
    pub index: i32,
}

impl HasVoteMessage {
    fn validate_basic(&self) -> Result<(), MessageValidationError> {
        non_negative_height(self.height)?;
        non_negative_round(self.round)?;
        if self.index < 0 {
            return Err(MessageValidationError::NegativeField { field: "index" });
        }
        Ok(())
    }
}

/// Sent when the sender adds a part of the current proposal block.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct HasProposalBlockPartMessage {
    pub height: Height,
    pub round: Round,
    pub index: i32,
}

impl HasProposalBlockPartMessage {
    fn validate_basic(&self) -> Result<(), MessageValidationError> {
        if self.height.int() < 1 {
            return Err(MessageValidationError::InvalidField {
                field: "height",
                reason: "must be at least 1",
            });
        }
        non_negative_round(self.round)?;
        if self.index < 0 {
            return Err(MessageValidationError::NegativeField { field: "index" });
        }
        Ok(())
    }
}

/// Claims that the sender has seen a two-thirds majority for `block_id`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VoteSetMaj23Message {
    pub height: Height,
    pub round: Round,
    pub vote_type: VoteType,
    pub block_id: BlockID,
}

impl VoteSetMaj23Message {
    fn validate_basic(&self) -> Result<(), MessageValidationError> {
        non_negative_height(self.height)?;
        non_negative_round(self.round)?;
        Ok(self.block_id.validate_basic()?)
    }
}

/// Answer to a [`VoteSetMaj23Message`]: the validators whose votes for `block_id` the sender has.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VoteSetBitsMessage {
    pub height: Height,
    pub round: Round,
    pub vote_type: VoteType,
    pub block_id: BlockID,
    pub votes: BitArray,
}

impl VoteSetBitsMessage {
    fn validate_basic(&self) -> Result<(), MessageValidationError> {
        non_negative_height(self.height)?;
        self.block_id.validate_basic()?;
        // The sender may have no votes at all.
        bit_array_size(self.votes.size(), "votes", true)
    }
}

fn non_negative_height(height: Height) -> Result<(), MessageValidationError> {
    if height.int() < 0 {
        return Err(MessageValidationError::NegativeField { field: "height" });
    }
    Ok(())
}

fn non_negative_round(round: Round) -> Result<(), MessageValidationError> {
    if round.int() < 0 {
        return Err(MessageValidationError::NegativeField { field: "round" });
    }
    Ok(())
}

fn bit_array_size(
    size: usize,
    field: &'static str,
    may_be_empty: bool,
) -> Result<(), MessageValidationError> {
    if size == 0 && !may_be_empty {
        return Err(MessageValidationError::InvalidField {
            field,
            reason: "must not be empty",
        });
    }
    if size > MAX_VOTES_COUNT {
        return Err(MessageValidationError::InvalidField {
            field,
            reason: "too big",
        });
    }
    Ok(())
}

impl From<ProposalMessage> for Message {
    fn from(value: ProposalMessage) -> Self {
        Message::Proposal(value)
    }
}

impl From<BlockPartMessage> for Message {
    fn from(value: BlockPartMessage) -> Self {
        Message::BlockPart(value)
    }
}

impl From<VoteMessage> for Message {
    fn from(value: VoteMessage) -> Self {
        Message::Vote(value)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageValidationError {
    #[error("{field} must not be negative")]
    NegativeField { field: &'static str },
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("invalid block ID: {0}")]
    BlockID(#[from] BlockError),
    #[error("invalid proposal: {0}")]
    Proposal(#[from] ProposalError),
    #[error("invalid block part: {0}")]
    Part(#[from] PartSetError),
    #[error("invalid vote: {0}")]
    Vote(#[from] VoteError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageDecodeError {
    #[error("message of {size} bytes exceeds the maximum message size")]
    TooBig { size: usize },
    #[error("message bytes are malformed")]
    Malformed,
}
