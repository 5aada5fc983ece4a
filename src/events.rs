/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events that the consensus state machine emits, for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Events are sent from the
//! consensus thread to the event bus thread, which runs the registered
//! [handlers](crate::event_bus::EventHandlers) on them.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::{
    consensus::round_state::RoundStepType,
    types::{
        block::{Block, BlockID},
        data_types::{Address, Height, PeerID, Round},
        evidence::DuplicateVoteEvidence,
        proposal::Proposal,
        vote::Vote,
    },
};

pub enum Event {
    // Events that mark progress through a height.
    NewRound(NewRoundEvent),
    NewRoundStep(NewRoundStepEvent),
    CompleteProposal(CompleteProposalEvent),
    Polka(PolkaEvent),
    Lock(LockEvent),
    Relock(RelockEvent),
    ValidBlock(ValidBlockEvent),
    TimeoutPropose(TimeoutProposeEvent),
    TimeoutWait(TimeoutWaitEvent),
    NewBlock(NewBlockEvent),
    // Events that involve votes.
    Vote(VoteEvent),
    Evidence(EvidenceEvent),
    // Events that involve receiving a message from a peer.
    ReceiveProposal(ReceiveProposalEvent),
    ReceiveVote(ReceiveVoteEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus only stops after consensus does.
            let _ = event_publisher.send(event);
        }
    }
}

/// A new round was entered.
pub struct NewRoundEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub proposer: Address,
}

/// The state machine moved to a new step.
pub struct NewRoundStepEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
}

/// Every part of the proposal block was received.
pub struct CompleteProposalEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub block_id: BlockID,
}

/// A two-thirds prevote majority was seen on entering Precommit. `block_id` is nil for a nil polka.
pub struct PolkaEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub block_id: BlockID,
}

pub struct LockEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub block_id: BlockID,
}

/// The locked block received a polka again, in a later round.
pub struct RelockEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub block_id: BlockID,
}

/// The valid block was updated, or a commit was seen for a block this replica does not have.
pub struct ValidBlockEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub block_id: BlockID,
}

pub struct TimeoutProposeEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
}

/// The timeout of a PrevoteWait or PrecommitWait step fired.
pub struct TimeoutWaitEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
}

/// A block was committed and applied.
pub struct NewBlockEvent {
    pub timestamp: SystemTime,
    pub block_id: BlockID,
    pub block: Block,
}

/// A vote was added to the vote sets of the current height, or to the last commit.
pub struct VoteEvent {
    pub timestamp: SystemTime,
    pub vote: Vote,
}

/// Two conflicting votes from the same validator were seen.
pub struct EvidenceEvent {
    pub timestamp: SystemTime,
    pub evidence: DuplicateVoteEvidence,
}

pub struct ReceiveProposalEvent {
    pub timestamp: SystemTime,
    /// `None` if this replica made the proposal.
    pub origin: Option<PeerID>,
    pub proposal: Proposal,
}

pub struct ReceiveVoteEvent {
    pub timestamp: SystemTime,
    pub origin: PeerID,
    pub vote: Vote,
}
