/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the replica's
//! [config](crate::replica::Configuration).
//!
//! tendermint_rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [ReceiveProposal](crate::events::ReceiveProposalEvent) is printed:
//!
//! ```text
//! ReceiveProposal, 1701329264, Id5u7f6, fNGCJyk, 12, 0
//! ```
//!
//! In the snippet:
//! - The third value is the first seven characters of the Base64 encoding of the ID of the peer that
//!   sent the proposal, or `self` if this replica made it.
//! - The fourth value is the first seven characters of the Base64 encoding of the hash of the proposed
//!   block.
//! - The fifth and sixth values are the height and round of the proposal.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const NEW_ROUND: &str = "NewRound";
pub const NEW_ROUND_STEP: &str = "NewRoundStep";
pub const COMPLETE_PROPOSAL: &str = "CompleteProposal";
pub const POLKA: &str = "Polka";
pub const LOCK: &str = "Lock";
pub const RELOCK: &str = "Relock";
pub const VALID_BLOCK: &str = "ValidBlock";
pub const TIMEOUT_PROPOSE: &str = "TimeoutPropose";
pub const TIMEOUT_WAIT: &str = "TimeoutWait";
pub const NEW_BLOCK: &str = "NewBlock";

pub const VOTE: &str = "Vote";
pub const EVIDENCE: &str = "Evidence";

pub const RECEIVE_PROPOSAL: &str = "ReceiveProposal";
pub const RECEIVE_VOTE: &str = "ReceiveVote";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for NewRoundEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_round_event: &NewRoundEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                NEW_ROUND,
                secs_since_unix_epoch(new_round_event.timestamp),
                new_round_event.height,
                new_round_event.round,
                first_seven_base64_chars(&new_round_event.proposer.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewRoundStepEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_round_step_event: &NewRoundStepEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                NEW_ROUND_STEP,
                secs_since_unix_epoch(new_round_step_event.timestamp),
                new_round_step_event.height,
                new_round_step_event.round,
                new_round_step_event.step.name()
            )
        };
        Box::new(logger)
    }
}

impl Logger for CompleteProposalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |complete_proposal_event: &CompleteProposalEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMPLETE_PROPOSAL,
                secs_since_unix_epoch(complete_proposal_event.timestamp),
                complete_proposal_event.height,
                complete_proposal_event.round,
                first_seven_base64_chars(&complete_proposal_event.block_id.hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for PolkaEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |polka_event: &PolkaEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                POLKA,
                secs_since_unix_epoch(polka_event.timestamp),
                polka_event.height,
                polka_event.round,
                block_id_info(&polka_event.block_id.hash.bytes(), polka_event.block_id.is_nil())
            )
        };
        Box::new(logger)
    }
}

impl Logger for LockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |lock_event: &LockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                LOCK,
                secs_since_unix_epoch(lock_event.timestamp),
                lock_event.height,
                lock_event.round,
                first_seven_base64_chars(&lock_event.block_id.hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for RelockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |relock_event: &RelockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RELOCK,
                secs_since_unix_epoch(relock_event.timestamp),
                relock_event.height,
                relock_event.round,
                first_seven_base64_chars(&relock_event.block_id.hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ValidBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |valid_block_event: &ValidBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                VALID_BLOCK,
                secs_since_unix_epoch(valid_block_event.timestamp),
                valid_block_event.height,
                valid_block_event.round,
                first_seven_base64_chars(&valid_block_event.block_id.hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for TimeoutProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |timeout_propose_event: &TimeoutProposeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                TIMEOUT_PROPOSE,
                secs_since_unix_epoch(timeout_propose_event.timestamp),
                timeout_propose_event.height,
                timeout_propose_event.round
            )
        };
        Box::new(logger)
    }
}

impl Logger for TimeoutWaitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |timeout_wait_event: &TimeoutWaitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                TIMEOUT_WAIT,
                secs_since_unix_epoch(timeout_wait_event.timestamp),
                timeout_wait_event.height,
                timeout_wait_event.round,
                timeout_wait_event.step.name()
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_block_event: &NewBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                NEW_BLOCK,
                secs_since_unix_epoch(new_block_event.timestamp),
                first_seven_base64_chars(&new_block_event.block_id.hash.bytes()),
                new_block_event.block.height(),
                new_block_event.block.data.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for VoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |vote_event: &VoteEvent| {
            let vote = &vote_event.vote;
            log::info!(
                "{}, {}, {}, {}, {}, {:?}, {}",
                VOTE,
                secs_since_unix_epoch(vote_event.timestamp),
                first_seven_base64_chars(&vote.validator_address.bytes()),
                vote.height,
                vote.round,
                vote.vote_type,
                block_id_info(&vote.block_id.hash.bytes(), vote.block_id.is_nil())
            )
        };
        Box::new(logger)
    }
}

impl Logger for EvidenceEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |evidence_event: &EvidenceEvent| {
            let vote_a = &evidence_event.evidence.vote_a;
            log::warn!(
                "{}, {}, {}, {}, {}, {:?}",
                EVIDENCE,
                secs_since_unix_epoch(evidence_event.timestamp),
                first_seven_base64_chars(&vote_a.validator_address.bytes()),
                vote_a.height,
                vote_a.round,
                vote_a.vote_type
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveProposalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_proposal_event: &ReceiveProposalEvent| {
            let proposal = &receive_proposal_event.proposal;
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PROPOSAL,
                secs_since_unix_epoch(receive_proposal_event.timestamp),
                match &receive_proposal_event.origin {
                    Some(origin) => first_seven_base64_chars(&origin.bytes()),
                    None => String::from("self"),
                },
                first_seven_base64_chars(&proposal.block_id.hash.bytes()),
                proposal.height,
                proposal.round
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_vote_event: &ReceiveVoteEvent| {
            let vote = &receive_vote_event.vote;
            log::info!(
                "{}, {}, {}, {}, {}, {}, {:?}",
                RECEIVE_VOTE,
                secs_since_unix_epoch(receive_vote_event.timestamp),
                first_seven_base64_chars(&receive_vote_event.origin.bytes()),
                first_seven_base64_chars(&vote.validator_address.bytes()),
                vote.height,
                vote.round,
                vote.vote_type
            )
        };
        Box::new(logger)
    }
}

fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn block_id_info(hash: &[u8], is_nil: bool) -> String {
    if is_nil {
        String::from("nil")
    } else {
        first_seven_base64_chars(hash)
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
