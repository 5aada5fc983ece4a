/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which runs the registered handlers on every [event](crate::events) that
//! consensus emits.
//!
//! Handlers come from two sources: the user's `on_*` closures registered on the
//! [`ReplicaSpec`](crate::replica::ReplicaSpec), and, if
//! [`Configuration::log_events`](crate::replica::Configuration::log_events) is set, the default
//! [loggers](crate::logging).

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Handlers for every kind of event, in the order they are run.
#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) new_round_handlers: Vec<HandlerPtr<NewRoundEvent>>,
    pub(crate) new_round_step_handlers: Vec<HandlerPtr<NewRoundStepEvent>>,
    pub(crate) complete_proposal_handlers: Vec<HandlerPtr<CompleteProposalEvent>>,
    pub(crate) polka_handlers: Vec<HandlerPtr<PolkaEvent>>,
    pub(crate) lock_handlers: Vec<HandlerPtr<LockEvent>>,
    pub(crate) relock_handlers: Vec<HandlerPtr<RelockEvent>>,
    pub(crate) valid_block_handlers: Vec<HandlerPtr<ValidBlockEvent>>,
    pub(crate) timeout_propose_handlers: Vec<HandlerPtr<TimeoutProposeEvent>>,
    pub(crate) timeout_wait_handlers: Vec<HandlerPtr<TimeoutWaitEvent>>,
    pub(crate) new_block_handlers: Vec<HandlerPtr<NewBlockEvent>>,
    pub(crate) vote_handlers: Vec<HandlerPtr<VoteEvent>>,
    pub(crate) evidence_handlers: Vec<HandlerPtr<EvidenceEvent>>,
    pub(crate) receive_proposal_handlers: Vec<HandlerPtr<ReceiveProposalEvent>>,
    pub(crate) receive_vote_handlers: Vec<HandlerPtr<ReceiveVoteEvent>>,
}

/// The user-defined handlers registered on a [`ReplicaSpec`](crate::replica::ReplicaSpec), at most one
/// per kind of event.
#[derive(Default)]
pub(crate) struct UserHandlers {
    pub(crate) on_new_round: Option<HandlerPtr<NewRoundEvent>>,
    pub(crate) on_new_round_step: Option<HandlerPtr<NewRoundStepEvent>>,
    pub(crate) on_complete_proposal: Option<HandlerPtr<CompleteProposalEvent>>,
    pub(crate) on_polka: Option<HandlerPtr<PolkaEvent>>,
    pub(crate) on_lock: Option<HandlerPtr<LockEvent>>,
    pub(crate) on_relock: Option<HandlerPtr<RelockEvent>>,
    pub(crate) on_valid_block: Option<HandlerPtr<ValidBlockEvent>>,
    pub(crate) on_timeout_propose: Option<HandlerPtr<TimeoutProposeEvent>>,
    pub(crate) on_timeout_wait: Option<HandlerPtr<TimeoutWaitEvent>>,
    pub(crate) on_new_block: Option<HandlerPtr<NewBlockEvent>>,
    pub(crate) on_vote: Option<HandlerPtr<VoteEvent>>,
    pub(crate) on_evidence: Option<HandlerPtr<EvidenceEvent>>,
    pub(crate) on_receive_proposal: Option<HandlerPtr<ReceiveProposalEvent>>,
    pub(crate) on_receive_vote: Option<HandlerPtr<ReceiveVoteEvent>>,
}

impl EventHandlers {
    /// Collect the user's handlers, preceded by the default loggers if `log_events` is set.
    pub(crate) fn new(log_events: bool, user_handlers: UserHandlers) -> EventHandlers {
        fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
            let mut handlers = Vec::new();
            if log_events {
                handlers.push(T::get_logger());
            }
            handlers.extend(user_handler);
            handlers
        }

        EventHandlers {
            new_round_handlers: handlers(log_events, user_handlers.on_new_round),
            new_round_step_handlers: handlers(log_events, user_handlers.on_new_round_step),
            complete_proposal_handlers: handlers(log_events, user_handlers.on_complete_proposal),
            polka_handlers: handlers(log_events, user_handlers.on_polka),
            lock_handlers: handlers(log_events, user_handlers.on_lock),
            relock_handlers: handlers(log_events, user_handlers.on_relock),
            valid_block_handlers: handlers(log_events, user_handlers.on_valid_block),
            timeout_propose_handlers: handlers(log_events, user_handlers.on_timeout_propose),
            timeout_wait_handlers: handlers(log_events, user_handlers.on_timeout_wait),
            new_block_handlers: handlers(log_events, user_handlers.on_new_block),
            vote_handlers: handlers(log_events, user_handlers.on_vote),
            evidence_handlers: handlers(log_events, user_handlers.on_evidence),
            receive_proposal_handlers: handlers(log_events, user_handlers.on_receive_proposal),
            receive_vote_handlers: handlers(log_events, user_handlers.on_receive_vote),
        }
    }

    /// Whether no handler at all is registered, in which case the event bus need not run.
    pub(crate) fn is_empty(&self) -> bool {
        self.new_round_handlers.is_empty()
            && self.new_round_step_handlers.is_empty()
            && self.complete_proposal_handlers.is_empty()
            && self.polka_handlers.is_empty()
            && self.lock_handlers.is_empty()
            && self.relock_handlers.is_empty()
            && self.valid_block_handlers.is_empty()
            && self.timeout_propose_handlers.is_empty()
            && self.timeout_wait_handlers.is_empty()
            && self.new_block_handlers.is_empty()
            && self.vote_handlers.is_empty()
            && self.evidence_handlers.is_empty()
            && self.receive_proposal_handlers.is_empty()
            && self.receive_vote_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::NewRound(new_round_event) => self
                .new_round_handlers
                .iter()
                .for_each(|handler| handler(&new_round_event)),

            Event::NewRoundStep(new_round_step_event) => self
                .new_round_step_handlers
                .iter()
                .for_each(|handler| handler(&new_round_step_event)),

            Event::CompleteProposal(complete_proposal_event) => self
                .complete_proposal_handlers
                .iter()
                .for_each(|handler| handler(&complete_proposal_event)),

            Event::Polka(polka_event) => self
                .polka_handlers
                .iter()
                .for_each(|handler| handler(&polka_event)),

            Event::Lock(lock_event) => self
                .lock_handlers
                .iter()
                .for_each(|handler| handler(&lock_event)),

            Event::Relock(relock_event) => self
                .relock_handlers
                .iter()
                .for_each(|handler| handler(&relock_event)),

            Event::ValidBlock(valid_block_event) => self
                .valid_block_handlers
                .iter()
                .for_each(|handler| handler(&valid_block_event)),

            Event::TimeoutPropose(timeout_propose_event) => self
                .timeout_propose_handlers
                .iter()
                .for_each(|handler| handler(&timeout_propose_event)),

            Event::TimeoutWait(timeout_wait_event) => self
                .timeout_wait_handlers
                .iter()
                .for_each(|handler| handler(&timeout_wait_event)),

            Event::NewBlock(new_block_event) => self
                .new_block_handlers
                .iter()
                .for_each(|handler| handler(&new_block_event)),

            Event::Vote(vote_event) => self
                .vote_handlers
                .iter()
                .for_each(|handler| handler(&vote_event)),

            Event::Evidence(evidence_event) => self
                .evidence_handlers
                .iter()
                .for_each(|handler| handler(&evidence_event)),

            Event::ReceiveProposal(receive_proposal_event) => self
                .receive_proposal_handlers
                .iter()
                .for_each(|handler| handler(&receive_proposal_event)),

            Event::ReceiveVote(receive_vote_event) => self
                .receive_vote_handlers
                .iter()
                .for_each(|handler| handler(&receive_vote_event)),
        }
    }
}

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                log::error!("Event bus thread disconnected from main thread");
                return;
            }
        }

        match event_subscriber.recv_timeout(RECV_TIMEOUT) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // Consensus stopped. Events it emitted before stopping have all been handled.
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
