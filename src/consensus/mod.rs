/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Tendermint consensus state machine.
//!
//! ## Heights, rounds, and steps
//!
//! Consensus decides on one block per height. Each height goes through one or more rounds, and each
//! round through the steps of [`RoundStepType`](round_state::RoundStepType): a designated proposer
//! proposes a block, validators prevote for it (or for nil), and, once more than two-thirds of the
//! voting power prevoted for the same block (a "polka"), they precommit for it. More than two-thirds of
//! precommits for a block commit it.
//!
//! A validator that precommits a block locks on it, and only prevotes for another block after seeing
//! a polka for that block in a later round. This is what keeps two correct validators from committing
//! different blocks at the same height.
//!
//! ## Inputs
//!
//! All state transitions happen on one thread, the receive routine, which consumes
//! [`ConsensusInput`](inputs::ConsensusInput)s: messages from peers, fired timeouts, mempool
//! notifications, and blocks verified by block sync. Messages produced by the state machine itself
//! (its proposal, block parts, and votes) go through an internal queue that is drained before any other
//! input is consumed.
//!
//! ## Crash recovery
//!
//! Every input is written to the [WAL](crate::wal) before it is processed, and internal messages are
//! made durable before they are acted on. On restart, the inputs of the current height are replayed,
//! bringing the state machine back to where it stopped.

pub mod errors;

pub mod ingest;

pub mod inputs;

pub mod round_state;

pub(crate) mod state;

mod handlers;

mod replay;

mod steps;

#[cfg(test)]
pub(crate) mod test_utils;

#[cfg(test)]
mod tests;
