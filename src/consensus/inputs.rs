/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Everything the consensus receive routine consumes.

use std::sync::mpsc::{SyncSender, TrySendError};
use std::thread;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    networking::messages::Message,
    timeout_ticker::TimeoutInfo,
    types::data_types::{PeerID, Timestamp},
};

use super::ingest::{IngestError, VerifiedBlock};

/// A message for the state machine, and where it came from.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MsgInfo {
    pub msg: Message,
    /// `None` for messages produced by this node.
    pub peer_id: Option<PeerID>,
    pub receive_time: Timestamp,
}

impl MsgInfo {
    pub fn from_peer(msg: Message, peer_id: PeerID) -> MsgInfo {
        MsgInfo {
            msg,
            peer_id: Some(peer_id),
            receive_time: Timestamp::now(),
        }
    }

    pub fn internal(msg: Message) -> MsgInfo {
        MsgInfo {
            msg,
            peer_id: None,
            receive_time: Timestamp::now(),
        }
    }
}

pub enum ConsensusInput {
    Peer(MsgInfo),
    Timeout(TimeoutInfo),
    TxsAvailable,
    IngestVerifiedBlock(VerifiedBlock, SyncSender<Result<(), IngestError>>),
}

impl From<TimeoutInfo> for ConsensusInput {
    fn from(value: TimeoutInfo) -> Self {
        ConsensusInput::Timeout(value)
    }
}

/// Cloneable handle for feeding inputs into the receive routine's bounded queue.
#[derive(Clone)]
pub struct ConsensusInputSender {
    sender: SyncSender<ConsensusInput>,
}

impl ConsensusInputSender {
    pub(crate) fn new(sender: SyncSender<ConsensusInput>) -> ConsensusInputSender {
        ConsensusInputSender { sender }
    }

    /// Enqueue `input` without blocking. If the queue is full, a detached thread waits for room.
    pub fn send(&self, input: ConsensusInput) {
        match self.sender.try_send(input) {
            Ok(()) => (),
            Err(TrySendError::Full(input)) => {
                log::debug!("Consensus input queue is full, sending in the background");
                let sender = self.sender.clone();
                thread::spawn(move || {
                    let _ = sender.send(input);
                });
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("Consensus receive routine has stopped; dropping input")
            }
        }
    }

    pub fn send_peer_message(&self, msg: Message, peer_id: PeerID) {
        self.send(ConsensusInput::Peer(MsgInfo::from_peer(msg, peer_id)))
    }

    pub fn txs_available(&self) {
        self.send(ConsensusInput::TxsAvailable)
    }

    /// Hand a block that was verified elsewhere (e.g. by block sync) to consensus, and wait for the
    /// outcome.
    pub fn ingest_verified_block(&self, block: VerifiedBlock) -> Result<(), IngestError> {
        let (reply, outcome) = std::sync::mpsc::sync_channel(1);
        self.sender
            .send(ConsensusInput::IngestVerifiedBlock(block, reply))
            .map_err(|_| IngestError::Stopped)?;
        outcome.recv().map_err(|_| IngestError::Stopped)?
    }
}
