/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The peer gossip reactor.
//!
//! The reactor sits between the [network](crate::networking) and the consensus state machine. It runs
//! on its own thread, consuming [`ReactorInput`]s:
//! 1. Network events. Messages that only describe what a peer knows update that peer's
//!    [`PeerState`](peer_state::PeerState). Proposals, block parts, and votes are forwarded to the state
//!    machine. A peer that sends a malformed message is disconnected.
//! 2. [`StateNotice`]s from the state machine: messages to broadcast, and peers to credit for votes or
//!    block parts that consensus accepted.
//!
//! For every connected peer, the reactor also spawns three [gossip](gossip) threads that push to the
//! peer whatever proposal parts and votes it is missing.

pub mod peer_state;

mod gossip;

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, RwLock,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    consensus::{inputs::ConsensusInputSender, round_state::RoundState},
    networking::{
        messages::{Message, VoteSetBitsMessage, VoteSetMaj23Message},
        network::{Network, NetworkEvent},
        sending::SenderHandle,
    },
    pluggables::BlockStore,
    types::{
        bit_array::BitArray,
        data_types::{Height, PeerID},
        params::FeatureParams,
    },
};

use self::{gossip::Gossip, peer_state::PeerState};

/// Number of votes a peer has to contribute before it is logged as a good peer.
pub const VOTES_TO_CONTRIBUTE_TO_BECOME_GOOD_PEER: u64 = 10000;

/// Number of block parts a peer has to contribute before it is logged as a good peer.
pub const BLOCK_PARTS_TO_CONTRIBUTE_TO_BECOME_GOOD_PEER: u64 = 10000;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Something for the reactor thread to handle.
#[derive(Debug)]
pub(crate) enum ReactorInput {
    Network(NetworkEvent),
    Consensus(StateNotice),
}

impl From<NetworkEvent> for ReactorInput {
    fn from(event: NetworkEvent) -> Self {
        ReactorInput::Network(event)
    }
}

/// What the consensus state machine tells the reactor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StateNotice {
    /// Send a message to every peer.
    Broadcast(Message),
    /// Consensus accepted a vote that came from this peer.
    PeerContributedVote(PeerID),
    /// Consensus accepted a block part that came from this peer.
    PeerContributedBlockPart(PeerID),
}

/// Configuration variables for the [`Reactor`] struct.
#[derive(Clone, Debug)]
pub(crate) struct ReactorConfiguration {
    pub(crate) peer_gossip_sleep_duration: Duration,
    pub(crate) peer_query_maj23_sleep_duration: Duration,
    pub(crate) initial_height: Height,
    pub(crate) feature: FeatureParams,
}

/// A connected peer: what it knows, and the gossip threads that serve it.
struct Peer {
    state: PeerState,
    shutdown_signals: Vec<Sender<()>>,
    routines: Vec<JoinHandle<()>>,
}

impl Peer {
    fn stop(self) {
        for shutdown_signal in &self.shutdown_signals {
            let _ = shutdown_signal.send(());
        }
        for routine in self.routines {
            let _ = routine.join();
        }
    }
}

pub(crate) struct Reactor<N: Network + 'static, S: BlockStore> {
    config: ReactorConfiguration,
    network: SenderHandle<N>,
    block_store: S,
    consensus: ConsensusInputSender,
    snapshot: Arc<RwLock<RoundState>>,
    peers: HashMap<PeerID, Peer>,
}

impl<N: Network + 'static, S: BlockStore> Reactor<N, S> {
    pub(crate) fn new(
        config: ReactorConfiguration,
        network: N,
        block_store: S,
        consensus: ConsensusInputSender,
        snapshot: Arc<RwLock<RoundState>>,
    ) -> Reactor<N, S> {
        Reactor {
            config,
            network: SenderHandle::new(network),
            block_store,
            consensus,
            snapshot,
            peers: HashMap::new(),
        }
    }

    pub(crate) fn start(
        self,
        inputs: Receiver<ReactorInput>,
        shutdown_signal: Receiver<()>,
    ) -> JoinHandle<()> {
        thread::spawn(move || self.run(inputs, shutdown_signal))
    }

    fn run(mut self, inputs: Receiver<ReactorInput>, shutdown_signal: Receiver<()>) {
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => break,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    log::error!("Reactor thread disconnected from main thread");
                    break;
                }
            }

            match inputs.recv_timeout(RECV_TIMEOUT) {
                Ok(input) => self.handle_input(input),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for (_, peer) in self.peers.drain() {
            peer.stop();
        }
    }

    pub(crate) fn handle_input(&mut self, input: ReactorInput) {
        match input {
            ReactorInput::Network(NetworkEvent::PeerConnected(peer)) => self.add_peer(peer),
            ReactorInput::Network(NetworkEvent::PeerDisconnected(peer)) => self.remove_peer(peer),
            ReactorInput::Network(NetworkEvent::Message(peer, msg)) => self.receive(peer, msg),
            ReactorInput::Consensus(StateNotice::Broadcast(msg)) => self.network.broadcast(msg),
            ReactorInput::Consensus(StateNotice::PeerContributedVote(peer)) => {
                if let Some(connected) = self.peers.get(&peer) {
                    let votes = connected.state.record_vote();
                    if votes % VOTES_TO_CONTRIBUTE_TO_BECOME_GOOD_PEER == 0 {
                        log::info!("Peer {} contributed {} votes", peer, votes);
                    }
                }
            }
            ReactorInput::Consensus(StateNotice::PeerContributedBlockPart(peer)) => {
                if let Some(connected) = self.peers.get(&peer) {
                    let parts = connected.state.record_block_part();
                    if parts % BLOCK_PARTS_TO_CONTRIBUTE_TO_BECOME_GOOD_PEER == 0 {
                        log::info!("Peer {} contributed {} block parts", peer, parts);
                    }
                }
            }
        }
    }

    fn add_peer(&mut self, peer: PeerID) {
        if self.peers.contains_key(&peer) {
            return;
        }
        log::debug!("Peer {} connected", peer);

        let state = PeerState::new();
        let gossip = Gossip {
            peer,
            peer_state: state.clone(),
            network: self.network.clone(),
            block_store: self.block_store.clone(),
            snapshot: Arc::clone(&self.snapshot),
            config: self.config.clone(),
        };

        let mut shutdown_signals = Vec::with_capacity(3);
        let mut routines = Vec::with_capacity(3);
        let gossip_routines: [fn(Gossip<N, S>, Receiver<()>); 3] = [
            Gossip::data_routine,
            Gossip::votes_routine,
            Gossip::query_maj23_routine,
        ];
        for routine in gossip_routines {
            let (shutdown_sender, shutdown_receiver) = mpsc::channel();
            let gossip = gossip.clone();
            shutdown_signals.push(shutdown_sender);
            routines.push(thread::spawn(move || routine(gossip, shutdown_receiver)));
        }
        self.peers.insert(
            peer,
            Peer {
                state,
                shutdown_signals,
                routines,
            },
        );

        let msg = read_snapshot(&self.snapshot).new_round_step_message();
        self.network.send(peer, Message::NewRoundStep(msg));
    }

    fn remove_peer(&mut self, peer: PeerID) {
        if let Some(connected) = self.peers.remove(&peer) {
            let stats = connected.state.stats();
            log::debug!(
                "Peer {} disconnected after contributing {} votes and {} block parts",
                peer,
                stats.votes,
                stats.block_parts
            );
            connected.stop();
        }
    }

    /// Handle a message from `peer`.
    pub(crate) fn receive(&mut self, peer: PeerID, msg: Message) {
        if let Err(err) = msg.validate_basic() {
            self.network
                .disconnect(peer, format!("invalid message: {}", err));
            return;
        }
        let peer_state = match self.peers.get(&peer) {
            Some(connected) => connected.state.clone(),
            None => {
                log::debug!("Ignoring message from unknown peer {}", peer);
                return;
            }
        };

        match msg {
            Message::NewRoundStep(msg) => {
                if let Err(err) = msg.validate_height(self.config.initial_height) {
                    self.network
                        .disconnect(peer, format!("invalid NewRoundStep: {}", err));
                    return;
                }
                peer_state.apply_new_round_step(&msg);
            }
            Message::NewValidBlock(msg) => peer_state.apply_new_valid_block(&msg),
            Message::HasVote(msg) => peer_state.apply_has_vote(&msg),
            Message::HasProposalBlockPart(msg) => peer_state.apply_has_proposal_block_part(&msg),
            Message::ProposalPOL(msg) => peer_state.apply_proposal_pol(&msg),
            Message::VoteSetMaj23(msg) => {
                let reply = match self.vote_set_bits(&msg) {
                    Some(reply) => reply,
                    None => {
                        log::debug!(
                            "Ignoring VoteSetMaj23 for height {} from {}: not our height",
                            msg.height,
                            peer
                        );
                        return;
                    }
                };
                self.consensus
                    .send_peer_message(Message::VoteSetMaj23(msg), peer);
                self.network.send(peer, Message::VoteSetBits(reply));
            }
            Message::Proposal(msg) => {
                peer_state.set_has_proposal(&msg.proposal);
                self.consensus.send_peer_message(Message::Proposal(msg), peer);
            }
            Message::BlockPart(msg) => {
                peer_state.set_has_proposal_block_part(msg.height, msg.round, msg.part.index as usize);
                self.consensus.send_peer_message(Message::BlockPart(msg), peer);
            }
            Message::Vote(msg) => {
                let (height, num_validators, last_commit_size) = {
                    let rs = read_snapshot(&self.snapshot);
                    (
                        rs.height,
                        rs.validators.size(),
                        rs.last_commit.as_ref().map(|last_commit| last_commit.size()),
                    )
                };
                peer_state.ensure_vote_bit_arrays(height, num_validators);
                if let Some(last_commit_size) = last_commit_size {
                    peer_state.ensure_vote_bit_arrays(height - 1, last_commit_size);
                }
                let vote = &msg.vote;
                if vote.validator_index >= 0 {
                    peer_state.set_has_vote(
                        vote.height,
                        vote.round,
                        vote.vote_type,
                        vote.validator_index as usize,
                    );
                }
                self.consensus.send_peer_message(Message::Vote(msg), peer);
            }
            Message::VoteSetBits(msg) => {
                let our_votes = {
                    let rs = read_snapshot(&self.snapshot);
                    if rs.height == msg.height {
                        rs.votes
                            .vote_set(msg.round, msg.vote_type)
                            .and_then(|votes| votes.bit_array_by_block_id(&msg.block_id))
                    } else {
                        None
                    }
                };
                peer_state.apply_vote_set_bits(&msg, our_votes.as_ref());
            }
        }
    }

    /// The votes this replica has for the block that a peer claims has a two-thirds majority. `None`
    /// if the claim is about another height.
    fn vote_set_bits(&self, msg: &VoteSetMaj23Message) -> Option<VoteSetBitsMessage> {
        let rs = read_snapshot(&self.snapshot);
        if rs.height != msg.height {
            return None;
        }
        let votes = rs
            .votes
            .vote_set(msg.round, msg.vote_type)
            .and_then(|votes| votes.bit_array_by_block_id(&msg.block_id))
            .unwrap_or_else(|| BitArray::new(0));
        Some(VoteSetBitsMessage {
            height: msg.height,
            round: msg.round,
            vote_type: msg.vote_type,
            block_id: msg.block_id,
            votes,
        })
    }

    #[cfg(test)]
    fn peer_state(&self, peer: &PeerID) -> Option<PeerState> {
        self.peers.get(peer).map(|connected| connected.state.clone())
    }
}

pub(crate) fn read_snapshot(
    snapshot: &RwLock<RoundState>,
) -> std::sync::RwLockReadGuard<'_, RoundState> {
    match snapshot.read() {
        Ok(rs) => rs,
        Err(poisoned) => poisoned.into_inner(),
    }
}
