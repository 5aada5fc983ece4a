/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The three threads that serve one peer.
//!
//! 1. The data routine sends parts of the proposal block that the peer is missing, parts of stored
//!    blocks to a peer that is catching up, and the proposal itself.
//! 2. The votes routine sends one vote the peer is missing at a time.
//! 3. The maj23 routine tells the peer which blocks this replica has seen a two-thirds majority for, so
//!    that the peer can answer with the votes it has, and this replica can send it the rest.
//!
//! Each step copies the round state snapshot and the peer's state, sends at most one message, and
//! reports whether it sent anything. The snapshot lock is released before anything is sent. The
//! routines sleep only when a step sent nothing.

use std::{
    sync::{
        mpsc::{Receiver, TryRecvError},
        Arc, RwLock,
    },
    thread,
    time::Duration,
};

use rand::{rngs::ThreadRng, thread_rng, Rng};

use crate::{
    consensus::round_state::{RoundState, RoundStepType},
    networking::{
        messages::{
            BlockPartMessage, Message, ProposalMessage, ProposalPOLMessage, VoteMessage,
            VoteSetMaj23Message,
        },
        network::Network,
        sending::SenderHandle,
    },
    pluggables::BlockStore,
    types::{
        commit::Commit,
        data_types::{Height, PeerID, Round},
        vote::VoteType,
    },
};

use super::{
    peer_state::{PeerRoundState, PeerState, VoteSource},
    read_snapshot, ReactorConfiguration,
};

#[derive(Clone)]
pub(super) struct Gossip<N: Network, S: BlockStore> {
    pub(super) peer: PeerID,
    pub(super) peer_state: PeerState,
    pub(super) network: SenderHandle<N>,
    pub(super) block_store: S,
    pub(super) snapshot: Arc<RwLock<RoundState>>,
    pub(super) config: ReactorConfiguration,
}

impl<N: Network, S: BlockStore> Gossip<N, S> {
    pub(super) fn data_routine(mut self, shutdown_signal: Receiver<()>) {
        let mut rng = thread_rng();
        while !should_stop(&shutdown_signal) {
            if !self.gossip_data(&mut rng) {
                thread::sleep(jittered(self.config.peer_gossip_sleep_duration, &mut rng));
            }
        }
    }

    pub(super) fn votes_routine(mut self, shutdown_signal: Receiver<()>) {
        let mut rng = thread_rng();
        // Only the first sleep after sending something is logged.
        let mut slept = false;
        while !should_stop(&shutdown_signal) {
            if self.gossip_votes(&mut rng) {
                slept = false;
                continue;
            }
            if !slept {
                let prs = self.peer_state.round_state();
                log::debug!(
                    "No votes to send to {} at {}/{}/{}, sleeping",
                    self.peer,
                    prs.height,
                    prs.round,
                    prs.step.name()
                );
                slept = true;
            }
            thread::sleep(self.config.peer_gossip_sleep_duration);
        }
    }

    pub(super) fn query_maj23_routine(mut self, shutdown_signal: Receiver<()>) {
        while !should_stop(&shutdown_signal) {
            let queries: [fn(&mut Self) -> bool; 4] = [
                Self::query_prevotes,
                Self::query_precommits,
                Self::query_pol_prevotes,
                Self::query_catchup_commit,
            ];
            for query in queries {
                if query(&mut self) {
                    thread::sleep(self.config.peer_query_maj23_sleep_duration);
                    if should_stop(&shutdown_signal) {
                        return;
                    }
                }
            }
            thread::sleep(self.config.peer_query_maj23_sleep_duration);
        }
    }

    /// Send one proposal block part or the proposal. Returns whether something was sent.
    pub(super) fn gossip_data(&mut self, rng: &mut ThreadRng) -> bool {
        let rs = read_snapshot(&self.snapshot).clone();
        let prs = self.peer_state.round_state();

        // A part of the proposal block that the peer is missing.
        if let (Some(our_parts), Some(peer_parts)) =
            (&rs.proposal_block_parts, &prs.proposal_block_parts)
        {
            if our_parts.has_header(&prs.proposal_block_part_set_header) {
                let missing = our_parts.bit_array().sub(peer_parts);
                if let Some(index) = missing.pick_random(rng) {
                    if let Some(part) = our_parts.get_part(index) {
                        self.network.send(
                            self.peer,
                            Message::BlockPart(BlockPartMessage {
                                height: rs.height,
                                round: rs.round,
                                part: part.clone(),
                            }),
                        );
                        self.peer_state
                            .set_has_proposal_block_part(prs.height, prs.round, index);
                        return true;
                    }
                }
            }
        }

        // The peer is at a height whose block we have.
        let base = self.block_store.base();
        if base.int() > 0 && prs.height.int() > 0 && prs.height < rs.height && prs.height >= base {
            return self.gossip_data_for_catchup(&prs, rng);
        }

        if rs.height != prs.height || rs.round != prs.round {
            return false;
        }

        // The proposal, and with a re-proposal the prevotes that justify it.
        if let Some(proposal) = &rs.proposal {
            if !prs.proposal {
                self.network.send(
                    self.peer,
                    Message::Proposal(ProposalMessage {
                        proposal: proposal.clone(),
                    }),
                );
                self.peer_state.set_has_proposal(proposal);
                if !proposal.pol_round.is_nil() {
                    if let Some(pol_prevotes) = rs.votes.prevotes(proposal.pol_round) {
                        self.network.send(
                            self.peer,
                            Message::ProposalPOL(ProposalPOLMessage {
                                height: rs.height,
                                proposal_pol_round: proposal.pol_round,
                                proposal_pol: pol_prevotes.bit_array(),
                            }),
                        );
                    }
                }
                return true;
            }
        }
        false
    }

    fn gossip_data_for_catchup(&mut self, prs: &PeerRoundState, rng: &mut ThreadRng) -> bool {
        let peer_parts = match &prs.proposal_block_parts {
            Some(peer_parts) => peer_parts,
            None => {
                // The peer never told us which block it is after. Assume it wants the one we stored.
                match self.block_store.load_block_meta(prs.height) {
                    Some(block_meta) => {
                        self.peer_state
                            .init_proposal_block_parts(block_meta.block_id.part_set_header);
                        return true;
                    }
                    None => {
                        log::error!(
                            "No block meta stored for height {} (base {}, height {})",
                            prs.height,
                            self.block_store.base(),
                            self.block_store.height()
                        );
                        return false;
                    }
                }
            }
        };

        let index = match peer_parts.not().pick_random(rng) {
            Some(index) => index,
            None => return false,
        };
        match self.block_store.load_block_meta(prs.height) {
            Some(block_meta)
                if block_meta.block_id.part_set_header == prs.proposal_block_part_set_header => {}
            Some(_) => {
                log::debug!(
                    "Peer {} is after a different block at height {}",
                    self.peer,
                    prs.height
                );
                return false;
            }
            None => return false,
        }
        let part = match self.block_store.load_block_part(prs.height, index as u32) {
            Some(part) => part,
            None => {
                log::error!(
                    "Could not load part {} of the block at height {}",
                    index,
                    prs.height
                );
                return false;
            }
        };

        self.network.send(
            self.peer,
            Message::BlockPart(BlockPartMessage {
                height: prs.height,
                round: prs.round,
                part,
            }),
        );
        self.peer_state
            .set_has_proposal_block_part(prs.height, prs.round, index);
        true
    }

    /// Send one vote the peer is missing. Returns whether a vote was sent.
    pub(super) fn gossip_votes(&mut self, rng: &mut ThreadRng) -> bool {
        let prs = self.peer_state.round_state();
        {
            let rs = read_snapshot(&self.snapshot).clone();

            if rs.height == prs.height && self.gossip_votes_for_height(&rs, &prs, rng) {
                return true;
            }

            // The peer is one height behind: it needs our last commit.
            if prs.height.int() != 0 && rs.height == prs.height + 1 {
                if let Some(last_commit) = &rs.last_commit {
                    if self.pick_send_vote(last_commit, rng) {
                        return true;
                    }
                }
            }

            if !(prs.height.int() != 0 && rs.height >= prs.height + 2) {
                return false;
            }
        }

        // The peer is further behind: send it precommits from the commit we stored for its height.
        let base = self.block_store.base();
        if base.int() == 0 || prs.height < base {
            return false;
        }
        if self.config.feature.vote_extensions_enabled(prs.height) {
            match self.block_store.load_block_extended_commit(prs.height) {
                Some(extended_commit) => self.pick_send_vote(&extended_commit, rng),
                None => false,
            }
        } else {
            match self.block_store.load_block_commit(prs.height) {
                Some(commit) => self.pick_send_vote(&commit, rng),
                None => false,
            }
        }
    }

    fn gossip_votes_for_height(
        &mut self,
        rs: &RoundState,
        prs: &PeerRoundState,
        rng: &mut ThreadRng,
    ) -> bool {
        let peer_round_known = !prs.round.is_nil() && prs.round <= rs.round;

        if prs.step == RoundStepType::NewHeight {
            if let Some(last_commit) = &rs.last_commit {
                if self.pick_send_vote(last_commit, rng) {
                    return true;
                }
            }
        }
        if prs.step <= RoundStepType::Propose
            && peer_round_known
            && !prs.proposal_pol_round.is_nil()
            && self.pick_send_prevotes(rs, prs.proposal_pol_round, rng)
        {
            return true;
        }
        if prs.step <= RoundStepType::PrevoteWait
            && peer_round_known
            && self.pick_send_prevotes(rs, prs.round, rng)
        {
            return true;
        }
        if prs.step <= RoundStepType::PrecommitWait && peer_round_known {
            if let Some(precommits) = rs.votes.precommits(prs.round) {
                if self.pick_send_vote(precommits, rng) {
                    return true;
                }
            }
        }
        // Prevotes again, for peers that need them to update their valid block.
        if peer_round_known && self.pick_send_prevotes(rs, prs.round, rng) {
            return true;
        }
        !prs.proposal_pol_round.is_nil() && self.pick_send_prevotes(rs, prs.proposal_pol_round, rng)
    }

    fn pick_send_prevotes(&mut self, rs: &RoundState, round: Round, rng: &mut ThreadRng) -> bool {
        match rs.votes.prevotes(round) {
            Some(prevotes) => self.pick_send_vote(prevotes, rng),
            None => false,
        }
    }

    fn pick_send_vote<V: VoteSource>(&mut self, votes: &V, rng: &mut ThreadRng) -> bool {
        let vote = match self.peer_state.pick_vote_to_send(votes, rng) {
            Some(vote) => vote,
            None => return false,
        };
        if vote.validator_index < 0 {
            return false;
        }
        self.peer_state.set_has_vote(
            vote.height,
            vote.round,
            vote.vote_type,
            vote.validator_index as usize,
        );
        self.network
            .send(self.peer, Message::Vote(VoteMessage { vote }));
        true
    }

    fn query_prevotes(&mut self) -> bool {
        self.query_round(VoteType::Prevote, |prs| prs.round)
    }

    fn query_precommits(&mut self) -> bool {
        self.query_round(VoteType::Precommit, |prs| prs.round)
    }

    fn query_pol_prevotes(&mut self) -> bool {
        self.query_round(VoteType::Prevote, |prs| prs.proposal_pol_round)
    }

    /// Claim our two-thirds majority among the votes of `vote_type` in the round `round_of` picks from
    /// the peer's state, if the peer is at our height.
    fn query_round(&mut self, vote_type: VoteType, round_of: fn(&PeerRoundState) -> Round) -> bool {
        let prs = self.peer_state.round_state();
        let round = round_of(&prs);
        if round.is_nil() {
            return false;
        }
        let maj23 = {
            let rs = read_snapshot(&self.snapshot);
            if rs.height != prs.height {
                return false;
            }
            rs.votes
                .vote_set(round, vote_type)
                .and_then(|votes| votes.two_thirds_majority())
        };
        match maj23 {
            Some(block_id) => {
                self.network.send(
                    self.peer,
                    Message::VoteSetMaj23(VoteSetMaj23Message {
                        height: prs.height,
                        round,
                        vote_type,
                        block_id,
                    }),
                );
                true
            }
            None => false,
        }
    }

    fn query_catchup_commit(&mut self) -> bool {
        let prs = self.peer_state.round_state();
        if prs.catchup_commit_round.is_nil()
            || prs.height.int() <= 0
            || prs.height > self.block_store.height()
            || prs.height < self.block_store.base()
        {
            return false;
        }
        match self.load_commit(prs.height) {
            Some(commit) => {
                self.network.send(
                    self.peer,
                    Message::VoteSetMaj23(VoteSetMaj23Message {
                        height: prs.height,
                        round: commit.round,
                        vote_type: VoteType::Precommit,
                        block_id: commit.block_id,
                    }),
                );
                true
            }
            None => false,
        }
    }

    /// The commit for `height`: the one we saw if it is our latest block, otherwise the one included in
    /// the next block.
    fn load_commit(&self, height: Height) -> Option<Commit> {
        if height == self.block_store.height() {
            self.block_store.load_seen_commit(height)
        } else {
            self.block_store.load_block_commit(height)
        }
    }
}

fn should_stop(shutdown_signal: &Receiver<()>) -> bool {
    !matches!(shutdown_signal.try_recv(), Err(TryRecvError::Empty))
}

/// `duration` plus up to a tenth of it, so that the gossip routines of different peers drift apart.
fn jittered<R: Rng>(duration: Duration, rng: &mut R) -> Duration {
    let max_jitter = duration.as_millis() as u64 / 10;
    if max_jitter == 0 {
        return duration;
    }
    duration + Duration::from_millis(rng.gen_range(0..=max_jitter))
}
