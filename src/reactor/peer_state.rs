/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! What this replica believes a peer knows.
//!
//! A [`PeerRoundState`] is built only from the digests that the peer sends (`NewRoundStep`, `HasVote`,
//! `VoteSetBits`, ...) and from what this replica sent to it. It is never authoritative: it only keeps
//! the gossip routines from sending things that the peer already has.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use rand::Rng;

use crate::{
    consensus::round_state::RoundStepType,
    networking::messages::{
        HasProposalBlockPartMessage, HasVoteMessage, NewRoundStepMessage, NewValidBlockMessage,
        ProposalPOLMessage, VoteSetBitsMessage,
    },
    types::{
        bit_array::BitArray,
        commit::{Commit, ExtendedCommit},
        data_types::{Height, Round, Timestamp},
        part_set::PartSetHeader,
        proposal::Proposal,
        vote::{Vote, VoteType},
    },
    votes::vote_set::VoteSet,
};

/// A peer's position in consensus, and the proposal parts and votes it is known to have.
#[derive(Clone, Debug)]
pub struct PeerRoundState {
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
    /// When the peer started `round`, estimated from its `NewRoundStep` message.
    pub start_time: Timestamp,

    pub proposal: bool,
    pub proposal_block_part_set_header: PartSetHeader,
    pub proposal_block_parts: Option<BitArray>,
    pub proposal_pol_round: Round,
    /// Prevotes of `proposal_pol_round` that the peer has.
    pub proposal_pol: Option<BitArray>,

    pub prevotes: Option<BitArray>,
    pub precommits: Option<BitArray>,
    pub last_commit_round: Round,
    pub last_commit: Option<BitArray>,
    /// A round, other than `round`, for whose precommits this replica has a two-thirds majority and
    /// is helping the peer catch up on.
    pub catchup_commit_round: Round,
    pub catchup_commit: Option<BitArray>,
}

impl Default for PeerRoundState {
    fn default() -> Self {
        PeerRoundState {
            height: Height::new(0),
            round: Round::NIL,
            step: RoundStepType::NewHeight,
            start_time: Timestamp::default(),
            proposal: false,
            proposal_block_part_set_header: PartSetHeader::default(),
            proposal_block_parts: None,
            proposal_pol_round: Round::NIL,
            proposal_pol: None,
            prevotes: None,
            precommits: None,
            last_commit_round: Round::NIL,
            last_commit: None,
            catchup_commit_round: Round::NIL,
            catchup_commit: None,
        }
    }
}

/// How much a peer contributed to consensus.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerStats {
    pub votes: u64,
    pub block_parts: u64,
}

#[derive(Default)]
struct Inner {
    prs: PeerRoundState,
    stats: PeerStats,
}

/// A set of votes that gossip can pick from: a vote set of the current height, or a commit loaded from
/// the block store.
pub(crate) trait VoteSource {
    fn height(&self) -> Height;
    fn round(&self) -> Round;
    fn vote_type(&self) -> VoteType;
    fn size(&self) -> usize;
    fn bit_array(&self) -> BitArray;
    fn get_vote(&self, index: usize) -> Option<Vote>;
}

impl VoteSource for VoteSet {
    fn height(&self) -> Height {
        VoteSet::height(self)
    }

    fn round(&self) -> Round {
        VoteSet::round(self)
    }

    fn vote_type(&self) -> VoteType {
        VoteSet::vote_type(self)
    }

    fn size(&self) -> usize {
        VoteSet::size(self)
    }

    fn bit_array(&self) -> BitArray {
        VoteSet::bit_array(self)
    }

    fn get_vote(&self, index: usize) -> Option<Vote> {
        self.get_by_index(index).cloned()
    }
}

impl VoteSource for Commit {
    fn height(&self) -> Height {
        self.height
    }

    fn round(&self) -> Round {
        self.round
    }

    fn vote_type(&self) -> VoteType {
        VoteType::Precommit
    }

    fn size(&self) -> usize {
        Commit::size(self)
    }

    fn bit_array(&self) -> BitArray {
        Commit::bit_array(self)
    }

    fn get_vote(&self, index: usize) -> Option<Vote> {
        Commit::get_vote(self, index)
    }
}

impl VoteSource for ExtendedCommit {
    fn height(&self) -> Height {
        self.height
    }

    fn round(&self) -> Round {
        self.round
    }

    fn vote_type(&self) -> VoteType {
        VoteType::Precommit
    }

    fn size(&self) -> usize {
        ExtendedCommit::size(self)
    }

    fn bit_array(&self) -> BitArray {
        ExtendedCommit::bit_array(self)
    }

    fn get_vote(&self, index: usize) -> Option<Vote> {
        self.get_extended_vote(index)
    }
}

/// Shared handle to the [`PeerRoundState`] of one peer. Clones refer to the same state.
#[derive(Clone, Default)]
pub(crate) struct PeerState(Arc<Mutex<Inner>>);

impl PeerState {
    pub(crate) fn new() -> PeerState {
        PeerState::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.0.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn round_state(&self) -> PeerRoundState {
        self.lock().prs.clone()
    }

    pub(crate) fn stats(&self) -> PeerStats {
        self.lock().stats
    }

    /// Count a vote that the peer contributed. Returns the new total.
    pub(crate) fn record_vote(&self) -> u64 {
        let mut inner = self.lock();
        inner.stats.votes += 1;
        inner.stats.votes
    }

    /// Count a block part that the peer contributed. Returns the new total.
    pub(crate) fn record_block_part(&self) -> u64 {
        let mut inner = self.lock();
        inner.stats.block_parts += 1;
        inner.stats.block_parts
    }

    pub(crate) fn set_has_proposal(&self, proposal: &Proposal) {
        let prs = &mut self.lock().prs;
        if prs.height != proposal.height || prs.round != proposal.round || prs.proposal {
            return;
        }
        prs.proposal = true;
        // Parts may already be tracked from a NewValidBlock message.
        if prs.proposal_block_parts.is_some() {
            return;
        }
        prs.proposal_block_part_set_header = proposal.block_id.part_set_header;
        prs.proposal_block_parts = Some(BitArray::new(
            proposal.block_id.part_set_header.total as usize,
        ));
        prs.proposal_pol_round = proposal.pol_round;
        prs.proposal_pol = None;
    }

    /// Start tracking the parts of a block that the peer is catching up on.
    pub(crate) fn init_proposal_block_parts(&self, header: PartSetHeader) {
        let prs = &mut self.lock().prs;
        if prs.proposal_block_parts.is_some() {
            return;
        }
        prs.proposal_block_part_set_header = header;
        prs.proposal_block_parts = Some(BitArray::new(header.total as usize));
    }

    pub(crate) fn set_has_proposal_block_part(&self, height: Height, round: Round, index: usize) {
        let prs = &mut self.lock().prs;
        if prs.height != height || prs.round != round {
            return;
        }
        if let Some(parts) = prs.proposal_block_parts.as_mut() {
            parts.set_index(index, true);
        }
    }

    /// Pick a random vote from `votes` that the peer does not have.
    pub(crate) fn pick_vote_to_send<V: VoteSource + ?Sized, R: Rng>(
        &self,
        votes: &V,
        rng: &mut R,
    ) -> Option<Vote> {
        if votes.size() == 0 {
            return None;
        }
        let (height, round, vote_type, size) =
            (votes.height(), votes.round(), votes.vote_type(), votes.size());

        let mut inner = self.lock();
        let prs = &mut inner.prs;
        if vote_type == VoteType::Precommit {
            ensure_catchup_commit_round(prs, height, round, size);
        }
        ensure_vote_bit_arrays(prs, height, size);

        let peer_votes = vote_bit_array(prs, height, round, vote_type)?;
        let index = votes.bit_array().sub(peer_votes).pick_random(rng)?;
        votes.get_vote(index)
    }

    /// Make sure there are bit arrays to record the peer's votes at `height`, for a validator set of
    /// `num_validators`.
    pub(crate) fn ensure_vote_bit_arrays(&self, height: Height, num_validators: usize) {
        ensure_vote_bit_arrays(&mut self.lock().prs, height, num_validators)
    }

    pub(crate) fn set_has_vote(&self, height: Height, round: Round, vote_type: VoteType, index: usize) {
        let prs = &mut self.lock().prs;
        if let Some(votes) = vote_bit_array(prs, height, round, vote_type) {
            votes.set_index(index, true);
        }
    }

    pub(crate) fn apply_new_round_step(&self, msg: &NewRoundStepMessage) {
        let prs = &mut self.lock().prs;
        // Digests only move forward.
        if (msg.height, msg.round, msg.step) <= (prs.height, prs.round, prs.step) {
            return;
        }

        let (ps_height, ps_round) = (prs.height, prs.round);
        let ps_catchup_commit_round = prs.catchup_commit_round;
        let ps_catchup_commit = prs.catchup_commit.take();
        let ps_precommits = prs.precommits.take();

        let now = Timestamp::now();
        prs.start_time = if msg.seconds_since_start_time >= 0 {
            now.saturating_sub(Duration::from_secs(msg.seconds_since_start_time as u64))
        } else {
            now + Duration::from_secs(msg.seconds_since_start_time.unsigned_abs())
        };
        prs.height = msg.height;
        prs.round = msg.round;
        prs.step = msg.step;

        if msg.height != ps_height || msg.round != ps_round {
            prs.proposal = false;
            prs.proposal_block_part_set_header = PartSetHeader::default();
            prs.proposal_block_parts = None;
            prs.proposal_pol_round = Round::NIL;
            prs.proposal_pol = None;
            prs.prevotes = None;
        } else {
            prs.precommits = ps_precommits.clone();
        }

        if msg.height == ps_height
            && msg.round != ps_round
            && msg.round == ps_catchup_commit_round
        {
            // The peer moved to the round that it was catching up on.
            prs.precommits = ps_catchup_commit.clone();
        }

        if msg.height != ps_height {
            // The peer's precommits of its last round become its last commit.
            if msg.height == ps_height + 1 && msg.last_commit_round == ps_round {
                prs.last_commit = ps_precommits;
            } else {
                prs.last_commit = None;
            }
            prs.last_commit_round = msg.last_commit_round;
            prs.catchup_commit_round = Round::NIL;
            prs.catchup_commit = None;
        } else {
            prs.catchup_commit_round = ps_catchup_commit_round;
            prs.catchup_commit = ps_catchup_commit;
        }
    }

    pub(crate) fn apply_new_valid_block(&self, msg: &NewValidBlockMessage) {
        let prs = &mut self.lock().prs;
        if prs.height != msg.height {
            return;
        }
        if prs.round != msg.round && !msg.is_commit {
            return;
        }
        prs.proposal_block_part_set_header = msg.block_part_set_header;
        prs.proposal_block_parts = Some(msg.block_parts.clone());
    }

    pub(crate) fn apply_proposal_pol(&self, msg: &ProposalPOLMessage) {
        let prs = &mut self.lock().prs;
        if prs.height != msg.height || prs.proposal_pol_round != msg.proposal_pol_round {
            return;
        }
        prs.proposal_pol = Some(msg.proposal_pol.clone());
    }

    pub(crate) fn apply_has_vote(&self, msg: &HasVoteMessage) {
        if msg.index < 0 {
            return;
        }
        let prs = &mut self.lock().prs;
        if prs.height != msg.height {
            return;
        }
        if let Some(votes) = vote_bit_array(prs, msg.height, msg.round, msg.vote_type) {
            votes.set_index(msg.index as usize, true);
        }
    }

    pub(crate) fn apply_has_proposal_block_part(&self, msg: &HasProposalBlockPartMessage) {
        if msg.index < 0 {
            return;
        }
        self.set_has_proposal_block_part(msg.height, msg.round, msg.index as usize)
    }

    /// `our_votes` are the votes for `msg.block_id` that this replica has, or `None` if it has no vote
    /// set for the message's round. Votes the peer claims are added to what it is known to have; votes
    /// that only this replica has are assumed missing at the peer.
    pub(crate) fn apply_vote_set_bits(&self, msg: &VoteSetBitsMessage, our_votes: Option<&BitArray>) {
        let prs = &mut self.lock().prs;
        if let Some(votes) = vote_bit_array(prs, msg.height, msg.round, msg.vote_type) {
            match our_votes {
                Some(our_votes) => {
                    let other_votes = votes.sub(our_votes);
                    let has_votes = other_votes.or(&msg.votes);
                    votes.update(&has_votes);
                }
                None => votes.update(&msg.votes),
            }
        }
    }
}

fn vote_bit_array(
    prs: &mut PeerRoundState,
    height: Height,
    round: Round,
    vote_type: VoteType,
) -> Option<&mut BitArray> {
    if prs.height == height {
        if prs.round == round {
            return match vote_type {
                VoteType::Prevote => prs.prevotes.as_mut(),
                VoteType::Precommit => prs.precommits.as_mut(),
            };
        }
        if prs.catchup_commit_round == round && vote_type == VoteType::Precommit {
            return prs.catchup_commit.as_mut();
        }
        if prs.proposal_pol_round == round && vote_type == VoteType::Prevote {
            return prs.proposal_pol.as_mut();
        }
        return None;
    }
    if prs.height == height + 1 && prs.last_commit_round == round && vote_type == VoteType::Precommit {
        return prs.last_commit.as_mut();
    }
    None
}

fn ensure_catchup_commit_round(
    prs: &mut PeerRoundState,
    height: Height,
    round: Round,
    num_validators: usize,
) {
    if prs.height != height || prs.catchup_commit_round == round {
        return;
    }
    prs.catchup_commit_round = round;
    prs.catchup_commit = if prs.round == round {
        prs.precommits.clone()
    } else {
        Some(BitArray::new(num_validators))
    };
}

fn ensure_vote_bit_arrays(prs: &mut PeerRoundState, height: Height, num_validators: usize) {
    if prs.height == height {
        prs.prevotes
            .get_or_insert_with(|| BitArray::new(num_validators));
        prs.precommits
            .get_or_insert_with(|| BitArray::new(num_validators));
        prs.catchup_commit
            .get_or_insert_with(|| BitArray::new(num_validators));
        prs.proposal_pol
            .get_or_insert_with(|| BitArray::new(num_validators));
    } else if prs.height == height + 1 {
        prs.last_commit
            .get_or_insert_with(|| BitArray::new(num_validators));
    }
}

#[cfg(test)]
mod tests {
    use rand::thread_rng;

    use crate::votes::test_utils::{block_id, prevote_set, signed_vote, validators};

    use super::*;

    fn new_round_step(height: i64, round: i32, step: RoundStepType, last_commit_round: i32) -> NewRoundStepMessage {
        NewRoundStepMessage {
            height: Height::new(height),
            round: Round::new(round),
            step,
            seconds_since_start_time: 0,
            last_commit_round: Round::new(last_commit_round),
        }
    }

    #[test]
    fn new_round_step_only_moves_forward() {
        let peer = PeerState::new();
        peer.apply_new_round_step(&new_round_step(1, 0, RoundStepType::Prevote, -1));
        peer.apply_new_round_step(&new_round_step(1, 0, RoundStepType::Propose, -1));

        let prs = peer.round_state();
        assert_eq!(prs.height, Height::new(1));
        assert_eq!(prs.step, RoundStepType::Prevote);
    }

    #[test]
    fn precommits_become_last_commit_on_next_height() {
        let peer = PeerState::new();
        peer.apply_new_round_step(&new_round_step(1, 2, RoundStepType::Precommit, -1));
        peer.ensure_vote_bit_arrays(Height::new(1), 4);
        peer.set_has_vote(Height::new(1), Round::new(2), VoteType::Precommit, 3);

        peer.apply_new_round_step(&new_round_step(2, 0, RoundStepType::NewHeight, 2));
        let prs = peer.round_state();
        assert_eq!(prs.last_commit_round, Round::new(2));
        assert!(prs.last_commit.unwrap().get_index(3));
        assert!(prs.precommits.is_none());
        assert!(prs.prevotes.is_none());
    }

    #[test]
    fn new_round_resets_the_proposal() {
        let peer = PeerState::new();
        peer.apply_new_round_step(&new_round_step(1, 0, RoundStepType::Propose, -1));
        let proposal = Proposal::new(
            Height::new(1),
            Round::new(0),
            Round::NIL,
            block_id(1),
            Timestamp::now(),
        );
        peer.set_has_proposal(&proposal);
        assert!(peer.round_state().proposal);
        peer.set_has_proposal_block_part(Height::new(1), Round::new(0), 0);
        assert!(peer.round_state().proposal_block_parts.unwrap().is_full());

        peer.apply_new_round_step(&new_round_step(1, 1, RoundStepType::NewRound, -1));
        let prs = peer.round_state();
        assert!(!prs.proposal);
        assert!(prs.proposal_block_parts.is_none());
    }

    #[test]
    fn votes_the_peer_has_are_not_picked() {
        let (validator_set, signers) = validators(4, 10);
        let mut votes = prevote_set(&validator_set);
        for index in 0..2 {
            let vote = signed_vote(&signers, &validator_set, index, VoteType::Prevote, block_id(1));
            votes.add_vote(vote).unwrap();
        }

        let peer = PeerState::new();
        peer.apply_new_round_step(&new_round_step(1, 0, RoundStepType::Prevote, -1));
        peer.ensure_vote_bit_arrays(Height::new(1), 4);
        peer.set_has_vote(Height::new(1), Round::new(0), VoteType::Prevote, 0);

        let mut rng = thread_rng();
        let picked = peer.pick_vote_to_send(&votes, &mut rng).unwrap();
        assert_eq!(picked.validator_index, 1);
        peer.set_has_vote(Height::new(1), Round::new(0), VoteType::Prevote, 1);
        assert!(peer.pick_vote_to_send(&votes, &mut rng).is_none());
    }

    #[test]
    fn vote_set_bits_mark_votes_as_known() {
        let peer = PeerState::new();
        peer.apply_new_round_step(&new_round_step(1, 0, RoundStepType::Prevote, -1));
        peer.ensure_vote_bit_arrays(Height::new(1), 4);

        let mut claimed = BitArray::new(4);
        claimed.set_index(2, true);
        peer.apply_vote_set_bits(
            &VoteSetBitsMessage {
                height: Height::new(1),
                round: Round::new(0),
                vote_type: VoteType::Prevote,
                block_id: block_id(1),
                votes: claimed,
            },
            None,
        );
        let prevotes = peer.round_state().prevotes.unwrap();
        assert!(prevotes.get_index(2));
        assert!(!prevotes.get_index(1));
    }
}
