/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! All the votes of one height, organized by round.
//!
//! Consensus keeps the vote sets of every round up to the one after its current round. Votes for any other
//! round are only accepted from a peer if that peer has not yet made us open more than
//! [`MAX_CATCHUP_ROUNDS_PER_PEER`] rounds this way, which bounds how much memory a single peer can make
//! us spend on rounds that are far ahead of us.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::types::{
    block::BlockID,
    data_types::{ChainID, Height, PeerID, Round},
    validator_set::ValidatorSet,
    vote::{Vote, VoteType},
};

use super::vote_set::{VoteSet, VoteSetError};

/// Number of rounds that each peer may make us instantiate ahead of or behind the current round.
pub const MAX_CATCHUP_ROUNDS_PER_PEER: usize = 2;

#[derive(Clone, Debug)]
pub struct HeightVoteSet {
    chain_id: ChainID,
    height: Height,
    validator_set: ValidatorSet,
    extensions_enabled: bool,

    round: Round,
    round_vote_sets: BTreeMap<Round, RoundVoteSet>,
    peer_catchup_rounds: HashMap<PeerID, Vec<Round>>,
}

#[derive(Clone, Debug)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

impl HeightVoteSet {
    pub fn new(
        chain_id: ChainID,
        height: Height,
        validator_set: ValidatorSet,
        extensions_enabled: bool,
    ) -> HeightVoteSet {
        let mut height_vote_set = HeightVoteSet {
            chain_id,
            height,
            validator_set: validator_set.clone(),
            extensions_enabled,
            round: Round::new(0),
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        height_vote_set.reset(height, validator_set);
        height_vote_set
    }

    /// Forget every vote and start collecting votes for `height` from `validator_set`.
    pub fn reset(&mut self, height: Height, validator_set: ValidatorSet) {
        self.height = height;
        self.validator_set = validator_set;
        self.round_vote_sets.clear();
        self.peer_catchup_rounds.clear();
        self.add_round(Round::new(0));
        self.round = Round::new(0);
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn extensions_enabled(&self) -> bool {
        self.extensions_enabled
    }

    /// Track votes up to `round`, opening vote sets for every round between the previous one and it.
    ///
    /// Consensus in round `r` sets `r + 1`, so that a two-thirds majority in the next round can be
    /// seen. Rounds only move forward, except that setting the round back by one is tolerated.
    pub fn set_round(&mut self, round: Round) -> Result<(), HeightVoteSetError> {
        let lowest = self.round - 1;
        if self.round.int() != 0 && round < lowest {
            return Err(HeightVoteSetError::RoundDecrement {
                current: self.round,
                requested: round,
            });
        }
        for r in lowest.int().max(0)..=round.int() {
            let r = Round::new(r);
            if !self.round_vote_sets.contains_key(&r) {
                self.add_round(r);
            }
        }
        self.round = round;
        Ok(())
    }

    fn add_round(&mut self, round: Round) {
        let make_set = |vote_type| {
            if self.extensions_enabled && vote_type == VoteType::Precommit {
                VoteSet::new_extended(
                    self.chain_id,
                    self.height,
                    round,
                    vote_type,
                    self.validator_set.clone(),
                )
            } else {
                VoteSet::new(
                    self.chain_id,
                    self.height,
                    round,
                    vote_type,
                    self.validator_set.clone(),
                )
            }
        };
        let round_vote_set = RoundVoteSet {
            prevotes: make_set(VoteType::Prevote),
            precommits: make_set(VoteType::Precommit),
        };
        self.round_vote_sets.insert(round, round_vote_set);
    }

    /// Add `vote`, received from `peer` (or produced locally if `peer` is `None`).
    ///
    /// Returns whether the vote was new. Votes for a round that has no vote sets yet make this set
    /// open that round, at most [`MAX_CATCHUP_ROUNDS_PER_PEER`] times per peer.
    pub fn add_vote(&mut self, vote: Vote, peer: Option<PeerID>) -> Result<bool, HeightVoteSetError> {
        if vote.height != self.height {
            return Err(HeightVoteSetError::UnexpectedHeight {
                expected: self.height,
                got: vote.height,
            });
        }
        if !self.round_vote_sets.contains_key(&vote.round) {
            let catchup_rounds = self.peer_catchup_rounds.entry(peer.unwrap_or(LOCAL)).or_default();
            if catchup_rounds.len() >= MAX_CATCHUP_ROUNDS_PER_PEER {
                return Err(HeightVoteSetError::GotVoteFromUnwantedRound { round: vote.round });
            }
            catchup_rounds.push(vote.round);
            self.add_round(vote.round);
        }

        let vote_set = self
            .vote_set_mut(vote.round, vote.vote_type)
            .ok_or(HeightVoteSetError::GotVoteFromUnwantedRound { round: vote.round })?;
        Ok(vote_set.add_vote(vote)?)
    }

    pub fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Prevote)
    }

    pub fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Precommit)
    }

    pub fn vote_set(&self, round: Round, vote_type: VoteType) -> Option<&VoteSet> {
        self.round_vote_sets
            .get(&round)
            .map(|round_vote_set| match vote_type {
                VoteType::Prevote => &round_vote_set.prevotes,
                VoteType::Precommit => &round_vote_set.precommits,
            })
    }

    fn vote_set_mut(&mut self, round: Round, vote_type: VoteType) -> Option<&mut VoteSet> {
        self.round_vote_sets
            .get_mut(&round)
            .map(|round_vote_set| match vote_type {
                VoteType::Prevote => &mut round_vote_set.prevotes,
                VoteType::Precommit => &mut round_vote_set.precommits,
            })
    }

    /// The latest round, up to and including the tracked round, in which prevotes reached a
    /// two-thirds majority for a (non-nil) block, and that block.
    pub fn pol_info(&self) -> Option<(Round, BlockID)> {
        self.round_vote_sets
            .range(..=self.round)
            .rev()
            .find_map(|(round, round_vote_set)| {
                round_vote_set
                    .prevotes
                    .two_thirds_majority()
                    .filter(|block_id| !block_id.is_nil())
                    .map(|block_id| (*round, block_id))
            })
    }

    /// Record that `peer` claims a two-thirds majority for `block_id` among the votes of `vote_type`
    /// in `round`. Claims about rounds we have no vote sets for are ignored.
    pub fn set_peer_maj23(
        &mut self,
        round: Round,
        vote_type: VoteType,
        peer: PeerID,
        block_id: BlockID,
    ) -> Result<(), HeightVoteSetError> {
        match self.vote_set_mut(round, vote_type) {
            Some(vote_set) => Ok(vote_set.set_peer_maj23(peer, block_id)?),
            None => Ok(()),
        }
    }
}

// Catch-up rounds opened by locally produced votes are counted under this ID.
const LOCAL: PeerID = PeerID::new([0; 32]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeightVoteSetError {
    #[error("expected vote for height {expected}, got {got}")]
    UnexpectedHeight { expected: Height, got: Height },
    #[error("peer has sent votes for too many catch-up rounds, latest {round}")]
    GotVoteFromUnwantedRound { round: Round },
    #[error("cannot set the round back from {current} to {requested}")]
    RoundDecrement { current: Round, requested: Round },
    #[error(transparent)]
    VoteSet(#[from] VoteSetError),
}
