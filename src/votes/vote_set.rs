/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Accumulator of the votes of one type at one height and round.
//!
//! Main type: [`VoteSet`].

use std::collections::HashMap;

use thiserror::Error;

use crate::types::{
    bit_array::BitArray,
    block::BlockID,
    commit::{BlockIDFlag, Commit, CommitError, ExtendedCommit, ExtendedCommitSig},
    data_types::{Address, ChainID, Height, PeerID, Power, Round, TotalPower},
    validator_set::ValidatorSet,
    vote::{Vote, VoteError, VoteType},
};

/// The votes for a single (height, round, vote type), cast by the members of a fixed validator set.
///
/// # Conflicting votes
///
/// At most one vote per validator counts towards the tally. If a validator signs two votes for different
/// blocks, the second one is rejected with [`VoteSetError::ConflictingVote`], which carries both votes
/// so that the caller can report the equivocation as evidence.
///
/// There is one exception: if a peer has told us (through [`set_peer_maj23`](Self::set_peer_maj23))
/// that some block got a two-thirds majority, conflicting votes for that block are still tracked
/// separately, so that we can eventually see the same majority that the peer saw. Once a majority is
/// reached for a block, that block's votes replace the primary votes of their validators.
#[derive(Clone, Debug)]
pub struct VoteSet {
    chain_id: ChainID,
    height: Height,
    round: Round,
    vote_type: VoteType,
    validator_set: ValidatorSet,
    extensions_enabled: bool,

    votes_bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: TotalPower,
    maj23: Option<BlockID>,
    votes_by_block: HashMap<BlockID, BlockVotes>,
    peer_maj23s: HashMap<PeerID, BlockID>,
}

impl VoteSet {
    pub fn new(
        chain_id: ChainID,
        height: Height,
        round: Round,
        vote_type: VoteType,
        validator_set: ValidatorSet,
    ) -> VoteSet {
        let size = validator_set.size();
        VoteSet {
            chain_id,
            height,
            round,
            vote_type,
            validator_set,
            extensions_enabled: false,
            votes_bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: TotalPower::new(0),
            maj23: None,
            votes_by_block: HashMap::new(),
            peer_maj23s: HashMap::new(),
        }
    }

    /// Create a vote set that requires non-nil precommits to carry a signed vote extension.
    pub fn new_extended(
        chain_id: ChainID,
        height: Height,
        round: Round,
        vote_type: VoteType,
        validator_set: ValidatorSet,
    ) -> VoteSet {
        let mut vote_set = VoteSet::new(chain_id, height, round, vote_type, validator_set);
        vote_set.extensions_enabled = true;
        vote_set
    }

    /// Reconstruct the precommit set that produced `commit`.
    pub fn from_commit(
        chain_id: ChainID,
        commit: &Commit,
        validator_set: ValidatorSet,
    ) -> Result<VoteSet, VoteSetError> {
        let mut vote_set = VoteSet::new(
            chain_id,
            commit.height,
            commit.round,
            VoteType::Precommit,
            validator_set,
        );
        for index in 0..commit.size() {
            if let Some(vote) = commit.get_vote(index) {
                vote_set.add_vote(vote)?;
            }
        }
        Ok(vote_set)
    }

    /// Reconstruct the precommit set, vote extensions included, that produced `extended_commit`.
    pub fn from_extended_commit(
        chain_id: ChainID,
        extended_commit: &ExtendedCommit,
        validator_set: ValidatorSet,
    ) -> Result<VoteSet, VoteSetError> {
        let mut vote_set = VoteSet::new_extended(
            chain_id,
            extended_commit.height,
            extended_commit.round,
            VoteType::Precommit,
            validator_set,
        );
        for index in 0..extended_commit.size() {
            if let Some(vote) = extended_commit.get_extended_vote(index) {
                vote_set.add_vote(vote)?;
            }
        }
        Ok(vote_set)
    }

    pub fn chain_id(&self) -> ChainID {
        self.chain_id
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn size(&self) -> usize {
        self.validator_set.size()
    }

    pub fn validator_set(&self) -> &ValidatorSet {
        &self.validator_set
    }

    pub fn extensions_enabled(&self) -> bool {
        self.extensions_enabled
    }

    /// Add `vote` to this set.
    ///
    /// Returns `Ok(true)` if the vote was added, and `Ok(false)` if this set already has exactly this
    /// vote.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        if vote.validator_index < 0 {
            return Err(VoteSetError::InvalidValidatorIndex {
                index: vote.validator_index,
            });
        }
        if vote.height != self.height || vote.round != self.round || vote.vote_type != self.vote_type
        {
            return Err(VoteSetError::UnexpectedStep {
                expected: (self.height, self.round, self.vote_type),
                got: (vote.height, vote.round, vote.vote_type),
            });
        }

        let index = vote.validator_index as usize;
        let (address, pub_key, voting_power) = match self.validator_set.get_by_index(index) {
            Some(validator) => (validator.address, validator.pub_key, validator.voting_power),
            None => {
                return Err(VoteSetError::InvalidValidatorIndex {
                    index: vote.validator_index,
                })
            }
        };
        if address != vote.validator_address {
            return Err(VoteSetError::InvalidValidatorAddress { index });
        }

        // If we already know of this exact vote, return early.
        if let Some(existing) = self.get_vote(index, &vote.block_id) {
            if existing.signature == vote.signature {
                return Ok(false);
            }
            return Err(VoteSetError::NonDeterministicSignature { index });
        }

        if self.extensions_enabled {
            vote.ensure_extension()?;
            vote.verify_vote_and_extension(self.chain_id, &pub_key)?;
        } else {
            vote.verify(self.chain_id, &pub_key)?;
            if !vote.extension.is_empty() || vote.extension_signature.is_some() {
                return Err(VoteSetError::UnexpectedExtension { index });
            }
        }

        let block_id = vote.block_id;
        let (added, conflicting) = self.add_verified_vote(vote.clone(), block_id, voting_power);
        match conflicting {
            Some(conflicting) => Err(VoteSetError::ConflictingVote(Box::new(
                ConflictingVoteError {
                    vote_a: conflicting,
                    vote_b: vote,
                    added,
                },
            ))),
            None => Ok(added),
        }
    }

    fn get_vote(&self, index: usize, block_id: &BlockID) -> Option<&Vote> {
        if let Some(existing) = &self.votes[index] {
            if existing.block_id == *block_id {
                return Some(existing);
            }
        }
        self.votes_by_block
            .get(block_id)
            .and_then(|block_votes| block_votes.votes[index].as_ref())
    }

    // Precondition: the vote is verified and is not already in the set.
    fn add_verified_vote(
        &mut self,
        vote: Vote,
        block_id: BlockID,
        voting_power: Power,
    ) -> (bool, Option<Vote>) {
        let index = vote.validator_index as usize;

        let conflicting = self.votes[index].clone();
        if conflicting.is_some() {
            // Replace the primary vote if this block is the one with the majority.
            if self.maj23 == Some(block_id) {
                self.votes[index] = Some(vote.clone());
                self.votes_bit_array.set_index(index, true);
            }
        } else {
            self.votes[index] = Some(vote.clone());
            self.votes_bit_array.set_index(index, true);
            self.sum += voting_power;
        }

        match self.votes_by_block.get(&block_id).map(|block_votes| block_votes.peer_maj23) {
            Some(peer_maj23) => {
                if conflicting.is_some() && !peer_maj23 {
                    // A conflict, and no peer claims that this block is special.
                    return (false, conflicting);
                }
            }
            None => {
                if conflicting.is_some() {
                    // Not tracking this block, so forget the vote.
                    return (false, conflicting);
                }
                let size = self.size();
                self.votes_by_block.insert(block_id, BlockVotes::new(false, size));
            }
        }

        let total = self.validator_set.total_voting_power();
        let block_votes = match self.votes_by_block.get_mut(&block_id) {
            Some(block_votes) => block_votes,
            None => return (false, conflicting),
        };
        let had_majority = block_votes.sum.exceeds_two_thirds_of(total);
        block_votes.add_verified_vote(vote, voting_power);
        let has_majority = block_votes.sum.exceeds_two_thirds_of(total);

        // Only the first majority counts.
        if !had_majority && has_majority && self.maj23.is_none() {
            self.maj23 = Some(block_id);
            for (i, vote) in block_votes.votes.iter().enumerate() {
                if let Some(vote) = vote {
                    self.votes[i] = Some(vote.clone());
                }
            }
        }

        (true, conflicting)
    }

    /// Record that `peer` claims a two-thirds majority for `block_id` in this set.
    ///
    /// From then on, votes for `block_id` are tracked even if they conflict with votes we already have.
    pub fn set_peer_maj23(&mut self, peer: PeerID, block_id: BlockID) -> Result<(), VoteSetError> {
        if let Some(existing) = self.peer_maj23s.get(&peer) {
            if *existing == block_id {
                return Ok(());
            }
            return Err(VoteSetError::ConflictingPeerMaj23 { peer });
        }
        self.peer_maj23s.insert(peer, block_id);

        let size = self.size();
        match self.votes_by_block.get_mut(&block_id) {
            Some(block_votes) => block_votes.peer_maj23 = true,
            None => {
                self.votes_by_block.insert(block_id, BlockVotes::new(true, size));
            }
        }
        Ok(())
    }

    /// Bit array of the validators whose votes count towards this set's tally.
    pub fn bit_array(&self) -> BitArray {
        self.votes_bit_array.clone()
    }

    /// Bit array of the validators that voted for `block_id`, if this set tracks `block_id`.
    pub fn bit_array_by_block_id(&self, block_id: &BlockID) -> Option<BitArray> {
        self.votes_by_block
            .get(block_id)
            .map(|block_votes| block_votes.bit_array.clone())
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Vote> {
        self.votes.get(index).and_then(|vote| vote.as_ref())
    }

    pub fn get_by_address(&self, address: &Address) -> Option<&Vote> {
        let (index, _) = self.validator_set.get_by_address(address)?;
        self.get_by_index(index)
    }

    /// All votes that count towards this set's tally.
    pub fn list(&self) -> Vec<Vote> {
        self.votes.iter().flatten().cloned().collect()
    }

    /// The block (possibly nil) that has more than two-thirds of the voting power, if any.
    pub fn two_thirds_majority(&self) -> Option<BlockID> {
        self.maj23
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// Whether votes for any combination of blocks (nil included) add up to more than two-thirds of the
    /// voting power.
    pub fn has_two_thirds_any(&self) -> bool {
        self.sum.exceeds_two_thirds_of(self.validator_set.total_voting_power())
    }

    pub fn has_all(&self) -> bool {
        self.sum == self.validator_set.total_voting_power()
    }

    /// Whether this is a set of precommits with a two-thirds majority for a block.
    pub fn is_commit(&self) -> bool {
        self.vote_type == VoteType::Precommit
            && self.maj23.map(|block_id| !block_id.is_nil()).unwrap_or(false)
    }

    /// Build the [`ExtendedCommit`] certified by this set of precommits.
    ///
    /// Validators that precommitted nil keep a `Nil` slot; validators that precommitted a block other than
    /// the majority block are recorded as absent.
    pub fn make_extended_commit(
        &self,
        extensions_enabled: bool,
    ) -> Result<ExtendedCommit, VoteSetError> {
        if self.vote_type != VoteType::Precommit {
            return Err(VoteSetError::NotPrecommits);
        }
        let block_id = match self.maj23 {
            Some(block_id) if !block_id.is_nil() => block_id,
            _ => return Err(VoteSetError::NoMajorityForBlock),
        };

        let extended_signatures = self
            .votes
            .iter()
            .map(|vote| match vote {
                Some(vote) => {
                    let mut sig = vote.extended_commit_sig();
                    if sig.commit_sig.block_id_flag == BlockIDFlag::Commit && vote.block_id != block_id
                    {
                        sig = ExtendedCommitSig::absent();
                    }
                    if !extensions_enabled {
                        sig.extension.clear();
                        sig.extension_signature = None;
                    }
                    sig
                }
                None => ExtendedCommitSig::absent(),
            })
            .collect();

        let extended_commit = ExtendedCommit {
            height: self.height,
            round: self.round,
            block_id,
            extended_signatures,
        };
        extended_commit.ensure_extensions(extensions_enabled)?;
        Ok(extended_commit)
    }

    /// Build the plain [`Commit`] certified by this set of precommits.
    pub fn make_commit(&self) -> Result<Commit, VoteSetError> {
        Ok(self.make_extended_commit(false)?.to_commit())
    }
}

/// Votes for one particular block.
#[derive(Clone, Debug)]
struct BlockVotes {
    // A peer claims this block has a two-thirds majority.
    peer_maj23: bool,
    bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: TotalPower,
}

impl BlockVotes {
    fn new(peer_maj23: bool, size: usize) -> BlockVotes {
        BlockVotes {
            peer_maj23,
            bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: TotalPower::new(0),
        }
    }

    fn add_verified_vote(&mut self, vote: Vote, voting_power: Power) {
        let index = vote.validator_index as usize;
        if self.votes[index].is_none() {
            self.bit_array.set_index(index, true);
            self.votes[index] = Some(vote);
            self.sum += voting_power;
        }
    }
}

/// Two votes signed by the same validator for the same height, round, and type, but different blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictingVoteError {
    /// The vote that was in the set first.
    pub vote_a: Vote,
    /// The vote that conflicts with it.
    pub vote_b: Vote,
    /// Whether `vote_b` was tracked anyway because a peer claimed a majority for its block.
    pub added: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VoteSetError {
    #[error("expected vote for {expected:?}, got {got:?}")]
    UnexpectedStep {
        expected: (Height, Round, VoteType),
        got: (Height, Round, VoteType),
    },
    #[error("validator index {index} is out of range")]
    InvalidValidatorIndex { index: i32 },
    #[error("validator address does not match validator at index {index}")]
    InvalidValidatorAddress { index: usize },
    #[error("invalid vote: {0}")]
    InvalidVote(#[from] VoteError),
    #[error("validator {index} signed the same vote twice with different signatures")]
    NonDeterministicSignature { index: usize },
    #[error("validator {index} attached a vote extension although extensions are disabled")]
    UnexpectedExtension { index: usize },
    #[error("conflicting votes from the same validator")]
    ConflictingVote(Box<ConflictingVoteError>),
    #[error("peer {peer} claimed a majority for two different blocks")]
    ConflictingPeerMaj23 { peer: PeerID },
    #[error("only a set of precommits can make a commit")]
    NotPrecommits,
    #[error("cannot make a commit without a two-thirds majority for a block")]
    NoMajorityForBlock,
    #[error("invalid commit: {0}")]
    InvalidCommit(#[from] CommitError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::data_types::SignatureBytes;
    use crate::votes::test_utils::*;

    #[test]
    fn duplicate_vote_is_not_added_twice() {
        let (validator_set, signers) = validators(4, 1);
        let mut vote_set = prevote_set(&validator_set);
        let vote = signed_vote(&signers, &validator_set, 0, VoteType::Prevote, block_id(1));

        assert_eq!(vote_set.add_vote(vote.clone()), Ok(true));
        assert_eq!(vote_set.add_vote(vote), Ok(false));
        assert_eq!(vote_set.bit_array().count_ones(), 1);
    }

    #[test]
    fn conflicting_vote_is_reported_every_time() {
        let (validator_set, signers) = validators(4, 1);
        let mut vote_set = prevote_set(&validator_set);
        let vote = signed_vote(&signers, &validator_set, 0, VoteType::Prevote, block_id(1));
        let conflicting = signed_vote(&signers, &validator_set, 0, VoteType::Prevote, block_id(2));

        assert_eq!(vote_set.add_vote(vote.clone()), Ok(true));
        for _ in 0..2 {
            match vote_set.add_vote(conflicting.clone()) {
                Err(VoteSetError::ConflictingVote(error)) => {
                    assert_eq!(error.vote_a, vote);
                    assert_eq!(error.vote_b, conflicting);
                    assert!(!error.added);
                }
                other => panic!("expected a conflicting vote error, got {:?}", other),
            }
        }
        assert_eq!(vote_set.get_by_index(0), Some(&vote));
        assert!(vote_set.bit_array_by_block_id(&block_id(2)).is_none());
    }

    #[test]
    fn two_thirds_threshold_is_strict() {
        // Total power 6: two-thirds is exactly 4, so a majority needs 5.
        let (validator_set, signers) = validators(6, 1);
        let mut vote_set = prevote_set(&validator_set);

        for index in 0..4 {
            let vote = signed_vote(&signers, &validator_set, index, VoteType::Prevote, block_id(1));
            vote_set.add_vote(vote).unwrap();
        }
        assert_eq!(vote_set.two_thirds_majority(), None);
        assert!(!vote_set.has_two_thirds_any());

        let vote = signed_vote(&signers, &validator_set, 4, VoteType::Prevote, block_id(1));
        vote_set.add_vote(vote).unwrap();
        assert_eq!(vote_set.two_thirds_majority(), Some(block_id(1)));
        assert!(vote_set.has_two_thirds_any());
        assert!(!vote_set.has_all());
    }

    #[test]
    fn two_thirds_any_counts_mixed_votes() {
        let (validator_set, signers) = validators(4, 1);
        let mut vote_set = prevote_set(&validator_set);

        let blocks = [block_id(1), block_id(2), BlockID::nil()];
        for (index, block) in blocks.into_iter().enumerate() {
            let vote = signed_vote(&signers, &validator_set, index, VoteType::Prevote, block);
            vote_set.add_vote(vote).unwrap();
        }
        assert!(vote_set.has_two_thirds_any());
        assert_eq!(vote_set.two_thirds_majority(), None);
    }

    #[test]
    fn nil_majority_is_a_majority() {
        let (validator_set, signers) = validators(4, 1);
        let mut vote_set = prevote_set(&validator_set);
        for index in 0..3 {
            let vote = signed_vote(&signers, &validator_set, index, VoteType::Prevote, BlockID::nil());
            vote_set.add_vote(vote).unwrap();
        }
        assert_eq!(vote_set.two_thirds_majority(), Some(BlockID::nil()));
    }

    #[test]
    fn peer_maj23_lets_conflicting_votes_be_tracked() {
        let (validator_set, signers) = validators(4, 1);
        let mut vote_set = prevote_set(&validator_set);
        let vote = signed_vote(&signers, &validator_set, 0, VoteType::Prevote, block_id(1));
        let conflicting = signed_vote(&signers, &validator_set, 0, VoteType::Prevote, block_id(2));
        vote_set.add_vote(vote).unwrap();

        let peer = PeerID::new([9; 32]);
        vote_set.set_peer_maj23(peer, block_id(2)).unwrap();
        match vote_set.add_vote(conflicting) {
            Err(VoteSetError::ConflictingVote(error)) => assert!(error.added),
            other => panic!("expected a conflicting vote error, got {:?}", other),
        }
        assert_eq!(
            vote_set.bit_array_by_block_id(&block_id(2)).map(|ba| ba.true_indices()),
            Some(vec![0])
        );
        assert_eq!(
            vote_set.set_peer_maj23(peer, block_id(3)),
            Err(VoteSetError::ConflictingPeerMaj23 { peer })
        );
    }

    #[test]
    fn invalid_votes_are_rejected() {
        let (validator_set, signers) = validators(4, 1);
        let mut vote_set = prevote_set(&validator_set);

        let mut wrong_round = signed_vote(&signers, &validator_set, 0, VoteType::Prevote, block_id(1));
        wrong_round.round = Round::new(1);
        assert!(matches!(
            vote_set.add_vote(wrong_round),
            Err(VoteSetError::UnexpectedStep { .. })
        ));

        let mut bad_index = signed_vote(&signers, &validator_set, 0, VoteType::Prevote, block_id(1));
        bad_index.validator_index = 4;
        assert!(matches!(
            vote_set.add_vote(bad_index),
            Err(VoteSetError::InvalidValidatorIndex { index: 4 })
        ));

        let mut bad_signature = signed_vote(&signers, &validator_set, 1, VoteType::Prevote, block_id(1));
        bad_signature.signature = SignatureBytes::new([1; 64]);
        assert!(matches!(
            vote_set.add_vote(bad_signature),
            Err(VoteSetError::InvalidVote(VoteError::InvalidSignature))
        ));
    }

    #[test]
    fn commit_marks_votes_for_other_blocks_absent() {
        let (validator_set, signers) = validators(4, 1);
        let mut vote_set = VoteSet::new(
            chain_id(),
            Height::new(1),
            Round::new(0),
            VoteType::Precommit,
            validator_set.clone(),
        );
        assert_eq!(vote_set.make_commit(), Err(VoteSetError::NoMajorityForBlock));

        for index in 0..3 {
            let vote = signed_vote(&signers, &validator_set, index, VoteType::Precommit, block_id(1));
            vote_set.add_vote(vote).unwrap();
        }
        let other = signed_vote(&signers, &validator_set, 3, VoteType::Precommit, block_id(2));
        vote_set.add_vote(other).unwrap();

        let commit = vote_set.make_commit().unwrap();
        assert_eq!(commit.block_id, block_id(1));
        assert_eq!(commit.bit_array().true_indices(), vec![0, 1, 2]);
        validator_set
            .verify_commit(chain_id(), block_id(1), Height::new(1), &commit)
            .unwrap();

        let rebuilt = VoteSet::from_commit(chain_id(), &commit, validator_set).unwrap();
        assert_eq!(rebuilt.two_thirds_majority(), Some(block_id(1)));
    }

    #[test]
    fn extended_vote_set_requires_extension_signatures() {
        let (validator_set, signers) = validators(4, 1);
        let mut vote_set = VoteSet::new_extended(
            chain_id(),
            Height::new(1),
            Round::new(0),
            VoteType::Precommit,
            validator_set.clone(),
        );

        let mut unextended = signed_extended_vote(&signers, &validator_set, 0, block_id(1));
        unextended.strip_extension();
        assert!(matches!(
            vote_set.add_vote(unextended),
            Err(VoteSetError::InvalidVote(VoteError::MissingExtensionSignature))
        ));

        for index in 0..3 {
            let vote = signed_extended_vote(&signers, &validator_set, index, block_id(1));
            vote_set.add_vote(vote).unwrap();
        }
        let extended_commit = vote_set.make_extended_commit(true).unwrap();
        assert!(extended_commit
            .extended_signatures
            .iter()
            .take(3)
            .all(|sig| sig.extension_signature.is_some()));
        assert!(vote_set.make_extended_commit(false).is_ok());
    }
}
