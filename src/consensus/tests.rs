/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::time::Duration;

use ed25519_dalek::SigningKey;

use crate::{
    events::Event,
    networking::messages::{BlockPartMessage, Message, ProposalMessage, VoteMessage},
    pluggables::BlockStore,
    privval::LocalPrivValidator,
    timeout_ticker::TimeoutInfo,
    types::{
        block::{Block, BlockID},
        crypto_primitives::Keypair,
        data_types::{Address, CryptoHash, Height, PeerID, Round, Timestamp},
        params::{ConsensusParams, SynchronyParams},
        part_set::{PartSetHeader, BLOCK_PART_SIZE_BYTES},
        proposal::Proposal,
        state::State,
        validator_set::ValidatorSet,
        vote::VoteType,
    },
    wal::file_wal::FileWal,
};

use super::{
    errors::ConsensusError,
    ingest::{IngestError, VerifiedBlock},
    inputs::{ConsensusInput, MsgInfo},
    round_state::RoundStepType,
    test_utils::*,
};

fn dummy_block_id(n: u8) -> BlockID {
    BlockID::new(
        CryptoHash::new([n; 32]),
        PartSetHeader {
            total: 1,
            hash: CryptoHash::new([n; 32]),
        },
    )
}

/// Run the height that `harness` is at to completion. Only works if its signer has all of the voting
/// power.
fn single_validator_harness() -> Harness {
    let (state, key) = single_validator_genesis();
    HarnessBuilder::new(state)
        .signer(LocalPrivValidator::new(key))
        .build()
}

fn single_validator_genesis() -> (State, SigningKey) {
    let (validator_set, keys) = validators(1);
    let state = genesis_state(validator_set, ConsensusParams::default());
    (state, keys[0].clone())
}

#[test]
fn single_validator_commits_blocks() {
    let mut harness = single_validator_harness();

    harness.commit_height();
    assert_eq!(harness.block_store.height(), Height::new(1));
    assert_eq!(harness.consensus.state.last_block_height, Height::new(1));
    assert_eq!(harness.consensus.rs.step, RoundStepType::NewHeight);
    assert!(harness.consensus.rs.last_commit.is_some());
    assert_eq!(
        harness.consensus.state.app_hash,
        NumberExecutor::app_hash(1)
    );

    harness.commit_height();
    let block = harness.block_store.load_block(Height::new(2)).unwrap();
    let last_commit = block.last_commit.unwrap();
    assert_eq!(last_commit.height, Height::new(1));
    assert_eq!(harness.consensus.state.last_block_height, Height::new(2));

    let new_blocks = harness
        .events
        .try_iter()
        .filter(|event| matches!(event, Event::NewBlock(_)))
        .count();
    assert_eq!(new_blocks, 2);
}

#[test]
fn own_vote_extensions_are_stored_with_the_commit() {
    let (validator_set, keys) = validators(1);
    let mut consensus_params = ConsensusParams::default();
    consensus_params.feature.vote_extensions_enable_height = Height::new(1);
    let state = genesis_state(validator_set, consensus_params);
    let mut harness = HarnessBuilder::new(state)
        .signer(LocalPrivValidator::new(keys[0].clone()))
        .build();

    harness.commit_height();
    let extended_commit = harness
        .block_store
        .load_block_extended_commit(Height::new(1))
        .unwrap();
    assert_eq!(
        extended_commit.extended_signatures[0].extension,
        1i64.to_le_bytes().to_vec()
    );

    // The next proposal carries the commit of height 1.
    harness.commit_height();
    assert!(harness
        .block_store
        .load_block(Height::new(2))
        .unwrap()
        .last_commit
        .is_some());
}

#[test]
fn rejected_proposal_is_prevoted_nil() {
    let (validator_set, keys) = validators(1);
    let state = genesis_state(validator_set, ConsensusParams::default());
    let mut harness = HarnessBuilder::new(state)
        .signer(LocalPrivValidator::new(keys[0].clone()))
        .executor(NumberExecutor {
            reject_proposals: true,
        })
        .build();

    harness
        .consensus
        .enter_new_round(Height::new(1), Round::new(0))
        .unwrap();
    harness.consensus.drain_internal_queue().unwrap();

    let rs = &harness.consensus.rs;
    assert_eq!(harness.block_store.height(), Height::new(0));
    assert_eq!(rs.step, RoundStepType::PrecommitWait);
    assert_eq!(
        rs.votes
            .prevotes(Round::new(0))
            .unwrap()
            .two_thirds_majority(),
        Some(BlockID::nil())
    );
    assert!(rs.locked_block.is_none());
}

#[test]
fn double_signing_risk_is_detected() {
    let (validator_set, keys) = validators(1);
    let state = genesis_state(validator_set, ConsensusParams::default());
    let mut harness = HarnessBuilder::new(state)
        .signer(LocalPrivValidator::new(keys[0].clone()))
        .build();
    harness.commit_height();
    let state = harness.consensus.state.clone();

    let mut config = config();
    config.double_sign_check_height = 1;
    let restarted = HarnessBuilder::new(state.clone())
        .config(config.clone())
        .block_store(harness.block_store.clone())
        .signer(LocalPrivValidator::new(keys[0].clone()))
        .build();
    assert!(matches!(
        restarted.consensus.check_double_signing_risk(Height::new(2)),
        Err(ConsensusError::SignatureFoundInPastBlocks { height }) if height == Height::new(1)
    ));

    // A depth of zero disables the check.
    config.double_sign_check_height = 0;
    let unchecked = HarnessBuilder::new(state)
        .config(config)
        .block_store(harness.block_store.clone())
        .signer(LocalPrivValidator::new(keys[0].clone()))
        .build();
    assert!(unchecked
        .consensus
        .check_double_signing_risk(Height::new(2))
        .is_ok());
}

#[test]
fn conflicting_votes_are_reported() {
    let (validator_set, keys) = validators(4);
    let state = genesis_state(validator_set.clone(), ConsensusParams::default());
    let mut harness = HarnessBuilder::new(state)
        .signer(LocalPrivValidator::new(keys[0].clone()))
        .build();

    for block_id in [dummy_block_id(1), dummy_block_id(2)] {
        let vote = signed_vote(
            &keys[1],
            &validator_set,
            Height::new(1),
            Round::new(0),
            VoteType::Prevote,
            block_id,
        );
        let peer = PeerID::new([1; 32]);
        harness
            .consensus
            .handle_msg(MsgInfo::from_peer(Message::Vote(VoteMessage { vote }), peer))
            .unwrap();
    }

    let reported = harness.evidence_pool.reported();
    assert_eq!(reported.len(), 1);
    assert_eq!(
        reported[0].address(),
        Address::from_verifying_key(&keys[1].verifying_key())
    );
    assert!(harness
        .events
        .try_iter()
        .any(|event| matches!(event, Event::Evidence(_))));
}

#[test]
fn only_the_proposer_can_propose() {
    let (validator_set, keys) = validators(4);
    let proposer = validator_set.get_proposer().address;
    let (proposer_key, other_key) = {
        let proposer_key = keys
            .iter()
            .find(|key| Address::from_verifying_key(&key.verifying_key()) == proposer)
            .unwrap();
        let other_key = keys
            .iter()
            .find(|key| Address::from_verifying_key(&key.verifying_key()) != proposer)
            .unwrap();
        (proposer_key.clone(), other_key.clone())
    };
    let state = genesis_state(validator_set, ConsensusParams::default());
    let mut harness = HarnessBuilder::new(state).build();

    let signed_proposal = |key| {
        let mut proposal = Proposal::new(
            Height::new(1),
            Round::new(0),
            Round::NIL,
            dummy_block_id(3),
            Timestamp::now(),
        );
        proposal.signature = Keypair::new(key).sign(&proposal.sign_bytes(chain_id()));
        MsgInfo::internal(Message::Proposal(ProposalMessage { proposal }))
    };

    harness
        .consensus
        .handle_msg(signed_proposal(other_key))
        .unwrap();
    assert!(harness.consensus.rs.proposal.is_none());

    harness
        .consensus
        .handle_msg(signed_proposal(proposer_key))
        .unwrap();
    assert!(harness.consensus.rs.proposal.is_some());
    assert!(harness.consensus.rs.proposal_block_parts.is_some());
}

#[test]
fn stale_timeouts_are_ignored() {
    let mut harness = single_validator_harness();
    harness.commit_height();

    // A timeout of the height that was just committed.
    harness
        .consensus
        .handle_timeout(TimeoutInfo {
            duration: Duration::ZERO,
            height: Height::new(1),
            round: Round::new(0),
            step: RoundStepType::Propose,
        })
        .unwrap();
    assert_eq!(harness.consensus.rs.height, Height::new(2));
    assert_eq!(harness.consensus.rs.step, RoundStepType::NewHeight);
}

#[test]
fn replay_restores_the_round_state() {
    let dir = tempfile::tempdir().unwrap();
    let wal_path = dir.path().join("wal");

    // Two validators, so that this replica's votes alone cannot decide anything.
    let (validator_set, keys) = validators(2);
    let proposer = validator_set.get_proposer().address;
    let key = keys
        .iter()
        .find(|key| Address::from_verifying_key(&key.verifying_key()) == proposer)
        .unwrap()
        .clone();
    let signer = LocalPrivValidator::new(key);
    let state = genesis_state(validator_set, ConsensusParams::default());

    let (proposal_block_id, own_prevote) = {
        let mut harness = HarnessBuilder::new(state.clone())
            .signer(signer.clone())
            .wal(FileWal::open(&wal_path).unwrap())
            .build();
        harness
            .consensus
            .handle_input(ConsensusInput::Timeout(TimeoutInfo {
                duration: Duration::ZERO,
                height: Height::new(1),
                round: Round::new(0),
                step: RoundStepType::NewHeight,
            }))
            .unwrap();
        harness.consensus.drain_internal_queue().unwrap();

        let rs = &harness.consensus.rs;
        assert_eq!(rs.step, RoundStepType::Prevote);
        let prevote = rs
            .votes
            .prevotes(Round::new(0))
            .unwrap()
            .get_by_address(&proposer)
            .cloned()
            .unwrap();
        (rs.proposal_block_id().unwrap(), prevote)
    };

    let mut restarted = HarnessBuilder::new(state)
        .signer(signer)
        .wal(FileWal::open(&wal_path).unwrap())
        .build();
    assert_eq!(restarted.consensus.rs.step, RoundStepType::NewHeight);
    restarted.consensus.catchup_replay(Height::new(1)).unwrap();

    let rs = &restarted.consensus.rs;
    assert_eq!(rs.step, RoundStepType::Prevote);
    assert_eq!(rs.round, Round::new(0));
    assert_eq!(rs.proposal_block_id(), Some(proposal_block_id));
    assert!(rs.proposal_block.is_some());
    let replayed_prevote = rs
        .votes
        .prevotes(Round::new(0))
        .unwrap()
        .get_by_address(&proposer)
        .unwrap();
    assert_eq!(replayed_prevote, &own_prevote);

    // Messages signed again during replay are duplicates of the replayed ones.
    restarted.consensus.drain_internal_queue().unwrap();
    assert_eq!(restarted.consensus.rs.step, RoundStepType::Prevote);
}

#[test]
fn verified_blocks_are_ingested() {
    let (genesis, key) = single_validator_genesis();
    let mut source = HarnessBuilder::new(genesis.clone())
        .signer(LocalPrivValidator::new(key))
        .build();
    source.commit_height();
    source.commit_height();

    let verified_block = |height: i64| {
        let height = Height::new(height);
        let block = source.block_store.load_block(height).unwrap();
        let parts = block.make_part_set(BLOCK_PART_SIZE_BYTES);
        let commit = source.block_store.load_seen_commit(height).unwrap();
        VerifiedBlock::new(block, parts, commit, None).unwrap()
    };

    let mut follower = HarnessBuilder::new(genesis.clone()).build();
    follower
        .consensus
        .ingest_verified_block(verified_block(1))
        .unwrap()
        .unwrap();
    assert_eq!(follower.consensus.state.last_block_height, Height::new(1));
    assert_eq!(follower.block_store.height(), Height::new(1));
    assert_eq!(follower.consensus.rs.height, Height::new(2));
    assert!(follower.consensus.rs.last_commit.is_some());

    assert!(matches!(
        follower.consensus.ingest_verified_block(verified_block(1)).unwrap(),
        Err(IngestError::AlreadyIncluded)
    ));

    // The follower can keep going with the next block.
    follower
        .consensus
        .ingest_verified_block(verified_block(2))
        .unwrap()
        .unwrap();
    assert_eq!(follower.consensus.state.app_hash, NumberExecutor::app_hash(2));

    let mut behind = HarnessBuilder::new(genesis).build();
    assert!(matches!(
        behind.consensus.ingest_verified_block(verified_block(2)).unwrap(),
        Err(IngestError::HeightGap { expected, got })
            if expected == Height::new(1) && got == Height::new(2)
    ));
}

#[test]
fn mismatched_commit_is_refused() {
    let mut source = single_validator_harness();
    source.commit_height();
    source.commit_height();

    let block = source.block_store.load_block(Height::new(1)).unwrap();
    let parts = block.make_part_set(BLOCK_PART_SIZE_BYTES);
    let commit = source.block_store.load_seen_commit(Height::new(2)).unwrap();
    assert!(matches!(
        VerifiedBlock::new(block, parts, commit, None),
        Err(IngestError::Validation(_))
    ));
}

fn address_of(key: &SigningKey) -> Address {
    Address::from_verifying_key(&key.verifying_key())
}

/// One replica among 4 equally powerful validators, fed proposals and votes from the other 3 by hand.
/// The replica proposes in none of the rounds 0 to 2.
struct Cluster {
    harness: Harness,
    keys: Vec<SigningKey>,
    validator_set: ValidatorSet,
    state: State,
    me: usize,
}

impl Cluster {
    fn new(executor: NumberExecutor) -> Cluster {
        Cluster::with_params(executor, ConsensusParams::default(), Timestamp::now())
    }

    fn with_params(
        executor: NumberExecutor,
        consensus_params: ConsensusParams,
        genesis_time: Timestamp,
    ) -> Cluster {
        let (validator_set, keys) = validators(4);
        let mut rotated = validator_set.clone();
        let mut proposers = vec![rotated.get_proposer().address];
        for _ in 0..2 {
            rotated.increment_proposer_priority(1);
            proposers.push(rotated.get_proposer().address);
        }
        let me = keys
            .iter()
            .position(|key| !proposers.contains(&address_of(key)))
            .unwrap();

        let state = State::from_genesis(
            chain_id(),
            Height::new(1),
            genesis_time,
            validator_set.clone(),
            consensus_params,
        );
        let harness = HarnessBuilder::new(state.clone())
            .signer(LocalPrivValidator::new(keys[me].clone()))
            .executor(executor)
            .build();
        Cluster {
            harness,
            keys,
            validator_set,
            state,
            me,
        }
    }

    fn others(&self) -> Vec<usize> {
        (0..self.keys.len()).filter(|index| *index != self.me).collect()
    }

    /// A valid block for height 1. Blocks with different tags have different hashes.
    fn block(&self, tag: u8) -> Block {
        self.block_timed(tag, self.state.block_time(Height::new(1), None))
    }

    fn block_timed(&self, tag: u8, time: Timestamp) -> Block {
        self.state.make_block(
            Height::new(1),
            vec![vec![tag]],
            None,
            address_of(&self.keys[0]),
            time,
        )
    }

    fn enter_round(&mut self, round: i32) {
        self.harness
            .consensus
            .enter_new_round(Height::new(1), Round::new(round))
            .unwrap();
        self.harness.consensus.drain_internal_queue().unwrap();
    }

    /// The proposer of the current round proposes `block`, and sends all of its parts.
    fn receive_proposal(&mut self, block: &Block, pol_round: Round) {
        let round = self.harness.consensus.rs.round;
        let proposer = self.harness.consensus.rs.validators.get_proposer().address;
        let index = self
            .keys
            .iter()
            .position(|key| address_of(key) == proposer)
            .unwrap();
        let (block_id, parts) = block.block_id_and_parts();
        let mut proposal = Proposal::new(
            Height::new(1),
            round,
            pol_round,
            block_id,
            block.header.time,
        );
        proposal.signature =
            Keypair::new(self.keys[index].clone()).sign(&proposal.sign_bytes(chain_id()));

        self.deliver(index, Message::Proposal(ProposalMessage { proposal }));
        for part_index in 0..parts.total() as usize {
            let part = parts.get_part(part_index).unwrap().clone();
            self.deliver(
                index,
                Message::BlockPart(BlockPartMessage {
                    height: Height::new(1),
                    round,
                    part,
                }),
            );
        }
    }

    fn receive_vote(&mut self, index: usize, round: i32, vote_type: VoteType, block_id: BlockID) {
        let vote = signed_vote(
            &self.keys[index],
            &self.validator_set,
            Height::new(1),
            Round::new(round),
            vote_type,
            block_id,
        );
        self.deliver(index, Message::Vote(VoteMessage { vote }));
    }

    fn deliver(&mut self, from: usize, msg: Message) {
        let peer = PeerID::from(&self.keys[from].verifying_key());
        self.harness
            .consensus
            .handle_msg(MsgInfo::from_peer(msg, peer))
            .unwrap();
        self.harness.consensus.drain_internal_queue().unwrap();
    }

    /// What this replica voted for in `round`, if it voted.
    fn own_vote(&self, round: i32, vote_type: VoteType) -> Option<BlockID> {
        let address = address_of(&self.keys[self.me]);
        self.harness
            .consensus
            .rs
            .votes
            .vote_set(Round::new(round), vote_type)
            .and_then(|votes| votes.get_by_address(&address))
            .map(|vote| vote.block_id)
    }

    /// Receive `block` as the round 0 proposal and see two other validators prevote it, which makes
    /// this replica lock on it.
    fn lock_in_round_0(&mut self, block: &Block) -> BlockID {
        let block_id = block.block_id_and_parts().0;
        self.enter_round(0);
        self.receive_proposal(block, Round::NIL);
        assert_eq!(self.own_vote(0, VoteType::Prevote), Some(block_id));
        for index in self.others().into_iter().take(2) {
            self.receive_vote(index, 0, VoteType::Prevote, block_id);
        }
        assert_eq!(self.harness.consensus.rs.locked_round, Round::new(0));
        assert_eq!(self.own_vote(0, VoteType::Precommit), Some(block_id));
        block_id
    }
}

#[test]
fn polka_locks_and_a_later_polka_relocks() {
    let mut cluster = Cluster::new(NumberExecutor::default());
    let block = cluster.block(1);
    let block_id = cluster.lock_in_round_0(&block);
    assert!(cluster.harness.consensus.rs.is_locked_on(&block));
    assert!(cluster
        .harness
        .events
        .try_iter()
        .any(|event| matches!(event, Event::Lock(lock) if lock.block_id == block_id)));

    // The round 1 proposer re-proposes the block with the polka of round 0.
    cluster.enter_round(1);
    cluster.receive_proposal(&block, Round::new(0));
    assert_eq!(cluster.own_vote(1, VoteType::Prevote), Some(block_id));

    for index in cluster.others().into_iter().take(2) {
        cluster.receive_vote(index, 1, VoteType::Prevote, block_id);
    }
    let rs = &cluster.harness.consensus.rs;
    assert_eq!(rs.locked_round, Round::new(1));
    assert_eq!(rs.valid_round, Round::new(1));
    assert_eq!(cluster.own_vote(1, VoteType::Precommit), Some(block_id));
    assert!(cluster
        .harness
        .events
        .try_iter()
        .any(|event| matches!(event, Event::Relock(relock) if relock.round == Round::new(1))));
}

#[test]
fn locked_replica_prevotes_nil_for_another_fresh_block() {
    let mut cluster = Cluster::new(NumberExecutor::default());
    let locked = cluster.block(1);
    cluster.lock_in_round_0(&locked);

    cluster.enter_round(1);
    let other = cluster.block(2);
    cluster.receive_proposal(&other, Round::NIL);
    assert_eq!(cluster.own_vote(1, VoteType::Prevote), Some(BlockID::nil()));

    // The lock survives the round.
    assert_eq!(cluster.harness.consensus.rs.locked_round, Round::new(0));
    assert!(cluster.harness.consensus.rs.is_locked_on(&locked));
}

#[test]
fn re_proposal_with_a_polka_is_prevoted_without_asking_the_application() {
    let mut cluster = Cluster::new(NumberExecutor {
        reject_proposals: true,
    });
    let block = cluster.block(1);
    let block_id = block.block_id_and_parts().0;

    // The others see the round 0 proposal and prevote it. This replica does not.
    cluster.enter_round(0);
    for index in cluster.others() {
        cluster.receive_vote(index, 0, VoteType::Prevote, block_id);
    }
    assert!(cluster.own_vote(0, VoteType::Prevote).is_none());

    cluster.enter_round(1);
    cluster.receive_proposal(&block, Round::new(0));
    assert_eq!(cluster.own_vote(1, VoteType::Prevote), Some(block_id));
}

#[test]
fn fresh_proposal_of_the_valid_block_is_prevoted_without_asking_the_application() {
    let mut cluster = Cluster::new(NumberExecutor {
        reject_proposals: true,
    });
    let block = cluster.block(1);
    let block_id = block.block_id_and_parts().0;

    // The propose timeout fires before the proposal arrives, then the others make a polka for it.
    cluster.enter_round(0);
    cluster
        .harness
        .consensus
        .enter_prevote(Height::new(1), Round::new(0))
        .unwrap();
    cluster.harness.consensus.drain_internal_queue().unwrap();
    assert_eq!(cluster.own_vote(0, VoteType::Prevote), Some(BlockID::nil()));
    for index in cluster.others() {
        cluster.receive_vote(index, 0, VoteType::Prevote, block_id);
    }
    cluster.receive_proposal(&block, Round::NIL);

    let rs = &cluster.harness.consensus.rs;
    assert_eq!(rs.valid_round, Round::new(0));
    assert!(rs.is_valid_block(&block));
    assert!(rs.locked_round.is_nil());

    cluster.enter_round(1);
    cluster.receive_proposal(&block, Round::NIL);
    assert_eq!(cluster.own_vote(1, VoteType::Prevote), Some(block_id));
}

#[test]
fn two_thirds_of_any_votes_in_a_later_round_skip_to_it() {
    let mut cluster = Cluster::new(NumberExecutor::default());
    cluster.enter_round(0);

    for index in cluster.others() {
        cluster.receive_vote(index, 2, VoteType::Prevote, BlockID::nil());
    }
    let rs = &cluster.harness.consensus.rs;
    assert_eq!(rs.round, Round::new(2));
    assert_eq!(rs.step, RoundStepType::Propose);
    assert!(rs
        .votes
        .prevotes(Round::new(2))
        .unwrap()
        .has_two_thirds_any());
}

#[test]
fn untimely_proposal_is_prevoted_nil() {
    let mut consensus_params = ConsensusParams::default();
    consensus_params.feature.pbts_enable_height = Height::new(1);
    consensus_params.synchrony =
        SynchronyParams::new(Duration::from_millis(500), Duration::from_secs(2));
    let genesis_time = Timestamp::now().saturating_sub(Duration::from_secs(2 * 60 * 60));

    // Timed an hour before it was received.
    let mut cluster =
        Cluster::with_params(NumberExecutor::default(), consensus_params, genesis_time);
    let stale = cluster.block_timed(1, Timestamp::now().saturating_sub(Duration::from_secs(60 * 60)));
    cluster.enter_round(0);
    cluster.receive_proposal(&stale, Round::NIL);
    assert_eq!(cluster.own_vote(0, VoteType::Prevote), Some(BlockID::nil()));

    // Timed when it was sent.
    let mut cluster =
        Cluster::with_params(NumberExecutor::default(), consensus_params, genesis_time);
    let timely = cluster.block(1);
    cluster.enter_round(0);
    cluster.receive_proposal(&timely, Round::NIL);
    assert_eq!(
        cluster.own_vote(0, VoteType::Prevote),
        Some(timely.block_id_and_parts().0)
    );
}

#[test]
fn locked_replica_only_precommits_another_block_after_a_newer_polka() {
    let mut cluster = Cluster::new(NumberExecutor::default());
    let locked = cluster.block(1);
    cluster.lock_in_round_0(&locked);
    let other = cluster.block(2);
    let other_id = other.block_id_and_parts().0;

    // Round 1: two others prevote the other block, which is no polka.
    cluster.enter_round(1);
    cluster.receive_proposal(&other, Round::NIL);
    for index in cluster.others().into_iter().take(2) {
        cluster.receive_vote(index, 1, VoteType::Prevote, other_id);
    }
    assert_eq!(cluster.harness.consensus.rs.step, RoundStepType::PrevoteWait);
    cluster
        .harness
        .consensus
        .enter_precommit(Height::new(1), Round::new(1))
        .unwrap();
    cluster.harness.consensus.drain_internal_queue().unwrap();
    assert_eq!(cluster.own_vote(1, VoteType::Precommit), Some(BlockID::nil()));
    assert!(cluster.harness.consensus.rs.is_locked_on(&locked));

    // Round 2: all three others prevote it, which is a polka newer than the lock.
    cluster.enter_round(2);
    cluster.receive_proposal(&other, Round::NIL);
    assert_eq!(cluster.own_vote(2, VoteType::Prevote), Some(BlockID::nil()));
    for index in cluster.others() {
        cluster.receive_vote(index, 2, VoteType::Prevote, other_id);
    }
    let rs = &cluster.harness.consensus.rs;
    assert_eq!(rs.locked_round, Round::new(2));
    assert!(rs.is_locked_on(&other));
    assert_eq!(cluster.own_vote(2, VoteType::Precommit), Some(other_id));
}
