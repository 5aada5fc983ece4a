/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! In-memory pluggables and a harness for driving a [`ConsensusState`] by hand.

use std::{
    collections::BTreeMap,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    time::Duration,
};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;

use crate::{
    app::{BlockExecutor, BlockExecutorError},
    events::Event,
    pluggables::{BlockStore, EvidencePool},
    privval::{LocalPrivValidator, PrivValidator},
    types::{
        block::{Block, BlockID, BlockMeta},
        commit::{Commit, ExtendedCommit},
        crypto_primitives::Keypair,
        data_types::{Address, ChainID, CryptoHash, Height, Power, Round, SignatureBytes, Timestamp},
        evidence::DuplicateVoteEvidence,
        params::ConsensusParams,
        part_set::{Part, PartSet},
        state::State,
        validator_set::{Validator, ValidatorSet},
        vote::{Vote, VoteType},
    },
    wal::{nil_wal::NilWal, Wal},
};

use super::{
    inputs::ConsensusInput,
    state::{ConsensusConfiguration, ConsensusState},
};

pub(crate) type TestConsensus = ConsensusState<NumberExecutor, MemBlockStore, RecordingEvidencePool>;

pub(crate) fn chain_id() -> ChainID {
    ChainID::new(42)
}

#[derive(Clone)]
struct StoredBlock {
    block: Block,
    parts: PartSet,
    seen_commit: Commit,
    extended_commit: Option<ExtendedCommit>,
}

/// Block store backed by a map shared between clones.
#[derive(Clone, Default)]
pub(crate) struct MemBlockStore(Arc<Mutex<BTreeMap<Height, StoredBlock>>>);

impl MemBlockStore {
    fn get(&self, height: Height) -> Option<StoredBlock> {
        self.0.lock().unwrap().get(&height).cloned()
    }
}

impl BlockStore for MemBlockStore {
    fn save_block(&mut self, block: &Block, parts: &PartSet, seen_commit: &Commit) {
        self.0.lock().unwrap().insert(
            block.height(),
            StoredBlock {
                block: block.clone(),
                parts: parts.clone(),
                seen_commit: seen_commit.clone(),
                extended_commit: None,
            },
        );
    }

    fn save_block_with_extended_commit(
        &mut self,
        block: &Block,
        parts: &PartSet,
        seen_extended_commit: &ExtendedCommit,
    ) {
        self.0.lock().unwrap().insert(
            block.height(),
            StoredBlock {
                block: block.clone(),
                parts: parts.clone(),
                seen_commit: seen_extended_commit.to_commit(),
                extended_commit: Some(seen_extended_commit.clone()),
            },
        );
    }

    fn load_block(&self, height: Height) -> Option<Block> {
        self.get(height).map(|stored| stored.block)
    }

    fn load_block_meta(&self, height: Height) -> Option<BlockMeta> {
        self.get(height)
            .map(|stored| BlockMeta::new(&stored.block, &stored.parts))
    }

    fn load_block_part(&self, height: Height, index: u32) -> Option<Part> {
        self.get(height)
            .and_then(|stored| stored.parts.get_part(index as usize).cloned())
    }

    fn load_seen_commit(&self, height: Height) -> Option<Commit> {
        self.get(height).map(|stored| stored.seen_commit)
    }

    fn load_block_commit(&self, height: Height) -> Option<Commit> {
        self.get(height + 1)
            .and_then(|stored| stored.block.last_commit)
    }

    fn load_block_extended_commit(&self, height: Height) -> Option<ExtendedCommit> {
        self.get(height).and_then(|stored| stored.extended_commit)
    }

    fn height(&self) -> Height {
        self.0
            .lock()
            .unwrap()
            .keys()
            .next_back()
            .copied()
            .unwrap_or_default()
    }

    fn base(&self) -> Height {
        self.0
            .lock()
            .unwrap()
            .keys()
            .next()
            .copied()
            .unwrap_or_default()
    }
}

/// Executor whose app state is the number of blocks it executed. Every block carries one transaction:
/// its height.
#[derive(Clone, Default)]
pub(crate) struct NumberExecutor {
    pub(crate) reject_proposals: bool,
}

impl NumberExecutor {
    pub(crate) fn app_hash(number: i64) -> CryptoHash {
        CryptoHash::digest(&number.to_le_bytes())
    }
}

impl BlockExecutor for NumberExecutor {
    fn create_proposal_block(
        &mut self,
        height: Height,
        state: &State,
        last_extended_commit: Option<&ExtendedCommit>,
        proposer_address: Address,
    ) -> Result<Block, BlockExecutorError> {
        let last_commit = last_extended_commit.map(|extended_commit| extended_commit.to_commit());
        let time = state.block_time(height, last_commit.as_ref());
        Ok(state.make_block(
            height,
            vec![height.int().to_le_bytes().to_vec()],
            last_commit,
            proposer_address,
            time,
        ))
    }

    fn process_proposal(&mut self, _block: &Block, _state: &State) -> Result<bool, BlockExecutorError> {
        Ok(!self.reject_proposals)
    }

    fn apply_block(
        &mut self,
        state: &State,
        block_id: BlockID,
        block: &Block,
    ) -> Result<State, BlockExecutorError> {
        let app_hash = NumberExecutor::app_hash(block.height().int());
        Ok(state.advance(block_id, &block.header, app_hash))
    }

    fn extend_vote(
        &mut self,
        vote: &Vote,
        _block: &Block,
        _state: &State,
    ) -> Result<Vec<u8>, BlockExecutorError> {
        Ok(vote.height.int().to_le_bytes().to_vec())
    }

    fn verify_vote_extension(&mut self, vote: &Vote) -> Result<(), BlockExecutorError> {
        if vote.extension == vote.height.int().to_le_bytes().to_vec() {
            Ok(())
        } else {
            Err(BlockExecutorError::InvalidVoteExtension {
                reason: "extension is not the vote's height".to_string(),
            })
        }
    }
}

/// Evidence pool that keeps everything reported to it.
#[derive(Clone, Default)]
pub(crate) struct RecordingEvidencePool(pub(crate) Arc<Mutex<Vec<DuplicateVoteEvidence>>>);

impl RecordingEvidencePool {
    pub(crate) fn reported(&self) -> Vec<DuplicateVoteEvidence> {
        self.0.lock().unwrap().clone()
    }
}

impl EvidencePool for RecordingEvidencePool {
    fn report_conflicting_votes(&mut self, evidence: DuplicateVoteEvidence) {
        self.0.lock().unwrap().push(evidence)
    }
}

/// `n` equally powerful validators. The i-th signing key belongs to the validator with index i.
pub(crate) fn validators(n: usize) -> (ValidatorSet, Vec<SigningKey>) {
    let mut keys: Vec<SigningKey> = (0..n).map(|_| SigningKey::generate(&mut OsRng)).collect();
    keys.sort_by_key(|key| Address::from_verifying_key(&key.verifying_key()));
    let validators = keys
        .iter()
        .map(|key| Validator::new(key.verifying_key(), Power::new(10)))
        .collect();
    (ValidatorSet::new(validators).unwrap(), keys)
}

pub(crate) fn genesis_state(validator_set: ValidatorSet, consensus_params: ConsensusParams) -> State {
    State::from_genesis(
        chain_id(),
        Height::new(1),
        Timestamp::now(),
        validator_set,
        consensus_params,
    )
}

/// Timeouts long enough that they never fire during a test. Tests step the state machine by hand.
pub(crate) fn config() -> ConsensusConfiguration {
    ConsensusConfiguration {
        timeout_propose: Duration::from_secs(60),
        timeout_propose_delta: Duration::from_secs(1),
        timeout_vote: Duration::from_secs(60),
        timeout_vote_delta: Duration::from_secs(1),
        timeout_commit: Duration::from_secs(60),
        skip_timeout_commit: false,
        create_empty_blocks: true,
        create_empty_blocks_interval: Duration::ZERO,
        double_sign_check_height: 0,
    }
}

/// A state machine and the receiving ends of its channels.
pub(crate) struct Harness {
    pub(crate) consensus: TestConsensus,
    pub(crate) block_store: MemBlockStore,
    pub(crate) evidence_pool: RecordingEvidencePool,
    pub(crate) events: Receiver<Event>,
    // Kept so that the ticker's sends do not fail.
    _timeouts: Receiver<ConsensusInput>,
}

impl Harness {
    /// Run round 0 of the current height to its commit, with every internal message processed.
    pub(crate) fn commit_height(&mut self) {
        let height = self.consensus.rs.height;
        self.consensus.enter_new_round(height, Round::new(0)).unwrap();
        self.consensus.drain_internal_queue().unwrap();
        self.consensus.publish_snapshot();
        assert_eq!(self.consensus.rs.height, height + 1);
    }
}

pub(crate) struct HarnessBuilder {
    state: State,
    config: ConsensusConfiguration,
    block_store: MemBlockStore,
    priv_validator: Option<Box<dyn PrivValidator>>,
    wal: Box<dyn Wal>,
    executor: NumberExecutor,
}

impl HarnessBuilder {
    pub(crate) fn new(state: State) -> HarnessBuilder {
        HarnessBuilder {
            state,
            config: config(),
            block_store: MemBlockStore::default(),
            priv_validator: None,
            wal: Box::new(NilWal),
            executor: NumberExecutor::default(),
        }
    }

    pub(crate) fn config(mut self, config: ConsensusConfiguration) -> HarnessBuilder {
        self.config = config;
        self
    }

    pub(crate) fn block_store(mut self, block_store: MemBlockStore) -> HarnessBuilder {
        self.block_store = block_store;
        self
    }

    pub(crate) fn signer(mut self, priv_validator: LocalPrivValidator) -> HarnessBuilder {
        self.priv_validator = Some(Box::new(priv_validator));
        self
    }

    pub(crate) fn wal(mut self, wal: impl Wal + 'static) -> HarnessBuilder {
        self.wal = Box::new(wal);
        self
    }

    pub(crate) fn executor(mut self, executor: NumberExecutor) -> HarnessBuilder {
        self.executor = executor;
        self
    }

    pub(crate) fn build(self) -> Harness {
        let (timeout_sender, timeouts) = mpsc::sync_channel(1000);
        let (event_sender, events): (Sender<Event>, Receiver<Event>) = mpsc::channel();
        let evidence_pool = RecordingEvidencePool::default();
        let consensus = ConsensusState::new(
            self.config,
            self.state,
            self.executor,
            self.block_store.clone(),
            evidence_pool.clone(),
            self.priv_validator,
            self.wal,
            timeout_sender,
            Some(event_sender),
            None,
        )
        .unwrap();
        Harness {
            consensus,
            block_store: self.block_store,
            evidence_pool,
            events,
            _timeouts: timeouts,
        }
    }
}

/// A vote signed by the validator with `index`, without a vote extension.
pub(crate) fn signed_vote(
    key: &SigningKey,
    validator_set: &ValidatorSet,
    height: Height,
    round: Round,
    vote_type: VoteType,
    block_id: BlockID,
) -> Vote {
    let address = Address::from_verifying_key(&key.verifying_key());
    let (index, _) = validator_set.get_by_address(&address).unwrap();
    let mut vote = Vote {
        vote_type,
        height,
        round,
        block_id,
        timestamp: Timestamp::now(),
        validator_address: address,
        validator_index: index as i32,
        signature: SignatureBytes::zero(),
        extension: Vec::new(),
        extension_signature: None,
    };
    vote.signature = Keypair::new(key.clone()).sign(&vote.sign_bytes(chain_id()));
    vote
}
