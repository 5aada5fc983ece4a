/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::{
    path::PathBuf,
    sync::{mpsc::Sender, Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use tendermint_rs::{
    events::{EvidenceEvent, NewBlockEvent, ReceiveProposalEvent, VoteEvent},
    pluggables::BlockStore,
    privval::LocalPrivValidator,
    replica::{Configuration, Replica, ReplicaSpec, StartError},
    types::{
        data_types::{Address, ChainID, CryptoHash, Height, PeerID, Power, Timestamp},
        evidence::DuplicateVoteEvidence,
        params::ConsensusParams,
        state::State,
        validator_set::{Validator, ValidatorSet},
    },
};

use super::{
    logging::{first_seven_base64_chars, log_with_context},
    mem_block_store::MemBlockStore,
    network::NetworkStub,
    number_executor::{NumberExecutor, RecordingEvidencePool, StubMempool},
};

pub(crate) const CHAIN_ID: ChainID = ChainID::new(7);

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

pub(crate) fn genesis_state(validator_set: ValidatorSet) -> State {
    State::from_genesis(
        CHAIN_ID,
        Height::new(1),
        Timestamp::now(),
        validator_set,
        ConsensusParams::default(),
    )
}

pub(crate) fn peer_id(key: &SigningKey) -> PeerID {
    PeerID::from(&key.verifying_key())
}

/// What a node is started with. Nodes of one cluster share the genesis state and differ in the rest.
pub(crate) struct NodeSpec {
    pub(crate) signing_key: Option<SigningKey>,
    pub(crate) network: NetworkStub,
    pub(crate) state: State,
    pub(crate) block_store: MemBlockStore,
    pub(crate) wal_path: Option<PathBuf>,
    pub(crate) double_sign_check_height: u64,
}

impl NodeSpec {
    pub(crate) fn new(signing_key: Option<SigningKey>, network: NetworkStub, state: State) -> NodeSpec {
        NodeSpec {
            signing_key,
            network,
            state,
            block_store: MemBlockStore::new(),
            wal_path: None,
            double_sign_check_height: 0,
        }
    }
}

pub(crate) struct Node {
    peer_id: PeerID,
    network: NetworkStub,
    executor: NumberExecutor,
    block_store: MemBlockStore,
    evidence_pool: RecordingEvidencePool,
    txs_available: Sender<()>,
    new_blocks: Arc<Mutex<Vec<(Height, CryptoHash)>>>,
    replica: Replica,
}

impl Node {
    pub(crate) fn start(spec: NodeSpec) -> Result<Node, StartError> {
        let peer_id = spec.network.peer_id();
        let context = peer_id.bytes();
        let executor = NumberExecutor::new(spec.state.clone());
        let evidence_pool = RecordingEvidencePool::default();
        let mempool = StubMempool::new();
        let txs_available = mempool.notifier();
        let new_blocks = Arc::new(Mutex::new(Vec::new()));

        let configuration = Configuration::builder()
            .chain_id(CHAIN_ID)
            .wal_path(spec.wal_path)
            .timeout_propose(Duration::from_millis(1000))
            .timeout_propose_delta(Duration::from_millis(200))
            .timeout_vote(Duration::from_millis(300))
            .timeout_vote_delta(Duration::from_millis(100))
            .timeout_commit(Duration::from_millis(100))
            .peer_gossip_sleep_duration(Duration::from_millis(20))
            .peer_query_maj23_sleep_duration(Duration::from_millis(500))
            .double_sign_check_height(spec.double_sign_check_height)
            .log_events(false)
            .build();

        let replica_spec = ReplicaSpec::builder()
            .executor(executor.clone())
            .block_store(spec.block_store.clone())
            .mempool(mempool)
            .evidence_pool(evidence_pool.clone())
            .network(spec.network.clone())
            .configuration(configuration)
            .state(spec.state)
            .on_new_block(new_block_handler(context, Arc::clone(&new_blocks)))
            .on_receive_proposal(receive_proposal_handler(context))
            .on_vote(vote_handler(context))
            .on_evidence(evidence_handler(context));

        let replica = match spec.signing_key {
            Some(signing_key) => replica_spec
                .priv_validator(LocalPrivValidator::new(signing_key))
                .build()
                .start()?,
            None => replica_spec.build().start()?,
        };

        Ok(Node {
            peer_id,
            network: spec.network,
            executor,
            block_store: spec.block_store,
            evidence_pool,
            txs_available,
            new_blocks,
            replica,
        })
    }

    pub(crate) fn peer_id(&self) -> PeerID {
        self.peer_id
    }

    pub(crate) fn network(&self) -> &NetworkStub {
        &self.network
    }

    /// The height that consensus is working on.
    pub(crate) fn consensus_height(&self) -> Height {
        self.replica.round_state().height
    }

    /// Height of the highest committed block.
    pub(crate) fn committed_height(&self) -> Height {
        self.block_store.height()
    }

    pub(crate) fn block_hash(&self, height: Height) -> Option<CryptoHash> {
        self.block_store.load_block(height).map(|block| block.hash())
    }

    pub(crate) fn app_hash(&self) -> CryptoHash {
        self.executor.latest_state().app_hash
    }

    /// Heights and hashes of the blocks committed since this node started, in order.
    pub(crate) fn new_blocks(&self) -> Vec<(Height, CryptoHash)> {
        self.new_blocks.lock().unwrap().clone()
    }

    pub(crate) fn evidence(&self) -> Vec<DuplicateVoteEvidence> {
        self.evidence_pool.reported()
    }

    pub(crate) fn notify_txs_available(&self) {
        let _ = self.txs_available.send(());
    }

    /// Stop every thread of the node, returning what a restarted node continues from.
    pub(crate) fn stop(self) -> (MemBlockStore, State) {
        drop(self.replica);
        (self.block_store, self.executor.latest_state())
    }
}

/// Poll `condition` until it holds, panicking after `timeout`.
pub(crate) fn wait_until(timeout: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting until {}", what);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn new_block_handler(
    context: [u8; 32],
    new_blocks: Arc<Mutex<Vec<(Height, CryptoHash)>>>,
) -> impl Fn(&NewBlockEvent) + Send + 'static {
    move |new_block_event| {
        log_with_context(
            Some(context),
            &format!(
                "Committed block, height: {}, block hash: {}",
                new_block_event.block.height(),
                first_seven_base64_chars(&new_block_event.block_id.hash.bytes())
            ),
        );
        new_blocks
            .lock()
            .unwrap()
            .push((new_block_event.block.height(), new_block_event.block_id.hash));
    }
}

fn receive_proposal_handler(context: [u8; 32]) -> impl Fn(&ReceiveProposalEvent) + Send + 'static {
    move |receive_proposal_event| {
        let proposal = &receive_proposal_event.proposal;
        log_with_context(
            Some(context),
            &format!(
                "Received proposal, height: {}, round: {}, block hash: {}",
                proposal.height,
                proposal.round,
                first_seven_base64_chars(&proposal.block_id.hash.bytes())
            ),
        );
    }
}

fn vote_handler(context: [u8; 32]) -> impl Fn(&VoteEvent) + Send + 'static {
    move |vote_event| {
        let vote = &vote_event.vote;
        log_with_context(
            Some(context),
            &format!(
                "Added vote, height: {}, round: {}, type: {:?}, validator: {}",
                vote.height,
                vote.round,
                vote.vote_type,
                first_seven_base64_chars(&vote.validator_address.bytes())
            ),
        );
    }
}

fn evidence_handler(context: [u8; 32]) -> impl Fn(&EvidenceEvent) + Send + 'static {
    move |evidence_event| {
        log_with_context(
            Some(context),
            &format!(
                "Detected equivocation, validator: {}, height: {}",
                first_seven_base64_chars(&evidence_event.evidence.address().bytes()),
                evidence_event.evidence.height()
            ),
        );
    }
}
