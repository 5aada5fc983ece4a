/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a replica.
//!
//! tendermint_rs works to safely replicate a state machine in multiple processes. In our terminology,
//! these processes are called 'replicas'. Replicas whose key is in the validator set sign proposals and
//! votes; the others only follow consensus.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the replica](ReplicaSpec) with:
//!   1. `ReplicaSpec::builder` to construct a `ReplicaSpecBuilder`,
//!   2. The setters of the `ReplicaSpecBuilder`, and
//!   3. The `ReplicaSpecBuilder::build` method to construct a [ReplicaSpec],
//! - The function to [start](ReplicaSpec::start) a [Replica] given its specification,
//! - [The type](Replica) which keeps the replica alive.
//!
//! ## Starting a replica
//!
//! ```ignore
//! let replica =
//!     ReplicaSpec::builder()
//!     .executor(executor)
//!     .block_store(block_store)
//!     .mempool(mempool)
//!     .evidence_pool(evidence_pool)
//!     .network(network)
//!     .configuration(configuration)
//!     .state(state)
//!     .priv_validator(LocalPrivValidator::new(signing_key))
//!     .on_new_block(new_block_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! `state` is the chain state after the highest block in `block_store`, or the genesis state if the
//! store is empty.
//!
//! ### Required setters
//!
//! - `.executor(...)`
//! - `.block_store(...)`
//! - `.mempool(...)`
//! - `.evidence_pool(...)`
//! - `.network(...)`
//! - `.configuration(...)`
//! - `.state(...)`
//!
//! ### Optional setters
//!
//! `.priv_validator(...)` makes the replica a signer. The rest register user-defined event handlers
//! for events from [crate::events]:
//! - `.on_new_round(...)`
//! - `.on_new_round_step(...)`
//! - `.on_complete_proposal(...)`
//! - `.on_polka(...)`
//! - `.on_lock(...)`
//! - `.on_relock(...)`
//! - `.on_valid_block(...)`
//! - `.on_timeout_propose(...)`
//! - `.on_timeout_wait(...)`
//! - `.on_new_block(...)`
//! - `.on_vote(...)`
//! - `.on_evidence(...)`
//! - `.on_receive_proposal(...)`
//! - `.on_receive_vote(...)`
//!
//! The replica's [configuration](Configuration) can also be defined using the builder pattern, for
//! example:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .chain_id(ChainID::new(0))
//!     .wal_path(Some(PathBuf::from("data/cs.wal")))
//!     .timeout_commit(Duration::from_millis(500))
//!     .log_events(true)
//!     .build()
//! ```

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::{
    app::BlockExecutor,
    consensus::{
        errors::ConsensusError,
        inputs::ConsensusInputSender,
        round_state::RoundState,
        state::{ConsensusConfiguration, ConsensusState},
    },
    event_bus::*,
    events::*,
    networking::{network::Network, receiving::start_polling},
    pluggables::{BlockStore, EvidencePool, Mempool},
    privval::PrivValidator,
    reactor::{Reactor, ReactorConfiguration},
    types::{
        data_types::{ChainID, Round, Timestamp},
        state::State,
    },
    wal::{file_wal::FileWal, nil_wal::NilWal, Wal, WalError},
};

/// Stores the user-defined parameters required to start the replica.
///
/// ## Timeouts
///
/// The propose, prevote, and precommit timeouts of round `r` are `timeout_x + r * timeout_x_delta`, so
/// that rounds get longer until the network is fast enough for a round to succeed. After a block is
/// committed, the next height starts `timeout_commit` later, unless `skip_timeout_commit` is set and
/// all precommits were received.
///
/// ## WAL
///
/// If `wal_path` is `None`, nothing is written ahead, and a restarted replica starts its height from
/// scratch. This is only safe for replicas that do not sign.
///
/// ## Log Events
///
/// tendermint_rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.chain_id(...)`

    Optional (defaults in parentheses):
    - `.wal_path(...)` (`None`)
    - `.timeout_propose(...)` (3s)
    - `.timeout_propose_delta(...)` (500ms)
    - `.timeout_vote(...)` (1s)
    - `.timeout_vote_delta(...)` (500ms)
    - `.timeout_commit(...)` (1s)
    - `.skip_timeout_commit(...)` (`false`)
    - `.create_empty_blocks(...)` (`true`)
    - `.create_empty_blocks_interval(...)` (0s)
    - `.peer_gossip_sleep_duration(...)` (100ms)
    - `.peer_query_maj23_sleep_duration(...)` (2s)
    - `.double_sign_check_height(...)` (0)
    - `.msg_queue_size(...)` (1000)
    - `.log_events(...)` (`false`)
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the chain ID of the blockchain. Must equal the chain ID of the initial state. Required."))]
    pub chain_id: ChainID,
    #[builder(default, setter(doc = "Set the path of the write-ahead log file. Optional."))]
    pub wal_path: Option<PathBuf>,
    #[builder(default = Duration::from_millis(3000), setter(doc = "Set how long to wait for a proposal in round 0. Optional."))]
    pub timeout_propose: Duration,
    #[builder(default = Duration::from_millis(500), setter(doc = "Set how much longer to wait for a proposal in each later round. Optional."))]
    pub timeout_propose_delta: Duration,
    #[builder(default = Duration::from_millis(1000), setter(doc = "Set how long to wait for more votes after seeing two-thirds of any votes in round 0. Optional."))]
    pub timeout_vote: Duration,
    #[builder(default = Duration::from_millis(500), setter(doc = "Set how much longer to wait for more votes in each later round. Optional."))]
    pub timeout_vote_delta: Duration,
    #[builder(default = Duration::from_millis(1000), setter(doc = "Set how long to wait after committing a block before starting the next height. Optional."))]
    pub timeout_commit: Duration,
    #[builder(default = false, setter(doc = "Start the next height as soon as all precommits are in, instead of waiting for timeout_commit. Optional."))]
    pub skip_timeout_commit: bool,
    #[builder(default = true, setter(doc = "Propose blocks even if there are no transactions. Optional."))]
    pub create_empty_blocks: bool,
    #[builder(default = Duration::ZERO, setter(doc = "If non-zero, wait this long for transactions before proposing an empty block. Optional."))]
    pub create_empty_blocks_interval: Duration,
    #[builder(default = Duration::from_millis(100), setter(doc = "Set how long the gossip threads sleep when they have nothing to send. Optional."))]
    pub peer_gossip_sleep_duration: Duration,
    #[builder(default = Duration::from_millis(2000), setter(doc = "Set how often peers are told which blocks this replica has seen a two-thirds majority for. Optional."))]
    pub peer_query_maj23_sleep_duration: Duration,
    #[builder(default = 0, setter(doc = "Refuse to start if this replica's key signed any of this many latest commits. Optional."))]
    pub double_sign_check_height: u64,
    #[builder(default = 1000, setter(doc = "Set the capacity of the consensus input queue. Optional."))]
    pub msg_queue_size: usize,
    #[builder(default = false, setter(doc = "Enable logging of events? Optional."))]
    pub log_events: bool,
}

impl Configuration {
    /// Reject values that cannot work.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.msg_queue_size == 0 {
            return Err(ConfigurationError::ZeroQueueSize);
        }
        let positive = [
            ("timeout_propose", self.timeout_propose),
            ("timeout_vote", self.timeout_vote),
            ("peer_gossip_sleep_duration", self.peer_gossip_sleep_duration),
            ("peer_query_maj23_sleep_duration", self.peer_query_maj23_sleep_duration),
        ];
        for (field, duration) in positive {
            if duration.is_zero() {
                return Err(ConfigurationError::ZeroDuration { field });
            }
        }
        Ok(())
    }

    /// How long to wait for a proposal in `round`.
    pub fn propose(&self, round: Round) -> Duration {
        self.consensus_configuration().propose(round)
    }

    /// How long to wait for more prevotes in `round`.
    pub fn prevote(&self, round: Round) -> Duration {
        self.consensus_configuration().prevote(round)
    }

    /// How long to wait for more precommits in `round`.
    pub fn precommit(&self, round: Round) -> Duration {
        self.consensus_configuration().precommit(round)
    }

    /// When the next height should start, given the time the last block was committed.
    pub fn commit(&self, commit_time: Timestamp) -> Timestamp {
        self.consensus_configuration().commit(commit_time)
    }

    /// Whether round 0 of a height waits for transactions before proposing.
    pub fn wait_for_txs(&self) -> bool {
        self.consensus_configuration().wait_for_txs()
    }

    fn consensus_configuration(&self) -> ConsensusConfiguration {
        ConsensusConfiguration {
            timeout_propose: self.timeout_propose,
            timeout_propose_delta: self.timeout_propose_delta,
            timeout_vote: self.timeout_vote,
            timeout_vote_delta: self.timeout_vote_delta,
            timeout_commit: self.timeout_commit,
            skip_timeout_commit: self.skip_timeout_commit,
            create_empty_blocks: self.create_empty_blocks,
            create_empty_blocks_interval: self.create_empty_blocks_interval,
            double_sign_check_height: self.double_sign_check_height,
        }
    }

    /// Split into the configurations of the consensus state machine and the reactor. The reactor also
    /// needs to know the chain's initial height and feature params, which come from `state`.
    fn split(&self, state: &State) -> (ConsensusConfiguration, ReactorConfiguration) {
        let reactor_config = ReactorConfiguration {
            peer_gossip_sleep_duration: self.peer_gossip_sleep_duration,
            peer_query_maj23_sleep_duration: self.peer_query_maj23_sleep_duration,
            initial_height: state.initial_height,
            feature: state.consensus_params.feature,
        };
        (self.consensus_configuration(), reactor_config)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("msg_queue_size must be positive")]
    ZeroQueueSize,
    #[error("{field} must be positive")]
    ZeroDuration { field: &'static str },
    #[error("configured chain ID {configured:?} differs from the state's chain ID {state:?}")]
    ChainIDMismatch { configured: ChainID, state: ChainID },
}

/// Why a replica failed to start.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("could not open the WAL: {0}")]
    Wal(#[from] WalError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

/// Stores all necessary parameters and trait implementations required to run the [Replica].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ReplicaSpec]. On the builder call the following methods to construct a valid [ReplicaSpec].

    Required:
    - `.executor(...)`
    - `.block_store(...)`
    - `.mempool(...)`
    - `.evidence_pool(...)`
    - `.network(...)`
    - `.configuration(...)`
    - `.state(...)`

    Optional:
    - `.priv_validator(...)`
    - `.on_new_round(...)`
    - `.on_new_round_step(...)`
    - `.on_complete_proposal(...)`
    - `.on_polka(...)`
    - `.on_lock(...)`
    - `.on_relock(...)`
    - `.on_valid_block(...)`
    - `.on_timeout_propose(...)`
    - `.on_timeout_wait(...)`
    - `.on_new_block(...)`
    - `.on_vote(...)`
    - `.on_evidence(...)`
    - `.on_receive_proposal(...)`
    - `.on_receive_vote(...)`
"))]
pub struct ReplicaSpec<E, S, M, P, N>
where
    E: BlockExecutor,
    S: BlockStore,
    M: Mempool,
    P: EvidencePool,
    N: Network + 'static,
{
    // Required parameters
    #[builder(setter(doc = "Set the block executor, through which consensus talks to the application. Required."))]
    executor: E,
    #[builder(setter(doc = "Set the store of committed blocks. Required."))]
    block_store: S,
    #[builder(setter(doc = "Set the mempool, which tells consensus when transactions are available. Required."))]
    mempool: M,
    #[builder(setter(doc = "Set the evidence pool, which receives conflicting votes. Required."))]
    evidence_pool: P,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::network::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a replica. Required."))]
    configuration: Configuration,
    #[builder(setter(doc = "Set the chain state after the highest stored block, or the genesis state. Required."))]
    state: State,
    // Optional parameters
    #[builder(default, setter(transform = |priv_validator: impl PrivValidator| Some(Box::new(priv_validator) as Box<dyn PrivValidator>),
    doc = "Set the signer of this replica's proposals and votes. Without one, the replica only follows consensus. Optional."))]
    priv_validator: Option<Box<dyn PrivValidator>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewRoundEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewRoundEvent>),
    doc = "Register a handler closure to be invoked after the replica enters a new round. Optional."))]
    on_new_round: Option<HandlerPtr<NewRoundEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewRoundStepEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewRoundStepEvent>),
    doc = "Register a handler closure to be invoked after every step change. Optional."))]
    on_new_round_step: Option<HandlerPtr<NewRoundStepEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CompleteProposalEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CompleteProposalEvent>),
    doc = "Register a handler closure to be invoked after every part of the proposal block is received. Optional."))]
    on_complete_proposal: Option<HandlerPtr<CompleteProposalEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PolkaEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PolkaEvent>),
    doc = "Register a handler closure to be invoked after the replica sees a two-thirds majority of prevotes. Optional."))]
    on_polka: Option<HandlerPtr<PolkaEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&LockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<LockEvent>),
    doc = "Register a handler closure to be invoked after the replica locks on a block. Optional."))]
    on_lock: Option<HandlerPtr<LockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RelockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RelockEvent>),
    doc = "Register a handler closure to be invoked after the replica relocks on its locked block. Optional."))]
    on_relock: Option<HandlerPtr<RelockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ValidBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ValidBlockEvent>),
    doc = "Register a handler closure to be invoked after the replica updates its valid block. Optional."))]
    on_valid_block: Option<HandlerPtr<ValidBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TimeoutProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TimeoutProposeEvent>),
    doc = "Register a handler closure to be invoked after the propose timeout fires. Optional."))]
    on_timeout_propose: Option<HandlerPtr<TimeoutProposeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TimeoutWaitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TimeoutWaitEvent>),
    doc = "Register a handler closure to be invoked after a prevote or precommit wait timeout fires. Optional."))]
    on_timeout_wait: Option<HandlerPtr<TimeoutWaitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is committed and applied. Optional."))]
    on_new_block: Option<HandlerPtr<NewBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&VoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<VoteEvent>),
    doc = "Register a handler closure to be invoked after a vote is added. Optional."))]
    on_vote: Option<HandlerPtr<VoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EvidenceEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EvidenceEvent>),
    doc = "Register a handler closure to be invoked after conflicting votes are detected. Optional."))]
    on_evidence: Option<HandlerPtr<EvidenceEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveProposalEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveProposalEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a proposal. Optional."))]
    on_receive_proposal: Option<HandlerPtr<ReceiveProposalEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveVoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveVoteEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a vote from a peer. Optional."))]
    on_receive_vote: Option<HandlerPtr<ReceiveVoteEvent>>,
}

impl<E, S, M, P, N> ReplicaSpec<E, S, M, P, N>
where
    E: BlockExecutor,
    S: BlockStore,
    M: Mempool,
    P: EvidencePool,
    N: Network + 'static,
{
    /// Replays the WAL, checks for double signing risk, then starts all threads and channels
    /// associated with running a replica, and returns the handles to them in a [Replica] struct.
    pub fn start(mut self) -> Result<Replica, StartError> {
        self.configuration.validate()?;
        if self.configuration.chain_id != self.state.chain_id {
            return Err(ConfigurationError::ChainIDMismatch {
                configured: self.configuration.chain_id,
                state: self.state.chain_id,
            }
            .into());
        }
        let (consensus_config, reactor_config) = self.configuration.split(&self.state);

        let wal: Box<dyn Wal> = match &self.configuration.wal_path {
            Some(path) => Box::new(FileWal::open(path)?),
            None => Box::new(NilWal),
        };

        let event_handlers = EventHandlers::new(
            self.configuration.log_events,
            UserHandlers {
                on_new_round: self.on_new_round,
                on_new_round_step: self.on_new_round_step,
                on_complete_proposal: self.on_complete_proposal,
                on_polka: self.on_polka,
                on_lock: self.on_lock,
                on_relock: self.on_relock,
                on_valid_block: self.on_valid_block,
                on_timeout_propose: self.on_timeout_propose,
                on_timeout_wait: self.on_timeout_wait,
                on_new_block: self.on_new_block,
                on_vote: self.on_vote,
                on_evidence: self.on_evidence,
                on_receive_proposal: self.on_receive_proposal,
                on_receive_vote: self.on_receive_vote,
            },
        );
        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let (input_sender, inputs) = mpsc::sync_channel(self.configuration.msg_queue_size);
        let (reactor_sender, reactor_inputs) = mpsc::channel();

        let consensus = ConsensusState::new(
            consensus_config,
            self.state,
            self.executor,
            self.block_store.clone(),
            self.evidence_pool,
            self.priv_validator,
            wal,
            input_sender.clone(),
            event_publisher,
            Some(reactor_sender.clone()),
        )?;
        let round_state = consensus.snapshot();
        let input_sender = ConsensusInputSender::new(input_sender);

        // Consensus replays the WAL before its thread is spawned. Nothing else runs until it succeeds.
        let (consensus_shutdown, consensus_shutdown_receiver) = mpsc::channel();
        let consensus = consensus.start(inputs, consensus_shutdown_receiver)?;

        let (event_bus_shutdown, event_bus_shutdown_receiver) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };
        let event_bus = match (event_subscriber, event_bus_shutdown_receiver) {
            (Some(event_subscriber), Some(shutdown_receiver)) => {
                Some(start_event_bus(event_handlers, event_subscriber, shutdown_receiver))
            }
            _ => None,
        };

        let (mempool_notifier_shutdown, mempool_notifier_shutdown_receiver) = mpsc::channel();
        let mempool_notifier = start_mempool_notifier(
            self.mempool.txs_available(),
            input_sender.clone(),
            mempool_notifier_shutdown_receiver,
        );

        let (reactor_shutdown, reactor_shutdown_receiver) = mpsc::channel();
        let reactor = Reactor::new(
            reactor_config,
            self.network.clone(),
            self.block_store,
            input_sender.clone(),
            Arc::clone(&round_state),
        )
        .start(reactor_inputs, reactor_shutdown_receiver);

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let poller = start_polling(self.network, poller_shutdown_receiver, reactor_sender);

        Ok(Replica {
            round_state,
            input_sender,
            consensus: Some(consensus),
            consensus_shutdown,
            mempool_notifier: Some(mempool_notifier),
            mempool_notifier_shutdown,
            reactor: Some(reactor),
            reactor_shutdown,
            poller: Some(poller),
            poller_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// Forward every "transactions available" notification of the mempool to consensus.
fn start_mempool_notifier(
    txs_available: Receiver<()>,
    input_sender: ConsensusInputSender,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                log::error!("Mempool notifier thread disconnected from main thread");
                return;
            }
        }

        match txs_available.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => input_sender.txs_available(),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}

/// A handle to the background threads of a tendermint_rs replica. When this value is dropped, all
/// background threads are gracefully shut down.
pub struct Replica {
    round_state: Arc<RwLock<RoundState>>,
    input_sender: ConsensusInputSender,
    consensus: Option<JoinHandle<()>>,
    consensus_shutdown: Sender<()>,
    mempool_notifier: Option<JoinHandle<()>>,
    mempool_notifier_shutdown: Sender<()>,
    reactor: Option<JoinHandle<()>>,
    reactor_shutdown: Sender<()>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Replica {
    /// A copy of the consensus round state, as of the last input that consensus processed.
    pub fn round_state(&self) -> RoundState {
        match self.round_state.read() {
            Ok(rs) => rs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// A handle for feeding inputs into consensus, e.g., blocks verified by block sync.
    pub fn input_sender(&self) -> ConsensusInputSender {
        self.input_sender.clone()
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        // The reactor must stop before the poller that feeds it. The event bus stops last and handles
        // the events of the last inputs.
        let _ = self.consensus_shutdown.send(());
        if let Some(consensus) = self.consensus.take() {
            let _ = consensus.join();
        }

        let _ = self.mempool_notifier_shutdown.send(());
        if let Some(mempool_notifier) = self.mempool_notifier.take() {
            let _ = mempool_notifier.join();
        }

        let _ = self.reactor_shutdown.send(());
        if let Some(reactor) = self.reactor.take() {
            let _ = reactor.join();
        }

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }

        if let Some(shutdown) = &self.event_bus_shutdown {
            let _ = shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }
    }
}
