/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`ConsensusState`] struct and its receive routine.
//!
//! The step functions are in [`steps`](super::steps), message handling in
//! [`handlers`](super::handlers), and WAL replay in [`replay`](super::replay).

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crate::{
    app::BlockExecutor,
    events::{Event, NewRoundStepEvent, TimeoutProposeEvent, TimeoutWaitEvent},
    networking::messages::Message,
    pluggables::{BlockStore, EvidencePool},
    privval::PrivValidator,
    reactor::{ReactorInput, StateNotice},
    timeout_ticker::{TimeoutInfo, TimeoutTicker},
    types::{
        commit::BlockIDFlag,
        crypto_primitives::VerifyingKey,
        data_types::{Address, Height, Round, Timestamp},
        state::State,
    },
    votes::{height_vote_set::HeightVoteSet, vote_set::VoteSet},
    wal::{messages::WalMessage, Wal},
};

use super::{
    errors::ConsensusError,
    ingest::IngestError,
    inputs::{ConsensusInput, MsgInfo},
    round_state::{RoundState, RoundStepType},
};

/// How long the receive routine waits for an input before checking the shutdown signal again.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration variables for the [`ConsensusState`] struct.
#[derive(Clone, Debug)]
pub(crate) struct ConsensusConfiguration {
    pub(crate) timeout_propose: Duration,
    pub(crate) timeout_propose_delta: Duration,
    pub(crate) timeout_vote: Duration,
    pub(crate) timeout_vote_delta: Duration,
    pub(crate) timeout_commit: Duration,
    pub(crate) skip_timeout_commit: bool,
    pub(crate) create_empty_blocks: bool,
    pub(crate) create_empty_blocks_interval: Duration,
    pub(crate) double_sign_check_height: u64,
}

impl ConsensusConfiguration {
    /// How long to wait for a proposal in `round`.
    pub(crate) fn propose(&self, round: Round) -> Duration {
        self.timeout_propose
            .saturating_add(self.timeout_propose_delta.saturating_mul(round.int().max(0) as u32))
    }

    /// How long to wait for more prevotes after seeing two-thirds of any prevotes in `round`.
    pub(crate) fn prevote(&self, round: Round) -> Duration {
        self.timeout_vote
            .saturating_add(self.timeout_vote_delta.saturating_mul(round.int().max(0) as u32))
    }

    /// How long to wait for more precommits after seeing two-thirds of any precommits in `round`.
    pub(crate) fn precommit(&self, round: Round) -> Duration {
        self.prevote(round)
    }

    /// When the next height should start, given the time the last one was committed.
    pub(crate) fn commit(&self, commit_time: Timestamp) -> Timestamp {
        commit_time + self.timeout_commit
    }

    /// Whether round 0 should wait for transactions before proposing.
    pub(crate) fn wait_for_txs(&self) -> bool {
        !self.create_empty_blocks || !self.create_empty_blocks_interval.is_zero()
    }
}

/// The consensus state machine of one replica.
///
/// All of its state is owned by the thread that runs its receive routine. Other threads read the
/// [`RoundState`] through the snapshot, and write into the state machine only by sending
/// [`ConsensusInput`]s.
pub(crate) struct ConsensusState<E: BlockExecutor, S: BlockStore, P: EvidencePool> {
    pub(super) config: ConsensusConfiguration,

    /// The chain state after the last committed block.
    pub(super) state: State,
    pub(super) rs: RoundState,

    pub(super) executor: E,
    pub(super) block_store: S,
    pub(super) evidence_pool: P,
    pub(super) priv_validator: Option<Box<dyn PrivValidator>>,
    pub(super) priv_validator_pub_key: Option<VerifyingKey>,

    pub(super) wal: Box<dyn Wal>,
    pub(super) ticker: TimeoutTicker,
    /// Messages produced by this replica (its proposal, block parts, and votes). Drained before any
    /// other input.
    pub(super) internal_queue: VecDeque<MsgInfo>,

    snapshot: Arc<RwLock<RoundState>>,
    pub(super) event_publisher: Option<Sender<Event>>,
    reactor: Option<Sender<ReactorInput>>,

    /// Set while messages from the WAL are being replayed.
    pub(super) replay_mode: bool,
}

impl<E: BlockExecutor, S: BlockStore, P: EvidencePool> ConsensusState<E, S, P> {
    /// Create a state machine that continues from `state`, the state after the last block in
    /// `block_store`. Fired timeouts are sent into `timeouts`, which should feed the receive routine.
    pub(crate) fn new(
        config: ConsensusConfiguration,
        state: State,
        executor: E,
        block_store: S,
        evidence_pool: P,
        priv_validator: Option<Box<dyn PrivValidator>>,
        wal: Box<dyn Wal>,
        timeouts: SyncSender<ConsensusInput>,
        event_publisher: Option<Sender<Event>>,
        reactor: Option<Sender<ReactorInput>>,
    ) -> Result<ConsensusState<E, S, P>, ConsensusError> {
        let last_commit = reconstruct_last_commit(&state, &block_store)?;
        let rs = new_round_state(
            &state,
            config.commit(Timestamp::now()),
            Timestamp::from_nanos(0),
            last_commit,
        );

        let mut consensus = ConsensusState {
            config,
            snapshot: Arc::new(RwLock::new(rs.clone())),
            state,
            rs,
            executor,
            block_store,
            evidence_pool,
            priv_validator,
            priv_validator_pub_key: None,
            wal,
            ticker: TimeoutTicker::start(timeouts),
            internal_queue: VecDeque::new(),
            event_publisher,
            reactor,
            replay_mode: false,
        };
        if let Err(err) = consensus.update_priv_validator_pub_key() {
            log::error!("Failed to get the private validator's public key: {}", err);
        }
        Ok(consensus)
    }

    /// The snapshot of the [`RoundState`] that is refreshed after every input.
    pub(crate) fn snapshot(&self) -> Arc<RwLock<RoundState>> {
        Arc::clone(&self.snapshot)
    }

    /// Replay the WAL, check that this replica did not sign any recent block, schedule round 0 of the
    /// current height, and spawn the receive routine.
    pub(crate) fn start(
        mut self,
        inputs: Receiver<ConsensusInput>,
        shutdown_signal: Receiver<()>,
    ) -> Result<JoinHandle<()>, ConsensusError> {
        self.catchup_replay(self.rs.height)?;
        self.check_double_signing_risk(self.rs.height)?;
        self.schedule_round_0();
        self.publish_snapshot();

        Ok(thread::spawn(move || self.receive_routine(inputs, shutdown_signal)))
    }

    fn receive_routine(mut self, inputs: Receiver<ConsensusInput>, shutdown_signal: Receiver<()>) {
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => break,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    log::error!("Consensus thread disconnected from main thread");
                    break;
                }
            }

            let result = match self.internal_queue.pop_front() {
                Some(mi) => self.handle_internal_msg(mi),
                None => match inputs.recv_timeout(RECV_TIMEOUT) {
                    Ok(input) => self.handle_input(input),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            };
            self.publish_snapshot();

            if let Err(err) = result {
                log::error!(
                    "Consensus stopped at {}/{}/{}: {}",
                    self.rs.height,
                    self.rs.round,
                    self.rs.step.name(),
                    err
                );
                break;
            }
        }

        if let Err(err) = self.wal.flush_and_sync() {
            log::error!("Failed to flush the WAL on shutdown: {}", err);
        }
    }

    /// Process one input from outside the state machine.
    pub(super) fn handle_input(&mut self, input: ConsensusInput) -> Result<(), ConsensusError> {
        match input {
            ConsensusInput::Peer(mi) => {
                if let Err(err) = self.wal.write(&WalMessage::MsgInfo(mi.clone())) {
                    log::error!("Failed to write a peer message to the WAL: {}", err);
                }
                self.handle_msg(mi)
            }
            ConsensusInput::Timeout(timeout) => {
                if let Err(err) = self.wal.write(&WalMessage::Timeout(timeout.into())) {
                    log::error!("Failed to write a timeout to the WAL: {}", err);
                }
                self.handle_timeout(timeout)
            }
            ConsensusInput::TxsAvailable => self.handle_txs_available(),
            ConsensusInput::IngestVerifiedBlock(block, reply) => {
                match self.ingest_verified_block(block) {
                    Ok(outcome) => {
                        let _ = reply.send(outcome);
                        Ok(())
                    }
                    Err(err) => {
                        let _ = reply.send(Err(IngestError::Stopped));
                        Err(err)
                    }
                }
            }
        }
    }

    /// Process a message produced by this replica. The message must be durable before it is acted on.
    pub(super) fn handle_internal_msg(&mut self, mi: MsgInfo) -> Result<(), ConsensusError> {
        self.wal.write_sync(&WalMessage::MsgInfo(mi.clone()))?;
        self.handle_msg(mi)
    }

    /// Process every queued internal message.
    #[cfg(test)]
    pub(super) fn drain_internal_queue(&mut self) -> Result<(), ConsensusError> {
        while let Some(mi) = self.internal_queue.pop_front() {
            self.handle_internal_msg(mi)?;
        }
        Ok(())
    }

    pub(super) fn handle_timeout(&mut self, timeout: TimeoutInfo) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if timeout.height != rs.height
            || timeout.round < rs.round
            || (timeout.round == rs.round && timeout.step < rs.step)
        {
            log::debug!(
                "Ignoring timeout {}/{}/{}, we are at {}/{}/{}",
                timeout.height,
                timeout.round,
                timeout.step.name(),
                rs.height,
                rs.round,
                rs.step.name()
            );
            return Ok(());
        }

        match timeout.step {
            RoundStepType::NewHeight => self.enter_new_round(timeout.height, Round::new(0)),
            RoundStepType::NewRound => self.enter_propose(timeout.height, timeout.round),
            RoundStepType::Propose => {
                self.emit(Event::TimeoutPropose(TimeoutProposeEvent {
                    timestamp: SystemTime::now(),
                    height: timeout.height,
                    round: timeout.round,
                }));
                self.enter_prevote(timeout.height, timeout.round)
            }
            RoundStepType::PrevoteWait => {
                self.emit_timeout_wait(timeout);
                self.enter_precommit(timeout.height, timeout.round)
            }
            RoundStepType::PrecommitWait => {
                self.emit_timeout_wait(timeout);
                self.enter_precommit(timeout.height, timeout.round)?;
                self.enter_new_round(timeout.height, timeout.round.next())
            }
            step => {
                log::warn!("Timeout for unexpected step {}", step.name());
                Ok(())
            }
        }
    }

    fn emit_timeout_wait(&self, timeout: TimeoutInfo) {
        self.emit(Event::TimeoutWait(TimeoutWaitEvent {
            timestamp: SystemTime::now(),
            height: timeout.height,
            round: timeout.round,
            step: timeout.step,
        }));
    }

    pub(super) fn handle_txs_available(&mut self) -> Result<(), ConsensusError> {
        // Only round 0 waits for transactions.
        if self.rs.round.int() != 0 {
            return Ok(());
        }

        match self.rs.step {
            RoundStepType::NewHeight => {
                if self.need_proof_block(self.rs.height)? {
                    // enter_new_round proposes right away.
                    return Ok(());
                }
                // The extra millisecond orders the NewRound timeout after the NewHeight one.
                let timeout_commit = self
                    .rs
                    .start_time
                    .checked_duration_since(Timestamp::now())
                    .unwrap_or(Duration::ZERO)
                    + Duration::from_millis(1);
                self.schedule_timeout(
                    timeout_commit,
                    self.rs.height,
                    Round::new(0),
                    RoundStepType::NewRound,
                );
                Ok(())
            }
            RoundStepType::NewRound => self.enter_propose(self.rs.height, Round::new(0)),
            _ => Ok(()),
        }
    }

    /// Whether the block at `height` must be proposed even if there are no transactions, because it
    /// is the first block, or because the last block changed the app hash.
    pub(super) fn need_proof_block(&self, height: Height) -> Result<bool, ConsensusError> {
        if height == self.state.initial_height {
            return Ok(true);
        }
        let last_block_meta = self.block_store.load_block_meta(height - 1).ok_or_else(|| {
            ConsensusError::invariant(format!("no block meta stored for height {}", height - 1))
        })?;
        Ok(self.state.app_hash != last_block_meta.header.app_hash)
    }

    /// Move to the state after the last committed block, and start a new height.
    pub(super) fn update_to_state(&mut self, state: State) -> Result<(), ConsensusError> {
        if !self.rs.commit_round.is_nil() && self.rs.height != state.last_block_height {
            return Err(ConsensusError::invariant(format!(
                "updating to a state at height {} while committing height {}",
                state.last_block_height, self.rs.height
            )));
        }
        if !self.state.is_genesis() && self.state.last_block_height + 1 != self.rs.height {
            return Err(ConsensusError::invariant(format!(
                "inconsistent last block height {} and current height {}",
                self.state.last_block_height, self.rs.height
            )));
        }
        if state.last_block_height <= self.state.last_block_height {
            log::debug!(
                "Not updating to a state that is not ahead: new height {}, current {}",
                state.last_block_height + 1,
                self.rs.height
            );
            self.new_step();
            return Ok(());
        }

        let last_commit = if state.is_genesis() {
            None
        } else if !self.rs.commit_round.is_nil() {
            let precommits = self
                .rs
                .votes
                .precommits(self.rs.commit_round)
                .filter(|precommits| precommits.has_two_thirds_majority())
                .ok_or_else(|| {
                    ConsensusError::invariant(format!(
                        "no two-thirds majority of precommits in commit round {}",
                        self.rs.commit_round
                    ))
                })?;
            Some(precommits.clone())
        } else {
            Some(self.rs.last_commit.take().ok_or_else(|| {
                ConsensusError::invariant(format!(
                    "no last commit after block {}",
                    state.last_block_height
                ))
            })?)
        };

        let start_time = if self.rs.commit_time.is_zero() {
            self.config.commit(Timestamp::now())
        } else {
            self.config.commit(self.rs.commit_time)
        };
        self.rs = new_round_state(&state, start_time, self.rs.commit_time, last_commit);
        self.state = state;

        self.new_step();
        Ok(())
    }

    pub(super) fn update_priv_validator_pub_key(
        &mut self,
    ) -> Result<(), crate::privval::PrivValidatorError> {
        if let Some(priv_validator) = &self.priv_validator {
            let pub_key = priv_validator.pub_key()?;
            if let Some(previous) = &self.priv_validator_pub_key {
                if previous != &pub_key {
                    log::warn!(
                        "Private validator key changed from {} to {}",
                        Address::from_verifying_key(previous),
                        Address::from_verifying_key(&pub_key)
                    );
                }
            }
            self.priv_validator_pub_key = Some(pub_key);
        }
        Ok(())
    }

    pub(super) fn priv_validator_address(&self) -> Option<Address> {
        self.priv_validator_pub_key
            .as_ref()
            .map(Address::from_verifying_key)
    }

    /// Refuse to start if this replica's key signed any of the `double_sign_check_height` most recent
    /// commits before `height`: another process may be running with the same key.
    pub(super) fn check_double_signing_risk(&self, height: Height) -> Result<(), ConsensusError> {
        let address = match self.priv_validator_address() {
            Some(address) => address,
            None => return Ok(()),
        };
        let depth = self.config.double_sign_check_height as i64;
        let depth = depth.min(height.int() - 1);

        for i in 1..=depth {
            let past_height = height - i;
            if let Some(seen_commit) = self.block_store.load_seen_commit(past_height) {
                let signed = seen_commit.signatures.iter().any(|sig| {
                    sig.block_id_flag == BlockIDFlag::Commit && sig.validator_address == address
                });
                if signed {
                    return Err(ConsensusError::SignatureFoundInPastBlocks {
                        height: past_height,
                    });
                }
            }
        }
        Ok(())
    }

    pub(super) fn schedule_round_0(&self) {
        let sleep = self
            .rs
            .start_time
            .checked_duration_since(Timestamp::now())
            .unwrap_or(Duration::ZERO);
        self.schedule_timeout(sleep, self.rs.height, Round::new(0), RoundStepType::NewHeight);
    }

    pub(super) fn schedule_timeout(
        &self,
        duration: Duration,
        height: Height,
        round: Round,
        step: RoundStepType,
    ) {
        self.ticker.schedule_timeout(TimeoutInfo {
            duration,
            height,
            round,
            step,
        });
    }

    pub(super) fn update_round_step(&mut self, round: Round, step: RoundStepType) {
        self.rs.round = round;
        self.rs.step = step;
    }

    /// Record and announce the current step.
    pub(super) fn new_step(&mut self) {
        let digest = self.rs.digest();
        if !self.replay_mode {
            if let Err(err) = self.wal.write(&WalMessage::EventDataRoundState(digest)) {
                log::error!("Failed to write the round state to the WAL: {}", err);
            }
        }
        self.emit(Event::NewRoundStep(NewRoundStepEvent {
            timestamp: SystemTime::now(),
            height: digest.height,
            round: digest.round,
            step: digest.step,
        }));
        let msg = self.rs.new_round_step_message();
        self.notify(StateNotice::Broadcast(Message::NewRoundStep(msg)));
    }

    pub(super) fn send_internal(&mut self, msg: Message) {
        self.internal_queue.push_back(MsgInfo::internal(msg));
    }

    pub(super) fn emit(&self, event: Event) {
        Event::publish(&self.event_publisher, event)
    }

    /// Tell the reactor about a change. Nothing is sent while replaying.
    pub(super) fn notify(&self, notice: StateNotice) {
        if self.replay_mode {
            return;
        }
        if let Some(reactor) = &self.reactor {
            let _ = reactor.send(ReactorInput::Consensus(notice));
        }
    }

    pub(super) fn publish_snapshot(&self) {
        match self.snapshot.write() {
            Ok(mut snapshot) => *snapshot = self.rs.clone(),
            Err(poisoned) => *poisoned.into_inner() = self.rs.clone(),
        }
    }
}

/// The round state at the start of the height after `state`.
fn new_round_state(
    state: &State,
    start_time: Timestamp,
    commit_time: Timestamp,
    last_commit: Option<VoteSet>,
) -> RoundState {
    let height = state.next_height();
    RoundState {
        height,
        round: Round::new(0),
        step: RoundStepType::NewHeight,
        start_time,
        commit_time,
        validators: state.validators.clone(),
        proposal: None,
        proposal_receive_time: None,
        proposal_block: None,
        proposal_block_parts: None,
        locked_round: Round::NIL,
        locked_block: None,
        locked_block_parts: None,
        valid_round: Round::NIL,
        valid_block: None,
        valid_block_parts: None,
        votes: HeightVoteSet::new(
            state.chain_id,
            height,
            state.validators.clone(),
            state.consensus_params.vote_extensions_enabled(height),
        ),
        commit_round: Round::NIL,
        last_commit,
        last_validators: state.last_validators.clone(),
        triggered_timeout_precommit: false,
    }
}

/// Rebuild the precommits for the last committed block from the block store.
fn reconstruct_last_commit<S: BlockStore>(
    state: &State,
    block_store: &S,
) -> Result<Option<VoteSet>, ConsensusError> {
    if state.is_genesis() {
        return Ok(None);
    }
    let height = state.last_block_height;
    let last_validators = state.last_validators.clone().ok_or_else(|| {
        ConsensusError::invariant(format!("no last validators after block {}", height))
    })?;

    let last_commit = if state.consensus_params.vote_extensions_enabled(height) {
        let extended_commit = block_store
            .load_block_extended_commit(height)
            .ok_or_else(|| {
                ConsensusError::invariant(format!("no extended commit stored for height {}", height))
            })?;
        VoteSet::from_extended_commit(state.chain_id, &extended_commit, last_validators)
    } else {
        let commit = block_store
            .load_seen_commit(height)
            .or_else(|| block_store.load_block_commit(height))
            .ok_or_else(|| {
                ConsensusError::invariant(format!("no commit stored for height {}", height))
            })?;
        VoteSet::from_commit(state.chain_id, &commit, last_validators)
    }
    .map_err(|err| {
        ConsensusError::invariant(format!(
            "stored commit for height {} is invalid: {}",
            height, err
        ))
    })?;

    if !last_commit.has_two_thirds_majority() {
        return Err(ConsensusError::invariant(format!(
            "stored commit for height {} has no two-thirds majority",
            height
        )));
    }
    Ok(Some(last_commit))
}
