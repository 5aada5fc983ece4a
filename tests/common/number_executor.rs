/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A block executor, mempool, and evidence pool for tests.
//!
//! The app state of [`NumberExecutor`] is the number of blocks it applied. Every block carries one
//! transaction: the block's height.

use std::sync::{
    mpsc::{self, Receiver, Sender},
    Arc, Mutex,
};

use tendermint_rs::{
    app::{BlockExecutor, BlockExecutorError},
    pluggables::{EvidencePool, Mempool},
    types::{
        block::{Block, BlockID},
        commit::ExtendedCommit,
        data_types::{Address, CryptoHash, Height},
        evidence::DuplicateVoteEvidence,
        state::State,
        vote::Vote,
    },
};

/// Executes blocks and remembers the latest chain state, which a restarted node starts from.
#[derive(Clone)]
pub(crate) struct NumberExecutor {
    latest_state: Arc<Mutex<State>>,
}

impl NumberExecutor {
    pub(crate) fn new(state: State) -> NumberExecutor {
        NumberExecutor {
            latest_state: Arc::new(Mutex::new(state)),
        }
    }

    /// The chain state after the last applied block.
    pub(crate) fn latest_state(&self) -> State {
        self.latest_state.lock().unwrap().clone()
    }

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

    fn process_proposal(&mut self, block: &Block, _state: &State) -> Result<bool, BlockExecutorError> {
        Ok(block.data == vec![block.height().int().to_le_bytes().to_vec()])
    }

    fn apply_block(
        &mut self,
        state: &State,
        block_id: BlockID,
        block: &Block,
    ) -> Result<State, BlockExecutorError> {
        let next_state = state.advance(
            block_id,
            &block.header,
            NumberExecutor::app_hash(block.height().int()),
        );
        *self.latest_state.lock().unwrap() = next_state.clone();
        Ok(next_state)
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

/// A mempool that is only ever non-empty when a test says so.
pub(crate) struct StubMempool {
    notifier: Sender<()>,
    txs_available: Option<Receiver<()>>,
}

impl StubMempool {
    pub(crate) fn new() -> StubMempool {
        let (notifier, txs_available) = mpsc::channel();
        StubMempool {
            notifier,
            txs_available: Some(txs_available),
        }
    }

    /// A handle that tells consensus that transactions arrived.
    pub(crate) fn notifier(&self) -> Sender<()> {
        self.notifier.clone()
    }
}

impl Mempool for StubMempool {
    fn txs_available(&mut self) -> Receiver<()> {
        match self.txs_available.take() {
            Some(txs_available) => txs_available,
            None => mpsc::channel().1,
        }
    }
}

/// Evidence pool that keeps everything reported to it.
#[derive(Clone, Default)]
pub(crate) struct RecordingEvidencePool(Arc<Mutex<Vec<DuplicateVoteEvidence>>>);

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
