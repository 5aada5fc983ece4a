/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The step functions of the state machine.
//!
//! Every `enter_*` function first checks that the state machine has not already passed the
//! `(height, round, step)` it was asked to enter, and returns without doing anything if it has. Past
//! that check, the function always finishes its bookkeeping (updating the step and announcing it),
//! even if its body fails, before passing the body's error on.

use std::time::SystemTime;

use crate::{
    app::BlockExecutor,
    events::{
        Event, LockEvent, NewBlockEvent, NewRoundEvent, PolkaEvent, RelockEvent, ValidBlockEvent,
    },
    pluggables::{BlockStore, EvidencePool},
    types::{
        block::{Block, BlockID},
        data_types::{Address, Height, Round, Timestamp},
        part_set::PartSet,
        proposal::Proposal,
        vote::VoteType,
    },
    wal::messages::WalMessage,
};

use super::{errors::ConsensusError, round_state::RoundStepType, state::ConsensusState};

impl<E: BlockExecutor, S: BlockStore, P: EvidencePool> ConsensusState<E, S, P> {
    /// Enter a new round. Round 0 is entered from `NewHeight`, later rounds from anywhere in an earlier
    /// round.
    pub(super) fn enter_new_round(
        &mut self,
        height: Height,
        round: Round,
    ) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != RoundStepType::NewHeight)
        {
            log::debug!(
                "Not entering new round {}/{}, at {}/{}/{}",
                height,
                round,
                self.rs.height,
                self.rs.round,
                self.rs.step.name()
            );
            return Ok(());
        }
        if self.rs.start_time > Timestamp::now() {
            log::debug!("Entering new round {}/{} before its start time", height, round);
        }

        let mut validators = self.rs.validators.clone();
        if self.rs.round < round {
            validators.increment_proposer_priority((round.int() - self.rs.round.int()) as u32);
        }

        // No NewRoundStep is announced for this step, only the NewRound event.
        self.update_round_step(round, RoundStepType::NewRound);
        self.rs.validators = validators;
        if round.int() != 0 {
            // A round 0 proposal may already have arrived: it is kept.
            self.rs.proposal = None;
            self.rs.proposal_receive_time = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        // Votes of the next round are tracked too, so that round skips can be detected.
        self.rs
            .votes
            .set_round(round.next())
            .map_err(|err| ConsensusError::invariant(err.to_string()))?;
        self.rs.triggered_timeout_precommit = false;

        self.emit(Event::NewRound(NewRoundEvent {
            timestamp: SystemTime::now(),
            height,
            round,
            proposer: self.rs.validators.get_proposer().address,
        }));

        // An empty block is still proposed right away when the app hash changed.
        let wait_for_txs = self.config.wait_for_txs()
            && round.int() == 0
            && !self.need_proof_block(height)?;
        if wait_for_txs {
            if !self.config.create_empty_blocks_interval.is_zero() {
                self.schedule_timeout(
                    self.config.create_empty_blocks_interval,
                    height,
                    round,
                    RoundStepType::NewRound,
                );
            }
            Ok(())
        } else {
            self.enter_propose(height, round)
        }
    }

    /// Enter `Propose`, and propose a block if this replica is the proposer of the round.
    pub(super) fn enter_propose(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && RoundStepType::Propose <= self.rs.step)
        {
            log::debug!(
                "Not entering propose step {}/{}, at {}/{}/{}",
                height,
                round,
                self.rs.height,
                self.rs.round,
                self.rs.step.name()
            );
            return Ok(());
        }

        // A proposer never proposes a block timed before the last block.
        if self.state.consensus_params.pbts_enabled(height) {
            if let Some(address) = self.priv_validator_address() {
                if self.is_proposer(&address) {
                    if let Some(wait) = self
                        .state
                        .last_block_time
                        .checked_duration_since(Timestamp::now())
                        .filter(|wait| !wait.is_zero())
                    {
                        self.schedule_timeout(wait, height, round, RoundStepType::NewRound);
                        return Ok(());
                    }
                }
            }
        }

        let result = self.propose(height, round);
        self.update_round_step(round, RoundStepType::Propose);
        self.new_step();
        result?;

        // Otherwise prevote once the rest of the proposal arrives, or when the propose timeout fires.
        if self.rs.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round)?;
        }
        Ok(())
    }

    fn propose(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        self.schedule_timeout(
            self.config.propose(round),
            height,
            round,
            RoundStepType::Propose,
        );

        let address = match self.priv_validator_address() {
            Some(address) => address,
            None => {
                log::debug!("Not proposing: this replica is not a validator");
                return Ok(());
            }
        };
        if !self.rs.validators.has_address(&address) {
            log::debug!("Not proposing: {} is not in the validator set", address);
            return Ok(());
        }

        if self.is_proposer(&address) {
            log::debug!("Our turn to propose at {}/{}", height, round);
            self.decide_proposal(height, round)
        } else {
            log::debug!(
                "Not our turn to propose at {}/{}, proposer is {}",
                height,
                round,
                self.rs.validators.get_proposer().address
            );
            Ok(())
        }
    }

    pub(super) fn is_proposer(&self, address: &Address) -> bool {
        &self.rs.validators.get_proposer().address == address
    }

    /// Enter `Prevote`, and prevote. Entered once the proposal is complete, or when the propose timeout
    /// fires.
    pub(super) fn enter_prevote(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && RoundStepType::Prevote <= self.rs.step)
        {
            log::debug!(
                "Not entering prevote step {}/{}, at {}/{}/{}",
                height,
                round,
                self.rs.height,
                self.rs.round,
                self.rs.step.name()
            );
            return Ok(());
        }

        let result = self.do_prevote(height);
        self.update_round_step(round, RoundStepType::Prevote);
        self.new_step();
        result
    }

    fn do_prevote(&mut self, height: Height) -> Result<(), ConsensusError> {
        let proposal = match &self.rs.proposal {
            Some(proposal) => proposal.clone(),
            None => {
                log::debug!("Prevoting nil: no proposal received");
                return self.sign_add_vote(VoteType::Prevote, BlockID::nil(), None);
            }
        };
        let (block, block_parts) = match (&self.rs.proposal_block, &self.rs.proposal_block_parts) {
            (Some(block), Some(block_parts)) => (block.clone(), block_parts.clone()),
            _ => {
                log::debug!("Prevoting nil: proposal block not received");
                return self.sign_add_vote(VoteType::Prevote, BlockID::nil(), None);
            }
        };

        let block_id = BlockID::new(block.hash(), block_parts.header());

        // A fresh proposal: validated here unless a polka already vouched for it.
        if proposal.pol_round.is_nil() {
            if !self.rs.locked_round.is_nil() {
                if self.rs.is_locked_on(&block) {
                    log::debug!("Prevoting the proposal: it is our locked block");
                    return self.sign_add_vote(VoteType::Prevote, block_id, Some(&block));
                }
                log::debug!("Prevoting nil: locked on a different block");
                return self.sign_add_vote(VoteType::Prevote, BlockID::nil(), None);
            }
            if self.rs.is_valid_block(&block) {
                log::debug!("Prevoting the proposal: it is our valid block");
                return self.sign_add_vote(VoteType::Prevote, block_id, Some(&block));
            }
            if !self.is_proposal_timely(height, &proposal, &block) {
                return self.sign_add_vote(VoteType::Prevote, BlockID::nil(), None);
            }
            if let Err(err) = self.executor.validate_block(&self.state, &block) {
                log::error!("Prevoting nil: proposal block is invalid: {}", err);
                return self.sign_add_vote(VoteType::Prevote, BlockID::nil(), None);
            }
            if !self.executor.process_proposal(&block, &self.state)? {
                log::error!(
                    "Prevoting nil: the application rejected the proposal block; the proposer may be misbehaving"
                );
                return self.sign_add_vote(VoteType::Prevote, BlockID::nil(), None);
            }
            log::debug!("Prevoting the proposal: it is valid and we are not locked");
            return self.sign_add_vote(VoteType::Prevote, block_id, Some(&block));
        }

        // A re-proposal citing a polka. The polka proves some correct validator validated it.
        let pol_majority = self
            .rs
            .votes
            .prevotes(proposal.pol_round)
            .and_then(|prevotes| prevotes.two_thirds_majority());
        let has_pol = matches!(pol_majority, Some(pol_block_id) if !pol_block_id.is_nil() && pol_block_id.hash == block.hash());
        if has_pol && proposal.pol_round < self.rs.round {
            if self.rs.locked_round < proposal.pol_round {
                log::debug!("Prevoting the proposal: it has a POL newer than our lock");
                return self.sign_add_vote(VoteType::Prevote, block_id, Some(&block));
            }
            if self.rs.is_locked_on(&block) {
                log::debug!("Prevoting the proposal: it has a POL and is our locked block");
                return self.sign_add_vote(VoteType::Prevote, block_id, Some(&block));
            }
            if self.rs.locked_round == proposal.pol_round {
                log::warn!(
                    "Locked on a different block in POL round {}: some validator equivocated. Prevoting the proposal",
                    proposal.pol_round
                );
                return self.sign_add_vote(VoteType::Prevote, block_id, Some(&block));
            }
        }

        log::debug!("Prevoting nil: the proposal is not our locked block and has no newer POL");
        self.sign_add_vote(VoteType::Prevote, BlockID::nil(), None)
    }

    /// Whether a fresh proposal passes the timestamp checks of proposer-based timestamps. Always true
    /// before they are enabled.
    fn is_proposal_timely(&self, height: Height, proposal: &Proposal, block: &Block) -> bool {
        if !self.state.consensus_params.pbts_enabled(height) {
            return true;
        }
        if proposal.timestamp != block.header.time {
            log::debug!("Prevoting nil: proposal timestamp differs from the block time");
            return false;
        }
        let receive_time = self
            .rs
            .proposal_receive_time
            .unwrap_or(Timestamp::from_nanos(0));
        if !proposal.is_timely(receive_time, self.state.consensus_params.synchrony) {
            log::info!(
                "Prevoting nil: proposal timed {} is not timely, received at {}",
                proposal.timestamp,
                receive_time
            );
            return false;
        }
        true
    }

    /// Enter `PrevoteWait`, after seeing two-thirds of any prevotes in the round.
    pub(super) fn enter_prevote_wait(
        &mut self,
        height: Height,
        round: Round,
    ) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && RoundStepType::PrevoteWait <= self.rs.step)
        {
            log::debug!(
                "Not entering prevote wait step {}/{}, at {}/{}/{}",
                height,
                round,
                self.rs.height,
                self.rs.round,
                self.rs.step.name()
            );
            return Ok(());
        }
        let has_two_thirds_any = self
            .rs
            .votes
            .prevotes(round)
            .map(|prevotes| prevotes.has_two_thirds_any())
            .unwrap_or(false);
        if !has_two_thirds_any {
            return Err(ConsensusError::invariant(format!(
                "entering prevote wait at {}/{} without two-thirds of any prevotes",
                height, round
            )));
        }

        self.schedule_timeout(
            self.config.prevote(round),
            height,
            round,
            RoundStepType::PrevoteWait,
        );
        self.update_round_step(round, RoundStepType::PrevoteWait);
        self.new_step();
        Ok(())
    }

    /// Enter `Precommit`, and precommit.
    pub(super) fn enter_precommit(
        &mut self,
        height: Height,
        round: Round,
    ) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && RoundStepType::Precommit <= self.rs.step)
        {
            log::debug!(
                "Not entering precommit step {}/{}, at {}/{}/{}",
                height,
                round,
                self.rs.height,
                self.rs.round,
                self.rs.step.name()
            );
            return Ok(());
        }

        let result = self.do_precommit(height, round);
        self.update_round_step(round, RoundStepType::Precommit);
        self.new_step();
        result
    }

    fn do_precommit(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let block_id = match self
            .rs
            .votes
            .prevotes(round)
            .and_then(|prevotes| prevotes.two_thirds_majority())
        {
            Some(block_id) => block_id,
            None => {
                if self.rs.locked_block.is_some() {
                    log::debug!("Precommitting nil: no polka while locked");
                } else {
                    log::debug!("Precommitting nil: no polka");
                }
                return self.sign_add_vote(VoteType::Precommit, BlockID::nil(), None);
            }
        };

        self.emit(Event::Polka(PolkaEvent {
            timestamp: SystemTime::now(),
            height,
            round,
            block_id,
        }));

        if block_id.is_nil() {
            log::debug!("Precommitting nil: polka for nil");
            return self.sign_add_vote(VoteType::Precommit, BlockID::nil(), None);
        }

        // The polka in this round must be the latest.
        match self.rs.votes.pol_info() {
            Some((pol_round, _)) if pol_round >= round => (),
            pol_info => {
                return Err(ConsensusError::invariant(format!(
                    "polka in round {} but POL info is {:?}",
                    round, pol_info
                )))
            }
        }

        let locked_block = self
            .rs
            .locked_block
            .clone()
            .filter(|locked| locked.hash() == block_id.hash);
        if let Some(locked_block) = locked_block {
            log::debug!("Precommitting the locked block: relocking");
            self.rs.locked_round = round;
            self.emit(Event::Relock(RelockEvent {
                timestamp: SystemTime::now(),
                height,
                round,
                block_id,
            }));
            return self.sign_add_vote(VoteType::Precommit, block_id, Some(&locked_block));
        }

        let proposal_block = self
            .rs
            .proposal_block
            .clone()
            .filter(|proposal_block| proposal_block.hash() == block_id.hash);
        if let Some(proposal_block) = proposal_block {
            if let Err(err) = self.executor.validate_block(&self.state, &proposal_block) {
                return Err(ConsensusError::invariant(format!(
                    "two-thirds prevoted for an invalid block: {}",
                    err
                )));
            }
            log::debug!("Precommitting the proposal block: locking");
            self.rs.locked_round = round;
            self.rs.locked_block = Some(proposal_block.clone());
            self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
            self.emit(Event::Lock(LockEvent {
                timestamp: SystemTime::now(),
                height,
                round,
                block_id,
            }));
            return self.sign_add_vote(VoteType::Precommit, block_id, Some(&proposal_block));
        }

        // A polka for a block we don't have: fetch it.
        if !self.has_proposal_parts_for(&block_id) {
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(PartSet::new_from_header(&block_id.part_set_header));
        }
        log::debug!("Precommitting nil: polka for a block we do not have");
        self.sign_add_vote(VoteType::Precommit, BlockID::nil(), None)
    }

    pub(super) fn has_proposal_parts_for(&self, block_id: &BlockID) -> bool {
        self.rs
            .proposal_block_parts
            .as_ref()
            .map(|parts| parts.has_header(&block_id.part_set_header))
            .unwrap_or(false)
    }

    /// Start waiting for more precommits, after seeing two-thirds of any precommits in the round.
    pub(super) fn enter_precommit_wait(
        &mut self,
        height: Height,
        round: Round,
    ) -> Result<(), ConsensusError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.triggered_timeout_precommit)
        {
            log::debug!(
                "Not entering precommit wait step {}/{}, at {}/{}/{}, triggered {}",
                height,
                round,
                self.rs.height,
                self.rs.round,
                self.rs.step.name(),
                self.rs.triggered_timeout_precommit
            );
            return Ok(());
        }
        let has_two_thirds_any = self
            .rs
            .votes
            .precommits(round)
            .map(|precommits| precommits.has_two_thirds_any())
            .unwrap_or(false);
        if !has_two_thirds_any {
            return Err(ConsensusError::invariant(format!(
                "entering precommit wait at {}/{} without two-thirds of any precommits",
                height, round
            )));
        }

        self.schedule_timeout(
            self.config.precommit(round),
            height,
            round,
            RoundStepType::PrecommitWait,
        );
        self.rs.triggered_timeout_precommit = true;
        self.new_step();
        Ok(())
    }

    /// Enter `Commit` for the block that got two-thirds of the precommits in `commit_round`.
    pub(super) fn enter_commit(
        &mut self,
        height: Height,
        commit_round: Round,
    ) -> Result<(), ConsensusError> {
        if self.rs.height != height || RoundStepType::Commit <= self.rs.step {
            log::debug!(
                "Not entering commit step {}/{}, at {}/{}/{}",
                height,
                commit_round,
                self.rs.height,
                self.rs.round,
                self.rs.step.name()
            );
            return Ok(());
        }

        let result = self.prepare_commit(height, commit_round);
        self.update_round_step(self.rs.round, RoundStepType::Commit);
        self.rs.commit_round = commit_round;
        self.rs.commit_time = Timestamp::now();
        self.new_step();
        result?;

        self.try_finalize_commit(height)
    }

    fn prepare_commit(&mut self, height: Height, commit_round: Round) -> Result<(), ConsensusError> {
        let block_id = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|precommits| precommits.two_thirds_majority())
            .ok_or_else(|| {
                ConsensusError::invariant(format!(
                    "entering commit at {}/{} without two-thirds of the precommits",
                    height, commit_round
                ))
            })?;

        // Locking no longer matters. The locked block becomes the proposal block if it is the one
        // committed.
        let locked_block_matches = self
            .rs
            .locked_block
            .as_ref()
            .map(|locked| locked.hash() == block_id.hash)
            .unwrap_or(false);
        if locked_block_matches {
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }

        let have_block = self
            .rs
            .proposal_block
            .as_ref()
            .map(|block| block.hash() == block_id.hash)
            .unwrap_or(false);
        if !have_block && !self.has_proposal_parts_for(&block_id) {
            log::info!(
                "Committing a block we do not have, fetching it: {}",
                block_id.hash
            );
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(PartSet::new_from_header(&block_id.part_set_header));
            self.emit(Event::ValidBlock(ValidBlockEvent {
                timestamp: SystemTime::now(),
                height,
                round: self.rs.round,
                block_id,
            }));
            self.notify_new_valid_block();
        }
        Ok(())
    }

    /// Finalize the commit if the committed block has arrived.
    pub(super) fn try_finalize_commit(&mut self, height: Height) -> Result<(), ConsensusError> {
        if self.rs.height != height {
            return Err(ConsensusError::invariant(format!(
                "finalizing commit of height {} at height {}",
                height, self.rs.height
            )));
        }
        let block_id = match self
            .rs
            .votes
            .precommits(self.rs.commit_round)
            .and_then(|precommits| precommits.two_thirds_majority())
        {
            Some(block_id) if !block_id.is_nil() => block_id,
            _ => {
                log::error!("Cannot finalize commit: no two-thirds majority of precommits for a block");
                return Ok(());
            }
        };
        let have_block = self
            .rs
            .proposal_block
            .as_ref()
            .map(|block| block.hash() == block_id.hash)
            .unwrap_or(false);
        if !have_block {
            log::debug!("Cannot finalize commit yet: waiting for block {}", block_id.hash);
            return Ok(());
        }

        self.finalize_commit(height)
    }

    /// Store, execute, and move past the committed block.
    fn finalize_commit(&mut self, height: Height) -> Result<(), ConsensusError> {
        if self.rs.height != height || self.rs.step != RoundStepType::Commit {
            log::debug!(
                "Not finalizing commit of height {}, at {}/{}/{}",
                height,
                self.rs.height,
                self.rs.round,
                self.rs.step.name()
            );
            return Ok(());
        }

        let precommits = self
            .rs
            .votes
            .precommits(self.rs.commit_round)
            .ok_or_else(|| ConsensusError::invariant("no precommits in the commit round"))?;
        let block_id = precommits
            .two_thirds_majority()
            .ok_or_else(|| ConsensusError::invariant("finalizing commit without a two-thirds majority"))?;
        let (block, block_parts) = match (&self.rs.proposal_block, &self.rs.proposal_block_parts) {
            (Some(block), Some(block_parts)) => (block.clone(), block_parts.clone()),
            _ => return Err(ConsensusError::invariant("finalizing commit without the block")),
        };
        if !block_parts.has_header(&block_id.part_set_header) {
            return Err(ConsensusError::invariant(
                "block parts do not match the committed part set header",
            ));
        }
        if block.hash() != block_id.hash {
            return Err(ConsensusError::invariant("block does not match the committed hash"));
        }
        if let Err(err) = self.executor.validate_block(&self.state, &block) {
            return Err(ConsensusError::invariant(format!(
                "two-thirds precommitted an invalid block: {}",
                err
            )));
        }

        log::info!(
            "Finalizing commit of block {} at height {} with {} txs",
            block_id.hash,
            height,
            block.data.len()
        );

        if self.block_store.height() < block.height() {
            let extensions_enabled = self.state.consensus_params.vote_extensions_enabled(height);
            let seen_extended_commit = precommits
                .make_extended_commit(extensions_enabled)
                .map_err(|err| ConsensusError::invariant(err.to_string()))?;
            if extensions_enabled {
                self.block_store.save_block_with_extended_commit(
                    &block,
                    &block_parts,
                    &seen_extended_commit,
                );
            } else {
                self.block_store
                    .save_block(&block, &block_parts, &seen_extended_commit.to_commit());
            }
        } else {
            log::debug!("Block {} is already stored", height);
        }

        // Everything after this marker belongs to the next height.
        self.wal.write_sync(&WalMessage::EndHeight(height))?;

        let new_state = self
            .executor
            .apply_block(&self.state, block_id, &block)?;
        self.emit(Event::NewBlock(NewBlockEvent {
            timestamp: SystemTime::now(),
            block_id,
            block,
        }));

        self.update_to_state(new_state)?;
        if let Err(err) = self.update_priv_validator_pub_key() {
            log::error!("Failed to refresh the private validator's public key: {}", err);
        }
        self.schedule_round_0();
        Ok(())
    }

    /// Skip the commit timeout, if configured to, once every validator has precommitted.
    pub(super) fn skip_timeout_commit_if_all_precommitted(
        &mut self,
        has_all: bool,
    ) -> Result<(), ConsensusError> {
        if self.config.skip_timeout_commit && has_all {
            self.enter_new_round(self.rs.height, Round::new(0))?;
        }
        Ok(())
    }
}
