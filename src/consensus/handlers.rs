/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Handling of proposals, block parts, and votes, and the making of this replica's own.

use std::time::{Duration, SystemTime};

use crate::{
    app::BlockExecutor,
    events::{
        CompleteProposalEvent, Event, EvidenceEvent, ReceiveProposalEvent, ReceiveVoteEvent,
        ValidBlockEvent, VoteEvent,
    },
    networking::messages::{
        BlockPartMessage, HasProposalBlockPartMessage, HasVoteMessage, Message,
        NewValidBlockMessage, ProposalMessage, VoteMessage, VoteSetMaj23Message,
    },
    pluggables::{BlockStore, EvidencePool},
    reactor::StateNotice,
    types::{
        block::{Block, BlockID},
        commit::ExtendedCommit,
        data_types::{Height, PeerID, Round, SignatureBytes, Timestamp},
        evidence::DuplicateVoteEvidence,
        part_set::{PartSet, BLOCK_PART_SIZE_BYTES},
        proposal::Proposal,
        vote::{Vote, VoteType},
    },
    votes::{
        height_vote_set::HeightVoteSetError,
        vote_set::{ConflictingVoteError, VoteSetError},
    },
};

use super::{
    errors::{ConsensusError, InputError},
    inputs::MsgInfo,
    round_state::RoundStepType,
    state::ConsensusState,
};

impl<E: BlockExecutor, S: BlockStore, P: EvidencePool> ConsensusState<E, S, P> {
    /// Process a proposal, block part, vote, or majority claim. Errors that only concern the message
    /// are logged and swallowed.
    pub(super) fn handle_msg(&mut self, mi: MsgInfo) -> Result<(), ConsensusError> {
        let MsgInfo {
            msg,
            peer_id,
            receive_time,
        } = mi;

        let result = match msg {
            Message::Proposal(ProposalMessage { proposal }) => {
                self.emit(Event::ReceiveProposal(ReceiveProposalEvent {
                    timestamp: SystemTime::now(),
                    origin: peer_id,
                    proposal: proposal.clone(),
                }));
                self.set_proposal(proposal, receive_time)
            }
            Message::BlockPart(msg) => self.handle_block_part(msg, peer_id),
            Message::Vote(VoteMessage { vote }) => {
                if let Some(origin) = peer_id {
                    self.emit(Event::ReceiveVote(ReceiveVoteEvent {
                        timestamp: SystemTime::now(),
                        origin,
                        vote: vote.clone(),
                    }));
                }
                self.try_add_vote(vote, peer_id).map(|_| ())
            }
            Message::VoteSetMaj23(msg) => self.handle_vote_set_maj23(msg, peer_id),
            msg => {
                log::debug!(
                    "Ignoring a {:?} channel message: consensus does not process it",
                    msg.channel()
                );
                Ok(())
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(InputError::Fatal(err)) => Err(err),
            Err(err) => {
                log::debug!(
                    "Failed to process a message at {}/{} from {}: {}",
                    self.rs.height,
                    self.rs.round,
                    peer_id
                        .map(|peer| peer.to_string())
                        .unwrap_or_else(|| "self".to_string()),
                    err
                );
                Ok(())
            }
        }
    }

    /// Accept the proposal of the current round, if it is the first one received and was signed by
    /// the round's proposer.
    pub(super) fn set_proposal(
        &mut self,
        proposal: Proposal,
        receive_time: Timestamp,
    ) -> Result<(), InputError> {
        if self.rs.proposal.is_some() {
            return Ok(());
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            return Ok(());
        }
        if proposal.pol_round < Round::NIL
            || (!proposal.pol_round.is_nil() && proposal.pol_round >= proposal.round)
        {
            return Err(InputError::InvalidProposalPOLRound {
                pol_round: proposal.pol_round,
                round: proposal.round,
            });
        }
        let proposer = self.rs.validators.get_proposer();
        if !proposal.verify(self.state.chain_id, &proposer.pub_key) {
            return Err(InputError::InvalidProposalSignature);
        }
        let max_parts = self.state.consensus_params.block.max_parts();
        if proposal.block_id.part_set_header.total > max_parts {
            return Err(InputError::ProposalTooManyParts {
                total: proposal.block_id.part_set_header.total,
                max: max_parts,
            });
        }

        log::info!(
            "Received proposal for block {} at {}/{}",
            proposal.block_id.hash,
            proposal.height,
            proposal.round
        );
        // Parts that are already being collected (for a commit, or for the valid block) are kept.
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts =
                Some(PartSet::new_from_header(&proposal.block_id.part_set_header));
        }
        self.rs.proposal = Some(proposal);
        self.rs.proposal_receive_time = Some(receive_time);
        Ok(())
    }

    fn handle_block_part(
        &mut self,
        msg: BlockPartMessage,
        peer: Option<PeerID>,
    ) -> Result<(), InputError> {
        let (height, round, index) = (msg.height, msg.round, msg.part.index);
        match self.add_proposal_block_part(msg) {
            Ok(true) => {
                self.notify(StateNotice::Broadcast(Message::HasProposalBlockPart(
                    HasProposalBlockPartMessage {
                        height,
                        round,
                        index: index as i32,
                    },
                )));
                if let Some(peer) = peer {
                    self.notify(StateNotice::PeerContributedBlockPart(peer));
                }
                let complete = self
                    .rs
                    .proposal_block_parts
                    .as_ref()
                    .map(|parts| parts.is_complete())
                    .unwrap_or(false);
                if complete {
                    self.handle_complete_proposal(height)?;
                }
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(InputError::Fatal(err)) => Err(InputError::Fatal(err)),
            Err(err) if round != self.rs.round => {
                log::debug!("Ignoring block part from round {}: {}", round, err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Add a part of the block being collected. Returns whether the part was new.
    pub(super) fn add_proposal_block_part(&mut self, msg: BlockPartMessage) -> Result<bool, InputError> {
        if msg.height != self.rs.height {
            log::debug!("Ignoring block part for height {}", msg.height);
            return Ok(false);
        }
        let max_bytes = self.state.consensus_params.block.max_bytes;
        let parts = match self.rs.proposal_block_parts.as_mut() {
            Some(parts) => parts,
            None => {
                log::debug!("Ignoring block part: not collecting any block");
                return Ok(false);
            }
        };

        let added = parts.add_part(msg.part)?;
        if parts.byte_size() > max_bytes {
            return Err(InputError::ProposalBlockTooBig {
                size: parts.byte_size(),
                max: max_bytes,
            });
        }
        if added && parts.is_complete() {
            let block = Block::from_part_set(parts)?;
            let block_id = BlockID::new(block.hash(), parts.header());
            log::info!(
                "Received complete proposal block {} at height {}",
                block_id.hash,
                block.height()
            );
            self.rs.proposal_block = Some(block);
            self.emit(Event::CompleteProposal(CompleteProposalEvent {
                timestamp: SystemTime::now(),
                height: self.rs.height,
                round: self.rs.round,
                block_id,
            }));
        }
        Ok(added)
    }

    fn handle_complete_proposal(&mut self, height: Height) -> Result<(), ConsensusError> {
        let round = self.rs.round;
        let maj23 = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|prevotes| prevotes.two_thirds_majority());

        if let Some(block_id) = maj23 {
            if !block_id.is_nil() && self.rs.valid_round < round {
                if self.proposal_block_is(&block_id) {
                    log::debug!("Updating the valid block to the completed proposal block");
                    self.rs.valid_round = round;
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                }
                // Otherwise the proposer or more than a third of the voting power is faulty.
            }
        }

        if self.rs.step <= RoundStepType::Propose && self.rs.is_proposal_complete() {
            self.enter_prevote(height, round)?;
            if maj23.is_some() {
                self.enter_precommit(height, round)?;
            }
        } else if self.rs.step == RoundStepType::Commit {
            self.try_finalize_commit(height)?;
        }
        Ok(())
    }

    fn proposal_block_is(&self, block_id: &BlockID) -> bool {
        self.rs
            .proposal_block
            .as_ref()
            .map(|block| block.hash() == block_id.hash)
            .unwrap_or(false)
    }

    fn handle_vote_set_maj23(
        &mut self,
        msg: VoteSetMaj23Message,
        peer: Option<PeerID>,
    ) -> Result<(), InputError> {
        let peer = match peer {
            Some(peer) => peer,
            None => return Ok(()),
        };
        if msg.height != self.rs.height {
            return Ok(());
        }
        self.rs
            .votes
            .set_peer_maj23(msg.round, msg.vote_type, peer, msg.block_id)
            .map_err(InputError::PeerMaj23)
    }

    /// Add a vote, and report it to the evidence pool if it conflicts with one already seen.
    pub(super) fn try_add_vote(
        &mut self,
        vote: Vote,
        peer: Option<PeerID>,
    ) -> Result<bool, InputError> {
        let err = match self.add_vote(vote, peer) {
            Ok(added) => return Ok(added),
            Err(err) => err,
        };

        if let Some(conflict) = conflicting_votes(&err) {
            let (vote_a, vote_b) = (conflict.vote_a.clone(), conflict.vote_b.clone());
            if Some(vote_a.validator_address) == self.priv_validator_address() {
                log::error!(
                    "Found a conflicting vote from ourselves at {}/{}: was this validator's signing state reset?",
                    vote_a.height,
                    vote_a.round
                );
                return Err(err);
            }
            self.report_conflicting_votes(vote_a, vote_b);
            return Err(err);
        }

        match err {
            InputError::AddVote(HeightVoteSetError::VoteSet(
                VoteSetError::NonDeterministicSignature { .. },
            )) => {
                log::debug!("Vote has a non-deterministic signature: {}", err);
                Ok(false)
            }
            InputError::Fatal(err) => Err(InputError::Fatal(err)),
            err => {
                log::info!("Failed to add vote: {}", err);
                Err(err)
            }
        }
    }

    fn report_conflicting_votes(&mut self, vote_a: Vote, vote_b: Vote) {
        let validators = if vote_a.height == self.rs.height {
            Some(&self.rs.validators)
        } else {
            self.rs.last_validators.as_ref()
        };
        let evidence = validators.and_then(|validators| {
            DuplicateVoteEvidence::new(vote_a, vote_b, self.state.last_block_time, validators)
        });
        match evidence {
            Some(evidence) => {
                log::info!(
                    "Reporting conflicting votes from {} at height {}",
                    evidence.address(),
                    evidence.height()
                );
                self.evidence_pool.report_conflicting_votes(evidence.clone());
                self.emit(Event::Evidence(EvidenceEvent {
                    timestamp: SystemTime::now(),
                    evidence,
                }));
            }
            None => log::debug!("Conflicting votes from a validator that is not in the set"),
        }
    }

    /// Add a vote to the current height's vote sets, or to the last commit, and act on the
    /// majorities that it creates.
    fn add_vote(&mut self, vote: Vote, peer: Option<PeerID>) -> Result<bool, InputError> {
        // A late precommit for the previous height.
        if vote.height + 1 == self.rs.height && vote.vote_type == VoteType::Precommit {
            if self.rs.step != RoundStepType::NewHeight {
                log::debug!("Ignoring precommit for the previous height outside NewHeight");
                return Ok(false);
            }
            let last_commit = match self.rs.last_commit.as_mut() {
                Some(last_commit) => last_commit,
                None => return Ok(false),
            };
            if !last_commit.add_vote(vote.clone())? {
                return Ok(false);
            }
            let has_all = last_commit.has_all();
            log::debug!(
                "Added precommit of {} to the last commit",
                vote.validator_address
            );
            self.on_vote_added(&vote, peer);
            self.skip_timeout_commit_if_all_precommitted(has_all)?;
            return Ok(true);
        }

        if vote.height != self.rs.height {
            log::debug!(
                "Ignoring vote for height {} at height {}",
                vote.height,
                self.rs.height
            );
            return Ok(false);
        }

        if self.state.consensus_params.vote_extensions_enabled(vote.height) {
            // Our own extensions were made by us.
            let own_vote = Some(vote.validator_address) == self.priv_validator_address();
            if vote.vote_type == VoteType::Precommit && !vote.is_nil() && !own_vote {
                let validator = usize::try_from(vote.validator_index)
                    .ok()
                    .and_then(|index| self.state.validators.get_by_index(index))
                    .ok_or(InputError::UnknownValidatorIndex {
                        index: vote.validator_index,
                    })?;
                vote.verify_extension(self.state.chain_id, &validator.pub_key)
                    .map_err(|err| InputError::VoteExtension(err.to_string()))?;
                self.executor
                    .verify_vote_extension(&vote)
                    .map_err(|err| InputError::VoteExtension(err.to_string()))?;
            }
        } else if !vote.extension.is_empty() || vote.extension_signature.is_some() {
            return Err(InputError::UnexpectedVoteExtension {
                height: vote.height,
            });
        }

        // A conflicting vote is still counted when a peer claimed a majority for its block.
        let (added, conflict) = match self.rs.votes.add_vote(vote.clone(), peer) {
            Ok(added) => (added, None),
            Err(HeightVoteSetError::VoteSet(VoteSetError::ConflictingVote(conflict)))
                if conflict.added =>
            {
                (true, Some(conflict))
            }
            Err(err) => return Err(err.into()),
        };
        if !added {
            return Ok(false);
        }

        self.on_vote_added(&vote, peer);
        let height = self.rs.height;
        match vote.vote_type {
            VoteType::Prevote => self.on_prevote_added(height, vote.round)?,
            VoteType::Precommit => self.on_precommit_added(height, vote.round)?,
        }

        match conflict {
            Some(conflict) => Err(InputError::AddVote(HeightVoteSetError::VoteSet(
                VoteSetError::ConflictingVote(conflict),
            ))),
            None => Ok(true),
        }
    }

    fn on_vote_added(&mut self, vote: &Vote, peer: Option<PeerID>) {
        log::debug!(
            "Added {:?} of {} at {}/{}",
            vote.vote_type,
            vote.validator_address,
            vote.height,
            vote.round
        );
        self.emit(Event::Vote(VoteEvent {
            timestamp: SystemTime::now(),
            vote: vote.clone(),
        }));
        self.notify(StateNotice::Broadcast(Message::HasVote(HasVoteMessage {
            height: vote.height,
            round: vote.round,
            vote_type: vote.vote_type,
            index: vote.validator_index,
        })));
        if let Some(peer) = peer {
            self.notify(StateNotice::PeerContributedVote(peer));
        }
    }

    fn on_prevote_added(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let (maj23, has_two_thirds_any) = match self.rs.votes.prevotes(round) {
            Some(prevotes) => (prevotes.two_thirds_majority(), prevotes.has_two_thirds_any()),
            None => (None, false),
        };

        // A polka for a block in the current round updates the valid block.
        if let Some(block_id) = maj23.filter(|block_id| !block_id.is_nil()) {
            if self.rs.valid_round < round && round == self.rs.round {
                if self.proposal_block_is(&block_id) {
                    log::debug!("Updating the valid block to the polka block at round {}", round);
                    self.rs.valid_round = round;
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                } else {
                    self.rs.proposal_block = None;
                }
                if !self.has_proposal_parts_for(&block_id) {
                    self.rs.proposal_block_parts =
                        Some(PartSet::new_from_header(&block_id.part_set_header));
                }
                self.emit(Event::ValidBlock(ValidBlockEvent {
                    timestamp: SystemTime::now(),
                    height,
                    round,
                    block_id,
                }));
                self.notify_new_valid_block();
            }
        }

        if self.rs.round < round && has_two_thirds_any {
            // Round skip.
            self.enter_new_round(height, round)
        } else if self.rs.round == round && RoundStepType::Prevote <= self.rs.step {
            let nil_majority = maj23.map(|block_id| block_id.is_nil()).unwrap_or(false);
            if maj23.is_some() && (self.rs.is_proposal_complete() || nil_majority) {
                self.enter_precommit(height, round)
            } else if has_two_thirds_any {
                self.enter_prevote_wait(height, round)
            } else {
                Ok(())
            }
        } else {
            // The polka that a re-proposal of this round was waiting for.
            let completes_pol = self
                .rs
                .proposal
                .as_ref()
                .map(|proposal| !proposal.pol_round.is_nil() && proposal.pol_round == round)
                .unwrap_or(false);
            if completes_pol && self.rs.is_proposal_complete() {
                self.enter_prevote(height, self.rs.round)
            } else {
                Ok(())
            }
        }
    }

    fn on_precommit_added(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let (maj23, has_two_thirds_any, has_all) = match self.rs.votes.precommits(round) {
            Some(precommits) => (
                precommits.two_thirds_majority(),
                precommits.has_two_thirds_any(),
                precommits.has_all(),
            ),
            None => (None, false, false),
        };

        match maj23 {
            Some(block_id) => {
                // The majority may be in a later round.
                self.enter_new_round(height, round)?;
                self.enter_precommit(height, round)?;
                if block_id.is_nil() {
                    self.enter_precommit_wait(height, round)
                } else {
                    self.enter_commit(height, round)?;
                    self.skip_timeout_commit_if_all_precommitted(has_all)
                }
            }
            None if self.rs.round <= round && has_two_thirds_any => {
                self.enter_new_round(height, round)?;
                self.enter_precommit_wait(height, round)
            }
            None => Ok(()),
        }
    }

    pub(super) fn notify_new_valid_block(&self) {
        if let Some(parts) = &self.rs.proposal_block_parts {
            self.notify(StateNotice::Broadcast(Message::NewValidBlock(
                NewValidBlockMessage {
                    height: self.rs.height,
                    round: self.rs.round,
                    block_part_set_header: parts.header(),
                    block_parts: parts.bit_array(),
                    is_commit: self.rs.step == RoundStepType::Commit,
                },
            )));
        }
    }

    /// Propose the valid block if there is one, or a new block otherwise.
    pub(super) fn decide_proposal(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let (block, block_parts) = match (&self.rs.valid_block, &self.rs.valid_block_parts) {
            (Some(valid_block), Some(valid_block_parts)) => {
                (valid_block.clone(), valid_block_parts.clone())
            }
            _ => match self.create_proposal_block(height)? {
                Some(block) => {
                    let block_parts = block.make_part_set(BLOCK_PART_SIZE_BYTES);
                    (block, block_parts)
                }
                None => return Ok(()),
            },
        };

        // The signer only re-signs what it signed before if it is asked to sign the same thing.
        if let Err(err) = self.wal.flush_and_sync() {
            log::error!("Failed to flush the WAL before proposing: {}", err);
        }

        let block_id = BlockID::new(block.hash(), block_parts.header());
        let mut proposal = Proposal::new(
            height,
            round,
            self.rs.valid_round,
            block_id,
            block.header.time,
        );
        let signed = match self.priv_validator.as_mut() {
            Some(priv_validator) => priv_validator.sign_proposal(self.state.chain_id, &mut proposal),
            None => return Ok(()),
        };
        if let Err(err) = signed {
            if self.replay_mode {
                log::debug!("Failed to sign proposal while replaying: {}", err);
            } else {
                log::error!("Failed to sign proposal at {}/{}: {}", height, round, err);
            }
            return Ok(());
        }

        log::info!(
            "Proposing block {} at {}/{} with POL round {}",
            block_id.hash,
            height,
            round,
            proposal.pol_round
        );
        self.send_internal(Message::Proposal(ProposalMessage { proposal }));
        for index in 0..block_parts.total() as usize {
            if let Some(part) = block_parts.get_part(index) {
                self.send_internal(Message::BlockPart(BlockPartMessage {
                    height,
                    round,
                    part: part.clone(),
                }));
            }
        }
        Ok(())
    }

    fn create_proposal_block(&mut self, height: Height) -> Result<Option<Block>, ConsensusError> {
        let last_extended_commit: Option<ExtendedCommit> = if height == self.state.initial_height {
            None
        } else {
            match &self.rs.last_commit {
                Some(last_commit) if last_commit.has_two_thirds_majority() => {
                    let extensions_enabled = self
                        .state
                        .consensus_params
                        .vote_extensions_enabled(self.state.last_block_height);
                    Some(
                        last_commit
                            .make_extended_commit(extensions_enabled)
                            .map_err(|err| ConsensusError::invariant(err.to_string()))?,
                    )
                }
                _ => {
                    log::error!("Cannot propose: no commit for the previous block");
                    return Ok(None);
                }
            }
        };
        let proposer_address = match self.priv_validator_address() {
            Some(address) => address,
            None => {
                log::error!("Cannot propose: the private validator's public key is not set");
                return Ok(None);
            }
        };

        match self.executor.create_proposal_block(
            height,
            &self.state,
            last_extended_commit.as_ref(),
            proposer_address,
        ) {
            Ok(block) => Ok(Some(block)),
            Err(err) => {
                log::error!("Failed to create a proposal block: {}", err);
                Ok(None)
            }
        }
    }

    /// Sign a vote for `block_id` and queue it as an internal message. Replicas outside the validator
    /// set do nothing.
    pub(super) fn sign_add_vote(
        &mut self,
        vote_type: VoteType,
        block_id: BlockID,
        block: Option<&Block>,
    ) -> Result<(), ConsensusError> {
        if self.priv_validator.is_none() {
            return Ok(());
        }
        let address = match self.priv_validator_address() {
            Some(address) => address,
            None => {
                log::error!("Cannot vote: the private validator's public key is not set");
                return Ok(());
            }
        };
        if !self.rs.validators.has_address(&address) {
            return Ok(());
        }

        let vote = match self.sign_vote(vote_type, block_id, block) {
            Ok(vote) => vote,
            Err(InputError::Fatal(err)) => return Err(err),
            Err(err) => {
                if self.replay_mode {
                    log::debug!("Failed to sign vote while replaying: {}", err);
                } else {
                    log::error!(
                        "Failed to sign {:?} at {}/{}: {}",
                        vote_type,
                        self.rs.height,
                        self.rs.round,
                        err
                    );
                }
                return Ok(());
            }
        };

        let extensions_enabled = self
            .state
            .consensus_params
            .vote_extensions_enabled(vote.height);
        let has_extension = vote.extension_signature.is_some();
        if vote.vote_type == VoteType::Precommit && !vote.is_nil() && has_extension != extensions_enabled {
            return Err(ConsensusError::invariant(format!(
                "signed precommit has extension {} while extensions enabled is {} at height {}",
                has_extension, extensions_enabled, vote.height
            )));
        }

        log::debug!(
            "Signed {:?} for {} at {}/{}",
            vote.vote_type,
            vote.block_id.hash,
            vote.height,
            vote.round
        );
        self.send_internal(Message::Vote(VoteMessage { vote }));
        Ok(())
    }

    fn sign_vote(
        &mut self,
        vote_type: VoteType,
        block_id: BlockID,
        block: Option<&Block>,
    ) -> Result<Vote, InputError> {
        // The signer only re-signs what it signed before if it is asked to sign the same thing.
        self.wal.flush_and_sync()?;

        let address = self.priv_validator_address().ok_or(InputError::PubKeyNotSet)?;
        let (index, _) = self
            .rs
            .validators
            .get_by_address(&address)
            .ok_or(InputError::NotAValidator)?;
        let mut vote = Vote {
            vote_type,
            height: self.rs.height,
            round: self.rs.round,
            block_id,
            timestamp: self.vote_time(self.rs.height),
            validator_address: address,
            validator_index: index as i32,
            signature: SignatureBytes::zero(),
            extension: Vec::new(),
            extension_signature: None,
        };

        let extensions_enabled = self
            .state
            .consensus_params
            .vote_extensions_enabled(vote.height);
        if vote_type == VoteType::Precommit && !block_id.is_nil() && extensions_enabled {
            let block = block.ok_or_else(|| {
                ConsensusError::invariant("extending a precommit without its block")
            })?;
            vote.extension = self
                .executor
                .extend_vote(&vote, block, &self.state)
                .map_err(InputError::ExtendVote)?;
        }

        let priv_validator = self.priv_validator.as_mut().ok_or(InputError::PubKeyNotSet)?;
        priv_validator.sign_vote(
            self.state.chain_id,
            &mut vote,
            extensions_enabled && vote_type == VoteType::Precommit,
        )?;
        Ok(vote)
    }

    /// The timestamp of this replica's next vote. Without proposer-based timestamps, it is later than
    /// the time of the block being voted on, so that the median time of a commit always increases.
    fn vote_time(&self, height: Height) -> Timestamp {
        let now = Timestamp::now();
        if self.state.consensus_params.pbts_enabled(height) {
            return now;
        }
        let block_time = self
            .rs
            .locked_block
            .as_ref()
            .or(self.rs.proposal_block.as_ref())
            .map(|block| block.header.time);
        match block_time {
            Some(block_time) => {
                let min_vote_time = block_time + Duration::from_millis(1);
                if now > min_vote_time {
                    now
                } else {
                    min_vote_time
                }
            }
            None => now,
        }
    }
}

fn conflicting_votes(err: &InputError) -> Option<&ConflictingVoteError> {
    match err {
        InputError::AddVote(HeightVoteSetError::VoteSet(VoteSetError::ConflictingVote(conflict)))
        | InputError::AddLastCommitVote(VoteSetError::ConflictingVote(conflict)) => Some(conflict),
        _ => None,
    }
}
