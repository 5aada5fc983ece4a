/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Prevotes and precommits.
//!
//! # Sign bytes
//!
//! A validator signs the Borsh serialization of a *canonical vote*: `(type, height, round, block_id,
//! chain_id)`. The timestamp, the validator's address, and the validator's index are not signed, so
//! two votes from the same validator for the same block at the same height, round, and type always
//! have the same sign bytes.
//!
//! Non-nil precommits additionally carry a *vote extension*: opaque bytes produced by the application,
//! signed separately over `(extension, height, round, chain_id)`.

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use super::{
    block::{BlockError, BlockID},
    commit::{BlockIDFlag, CommitSig, ExtendedCommitSig},
    crypto_primitives::{verify_signature, VerifyingKey},
    data_types::{Address, ChainID, Height, Round, SignatureBytes, Timestamp},
};

/// Maximum size of a vote extension, in bytes.
pub const MAX_VOTE_EXTENSION_SIZE: usize = 1024 * 1024 / 2;

/// The two phases of voting in a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: Height,
    pub round: Round,
    pub block_id: BlockID,
    pub timestamp: Timestamp,
    pub validator_address: Address,
    pub validator_index: i32,
    pub signature: SignatureBytes,
    pub extension: Vec<u8>,
    pub extension_signature: Option<SignatureBytes>,
}

#[derive(BorshSerialize)]
struct CanonicalVote {
    vote_type: VoteType,
    height: Height,
    round: Round,
    block_id: Option<BlockID>,
    chain_id: ChainID,
}

#[derive(BorshSerialize)]
struct CanonicalVoteExtension {
    extension: Vec<u8>,
    height: Height,
    round: Round,
    chain_id: ChainID,
}

impl Vote {
    /// Whether this is a vote for nothing.
    pub fn is_nil(&self) -> bool {
        self.block_id.is_nil()
    }

    /// Bytes that the validator signs to produce [`signature`](Self::signature).
    pub fn sign_bytes(&self, chain_id: ChainID) -> Vec<u8> {
        CanonicalVote {
            vote_type: self.vote_type,
            height: self.height,
            round: self.round,
            block_id: (!self.block_id.is_nil()).then_some(self.block_id),
            chain_id,
        }
        .try_to_vec()
        .unwrap_or_default()
    }

    /// Bytes that the validator signs to produce [`extension_signature`](Self::extension_signature).
    pub fn extension_sign_bytes(&self, chain_id: ChainID) -> Vec<u8> {
        CanonicalVoteExtension {
            extension: self.extension.clone(),
            height: self.height,
            round: self.round,
            chain_id,
        }
        .try_to_vec()
        .unwrap_or_default()
    }

    /// Check that `verifying_key` belongs to the vote's validator and produced its signature.
    pub fn verify(&self, chain_id: ChainID, verifying_key: &VerifyingKey) -> Result<(), VoteError> {
        if Address::from_verifying_key(verifying_key) != self.validator_address {
            return Err(VoteError::InvalidValidatorAddress);
        }
        if !verify_signature(verifying_key, &self.sign_bytes(chain_id), &self.signature) {
            return Err(VoteError::InvalidSignature);
        }
        Ok(())
    }

    /// Like [`verify`](Self::verify), but also checks the extension signature of non-nil precommits.
    pub fn verify_vote_and_extension(
        &self,
        chain_id: ChainID,
        verifying_key: &VerifyingKey,
    ) -> Result<(), VoteError> {
        self.verify(chain_id, verifying_key)?;
        if self.vote_type == VoteType::Precommit && !self.is_nil() {
            self.verify_extension(chain_id, verifying_key)?;
        }
        Ok(())
    }

    pub fn verify_extension(
        &self,
        chain_id: ChainID,
        verifying_key: &VerifyingKey,
    ) -> Result<(), VoteError> {
        let signature = self
            .extension_signature
            .as_ref()
            .ok_or(VoteError::MissingExtensionSignature)?;
        if !verify_signature(verifying_key, &self.extension_sign_bytes(chain_id), signature) {
            return Err(VoteError::InvalidExtensionSignature);
        }
        Ok(())
    }

    /// Check that a non-nil precommit carries an extension signature. Used when vote extensions are
    /// enabled at the vote's height.
    pub fn ensure_extension(&self) -> Result<(), VoteError> {
        if self.vote_type == VoteType::Precommit
            && !self.is_nil()
            && self.extension_signature.is_none()
        {
            return Err(VoteError::MissingExtensionSignature);
        }
        Ok(())
    }

    /// Remove the extension and extension signature.
    pub fn strip_extension(&mut self) {
        self.extension.clear();
        self.extension_signature = None;
    }

    /// Stateless checks of the vote's fields.
    pub fn validate_basic(&self) -> Result<(), VoteError> {
        if self.height.int() <= 0 {
            return Err(VoteError::NonPositiveHeight);
        }
        if self.round.int() < 0 {
            return Err(VoteError::NegativeRound);
        }
        self.block_id.validate_basic()?;
        if self.validator_address.is_zero() {
            return Err(VoteError::EmptyValidatorAddress);
        }
        if self.validator_index < 0 {
            return Err(VoteError::NegativeValidatorIndex);
        }
        if self.signature.is_zero() {
            return Err(VoteError::MissingSignature);
        }

        // Only non-nil precommits may carry extensions.
        if self.vote_type != VoteType::Precommit || self.is_nil() {
            if !self.extension.is_empty() || self.extension_signature.is_some() {
                return Err(VoteError::UnexpectedExtension);
            }
        } else {
            if self.extension.len() > MAX_VOTE_EXTENSION_SIZE {
                return Err(VoteError::ExtensionTooBig);
            }
            if !self.extension.is_empty() && self.extension_signature.is_none() {
                return Err(VoteError::MissingExtensionSignature);
            }
        }
        Ok(())
    }

    /// Convert into the signature slot of a [`Commit`](super::commit::Commit).
    pub fn commit_sig(&self) -> CommitSig {
        let block_id_flag = if self.is_nil() {
            BlockIDFlag::Nil
        } else {
            BlockIDFlag::Commit
        };
        CommitSig {
            block_id_flag,
            validator_address: self.validator_address,
            timestamp: self.timestamp,
            signature: Some(self.signature),
        }
    }

    /// Convert into the signature slot of an [`ExtendedCommit`](super::commit::ExtendedCommit).
    pub fn extended_commit_sig(&self) -> ExtendedCommitSig {
        ExtendedCommitSig {
            commit_sig: self.commit_sig(),
            extension: self.extension.clone(),
            extension_signature: self.extension_signature,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VoteError {
    #[error("vote height must be positive")]
    NonPositiveHeight,
    #[error("vote round must not be negative")]
    NegativeRound,
    #[error("vote has a malformed block ID: {0}")]
    MalformedBlockID(#[from] BlockError),
    #[error("vote has an empty validator address")]
    EmptyValidatorAddress,
    #[error("vote has a negative validator index")]
    NegativeValidatorIndex,
    #[error("vote is not signed")]
    MissingSignature,
    #[error("vote extension present on a vote that cannot carry one")]
    UnexpectedExtension,
    #[error("vote extension is too big")]
    ExtensionTooBig,
    #[error("vote extension signature is missing")]
    MissingExtensionSignature,
    #[error("validator address does not match the verifying key")]
    InvalidValidatorAddress,
    #[error("invalid vote signature")]
    InvalidSignature,
    #[error("invalid vote extension signature")]
    InvalidExtensionSignature,
}
