/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Commits: the precommits that finalized a block, stored alongside the next block.
//!
//! A [`Commit`] has one [`CommitSig`] slot per validator (in validator set order), recording whether that
//! validator precommitted the block, precommitted nil, or was not heard from. An [`ExtendedCommit`]
//! additionally keeps the vote extensions of the committing precommits, and is what a proposer hands
//! to the application when it creates the next block while vote extensions are enabled.

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use super::{
    bit_array::BitArray,
    block::BlockID,
    data_types::{Address, ChainID, CryptoHash, Height, Round, SignatureBytes, Timestamp},
    merkle::hash_from_byte_slices,
    vote::{Vote, VoteType},
};

/// What a validator's slot in a commit says about its precommit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum BlockIDFlag {
    /// No precommit was received from this validator.
    Absent,
    /// The validator precommitted the committed block.
    Commit,
    /// The validator precommitted nil.
    Nil,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CommitSig {
    pub block_id_flag: BlockIDFlag,
    pub validator_address: Address,
    pub timestamp: Timestamp,
    pub signature: Option<SignatureBytes>,
}

impl CommitSig {
    pub fn absent() -> CommitSig {
        CommitSig {
            block_id_flag: BlockIDFlag::Absent,
            validator_address: Address::default(),
            timestamp: Timestamp::default(),
            signature: None,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.block_id_flag == BlockIDFlag::Absent
    }

    /// The block this slot's precommit was for, given the commit's `block_id`.
    pub fn block_id(&self, commit_block_id: BlockID) -> BlockID {
        match self.block_id_flag {
            BlockIDFlag::Commit => commit_block_id,
            BlockIDFlag::Absent | BlockIDFlag::Nil => BlockID::nil(),
        }
    }

    pub fn validate_basic(&self) -> Result<(), CommitError> {
        match self.block_id_flag {
            BlockIDFlag::Absent => {
                if !self.validator_address.is_zero() || self.signature.is_some() {
                    return Err(CommitError::AbsentSlotNotEmpty);
                }
            }
            BlockIDFlag::Commit | BlockIDFlag::Nil => {
                if self.validator_address.is_zero() {
                    return Err(CommitError::MissingValidatorAddress);
                }
                if self.signature.is_none() {
                    return Err(CommitError::MissingSignature);
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    pub height: Height,
    pub round: Round,
    pub block_id: BlockID,
    pub signatures: Vec<CommitSig>,
}

impl Commit {
    /// Merkle root of the Borsh serializations of the commit's signature slots.
    pub fn hash(&self) -> CryptoHash {
        let items: Vec<Vec<u8>> = self
            .signatures
            .iter()
            .map(|sig| sig.try_to_vec().unwrap_or_default())
            .collect();
        hash_from_byte_slices(&items)
    }

    pub fn size(&self) -> usize {
        self.signatures.len()
    }

    /// Reconstruct the precommit that validator `index` cast, or `None` if its slot is absent.
    pub fn get_vote(&self, index: usize) -> Option<Vote> {
        let sig = self.signatures.get(index)?;
        let signature = sig.signature?;
        Some(Vote {
            vote_type: VoteType::Precommit,
            height: self.height,
            round: self.round,
            block_id: sig.block_id(self.block_id),
            timestamp: sig.timestamp,
            validator_address: sig.validator_address,
            validator_index: index as i32,
            signature,
            extension: Vec::new(),
            extension_signature: None,
        })
    }

    /// Sign bytes of the precommit in slot `index`.
    pub fn vote_sign_bytes(&self, chain_id: ChainID, index: usize) -> Option<Vec<u8>> {
        self.get_vote(index).map(|vote| vote.sign_bytes(chain_id))
    }

    /// Bit array of the non-absent slots.
    pub fn bit_array(&self) -> BitArray {
        let mut bit_array = BitArray::new(self.signatures.len());
        for (i, sig) in self.signatures.iter().enumerate() {
            bit_array.set_index(i, !sig.is_absent());
        }
        bit_array
    }

    pub fn validate_basic(&self) -> Result<(), CommitError> {
        if self.height.int() < 0 {
            return Err(CommitError::NegativeHeight);
        }
        if self.round.int() < 0 {
            return Err(CommitError::NegativeRound);
        }
        if self.height.int() >= 1 {
            if self.block_id.is_nil() {
                return Err(CommitError::NilBlockID);
            }
            if self.signatures.is_empty() {
                return Err(CommitError::NoSignatures);
            }
            for sig in &self.signatures {
                sig.validate_basic()?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ExtendedCommitSig {
    pub commit_sig: CommitSig,
    pub extension: Vec<u8>,
    pub extension_signature: Option<SignatureBytes>,
}

impl ExtendedCommitSig {
    pub fn absent() -> ExtendedCommitSig {
        ExtendedCommitSig {
            commit_sig: CommitSig::absent(),
            extension: Vec::new(),
            extension_signature: None,
        }
    }

    /// Check that the extension data is present iff it must be.
    pub fn ensure_extension(&self, extensions_enabled: bool) -> Result<(), CommitError> {
        let carries_extension =
            !self.extension.is_empty() || self.extension_signature.is_some();
        if extensions_enabled {
            if self.commit_sig.block_id_flag == BlockIDFlag::Commit
                && self.extension_signature.is_none()
            {
                return Err(CommitError::MissingExtension {
                    validator: self.commit_sig.validator_address,
                });
            }
            if self.commit_sig.block_id_flag != BlockIDFlag::Commit && carries_extension {
                return Err(CommitError::UnexpectedExtension {
                    validator: self.commit_sig.validator_address,
                });
            }
        } else if carries_extension {
            return Err(CommitError::UnexpectedExtension {
                validator: self.commit_sig.validator_address,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ExtendedCommit {
    pub height: Height,
    pub round: Round,
    pub block_id: BlockID,
    pub extended_signatures: Vec<ExtendedCommitSig>,
}

impl ExtendedCommit {
    /// Drop the extensions, keeping only the signature slots.
    pub fn to_commit(&self) -> Commit {
        Commit {
            height: self.height,
            round: self.round,
            block_id: self.block_id,
            signatures: self
                .extended_signatures
                .iter()
                .map(|sig| sig.commit_sig.clone())
                .collect(),
        }
    }

    /// Reconstruct the precommit (extension included) that validator `index` cast.
    pub fn get_extended_vote(&self, index: usize) -> Option<Vote> {
        let sig = self.extended_signatures.get(index)?;
        let mut vote = self.to_commit().get_vote(index)?;
        vote.extension = sig.extension.clone();
        vote.extension_signature = sig.extension_signature;
        Some(vote)
    }

    pub fn ensure_extensions(&self, extensions_enabled: bool) -> Result<(), CommitError> {
        for sig in &self.extended_signatures {
            sig.ensure_extension(extensions_enabled)?;
        }
        Ok(())
    }

    pub fn bit_array(&self) -> BitArray {
        self.to_commit().bit_array()
    }

    pub fn size(&self) -> usize {
        self.extended_signatures.len()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommitError {
    #[error("commit height must not be negative")]
    NegativeHeight,
    #[error("commit round must not be negative")]
    NegativeRound,
    #[error("commit for a positive height has a nil block ID")]
    NilBlockID,
    #[error("commit has no signatures")]
    NoSignatures,
    #[error("absent commit slot carries an address or signature")]
    AbsentSlotNotEmpty,
    #[error("commit slot is missing its validator address")]
    MissingValidatorAddress,
    #[error("commit slot is missing its signature")]
    MissingSignature,
    #[error("vote extension missing for validator {validator}")]
    MissingExtension { validator: Address },
    #[error("unexpected vote extension for validator {validator}")]
    UnexpectedExtension { validator: Address },
}
