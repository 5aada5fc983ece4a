/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The signer of this replica's votes and proposals.
//!
//! Consensus never touches a signing key directly. It hands every vote and proposal that it wants to
//! sign to a [`PrivValidator`], which may refuse. [`LocalPrivValidator`] keeps the key in memory and
//! refuses to sign anything that would conflict with what it signed before.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::types::{
    crypto_primitives::{Keypair, SigningKey, VerifyingKey},
    data_types::{ChainID, Height, Round, SignatureBytes, Timestamp},
    proposal::Proposal,
    vote::{Vote, VoteType},
};

pub trait PrivValidator: Send + 'static {
    fn pub_key(&self) -> Result<VerifyingKey, PrivValidatorError>;

    /// Fill in `vote.signature` and, if `sign_extension` is set and the vote is a non-nil precommit,
    /// `vote.extension_signature`. The signer may also replace `vote.timestamp`.
    fn sign_vote(
        &mut self,
        chain_id: ChainID,
        vote: &mut Vote,
        sign_extension: bool,
    ) -> Result<(), PrivValidatorError>;

    /// Fill in `proposal.signature`. The signer may also replace `proposal.timestamp`.
    fn sign_proposal(
        &mut self,
        chain_id: ChainID,
        proposal: &mut Proposal,
    ) -> Result<(), PrivValidatorError>;
}

/// Signs with an in-memory key and remembers the last thing it signed.
///
/// Asked to sign for a `(height, round, step)` older than the last one it signed, it refuses. Asked
/// to sign for the same `(height, round, step)` again, it returns the previous signature if the request
/// matches what it signed before (up to the timestamp), and refuses otherwise. Clones share the same
/// memory.
#[derive(Clone)]
pub struct LocalPrivValidator {
    keypair: Keypair,
    last_signed: Arc<Mutex<Option<LastSigned>>>,
}

#[derive(Clone)]
struct LastSigned {
    height: Height,
    round: Round,
    step: SignStep,
    sign_bytes: Vec<u8>,
    signature: SignatureBytes,
    timestamp: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SignStep {
    Propose,
    Prevote,
    Precommit,
}

impl From<VoteType> for SignStep {
    fn from(value: VoteType) -> Self {
        match value {
            VoteType::Prevote => SignStep::Prevote,
            VoteType::Precommit => SignStep::Precommit,
        }
    }
}

/// Result of checking a sign request against the last signed message.
enum Check {
    /// Nothing was signed at this position yet.
    New,
    /// The same message was signed already: reuse its signature and timestamp.
    Same(SignatureBytes, Timestamp),
}

impl LocalPrivValidator {
    pub fn new(signing_key: SigningKey) -> LocalPrivValidator {
        LocalPrivValidator {
            keypair: Keypair::new(signing_key),
            last_signed: Arc::new(Mutex::new(None)),
        }
    }

    /// `sign_bytes_at` computes the sign bytes of the request with its timestamp replaced by the given
    /// one.
    fn check(
        last_signed: &Option<LastSigned>,
        height: Height,
        round: Round,
        step: SignStep,
        sign_bytes_at: impl Fn(Timestamp) -> Vec<u8>,
    ) -> Result<Check, PrivValidatorError> {
        let last = match last_signed {
            Some(last) => last,
            None => return Ok(Check::New),
        };
        if (height, round, step) < (last.height, last.round, last.step) {
            return Err(PrivValidatorError::Regression {
                height,
                round,
                last_height: last.height,
                last_round: last.round,
            });
        }
        if (height, round, step) > (last.height, last.round, last.step) {
            return Ok(Check::New);
        }
        if sign_bytes_at(last.timestamp) == last.sign_bytes {
            Ok(Check::Same(last.signature, last.timestamp))
        } else {
            Err(PrivValidatorError::ConflictingData { height, round })
        }
    }
}

impl PrivValidator for LocalPrivValidator {
    fn pub_key(&self) -> Result<VerifyingKey, PrivValidatorError> {
        Ok(self.keypair.public())
    }

    fn sign_vote(
        &mut self,
        chain_id: ChainID,
        vote: &mut Vote,
        sign_extension: bool,
    ) -> Result<(), PrivValidatorError> {
        let mut last_signed = self
            .last_signed
            .lock()
            .map_err(|_| PrivValidatorError::Poisoned)?;
        let step = SignStep::from(vote.vote_type);
        let check = Self::check(&last_signed, vote.height, vote.round, step, |timestamp| {
            let mut vote = vote.clone();
            vote.timestamp = timestamp;
            vote.sign_bytes(chain_id)
        })?;

        // Extensions are not covered by the double-sign check: re-extending the same vote is harmless.
        if sign_extension && vote.vote_type == VoteType::Precommit && !vote.is_nil() {
            vote.extension_signature = Some(self.keypair.sign(&vote.extension_sign_bytes(chain_id)));
        }

        match check {
            Check::Same(signature, timestamp) => {
                vote.signature = signature;
                vote.timestamp = timestamp;
            }
            Check::New => {
                let sign_bytes = vote.sign_bytes(chain_id);
                vote.signature = self.keypair.sign(&sign_bytes);
                *last_signed = Some(LastSigned {
                    height: vote.height,
                    round: vote.round,
                    step,
                    sign_bytes,
                    signature: vote.signature,
                    timestamp: vote.timestamp,
                });
            }
        }
        Ok(())
    }

    fn sign_proposal(
        &mut self,
        chain_id: ChainID,
        proposal: &mut Proposal,
    ) -> Result<(), PrivValidatorError> {
        let mut last_signed = self
            .last_signed
            .lock()
            .map_err(|_| PrivValidatorError::Poisoned)?;
        let check = Self::check(
            &last_signed,
            proposal.height,
            proposal.round,
            SignStep::Propose,
            |timestamp| {
                let mut proposal = proposal.clone();
                proposal.timestamp = timestamp;
                proposal.sign_bytes(chain_id)
            },
        )?;

        match check {
            Check::Same(signature, timestamp) => {
                proposal.signature = signature;
                proposal.timestamp = timestamp;
            }
            Check::New => {
                let sign_bytes = proposal.sign_bytes(chain_id);
                proposal.signature = self.keypair.sign(&sign_bytes);
                *last_signed = Some(LastSigned {
                    height: proposal.height,
                    round: proposal.round,
                    step: SignStep::Propose,
                    sign_bytes,
                    signature: proposal.signature,
                    timestamp: proposal.timestamp,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PrivValidatorError {
    #[error("refusing to sign for {height}/{round}: already signed for {last_height}/{last_round}")]
    Regression {
        height: Height,
        round: Round,
        last_height: Height,
        last_round: Round,
    },
    #[error("refusing to sign conflicting data at {height}/{round}")]
    ConflictingData { height: Height, round: Round },
    #[error("signer state lock is poisoned")]
    Poisoned,
    #[error("remote signer error: {reason}")]
    Remote { reason: String },
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::*;
    use crate::types::{
        block::BlockID,
        data_types::{Address, CryptoHash},
        part_set::PartSetHeader,
    };

    fn block_id(n: u8) -> BlockID {
        BlockID::new(
            CryptoHash::new([n; 32]),
            PartSetHeader {
                total: 1,
                hash: CryptoHash::new([n; 32]),
            },
        )
    }

    fn vote(validator: &LocalPrivValidator, round: i32, vote_type: VoteType, block_id: BlockID) -> Vote {
        Vote {
            vote_type,
            height: Height::new(3),
            round: Round::new(round),
            block_id,
            timestamp: Timestamp::now(),
            validator_address: Address::from_verifying_key(&validator.pub_key().unwrap()),
            validator_index: 0,
            signature: SignatureBytes::zero(),
            extension: vec![1, 2, 3],
            extension_signature: None,
        }
    }

    #[test]
    fn signed_vote_verifies() {
        let mut signer = LocalPrivValidator::new(SigningKey::generate(&mut OsRng));
        let chain_id = ChainID::new(1);
        let mut precommit = vote(&signer, 0, VoteType::Precommit, block_id(1));
        signer.sign_vote(chain_id, &mut precommit, true).unwrap();
        let key = signer.pub_key().unwrap();
        assert!(precommit.verify_vote_and_extension(chain_id, &key).is_ok());
    }

    #[test]
    fn conflicting_vote_is_refused() {
        let mut signer = LocalPrivValidator::new(SigningKey::generate(&mut OsRng));
        let chain_id = ChainID::new(1);
        let mut first = vote(&signer, 0, VoteType::Prevote, block_id(1));
        signer.sign_vote(chain_id, &mut first, false).unwrap();

        let mut again = vote(&signer, 0, VoteType::Prevote, block_id(1));
        signer.sign_vote(chain_id, &mut again, false).unwrap();
        assert_eq!(again.signature, first.signature);
        assert_eq!(again.timestamp, first.timestamp);

        let mut conflicting = vote(&signer, 0, VoteType::Prevote, block_id(2));
        assert!(matches!(
            signer.sign_vote(chain_id, &mut conflicting, false),
            Err(PrivValidatorError::ConflictingData { .. })
        ));
    }

    #[test]
    fn older_positions_are_refused() {
        let mut signer = LocalPrivValidator::new(SigningKey::generate(&mut OsRng));
        let chain_id = ChainID::new(1);
        let mut precommit = vote(&signer, 1, VoteType::Precommit, BlockID::nil());
        signer.sign_vote(chain_id, &mut precommit, false).unwrap();

        let mut prevote = vote(&signer, 1, VoteType::Prevote, BlockID::nil());
        assert!(matches!(
            signer.sign_vote(chain_id, &mut prevote, false),
            Err(PrivValidatorError::Regression { .. })
        ));
        let mut next_round = vote(&signer, 2, VoteType::Prevote, block_id(4));
        assert!(signer.sign_vote(chain_id, &mut next_round, false).is_ok());
    }

    #[test]
    fn re_signing_a_proposal_keeps_its_timestamp() {
        let mut signer = LocalPrivValidator::new(SigningKey::generate(&mut OsRng));
        let chain_id = ChainID::new(1);
        let mut proposal = Proposal::new(
            Height::new(3),
            Round::new(0),
            Round::NIL,
            block_id(1),
            Timestamp::from_nanos(10),
        );
        signer.sign_proposal(chain_id, &mut proposal).unwrap();

        let mut again = Proposal::new(
            Height::new(3),
            Round::new(0),
            Round::NIL,
            block_id(1),
            Timestamp::from_nanos(20),
        );
        signer.sign_proposal(chain_id, &mut again).unwrap();
        assert_eq!(again, proposal);
        assert!(again.verify(chain_id, &signer.pub_key().unwrap()));
    }
}
