/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives used in this crate.
//!
//! Votes and proposals are signed with Ed25519 using [`ed25519_dalek`], and hashes are SHA256 hashes
//! computed using [`sha2`]. The main definitions of both crates are re-exported here so that users do
//! not have to depend on exactly the same versions of these crates.

use super::data_types::{Address, SignatureBytes};

pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};

/// Keypair used by a local signer to sign votes and proposals.
#[derive(Clone)]
pub(crate) struct Keypair(SigningKey);

impl Keypair {
    pub(crate) fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    pub(crate) fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(message).to_bytes())
    }

    pub(crate) fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }

    pub(crate) fn address(&self) -> Address {
        Address::from_verifying_key(&self.public())
    }
}

/// Check that `signature` is a valid signature over `message` by `verifying_key`.
pub fn verify_signature(
    verifying_key: &VerifyingKey,
    message: &[u8],
    signature: &SignatureBytes,
) -> bool {
    let signature = Signature::from_bytes(&signature.bytes());
    verifying_key.verify(message, &signature).is_ok()
}
