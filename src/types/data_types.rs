/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes or numbers, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::{Add, AddAssign, Sub},
    time::{Duration, SystemTime},
};

use borsh::{BorshDeserialize, BorshSerialize};

use super::crypto_primitives::{CryptoHasher, Digest, VerifyingKey};

/// Number that uniquely identifies a blockchain.
///
/// Every replica in the same network should be configured with the same `ChainID`. The `ChainID` is
/// part of the bytes that validators sign, so that a signature produced for one chain can never be
/// replayed on another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct ChainID(u64);

impl ChainID {
    /// Create a new `ChainID` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `ChainID`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// Height of a block in the blockchain.
///
/// The first block of a chain has the chain's `initial_height` (usually 1). Messages with a negative
/// height fail basic validation.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Height(i64);

impl Height {
    /// Create a new `Height` with an `int` inner value.
    pub const fn new(int: i64) -> Self {
        Self(int)
    }

    /// Get the inner `i64` value of this `Height`.
    pub const fn int(&self) -> i64 {
        self.0
    }
}

impl Display for Height {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<i64> for Height {
    type Output = Height;
    fn add(self, rhs: i64) -> Self::Output {
        Height(self.0 + rhs)
    }
}

impl Sub<i64> for Height {
    type Output = Height;
    fn sub(self, rhs: i64) -> Self::Output {
        Height(self.0 - rhs)
    }
}

impl Sub<Height> for Height {
    type Output = i64;
    fn sub(self, rhs: Height) -> Self::Output {
        self.0 - rhs.0
    }
}

impl AddAssign<i64> for Height {
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs
    }
}

/// Round number within a single height.
///
/// Rounds start at 0 for every height. The value `-1` ([`Round::NIL`]) means "no round", e.g., an
/// unlocked validator has `locked_round == Round::NIL`, and a fresh proposal has
/// `pol_round == Round::NIL`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Round(i32);

impl Round {
    /// The "no round" sentinel.
    pub const NIL: Round = Round(-1);

    /// Create a new `Round` with an `int` inner value.
    pub const fn new(int: i32) -> Self {
        Self(int)
    }

    /// Get the inner `i32` value of this `Round`.
    pub const fn int(&self) -> i32 {
        self.0
    }

    pub const fn is_nil(&self) -> bool {
        self.0 < 0
    }

    /// Get the round immediately after this one.
    pub const fn next(&self) -> Round {
        Round(self.0 + 1)
    }
}

impl Display for Round {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<i32> for Round {
    type Output = Round;
    fn add(self, rhs: i32) -> Self::Output {
        Round(self.0 + rhs)
    }
}

impl Sub<i32> for Round {
    type Output = Round;
    fn sub(self, rhs: i32) -> Self::Output {
        Round(self.0 - rhs)
    }
}

/// 32-byte cryptographic hash.
///
/// Within this crate, all `CryptoHash`-es are SHA256 hashes. The all-zero hash is used as the
/// hash of "nothing", for example, the block hash inside a nil vote's [`BlockID`](super::block::BlockID).
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The all-zero hash.
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Compute the SHA256 hash of `bytes`.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = CryptoHasher::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Ed25519 digital signature.
///
/// Produced using the [`ed25519_dalek`] crate, whose main definitions are re-exported from the
/// [`crypto_primitives`](super::crypto_primitives) module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// The all-zero signature, used as the placeholder of a vote that has not been signed yet.
    pub const fn zero() -> Self {
        Self([0u8; 64])
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 64]
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// 20-byte identifier of a validator, derived from its public key.
///
/// The address of a validator is the first 20 bytes of the SHA256 hash of its Ed25519 verifying key.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Address([u8; 20]);

impl Address {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Derive the `Address` of the validator identified by `verifying_key`.
    pub fn from_verifying_key(verifying_key: &VerifyingKey) -> Self {
        let hash = CryptoHash::digest(verifying_key.as_bytes()).bytes();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&hash[..20]);
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 20] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Voting power of a single validator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Power(u64);

impl Power {
    /// Create a new `Power` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `Power`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// Sum of the voting powers of some set of validators.
///
/// `TotalPower` is wider than [`Power`] so that summing the powers of a whole validator set can never
/// overflow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct TotalPower(u128);

impl TotalPower {
    /// Create a new `TotalPower` with an `int` inner value.
    pub const fn new(int: u128) -> Self {
        Self(int)
    }

    /// Get the inner `u128` value of this `TotalPower`.
    pub const fn int(&self) -> u128 {
        self.0
    }

    /// Whether this amount of power is strictly more than two-thirds of `total`.
    ///
    /// The comparison is done with integer arithmetic so that every replica reaches the same result:
    /// `self > total * 2 / 3`.
    pub const fn exceeds_two_thirds_of(&self, total: TotalPower) -> bool {
        self.0 > total.0 * 2 / 3
    }

    /// Whether this amount of power is strictly more than one-third of `total`.
    pub const fn exceeds_one_third_of(&self, total: TotalPower) -> bool {
        self.0 > total.0 / 3
    }
}

impl Display for TotalPower {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl AddAssign<Power> for TotalPower {
    fn add_assign(&mut self, rhs: Power) {
        self.0 += rhs.0 as u128
    }
}

impl Add<Power> for TotalPower {
    type Output = TotalPower;
    fn add(self, rhs: Power) -> Self::Output {
        TotalPower(self.0 + rhs.0 as u128)
    }
}

/// Point in wall-clock time, as the number of nanoseconds since the Unix Epoch.
///
/// Timestamps appear in block headers, proposals, votes, and WAL entries. The zero timestamp is used as
/// "unset".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn nanos(&self) -> u64 {
        self.0
    }

    /// Read the current wall-clock time.
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Get the `SystemTime` equivalent of this `Timestamp`.
    pub fn system_time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_nanos(self.0)
    }

    /// Get the time elapsed from `earlier` to `self`, or `None` if `earlier` is later than `self`.
    pub fn checked_duration_since(&self, earlier: Timestamp) -> Option<Duration> {
        self.0.checked_sub(earlier.0).map(Duration::from_nanos)
    }

    /// Get the point in time `duration` before `self`, saturating at the Unix Epoch.
    pub fn saturating_sub(&self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(duration.as_nanos() as u64))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        Self(
            time.duration_since(SystemTime::UNIX_EPOCH)
                .map(|duration| duration.as_nanos() as u64)
                .unwrap_or(0),
        )
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;
    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_nanos() as u64))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}

/// Identifier of a peer in the peer-to-peer network: the bytes of the peer's node key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct PeerID([u8; 32]);

impl PeerID {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl From<&VerifyingKey> for PeerID {
    fn from(verifying_key: &VerifyingKey) -> Self {
        Self(verifying_key.to_bytes())
    }
}

impl Display for PeerID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl Debug for PeerID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}
