/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Consensus parameters: protocol-level settings that every validator must agree on.
//!
//! Unlike the replica's [`Configuration`](crate::replica::Configuration), these are part of the chain
//! [`State`](super::state::State), and changing them locally would make a replica disagree with the
//! rest of the network about which votes and blocks are valid.

use std::time::Duration;

use super::{
    data_types::{Height, Round},
    part_set::BLOCK_PART_SIZE_BYTES,
};

/// Upper bound on the message delay, however large the round.
pub const MAX_MESSAGE_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsensusParams {
    pub block: BlockParams,
    pub feature: FeatureParams,
    pub synchrony: SynchronyParams,
}

impl ConsensusParams {
    pub fn vote_extensions_enabled(&self, height: Height) -> bool {
        self.feature.vote_extensions_enabled(height)
    }

    pub fn pbts_enabled(&self, height: Height) -> bool {
        self.feature.pbts_enabled(height)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockParams {
    /// Maximum size of a serialized block, in bytes.
    pub max_bytes: usize,
}

impl BlockParams {
    /// Maximum number of parts that a block of at most `max_bytes` is split into.
    pub fn max_parts(&self) -> u32 {
        (self.max_bytes.saturating_sub(1) / BLOCK_PART_SIZE_BYTES + 1) as u32
    }
}

impl Default for BlockParams {
    fn default() -> Self {
        Self {
            max_bytes: 22020096,
        }
    }
}

/// Heights from which optional protocol features are turned on.
///
/// A feature is enabled at height `h` iff its enable height is positive and not greater than `h`. An
/// enable height of zero (the default) disables the feature.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureParams {
    pub vote_extensions_enable_height: Height,
    pub pbts_enable_height: Height,
}

impl FeatureParams {
    pub fn vote_extensions_enabled(&self, height: Height) -> bool {
        feature_enabled(self.vote_extensions_enable_height, height)
    }

    /// Whether proposer-based timestamps are in effect at `height`.
    pub fn pbts_enabled(&self, height: Height) -> bool {
        feature_enabled(self.pbts_enable_height, height)
    }
}

fn feature_enabled(enable_height: Height, current_height: Height) -> bool {
    enable_height.int() > 0 && enable_height <= current_height
}

/// Bounds used to decide whether a proposal's timestamp is "timely" when proposer-based timestamps
/// are enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SynchronyParams {
    precision: Duration,
    message_delay: Duration,
}

impl SynchronyParams {
    pub fn new(precision: Duration, message_delay: Duration) -> Self {
        Self {
            precision,
            message_delay,
        }
    }

    /// Maximum clock difference between correct validators.
    pub fn precision(&self) -> Duration {
        self.precision
    }

    /// Maximum time for a proposal to travel from the proposer to every correct validator.
    pub fn message_delay(&self) -> Duration {
        self.message_delay
    }

    /// The synchrony bounds in effect in `round`: the message delay grows by 10% every round, capped at
    /// [`MAX_MESSAGE_DELAY`], so that a network whose real delay exceeds the configured one eventually
    /// accepts proposals again.
    pub fn in_round(&self, round: Round) -> SynchronyParams {
        if round.int() <= 0 {
            return *self;
        }
        let scaled = 1.1f64.powi(round.int()) * self.message_delay.as_nanos() as f64;
        let message_delay = if scaled >= MAX_MESSAGE_DELAY.as_nanos() as f64 {
            MAX_MESSAGE_DELAY
        } else {
            Duration::from_nanos(scaled as u64)
        };
        SynchronyParams {
            precision: self.precision,
            message_delay,
        }
    }
}

impl Default for SynchronyParams {
    fn default() -> Self {
        Self {
            precision: Duration::from_millis(505),
            message_delay: Duration::from_secs(15),
        }
    }
}
