/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::time::Duration;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    consensus::{inputs::MsgInfo, round_state::{RoundStateDigest, RoundStepType}},
    timeout_ticker::TimeoutInfo,
    types::data_types::{Height, Round, Timestamp},
};

/// Everything that the state machine writes to its write-ahead log.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum WalMessage {
    /// A step change.
    EventDataRoundState(RoundStateDigest),
    /// A message that was about to be processed.
    MsgInfo(MsgInfo),
    /// A timeout that was about to be processed.
    Timeout(WalTimeout),
    /// Marks that the block at this height was committed: everything after it belongs to the next
    /// height.
    EndHeight(Height),
}

/// A [`WalMessage`] and the time it was written.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TimedWalMessage {
    pub time: Timestamp,
    pub msg: WalMessage,
}

/// The stored form of a [`TimeoutInfo`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct WalTimeout {
    pub duration_millis: u64,
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
}

impl From<TimeoutInfo> for WalTimeout {
    fn from(value: TimeoutInfo) -> Self {
        WalTimeout {
            duration_millis: value.duration.as_millis() as u64,
            height: value.height,
            round: value.round,
            step: value.step,
        }
    }
}

impl From<WalTimeout> for TimeoutInfo {
    fn from(value: WalTimeout) -> Self {
        TimeoutInfo {
            duration: Duration::from_millis(value.duration_millis),
            height: value.height,
            round: value.round,
            step: value.step,
        }
    }
}
