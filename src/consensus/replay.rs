/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Rebuilding the round state of the current height from the WAL after a restart.
//!
//! Everything the receive routine processed at the current height is in the WAL after the
//! `EndHeight(height - 1)` marker. Feeding those messages and timeouts back through the same handlers,
//! in the same order, brings the state machine back to where it stopped. Votes and proposals that it
//! signs again along the way are signed over the same data, so the signer hands back the same
//! signatures.

use crate::{
    app::BlockExecutor,
    pluggables::{BlockStore, EvidencePool},
    types::data_types::Height,
    wal::messages::{TimedWalMessage, WalMessage},
};

use super::{errors::ConsensusError, state::ConsensusState};

impl<E: BlockExecutor, S: BlockStore, P: EvidencePool> ConsensusState<E, S, P> {
    /// Replay the WAL entries of `height`. Problems with the WAL itself are logged and replay is
    /// skipped; only errors that would also stop the receive routine are returned.
    pub(super) fn catchup_replay(&mut self, height: Height) -> Result<(), ConsensusError> {
        match self.wal.search_for_end_height(height) {
            Ok(Some(_)) => {
                log::error!(
                    "WAL already contains the end of height {}: was the block store rolled back?",
                    height
                );
                return Ok(());
            }
            Ok(None) => (),
            Err(err) => {
                log::error!("Failed to search the WAL, skipping replay: {}", err);
                return Ok(());
            }
        }

        let msgs = match self.wal.search_for_end_height(height - 1) {
            Ok(Some(msgs)) => msgs,
            Ok(None) => {
                log::info!(
                    "WAL has no end marker for height {}, nothing to replay",
                    height - 1
                );
                return Ok(());
            }
            Err(err) => {
                log::error!("Failed to search the WAL, skipping replay: {}", err);
                return Ok(());
            }
        };

        log::info!(
            "Replaying {} WAL entries of height {}",
            msgs.len(),
            height
        );
        self.replay_mode = true;
        let result = msgs
            .into_iter()
            .try_for_each(|timed| self.read_replay_message(timed));
        self.replay_mode = false;
        result?;

        log::info!(
            "Replay done at {}/{}/{}",
            self.rs.height,
            self.rs.round,
            self.rs.step.name()
        );
        Ok(())
    }

    fn read_replay_message(&mut self, timed: TimedWalMessage) -> Result<(), ConsensusError> {
        match timed.msg {
            WalMessage::EventDataRoundState(digest) => {
                let current = self.rs.digest();
                if digest != current {
                    log::debug!(
                        "Replayed round state {}/{}/{} differs from logged {}/{}/{}",
                        current.height,
                        current.round,
                        current.step.name(),
                        digest.height,
                        digest.round,
                        digest.step.name()
                    );
                }
                Ok(())
            }
            WalMessage::MsgInfo(mi) => self.handle_msg(mi),
            WalMessage::Timeout(timeout) => self.handle_timeout(timeout.into()),
            WalMessage::EndHeight(_) => Ok(()),
        }
    }
}
