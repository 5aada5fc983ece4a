/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use crate::types::data_types::Height;

use super::{
    messages::{TimedWalMessage, WalMessage},
    Wal, WalError,
};

/// A WAL that stores nothing. Used when no WAL path is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NilWal;

impl Wal for NilWal {
    fn write(&mut self, _msg: &WalMessage) -> Result<(), WalError> {
        Ok(())
    }

    fn write_sync(&mut self, _msg: &WalMessage) -> Result<(), WalError> {
        Ok(())
    }

    fn flush_and_sync(&mut self) -> Result<(), WalError> {
        Ok(())
    }

    fn search_for_end_height(
        &mut self,
        _height: Height,
    ) -> Result<Option<Vec<TimedWalMessage>>, WalError> {
        Ok(None)
    }
}
