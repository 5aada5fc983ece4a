/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The write-ahead log (WAL) of the consensus state machine.
//!
//! Before the state machine processes any input, it writes the input to the WAL. After a crash, the
//! inputs written since the last committed height are replayed through the state machine, which brings
//! it back to where it was, and in particular keeps it from signing anything that conflicts with what it
//! signed before the crash.
//!
//! Two implementations are provided: [`FileWal`](file_wal::FileWal), which stores the log in a single
//! append-only file, and [`NilWal`](nil_wal::NilWal), which stores nothing.

use thiserror::Error;

use crate::types::data_types::Height;

use messages::{TimedWalMessage, WalMessage};

pub mod file_wal;

pub mod messages;

pub mod nil_wal;

pub trait Wal: Send {
    /// Append `msg` to the log. The write may be buffered.
    fn write(&mut self, msg: &WalMessage) -> Result<(), WalError>;

    /// Append `msg` to the log and make sure that it, and everything written before it, is on disk.
    fn write_sync(&mut self, msg: &WalMessage) -> Result<(), WalError>;

    fn flush_and_sync(&mut self) -> Result<(), WalError>;

    /// Find the `EndHeight(height)` marker and return every message written after it, in order.
    /// Returns `None` if the log contains no such marker.
    fn search_for_end_height(
        &mut self,
        height: Height,
    ) -> Result<Option<Vec<TimedWalMessage>>, WalError>;
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAL record of {size} bytes exceeds the maximum record size")]
    RecordTooBig { size: usize },
}
