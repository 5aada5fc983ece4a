/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A WAL stored in a single append-only file.
//!
//! ## Record format
//!
//! Each [`TimedWalMessage`] is stored as one record:
//!
//! ```text
//! | length: u32 (big endian) | Borsh-serialized message: [u8; length] | CRC32 of the message: u32 (big endian) |
//! ```
//!
//! A crash in the middle of a write can leave a partial record at the end of the file. When the file is
//! opened, it is scanned from the start, and everything from the first record that is incomplete, has a
//! wrong checksum, or does not deserialize, onwards is truncated away.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::{Height, Timestamp};

use super::{
    messages::{TimedWalMessage, WalMessage},
    Wal, WalError,
};

/// Records bigger than this are considered corrupt.
pub const MAX_RECORD_SIZE: usize = 2 * 1024 * 1024;

const LENGTH_SIZE: usize = 4;
const CHECKSUM_SIZE: usize = 4;

pub struct FileWal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileWal {
    /// Open the WAL at `path`, creating it (and its parent directories) if it does not exist, and
    /// repairing a corrupted tail if there is one.
    ///
    /// A new WAL starts with an `EndHeight(0)` marker.
    pub fn open(path: impl AsRef<Path>) -> Result<FileWal, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;
        let (_, clean_len) = decode_records(&bytes);
        if clean_len < bytes.len() {
            log::warn!(
                "WAL {} has a corrupted tail: truncating from {} to {} bytes",
                path.display(),
                bytes.len(),
                clean_len
            );
            file.set_len(clean_len as u64)?;
            file.sync_all()?;
        }

        let mut wal = FileWal {
            path,
            writer: BufWriter::new(file),
        };
        if clean_len == 0 {
            wal.write_sync(&WalMessage::EndHeight(Height::new(0)))?;
        }
        Ok(wal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every message in the log, in the order they were written.
    pub fn read_all(&mut self) -> Result<Vec<TimedWalMessage>, WalError> {
        self.writer.flush()?;
        let mut bytes = Vec::new();
        File::open(&self.path)?.read_to_end(&mut bytes)?;
        Ok(decode_records(&bytes).0)
    }
}

impl Wal for FileWal {
    fn write(&mut self, msg: &WalMessage) -> Result<(), WalError> {
        let record = encode_record(&TimedWalMessage {
            time: Timestamp::now(),
            msg: msg.clone(),
        })?;
        self.writer.write_all(&record)?;
        Ok(())
    }

    fn write_sync(&mut self, msg: &WalMessage) -> Result<(), WalError> {
        self.write(msg)?;
        self.flush_and_sync()
    }

    fn flush_and_sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn search_for_end_height(
        &mut self,
        height: Height,
    ) -> Result<Option<Vec<TimedWalMessage>>, WalError> {
        let mut messages = self.read_all()?;
        let marker = messages
            .iter()
            .rposition(|timed| timed.msg == WalMessage::EndHeight(height));
        Ok(marker.map(|position| messages.split_off(position + 1)))
    }
}

fn encode_record(msg: &TimedWalMessage) -> Result<Vec<u8>, WalError> {
    let payload = msg.try_to_vec()?;
    if payload.len() > MAX_RECORD_SIZE {
        return Err(WalError::RecordTooBig {
            size: payload.len(),
        });
    }
    let mut record = Vec::with_capacity(LENGTH_SIZE + payload.len() + CHECKSUM_SIZE);
    record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    record.extend_from_slice(&payload);
    record.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    Ok(record)
}

/// Decode records from the start of `bytes` until the end or the first corrupt record. Returns the
/// decoded messages and the number of bytes they span.
fn decode_records(bytes: &[u8]) -> (Vec<TimedWalMessage>, usize) {
    let mut messages = Vec::new();
    let mut cursor = 0;
    while cursor < bytes.len() {
        match decode_record(&bytes[cursor..]) {
            Some((msg, record_len)) => {
                messages.push(msg);
                cursor += record_len;
            }
            None => break,
        }
    }
    (messages, cursor)
}

fn decode_record(bytes: &[u8]) -> Option<(TimedWalMessage, usize)> {
    let length = u32::from_be_bytes(bytes.get(..LENGTH_SIZE)?.try_into().ok()?) as usize;
    if length > MAX_RECORD_SIZE {
        return None;
    }
    let payload = bytes.get(LENGTH_SIZE..LENGTH_SIZE + length)?;
    let checksum_start = LENGTH_SIZE + length;
    let checksum = u32::from_be_bytes(
        bytes
            .get(checksum_start..checksum_start + CHECKSUM_SIZE)?
            .try_into()
            .ok()?,
    );
    if crc32fast::hash(payload) != checksum {
        return None;
    }
    let msg = TimedWalMessage::try_from_slice(payload).ok()?;
    Some((msg, checksum_start + CHECKSUM_SIZE))
}
