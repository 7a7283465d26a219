// src/core/store/log.rs

//! The append-only record log backing the state store.
//!
//! Each record is one CRC-framed JSON line: an 8-hex-digit CRC-32 of the
//! JSON payload, a space, the payload, a newline. Replay stops at the
//! first frame whose checksum fails and truncates the file there, so a
//! torn tail from a crash mid-write never poisons recovery.

use crate::core::UeeError;
use crate::core::store::{Envelope, Namespace};
use crc::{CRC_32_ISO_HDLC, Crc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The mutation kind a log record carries.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogOp {
    Put,
    Del,
}

/// One durable mutation of the store.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogRecord {
    pub ns: Namespace,
    pub key: String,
    pub op: LogOp,
    /// Present for `Put`, absent for `Del`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Envelope>,
}

/// Frames a record as a CRC-prefixed JSON line.
pub fn encode_record(record: &LogRecord) -> Result<Vec<u8>, UeeError> {
    let payload = serde_json::to_string(record)?;
    let checksum = CRC32.checksum(payload.as_bytes());
    Ok(format!("{checksum:08x} {payload}\n").into_bytes())
}

/// Decodes one framed line, verifying the checksum.
fn decode_line(line: &str) -> Result<LogRecord, UeeError> {
    let (crc_hex, payload) = line
        .split_once(' ')
        .ok_or_else(|| UeeError::StoreUnavailable("log frame missing checksum".to_string()))?;
    let expected = u32::from_str_radix(crc_hex, 16)
        .map_err(|_| UeeError::StoreUnavailable("log frame checksum is not hex".to_string()))?;
    if CRC32.checksum(payload.as_bytes()) != expected {
        return Err(UeeError::StoreUnavailable(
            "log frame checksum mismatch".to_string(),
        ));
    }
    serde_json::from_str(payload)
        .map_err(|e| UeeError::StoreUnavailable(format!("log frame is not a record: {e}")))
}

/// The single append point for the store. Callers serialize access with
/// an async mutex; every append is fsynced before it returns.
pub struct LogWriter {
    path: PathBuf,
    file: File,
}

impl LogWriter {
    /// Opens the log file for appending, creating it if absent.
    pub async fn open(path: &Path) -> Result<Self, UeeError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Appends one record and waits for it to reach disk.
    pub async fn append(&mut self, record: &LogRecord) -> Result<(), UeeError> {
        let frame = encode_record(record)?;
        self.file.write_all(&frame).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }

    /// Reopens the writer after the log file was replaced underneath it
    /// (compaction renames a snapshot over the old log).
    pub async fn reopen(&mut self) -> Result<(), UeeError> {
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        Ok(())
    }
}

/// Replays the log at `path`, returning all intact records in order.
///
/// A corrupt or torn frame ends the replay: everything from that offset
/// on is discarded and the file is truncated to the last good frame.
pub async fn replay(path: &Path) -> Result<Vec<LogRecord>, UeeError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    let mut good_offset = 0usize;
    let mut cursor = 0usize;

    while cursor < bytes.len() {
        let rest = &bytes[cursor..];
        let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
            // No trailing newline: a write was torn mid-frame.
            break;
        };
        let line = match std::str::from_utf8(&rest[..newline]) {
            Ok(s) => s,
            Err(_) => break,
        };
        match decode_line(line) {
            Ok(record) => {
                records.push(record);
                cursor += newline + 1;
                good_offset = cursor;
            }
            Err(e) => {
                warn!(
                    "State log corruption at byte {}: {}. Discarding the tail.",
                    cursor, e
                );
                break;
            }
        }
    }

    if good_offset < bytes.len() {
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(good_offset as u64).await?;
        file.sync_all().await?;
    }

    Ok(records)
}
