//! Shared value types flowing between the source, the sink, and the gateway.
//!
//! A [`Change`] pairs a [`Checkpoint`] (WAL position + commit time) with one
//! of the three logical-replication message variants: `Begin`, a row-level
//! change, or `Commit`. Tuples carry their columns as [`Field`]s whose datums
//! are raw PostgreSQL binary wire format, so the sink can rebind them against
//! the target without reinterpreting values.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Schema installed into the target database by the sink.
pub const EXTENSION_NAMESPACE: &str = "pgcapture";
/// Table that server-side event triggers write executed DDL into.
pub const EXTENSION_DDL_LOGS: &str = "ddl_logs";

/// Microseconds between the Unix epoch and 2000-01-01T00:00:00Z, the base of
/// PostgreSQL commit timestamps.
pub const MICROS_UNIX_EPOCH_TO_Y2K: i64 = 946_684_800_000_000;

/// A position in the replication stream: the WAL LSN of a transaction commit
/// and the corresponding commit time.
///
/// LSN 0 means "unknown / dump origin" and is never durably stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checkpoint {
    pub lsn: u64,
    pub ts: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn from_lsn(lsn: u64) -> Self {
        Self { lsn, ts: None }
    }
}

/// One message from the logical-replication stream, positioned by its
/// checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub checkpoint: Checkpoint,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Opens a transaction; carries no payload beyond its position.
    Begin,
    /// A row-level INSERT, UPDATE, or DELETE.
    Row(RowChange),
    /// Closes a transaction.
    Commit(Commit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Insert,
    Update,
    Delete,
}

/// A row-level change. `old_tuple` is empty unless the source captured the
/// replaced row (DELETE always, UPDATE only on key change or full replica
/// identity).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowChange {
    pub op: Op,
    pub namespace: String,
    pub table: String,
    pub new_tuple: Vec<Field>,
    pub old_tuple: Vec<Field>,
}

impl Default for Op {
    fn default() -> Self {
        Op::Insert
    }
}

impl RowChange {
    /// True for changes recorded by the DDL event triggers, which the sink
    /// replays as SQL text instead of a row operation.
    pub fn is_ddl(&self) -> bool {
        self.namespace == EXTENSION_NAMESPACE && self.table == EXTENSION_DDL_LOGS
    }
}

/// One column of a tuple. `datum` is PostgreSQL binary wire format for the
/// column's `oid`; `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub oid: u32,
    pub datum: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    /// Microseconds since 2000-01-01T00:00:00Z.
    pub commit_time: u64,
}

/// Descriptor for one bulk table reload, produced by the dump scheduler and
/// interpreted only by the dumper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpInfo {
    pub namespace: String,
    pub table: String,
    pub predicate: String,
}

/// Formats an LSN the way PostgreSQL prints it, e.g. `AE28/49B135E8`.
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn as u32)
}

/// Parses PostgreSQL's `hi/lo` hexadecimal LSN notation.
pub fn parse_lsn(s: &str) -> Result<u64> {
    let (hi, lo) = s
        .split_once('/')
        .ok_or_else(|| Error::InvalidLsn(s.to_string()))?;
    let hi = u32::from_str_radix(hi, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;
    let lo = u32::from_str_radix(lo, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;
    Ok((u64::from(hi) << 32) | u64::from(lo))
}

/// Converts a commit time (microseconds since the year-2000 epoch) to UTC.
pub fn commit_timestamp(commit_time: u64) -> Result<DateTime<Utc>> {
    let micros = i64::try_from(commit_time)
        .ok()
        .and_then(|t| t.checked_add(MICROS_UNIX_EPOCH_TO_Y2K))
        .ok_or_else(|| Error::InvalidTimestamp(commit_time.to_string()))?;
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::InvalidTimestamp(commit_time.to_string()))
}
