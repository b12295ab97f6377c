//! Operational log of coordination requests
//!
//! The log is append-only and strictly ordered: the coordinator allocates
//! the next sequential id with `log`, replicas write coordinator-assigned
//! ids with `log_received`. Two implementations share the `OperationLog`
//! trait: `MemoryOperationLog` for volatile storages and tests, and
//! `PersistentOperationalLog` backed by segmented files.

pub mod persistent;

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;

use tessera_api::log::{LogId, LogRequest, OperationLogEntry};
use tessera_api::wire::WireError;

/// Error types for log operations
#[derive(Error, Debug)]
pub enum OplogError {
    #[error("oplog i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot decode oplog entry {0}: {1}")]
    Decode(LogId, WireError),

    #[error("corrupt oplog info file: {0}")]
    CorruptInfo(String),

    #[error("illegal oplog state: {0}")]
    IllegalState(String),
}

/// Where a log id falls relative to the retained entries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogIdStatus {
    /// The id is retained in the log
    Present,
    /// The id is beyond the last written entry
    Future,
    /// The id was pruned away (or never retained on this node)
    TooOld,
}

/// Durable, strictly-ordered, appendable log of coordination requests
pub trait OperationLog: Send + Sync {
    /// Append a brand-new entry, allocating the next sequential id
    fn log(&self, request: LogRequest) -> Result<LogId, OplogError>;

    /// Write an entry whose id was assigned by the coordinator
    ///
    /// Returns `true` when the entry is stored (or already was); `false`
    /// when it cannot be written yet because entries are missing in
    /// between. Never allocates a new id.
    fn log_received(&self, log_id: LogId, request: LogRequest) -> Result<bool, OplogError>;

    /// Highest id known to be durable
    fn last_persistent_log(&self) -> LogId;

    /// Replay the entries with ids in `[from, to]` in ascending order
    fn iterate(&self, from: LogId, to: LogId) -> Result<Vec<OperationLogEntry>, OplogError>;

    /// Truncate every entry beyond `log_id`
    fn remove_after(&self, log_id: LogId) -> Result<LogIdStatus, OplogError>;

    /// Advance the prune watermark; storage below it may be reclaimed
    fn cut_until(&self, log_id: LogId) -> Result<(), OplogError>;

    /// Tell the log whether the local node currently leads, and at which term
    fn set_leader(&self, leader: bool, term: u64);
}

/// In-memory operational log for volatile storages and tests
pub struct MemoryOperationLog {
    inner: Mutex<MemoryInner>,
}

struct MemoryInner {
    entries: VecDeque<OperationLogEntry>,
    /// Id of the first retained entry minus one (prune watermark)
    first_id: u64,
    last_id: u64,
    leader: bool,
    term: u64,
}

impl MemoryOperationLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                entries: VecDeque::new(),
                first_id: 0,
                last_id: 0,
                leader: false,
                term: 0,
            }),
        }
    }

    /// Whether the local node currently believes it leads the group
    pub fn is_leader(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.leader
    }

    /// Term last announced through `set_leader`
    pub fn term(&self) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.term
    }
}

impl Default for MemoryOperationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLog for MemoryOperationLog {
    fn log(&self, request: LogRequest) -> Result<LogId, OplogError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_id += 1;
        let id = LogId(inner.last_id);
        inner.entries.push_back(OperationLogEntry::new(id, request));
        Ok(id)
    }

    fn log_received(&self, log_id: LogId, request: LogRequest) -> Result<bool, OplogError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if log_id.0 <= inner.last_id {
            // already received, just a duplicate
            return Ok(true);
        }
        if log_id.0 > inner.last_id + 1 {
            return Ok(false);
        }
        inner.last_id = log_id.0;
        inner
            .entries
            .push_back(OperationLogEntry::new(log_id, request));
        Ok(true)
    }

    fn last_persistent_log(&self) -> LogId {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        LogId(inner.last_id)
    }

    fn iterate(&self, from: LogId, to: LogId) -> Result<Vec<OperationLogEntry>, OplogError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .entries
            .iter()
            .filter(|entry| entry.log_id >= from && entry.log_id <= to)
            .cloned()
            .collect())
    }

    fn remove_after(&self, log_id: LogId) -> Result<LogIdStatus, OplogError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if log_id.0 > inner.last_id {
            return Ok(LogIdStatus::Future);
        }
        if log_id.0 < inner.first_id {
            inner.entries.clear();
            inner.last_id = log_id.0;
            inner.first_id = log_id.0;
            return Ok(LogIdStatus::TooOld);
        }
        inner.entries.retain(|entry| entry.log_id <= log_id);
        inner.last_id = log_id.0;
        Ok(LogIdStatus::Present)
    }

    fn cut_until(&self, log_id: LogId) -> Result<(), OplogError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        while inner
            .entries
            .front()
            .is_some_and(|entry| entry.log_id <= log_id)
        {
            inner.entries.pop_front();
        }
        if log_id.0 > inner.first_id {
            inner.first_id = log_id.0;
        }
        Ok(())
    }

    fn set_leader(&self, leader: bool, term: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.leader = leader;
        inner.term = term;
    }
}
