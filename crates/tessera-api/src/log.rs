//! Operational-log identifiers and request payloads
//!
//! Log entries are identified by a `LogId` and carry a `LogRequest`, the
//! coordination command being replicated. Requests are encoded with a
//! stable numeric tag; decoding goes through an explicit registry so a new
//! request kind is one registration away, with no dynamic type lookup.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::tx::TransactionSubmit;
use crate::wire::{self, WireError, WireResult};

/// Request-type tag for a replicated transaction submission
pub const REQUEST_TRANSACTION: u32 = 1;
/// Request-type tag for a coordinator confirmation watermark
pub const REQUEST_CONFIRM: u32 = 2;

/// Strictly increasing identifier of an operational-log entry
///
/// Ids are gapless under normal operation; 0 means "nothing logged yet"
/// and the first assigned id is 1. A `LogId` is the only valid way to
/// reference a logged request.
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LogId(pub u64);

impl LogId {
    /// The id before any entry was logged
    pub const ZERO: LogId = LogId(0);

    pub fn next(&self) -> LogId {
        LogId(self.0 + 1)
    }
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A coordination command carried by a log entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogRequest {
    /// A transaction to validate and apply on every replica
    Transaction(TransactionSubmit),
    /// The coordinator confirming that everything up to `up_to` is settled
    Confirm { up_to: LogId },
}

impl LogRequest {
    /// Stable numeric tag identifying the request kind on disk and wire
    pub fn request_type(&self) -> u32 {
        match self {
            LogRequest::Transaction(_) => REQUEST_TRANSACTION,
            LogRequest::Confirm { .. } => REQUEST_CONFIRM,
        }
    }

    /// Serialize the payload (without the type tag)
    pub fn encode_payload(&self, buf: &mut impl BufMut) {
        match self {
            LogRequest::Transaction(submit) => submit.encode(buf),
            LogRequest::Confirm { up_to } => buf.put_u64(up_to.0),
        }
    }
}

/// Decoder function for one request kind
pub type LogRequestDecoder = fn(&mut &[u8]) -> WireResult<LogRequest>;

/// Explicit mapping from request-type tag to decoder
///
/// Replaces lookup-by-class-name: embedders register additional request
/// kinds at composition time and the log replays them without any dynamic
/// type machinery.
pub struct LogRequestRegistry {
    decoders: HashMap<u32, LogRequestDecoder>,
}

impl Default for LogRequestRegistry {
    fn default() -> Self {
        let mut registry = Self {
            decoders: HashMap::new(),
        };
        registry.register(REQUEST_TRANSACTION, |buf| {
            Ok(LogRequest::Transaction(TransactionSubmit::decode(buf)?))
        });
        registry.register(REQUEST_CONFIRM, |buf| {
            Ok(LogRequest::Confirm {
                up_to: LogId(wire::get_u64(buf)?),
            })
        });
        registry
    }
}

impl LogRequestRegistry {
    pub fn register(&mut self, request_type: u32, decoder: LogRequestDecoder) {
        self.decoders.insert(request_type, decoder);
    }

    pub fn decode(&self, request_type: u32, payload: &[u8]) -> WireResult<LogRequest> {
        let decoder = self
            .decoders
            .get(&request_type)
            .ok_or(WireError::UnknownTag(request_type))?;
        let mut slice = payload;
        decoder(&mut slice)
    }
}

/// One immutable entry of the operational log
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationLogEntry {
    pub log_id: LogId,
    pub request: LogRequest,
}

impl OperationLogEntry {
    pub fn new(log_id: LogId, request: LogRequest) -> Self {
        Self { log_id, request }
    }
}
