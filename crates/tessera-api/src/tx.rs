//! Distributed transaction submissions and responses
//!
//! A client turns its working set into a `TransactionSubmit`: one entry per
//! record mutation plus per-key index deltas. The coordinator answers with a
//! `TransactionResponse` mapping every submitted record to its definitively
//! assigned identity and version.

use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::wire::{self, WireError, WireResult};

/// Identity of a record: partition plus position within it
///
/// Positions below zero are temporary, client-assigned placeholders; the
/// coordinator replaces them with definitive positions during phase 1.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub partition: i32,
    pub position: i64,
}

impl RecordId {
    pub fn new(partition: i32, position: i64) -> Self {
        Self { partition, position }
    }

    /// A client-side placeholder not yet assigned by the coordinator
    pub fn is_temporary(&self) -> bool {
        self.position < 0
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.partition);
        buf.put_i64(self.position);
    }

    fn decode(buf: &mut impl Buf) -> WireResult<Self> {
        Ok(Self {
            partition: wire::get_i32(buf)?,
            position: wire::get_i64(buf)?,
        })
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.partition, self.position)
    }
}

/// Per-session identifier making submissions correlatable and idempotent
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationId {
    pub session: String,
    pub sequence: u64,
}

impl OperationId {
    pub fn new(session: impl Into<String>, sequence: u64) -> Self {
        Self {
            session: session.into(),
            sequence,
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        wire::put_string(buf, &self.session);
        buf.put_u64(self.sequence);
    }

    fn decode(buf: &mut impl Buf) -> WireResult<Self> {
        Ok(Self {
            session: wire::get_string(buf)?,
            sequence: wire::get_u64(buf)?,
        })
    }
}

impl Display for OperationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.session, self.sequence)
    }
}

/// Kind of record mutation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOperationKind {
    Create,
    Update,
    Delete,
}

impl RecordOperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOperationKind::Create => "CREATE",
            RecordOperationKind::Update => "UPDATE",
            RecordOperationKind::Delete => "DELETE",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            RecordOperationKind::Create => 0,
            RecordOperationKind::Update => 1,
            RecordOperationKind::Delete => 2,
        }
    }

    fn from_tag(tag: u8) -> WireResult<Self> {
        match tag {
            0 => Ok(RecordOperationKind::Create),
            1 => Ok(RecordOperationKind::Update),
            2 => Ok(RecordOperationKind::Delete),
            _ => Err(WireError::InvalidValue("record_operation_kind")),
        }
    }
}

impl Display for RecordOperationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One record mutation within a transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOperationRequest {
    /// Definitive id for updates/deletes, temporary id for creates
    pub id: RecordId,
    /// The version this change was based on; checked during phase 1
    pub previous_version: i32,
    pub kind: RecordOperationKind,
    /// Serialized record content; empty for deletes
    pub payload: Vec<u8>,
}

impl RecordOperationRequest {
    fn encode(&self, buf: &mut impl BufMut) {
        self.id.encode(buf);
        buf.put_i32(self.previous_version);
        buf.put_u8(self.kind.tag());
        wire::put_bytes(buf, &self.payload);
    }

    fn decode(buf: &mut impl Buf) -> WireResult<Self> {
        Ok(Self {
            id: RecordId::decode(buf)?,
            previous_version: wire::get_i32(buf)?,
            kind: RecordOperationKind::from_tag(wire::get_u8(buf)?)?,
            payload: wire::get_bytes(buf)?,
        })
    }
}

/// Put/remove deltas for a single index key
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexKeyChange {
    pub key: String,
    pub puts: Vec<RecordId>,
    pub removes: Vec<RecordId>,
}

impl IndexKeyChange {
    /// The record this change wants the key to point at, if any
    pub fn implied_holder(&self) -> Option<RecordId> {
        self.puts.last().copied()
    }

    fn encode(&self, buf: &mut impl BufMut) {
        wire::put_string(buf, &self.key);
        buf.put_u32(self.puts.len() as u32);
        for id in &self.puts {
            id.encode(buf);
        }
        buf.put_u32(self.removes.len() as u32);
        for id in &self.removes {
            id.encode(buf);
        }
    }

    fn decode(buf: &mut impl Buf) -> WireResult<Self> {
        let key = wire::get_string(buf)?;
        let puts_len = wire::get_u32(buf)? as usize;
        let mut puts = Vec::with_capacity(puts_len.min(1024));
        for _ in 0..puts_len {
            puts.push(RecordId::decode(buf)?);
        }
        let removes_len = wire::get_u32(buf)? as usize;
        let mut removes = Vec::with_capacity(removes_len.min(1024));
        for _ in 0..removes_len {
            removes.push(RecordId::decode(buf)?);
        }
        Ok(Self { key, puts, removes })
    }
}

/// All deltas a transaction applies to one index
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOperationRequest {
    pub index: String,
    pub changes: Vec<IndexKeyChange>,
}

impl IndexOperationRequest {
    fn encode(&self, buf: &mut impl BufMut) {
        wire::put_string(buf, &self.index);
        buf.put_u32(self.changes.len() as u32);
        for change in &self.changes {
            change.encode(buf);
        }
    }

    fn decode(buf: &mut impl Buf) -> WireResult<Self> {
        let index = wire::get_string(buf)?;
        let len = wire::get_u32(buf)? as usize;
        let mut changes = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            changes.push(IndexKeyChange::decode(buf)?);
        }
        Ok(Self { index, changes })
    }
}

/// A client-submitted transaction: record mutations plus index deltas
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSubmit {
    pub operation_id: OperationId,
    pub record_operations: Vec<RecordOperationRequest>,
    pub index_operations: Vec<IndexOperationRequest>,
}

impl TransactionSubmit {
    pub fn encode(&self, buf: &mut impl BufMut) {
        self.operation_id.encode(buf);
        buf.put_u32(self.record_operations.len() as u32);
        for op in &self.record_operations {
            op.encode(buf);
        }
        buf.put_u32(self.index_operations.len() as u32);
        for op in &self.index_operations {
            op.encode(buf);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> WireResult<Self> {
        let operation_id = OperationId::decode(buf)?;
        let records_len = wire::get_u32(buf)? as usize;
        let mut record_operations = Vec::with_capacity(records_len.min(1024));
        for _ in 0..records_len {
            record_operations.push(RecordOperationRequest::decode(buf)?);
        }
        let indexes_len = wire::get_u32(buf)? as usize;
        let mut index_operations = Vec::with_capacity(indexes_len.min(1024));
        for _ in 0..indexes_len {
            index_operations.push(IndexOperationRequest::decode(buf)?);
        }
        Ok(Self {
            operation_id,
            record_operations,
            index_operations,
        })
    }
}

/// Final identity and version of one record after commit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    /// The id as it appeared in the submission (possibly temporary)
    pub requested: RecordId,
    /// The definitively assigned id
    pub assigned: RecordId,
    /// The version after the transaction applied
    pub version: i32,
}

/// Coordinator answer letting every participant converge on the same state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub operation_id: OperationId,
    pub outcomes: Vec<RecordOutcome>,
}

impl TransactionResponse {
    pub fn encode(&self, buf: &mut impl BufMut) {
        self.operation_id.encode(buf);
        buf.put_u32(self.outcomes.len() as u32);
        for outcome in &self.outcomes {
            outcome.requested.encode(buf);
            outcome.assigned.encode(buf);
            buf.put_i32(outcome.version);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> WireResult<Self> {
        let operation_id = OperationId::decode(buf)?;
        let len = wire::get_u32(buf)? as usize;
        let mut outcomes = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            outcomes.push(RecordOutcome {
                requested: RecordId::decode(buf)?,
                assigned: RecordId::decode(buf)?,
                version: wire::get_i32(buf)?,
            });
        }
        Ok(Self {
            operation_id,
            outcomes,
        })
    }
}
