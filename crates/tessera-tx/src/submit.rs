//! Submit/response correlation and client-side reconciliation
//!
//! A submission is asynchronous: the client registers its operation id and
//! gets a future-style receiver back; whenever the coordinator's response
//! arrives, the context resolves it. The operation id also makes
//! resubmission after a timeout idempotent on the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use tessera_api::tx::{OperationId, RecordId, TransactionResponse};

use crate::coordinator::TxConflict;

/// What the client ultimately observes for one submission
pub type TransactionResult = Result<TransactionResponse, TxConflict>;

/// Allocates sequential operation ids for one client session
pub struct OperationIdGenerator {
    session: String,
    sequence: AtomicU64,
}

impl OperationIdGenerator {
    pub fn new() -> Self {
        Self {
            session: uuid::Uuid::new_v4().to_string(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn next_id(&self) -> OperationId {
        OperationId::new(
            self.session.clone(),
            self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
        )
    }
}

impl Default for OperationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Correlates in-flight submissions with their eventual responses
pub struct SubmitContext {
    pending: DashMap<OperationId, oneshot::Sender<TransactionResult>>,
}

impl SubmitContext {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Register a submission; the returned receiver completes when the
    /// response arrives. Registering the same id again (a resubmission)
    /// replaces the previous waiter.
    pub fn register(&self, operation_id: OperationId) -> oneshot::Receiver<TransactionResult> {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(operation_id.clone(), tx).is_some() {
            debug!(operation = %operation_id, "submission re-registered");
        }
        rx
    }

    /// Resolve a pending submission; returns `false` for an unknown id
    /// (a duplicate or long-abandoned response)
    pub fn resolve(&self, operation_id: &OperationId, result: TransactionResult) -> bool {
        match self.pending.remove(operation_id) {
            Some((_, sender)) => sender.send(result).is_ok(),
            None => false,
        }
    }

    /// Drop a pending submission without resolving it
    pub fn forget(&self, operation_id: &OperationId) {
        self.pending.remove(operation_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for SubmitContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One record as the client session tracks it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedRecord {
    pub id: RecordId,
    pub version: i32,
    /// Local modifications not yet acknowledged by the coordinator
    pub dirty: bool,
    /// Whether the locally cached copy may still be trusted
    pub cached: bool,
}

/// Client-side working set, reconciled against transaction responses
///
/// After a commit the coordinator may have assigned new identities and
/// versions; the reconciliation remaps placeholders, drops cached copies
/// the server has moved past, and only then marks records clean.
pub struct SessionRecordSet {
    records: HashMap<RecordId, TrackedRecord>,
}

impl SessionRecordSet {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    pub fn track(&mut self, id: RecordId, version: i32) {
        self.records.insert(
            id,
            TrackedRecord {
                id,
                version,
                dirty: true,
                cached: true,
            },
        );
    }

    pub fn get(&self, id: &RecordId) -> Option<&TrackedRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Fold a commit response back into the working set
    pub fn apply_response(&mut self, response: &TransactionResponse) {
        let mut reconciled = Vec::with_capacity(response.outcomes.len());
        for outcome in &response.outcomes {
            let Some(mut record) = self.records.remove(&outcome.requested) else {
                continue;
            };
            // the placeholder identity gives way to the assigned one
            record.id = outcome.assigned;
            // a version jump beyond one step means the coordinator applied a
            // conflict-resolution override; the local copy is not that record
            if outcome.version > record.version + 1 {
                record.cached = false;
            }
            record.version = outcome.version;
            reconciled.push(record);
        }

        // participating records become clean only after the whole response
        // was processed
        for mut record in reconciled {
            record.dirty = false;
            self.records.insert(record.id, record);
        }
    }
}

impl Default for SessionRecordSet {
    fn default() -> Self {
        Self::new()
    }
}
