//! Two-phase distributed transaction coordinator
//!
//! Phase 1 validates the submission against the storage engine and
//! preallocates identities for new records; it never mutates visible
//! state, so a failed or vetoed transaction has nothing to roll back.
//! Phase 2 applies the prevalidated operation set atomically.
//!
//! Phase 1 and phase 2 of competing transactions are serialized per
//! record/index key through sorted lock guards: two transactions racing on
//! the same unique-index key can never both pass validation.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use tessera_api::tx::{
    IndexOperationRequest, OperationId, RecordId, RecordOperationKind, RecordOutcome,
    TransactionResponse, TransactionSubmit,
};
use tessera_common::TesseraError;
use tessera_consistency::oplog::OplogError;

use crate::storage::{AppliedRecord, ResolvedRecordOperation, StorageEngine};

/// Client-visible conflict kinds
///
/// Conflicts are never retried inside the coordinator; they propagate one
/// hop to the submitting client, which decides to retry, merge or give up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxConflict {
    #[error("duplicated key '{key}' in index '{index}', already assigned to record {holder}")]
    DuplicateKey {
        index: String,
        key: String,
        holder: RecordId,
    },

    #[error("record {id} was modified concurrently: submitted version {expected}, stored version {actual}")]
    ConcurrentModification {
        id: RecordId,
        expected: i32,
        actual: i32,
    },

    #[error("record {id} was deleted concurrently")]
    ConcurrentDelete { id: RecordId },

    #[error("record was created concurrently: expected {expected}, found {actual}")]
    ConcurrentCreate { expected: RecordId, actual: RecordId },
}

impl TxConflict {
    /// Whether a fresh submission of the same transaction may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxConflict::ConcurrentCreate { .. })
    }
}

/// Errors of the transaction execution path
#[derive(Error, Debug)]
pub enum TxError {
    #[error(transparent)]
    Conflict(#[from] TxConflict),

    #[error("storage error: {0}")]
    Storage(#[from] TesseraError),

    #[error("operation log error: {0}")]
    Oplog(#[from] OplogError),
}

/// Output of phase 1: the validated, identity-resolved operation set
#[derive(Debug)]
pub struct PreparedTransaction {
    pub operation_id: OperationId,
    pub operations: Vec<ResolvedRecordOperation>,
    pub index_operations: Vec<IndexOperationRequest>,
}

/// Lock key covering either a record or one unique-index key
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum LockKey {
    Record(RecordId),
    IndexKey(String, String),
}

/// Two-phase coordinator bound to one storage engine
pub struct TransactionCoordinator {
    engine: Arc<dyn StorageEngine>,
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl TransactionCoordinator {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            engine,
            locks: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Run both phases under the transaction's key locks
    pub async fn execute(&self, submit: &TransactionSubmit) -> Result<TransactionResponse, TxError> {
        let _guards = self.lock_keys(submit).await;
        let prepared = self.first_phase(submit)?;
        let applied = self.second_phase(&prepared, true)?;
        Ok(Self::build_response(prepared.operation_id, applied))
    }

    /// Acquire the guards covering every record and unique-index key the
    /// submission touches, in sorted order
    pub async fn lock_keys(&self, submit: &TransactionSubmit) -> Vec<OwnedMutexGuard<()>> {
        let mut keys = BTreeSet::new();
        for op in &submit.record_operations {
            if !op.id.is_temporary() {
                keys.insert(LockKey::Record(op.id));
            }
        }
        for index_op in &submit.index_operations {
            if self.engine.is_unique_index(&index_op.index) {
                for change in &index_op.changes {
                    keys.insert(LockKey::IndexKey(
                        index_op.index.clone(),
                        change.key.clone(),
                    ));
                }
            }
        }

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = self
                .locks
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    /// Phase 1: preallocate identities and validate without mutating state
    pub fn first_phase(&self, submit: &TransactionSubmit) -> Result<PreparedTransaction, TxConflict> {
        // preallocate positions for new records so the same identities are
        // reproducible when the transaction is replayed from the log
        let mut assigned_ids: HashMap<RecordId, RecordId> = HashMap::new();
        let mut operations = Vec::with_capacity(submit.record_operations.len());
        for op in &submit.record_operations {
            let assigned = if op.kind == RecordOperationKind::Create && op.id.is_temporary() {
                let position = self.engine.preallocate_position(op.id.partition);
                let assigned = RecordId::new(op.id.partition, position);
                assigned_ids.insert(op.id, assigned);
                assigned
            } else {
                op.id
            };
            operations.push(ResolvedRecordOperation {
                requested: op.id,
                assigned,
                kind: op.kind,
                payload: op.payload.clone(),
                previous_version: op.previous_version,
            });
        }

        // unique-index duplicate detection
        let mut index_operations = Vec::with_capacity(submit.index_operations.len());
        for index_op in &submit.index_operations {
            let mut resolved = IndexOperationRequest {
                index: index_op.index.clone(),
                changes: Vec::with_capacity(index_op.changes.len()),
            };
            let unique = self.engine.is_unique_index(&index_op.index);
            for change in &index_op.changes {
                let mut change = change.clone();
                for id in change.puts.iter_mut().chain(change.removes.iter_mut()) {
                    if let Some(assigned) = assigned_ids.get(id) {
                        *id = *assigned;
                    }
                }
                if unique {
                    if let Some(implied) = change.implied_holder() {
                        let holder = self
                            .engine
                            .lookup_unique_index_holder(&index_op.index, &change.key);
                        if let Some(holder) = holder {
                            if holder != implied {
                                return Err(TxConflict::DuplicateKey {
                                    index: index_op.index.clone(),
                                    key: change.key.clone(),
                                    holder,
                                });
                            }
                        }
                    }
                }
                resolved.changes.push(change);
            }
            index_operations.push(resolved);
        }

        // version checks for updates and deletes
        for op in &submit.record_operations {
            if op.kind == RecordOperationKind::Create {
                continue;
            }
            match self.engine.current_version(&op.id) {
                Some(actual) if actual == op.previous_version => {}
                Some(actual) => {
                    return Err(TxConflict::ConcurrentModification {
                        id: op.id,
                        expected: op.previous_version,
                        actual,
                    });
                }
                None => {
                    if self.engine.is_tombstone(&op.id) {
                        return Err(TxConflict::ConcurrentDelete { id: op.id });
                    }
                    // the record the client saw is gone and something else
                    // may own its identity now; retryable
                    return Err(TxConflict::ConcurrentCreate {
                        expected: RecordId::new(op.id.partition, -1),
                        actual: op.id,
                    });
                }
            }
        }

        debug!(
            operation = %submit.operation_id,
            records = operations.len(),
            "transaction validated"
        );
        Ok(PreparedTransaction {
            operation_id: submit.operation_id.clone(),
            operations,
            index_operations,
        })
    }

    /// Phase 2: apply atomically on success, discard on failure
    ///
    /// With `success = false` this is a no-op: phase 1 only validated and
    /// preallocated, so there is nothing to undo.
    pub fn second_phase(
        &self,
        prepared: &PreparedTransaction,
        success: bool,
    ) -> Result<Vec<AppliedRecord>, TxError> {
        if !success {
            debug!(operation = %prepared.operation_id, "transaction discarded");
            return Ok(Vec::new());
        }
        let applied = self
            .engine
            .apply_atomic(&prepared.operations, &prepared.index_operations)?;
        debug!(
            operation = %prepared.operation_id,
            records = applied.len(),
            "transaction applied"
        );
        Ok(applied)
    }

    fn build_response(operation_id: OperationId, applied: Vec<AppliedRecord>) -> TransactionResponse {
        TransactionResponse {
            operation_id,
            outcomes: applied
                .into_iter()
                .map(|record| RecordOutcome {
                    requested: record.requested,
                    assigned: record.assigned,
                    version: record.version,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorageEngine;
    use tessera_api::tx::{IndexKeyChange, RecordOperationRequest};

    fn coordinator() -> (Arc<MemoryStorageEngine>, TransactionCoordinator) {
        let engine = Arc::new(MemoryStorageEngine::new());
        engine.register_unique_index("person.name");
        let coordinator = TransactionCoordinator::new(engine.clone());
        (engine, coordinator)
    }

    fn create_op(temp: i64, payload: &[u8]) -> RecordOperationRequest {
        RecordOperationRequest {
            id: RecordId::new(10, temp),
            previous_version: 0,
            kind: RecordOperationKind::Create,
            payload: payload.to_vec(),
        }
    }

    fn index_put(key: &str, id: RecordId) -> IndexOperationRequest {
        IndexOperationRequest {
            index: "person.name".to_string(),
            changes: vec![IndexKeyChange {
                key: key.to_string(),
                puts: vec![id],
                removes: vec![],
            }],
        }
    }

    fn submit(
        sequence: u64,
        records: Vec<RecordOperationRequest>,
        indexes: Vec<IndexOperationRequest>,
    ) -> TransactionSubmit {
        TransactionSubmit {
            operation_id: OperationId::new("session", sequence),
            record_operations: records,
            index_operations: indexes,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_identities() {
        let (engine, coordinator) = coordinator();
        let tx = submit(
            1,
            vec![create_op(-1, b"ada")],
            vec![index_put("ada", RecordId::new(10, -1))],
        );
        let response = coordinator.execute(&tx).await.unwrap();

        assert_eq!(response.outcomes.len(), 1);
        let outcome = &response.outcomes[0];
        assert_eq!(outcome.requested, RecordId::new(10, -1));
        assert!(!outcome.assigned.is_temporary());
        assert_eq!(outcome.version, 1);
        assert_eq!(
            engine.lookup_unique_index_holder("person.name", "ada"),
            Some(outcome.assigned)
        );
    }

    #[tokio::test]
    async fn test_duplicate_key_conflict_names_index_key_and_holder() {
        let (_, coordinator) = coordinator();
        let first = submit(
            1,
            vec![create_op(-1, b"ada")],
            vec![index_put("ada", RecordId::new(10, -1))],
        );
        let winner = coordinator.execute(&first).await.unwrap().outcomes[0].assigned;

        let second = submit(
            2,
            vec![create_op(-1, b"ada again")],
            vec![index_put("ada", RecordId::new(10, -1))],
        );
        let conflict = match coordinator.execute(&second).await {
            Err(TxError::Conflict(conflict)) => conflict,
            other => panic!("expected conflict, got {:?}", other),
        };
        assert_eq!(
            conflict,
            TxConflict::DuplicateKey {
                index: "person.name".to_string(),
                key: "ada".to_string(),
                holder: winner,
            }
        );
        assert!(!conflict.is_retryable());
    }

    #[tokio::test]
    async fn test_concurrent_inserts_one_wins() {
        let (_, coordinator) = coordinator();
        let coordinator = Arc::new(coordinator);

        let mut handles = Vec::new();
        for sequence in 0..2u64 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                let tx = submit(
                    sequence,
                    vec![create_op(-1, b"ada")],
                    vec![index_put("ada", RecordId::new(10, -1))],
                );
                coordinator.execute(&tx).await
            }));
        }

        let mut successes = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(TxError::Conflict(TxConflict::DuplicateKey { key, .. })) => {
                    assert_eq!(key, "ada");
                    duplicates += 1;
                }
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(duplicates, 1);
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let (_, coordinator) = coordinator();
        let created = coordinator
            .execute(&submit(1, vec![create_op(-1, b"v1")], vec![]))
            .await
            .unwrap();
        let id = created.outcomes[0].assigned;

        // a first update moves the stored version to 2
        let update = RecordOperationRequest {
            id,
            previous_version: 1,
            kind: RecordOperationKind::Update,
            payload: b"v2".to_vec(),
        };
        coordinator
            .execute(&submit(2, vec![update.clone()], vec![]))
            .await
            .unwrap();

        // a second update based on the stale version must be rejected
        let result = coordinator.execute(&submit(3, vec![update], vec![])).await;
        match result {
            Err(TxError::Conflict(TxConflict::ConcurrentModification {
                id: conflicting,
                expected,
                actual,
            })) => {
                assert_eq!(conflicting, id);
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected concurrent modification, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_of_deleted_record_is_concurrent_delete() {
        let (_, coordinator) = coordinator();
        let created = coordinator
            .execute(&submit(1, vec![create_op(-1, b"v1")], vec![]))
            .await
            .unwrap();
        let id = created.outcomes[0].assigned;

        let delete = RecordOperationRequest {
            id,
            previous_version: 1,
            kind: RecordOperationKind::Delete,
            payload: Vec::new(),
        };
        coordinator
            .execute(&submit(2, vec![delete], vec![]))
            .await
            .unwrap();

        let update = RecordOperationRequest {
            id,
            previous_version: 1,
            kind: RecordOperationKind::Update,
            payload: b"v2".to_vec(),
        };
        let result = coordinator.execute(&submit(3, vec![update], vec![])).await;
        assert!(matches!(
            result,
            Err(TxError::Conflict(TxConflict::ConcurrentDelete { id: deleted })) if deleted == id
        ));
    }

    #[tokio::test]
    async fn test_update_of_unknown_record_is_retryable_create_conflict() {
        let (_, coordinator) = coordinator();
        let ghost = RecordId::new(10, 99);
        let update = RecordOperationRequest {
            id: ghost,
            previous_version: 1,
            kind: RecordOperationKind::Update,
            payload: b"v2".to_vec(),
        };
        let result = coordinator.execute(&submit(1, vec![update], vec![])).await;
        match result {
            Err(TxError::Conflict(conflict @ TxConflict::ConcurrentCreate { actual, .. })) => {
                assert_eq!(actual, ghost);
                assert!(conflict.is_retryable());
            }
            other => panic!("expected create conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_discard_leaves_no_trace() {
        let (engine, coordinator) = coordinator();
        let tx = submit(
            1,
            vec![create_op(-1, b"ada")],
            vec![index_put("ada", RecordId::new(10, -1))],
        );

        let prepared = coordinator.first_phase(&tx).unwrap();
        let applied = coordinator.second_phase(&prepared, false).unwrap();

        assert!(applied.is_empty());
        assert_eq!(engine.record_count(), 0);
        assert_eq!(engine.lookup_unique_index_holder("person.name", "ada"), None);
    }

    #[tokio::test]
    async fn test_reinserting_same_holder_is_not_a_conflict() {
        let (_, coordinator) = coordinator();
        let created = coordinator
            .execute(&submit(
                1,
                vec![create_op(-1, b"ada")],
                vec![index_put("ada", RecordId::new(10, -1))],
            ))
            .await
            .unwrap();
        let id = created.outcomes[0].assigned;

        // an update that re-asserts the same key -> record mapping is fine
        let update = RecordOperationRequest {
            id,
            previous_version: 1,
            kind: RecordOperationKind::Update,
            payload: b"ada v2".to_vec(),
        };
        let result = coordinator
            .execute(&submit(2, vec![update], vec![index_put("ada", id)]))
            .await;
        assert!(result.is_ok());
    }
}
