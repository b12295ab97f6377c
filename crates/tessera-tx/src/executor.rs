//! Leader-side execution glue
//!
//! Ties the pieces of a replicated write together: a submission is
//! appended to the operational log, validated and applied through the
//! two-phase coordinator, and its response handed back for the submit
//! context to resolve. Replicas run the same transactions from the log,
//! so every node converges on identical record identities and versions.

use std::sync::Arc;

use tracing::{debug, warn};

use tessera_api::log::{LogId, LogRequest};
use tessera_api::tx::{TransactionResponse, TransactionSubmit};
use tessera_consistency::oplog::OperationLog;

use crate::coordinator::{TransactionCoordinator, TxError};

/// Executes submitted transactions against the local log and storage
pub struct TxExecutor {
    oplog: Arc<dyn OperationLog>,
    coordinator: Arc<TransactionCoordinator>,
}

impl TxExecutor {
    pub fn new(oplog: Arc<dyn OperationLog>, coordinator: Arc<TransactionCoordinator>) -> Self {
        Self { oplog, coordinator }
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn last_log_id(&self) -> LogId {
        self.oplog.last_persistent_log()
    }

    /// Coordinator path: record the submission in the log, then run both
    /// phases locally
    ///
    /// A transaction that fails validation still occupies its log entry;
    /// replicas replaying it reach the same verdict, so the outcome per
    /// entry is identical everywhere.
    pub async fn submit(&self, submit: TransactionSubmit) -> Result<TransactionResponse, TxError> {
        let log_id = self.oplog.log(LogRequest::Transaction(submit.clone()))?;
        debug!(operation = %submit.operation_id, log_id = %log_id, "transaction logged");
        let result = self.coordinator.execute(&submit).await;
        if let Err(TxError::Conflict(conflict)) = &result {
            warn!(operation = %submit.operation_id, "transaction conflict: {}", conflict);
        }
        result
    }

    /// Replica path: store the entry at the coordinator-assigned id and
    /// apply it
    ///
    /// Returns `None` when the entry cannot be written yet (a gap in the
    /// sequence); the caller is expected to catch up and retry.
    pub async fn apply_replicated(
        &self,
        log_id: LogId,
        submit: TransactionSubmit,
    ) -> Result<Option<TransactionResponse>, TxError> {
        if log_id <= self.oplog.last_persistent_log() {
            // already stored and applied; a retransmission
            return Ok(None);
        }
        if !self
            .oplog
            .log_received(log_id, LogRequest::Transaction(submit.clone()))?
        {
            debug!(log_id = %log_id, "replicated entry out of sequence");
            return Ok(None);
        }
        match self.coordinator.execute(&submit).await {
            Ok(response) => Ok(Some(response)),
            Err(TxError::Conflict(conflict)) => {
                // the leader reached the same verdict; nothing was applied
                debug!(log_id = %log_id, "replicated transaction conflicted: {}", conflict);
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorageEngine, StorageEngine};
    use tessera_api::tx::{
        IndexKeyChange, IndexOperationRequest, OperationId, RecordId, RecordOperationKind,
        RecordOperationRequest,
    };
    use tessera_consistency::oplog::MemoryOperationLog;

    fn executor() -> (Arc<MemoryStorageEngine>, Arc<MemoryOperationLog>, TxExecutor) {
        let engine = Arc::new(MemoryStorageEngine::new());
        engine.register_unique_index("person.name");
        let oplog = Arc::new(MemoryOperationLog::new());
        let executor = TxExecutor::new(
            oplog.clone(),
            Arc::new(TransactionCoordinator::new(engine.clone())),
        );
        (engine, oplog, executor)
    }

    fn create_submit(sequence: u64, key: &str) -> TransactionSubmit {
        let temp = RecordId::new(10, -1);
        TransactionSubmit {
            operation_id: OperationId::new("session", sequence),
            record_operations: vec![RecordOperationRequest {
                id: temp,
                previous_version: 0,
                kind: RecordOperationKind::Create,
                payload: key.as_bytes().to_vec(),
            }],
            index_operations: vec![IndexOperationRequest {
                index: "person.name".to_string(),
                changes: vec![IndexKeyChange {
                    key: key.to_string(),
                    puts: vec![temp],
                    removes: vec![],
                }],
            }],
        }
    }

    #[tokio::test]
    async fn test_submit_logs_and_applies() {
        let (engine, oplog, executor) = executor();

        let response = executor.submit(create_submit(1, "ada")).await.unwrap();
        assert_eq!(engine.record_count(), 1);
        assert_eq!(oplog.last_persistent_log(), LogId(1));

        let entries = oplog.iterate(LogId(1), LogId(1)).unwrap();
        match &entries[0].request {
            LogRequest::Transaction(logged) => {
                assert_eq!(logged.operation_id, response.operation_id);
            }
            other => panic!("expected transaction entry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conflicting_submit_still_occupies_a_log_entry() {
        let (engine, oplog, executor) = executor();

        executor.submit(create_submit(1, "ada")).await.unwrap();
        let result = executor.submit(create_submit(2, "ada")).await;
        assert!(result.is_err());

        assert_eq!(engine.record_count(), 1);
        assert_eq!(oplog.last_persistent_log(), LogId(2));
    }

    #[tokio::test]
    async fn test_replica_applies_in_sequence() {
        let (leader_engine, leader_log, leader) = executor();
        let (replica_engine, _replica_log, replica) = executor();

        leader.submit(create_submit(1, "ada")).await.unwrap();
        leader.submit(create_submit(2, "bob")).await.unwrap();

        for entry in leader_log.iterate(LogId(1), LogId(2)).unwrap() {
            let LogRequest::Transaction(submit) = entry.request else {
                panic!("expected transaction entry");
            };
            let response = replica
                .apply_replicated(entry.log_id, submit)
                .await
                .unwrap()
                .expect("in-sequence entry must apply");
            assert!(!response.outcomes[0].assigned.is_temporary());
        }

        // both nodes converged on the same identities
        assert_eq!(replica_engine.record_count(), 2);
        assert_eq!(
            replica_engine.lookup_unique_index_holder("person.name", "ada"),
            leader_engine.lookup_unique_index_holder("person.name", "ada"),
        );
        assert_eq!(replica.last_log_id(), LogId(2));
    }

    #[tokio::test]
    async fn test_submit_context_round_trip() {
        use crate::submit::{OperationIdGenerator, SessionRecordSet, SubmitContext};

        let (_, _, executor) = executor();
        let executor = Arc::new(executor);
        let context = Arc::new(SubmitContext::new());
        let ids = OperationIdGenerator::new();

        // client side: track the working set and register the submission
        let mut records = SessionRecordSet::new();
        let temp = RecordId::new(10, -1);
        records.track(temp, 0);

        let operation_id = ids.next_id();
        let mut submit = create_submit(1, "ada");
        submit.operation_id = operation_id.clone();
        let pending = context.register(operation_id.clone());

        // coordinator side: execute and resolve through the context
        {
            let executor = executor.clone();
            let context = context.clone();
            let operation_id = operation_id.clone();
            tokio::spawn(async move {
                let result = match executor.submit(submit).await {
                    Ok(response) => Ok(response),
                    Err(TxError::Conflict(conflict)) => Err(conflict),
                    Err(other) => panic!("unexpected error: {:?}", other),
                };
                context.resolve(&operation_id, result);
            });
        }

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.operation_id, operation_id);

        records.apply_response(&response);
        let assigned = response.outcomes[0].assigned;
        let record = records.get(&assigned).unwrap();
        assert_eq!(record.version, 1);
        assert!(!record.dirty);
    }

    #[tokio::test]
    async fn test_replica_rejects_gap() {
        let (_, _, replica) = executor();
        let result = replica
            .apply_replicated(LogId(5), create_submit(1, "ada"))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(replica.last_log_id(), LogId::ZERO);
    }
}
