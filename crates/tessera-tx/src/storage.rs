//! Storage engine collaborator
//!
//! The coordinator never touches raw storage pages; it talks to the engine
//! through this narrow trait. `MemoryStorageEngine` implements it for
//! volatile embeddings and tests.

use std::collections::HashMap;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use tessera_api::tx::{IndexOperationRequest, RecordId, RecordOperationKind};
use tessera_common::TesseraError;

/// A record operation after phase-1 identity resolution
#[derive(Clone, Debug)]
pub struct ResolvedRecordOperation {
    /// Identity as submitted by the client (possibly temporary)
    pub requested: RecordId,
    /// Definitive identity, preallocated for creates
    pub assigned: RecordId,
    pub kind: RecordOperationKind,
    pub payload: Vec<u8>,
    pub previous_version: i32,
}

/// Outcome of applying one record operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppliedRecord {
    pub requested: RecordId,
    pub assigned: RecordId,
    pub version: i32,
}

/// Narrow surface the coordinator needs from the storage engine
pub trait StorageEngine: Send + Sync {
    /// Reserve the next position in `partition`, reproducible on replay
    fn preallocate_position(&self, partition: i32) -> i64;

    /// Authoritative version of a record, or `None` when it does not exist
    fn current_version(&self, id: &RecordId) -> Option<i32>;

    /// Whether a missing record is known to have been deleted
    fn is_tombstone(&self, id: &RecordId) -> bool;

    /// Whether `index` enforces key uniqueness
    fn is_unique_index(&self, index: &str) -> bool;

    /// The record currently holding `key` in a unique index
    fn lookup_unique_index_holder(&self, index: &str, key: &str) -> Option<RecordId>;

    /// Apply a prevalidated operation set atomically
    fn apply_atomic(
        &self,
        operations: &[ResolvedRecordOperation],
        index_operations: &[IndexOperationRequest],
    ) -> Result<Vec<AppliedRecord>, TesseraError>;
}

#[derive(Clone, Debug)]
struct StoredRecord {
    payload: Vec<u8>,
    version: i32,
}

/// In-memory storage engine with versioned records, tombstones and unique
/// indexes
pub struct MemoryStorageEngine {
    records: DashMap<RecordId, StoredRecord>,
    tombstones: DashSet<RecordId>,
    unique_indexes: DashSet<String>,
    indexes: DashMap<String, HashMap<String, RecordId>>,
    positions: Mutex<HashMap<i32, i64>>,
}

impl MemoryStorageEngine {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            tombstones: DashSet::new(),
            unique_indexes: DashSet::new(),
            indexes: DashMap::new(),
            positions: Mutex::new(HashMap::new()),
        }
    }

    /// Declare `index` unique; lookups against it take part in phase-1
    /// duplicate detection
    pub fn register_unique_index(&self, index: impl Into<String>) {
        self.unique_indexes.insert(index.into());
    }

    /// Direct read access, for embedders and tests
    pub fn record_payload(&self, id: &RecordId) -> Option<Vec<u8>> {
        self.records.get(id).map(|r| r.payload.clone())
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl Default for MemoryStorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for MemoryStorageEngine {
    fn preallocate_position(&self, partition: i32) -> i64 {
        let mut positions = self.positions.lock();
        let counter = positions.entry(partition).or_insert(0);
        let position = *counter;
        *counter += 1;
        position
    }

    fn current_version(&self, id: &RecordId) -> Option<i32> {
        self.records.get(id).map(|r| r.version)
    }

    fn is_tombstone(&self, id: &RecordId) -> bool {
        self.tombstones.contains(id)
    }

    fn is_unique_index(&self, index: &str) -> bool {
        self.unique_indexes.contains(index)
    }

    fn lookup_unique_index_holder(&self, index: &str, key: &str) -> Option<RecordId> {
        self.indexes
            .get(index)
            .and_then(|entries| entries.get(key).copied())
    }

    fn apply_atomic(
        &self,
        operations: &[ResolvedRecordOperation],
        index_operations: &[IndexOperationRequest],
    ) -> Result<Vec<AppliedRecord>, TesseraError> {
        let mut applied = Vec::with_capacity(operations.len());
        for op in operations {
            let version = match op.kind {
                RecordOperationKind::Create => {
                    self.tombstones.remove(&op.assigned);
                    self.records.insert(
                        op.assigned,
                        StoredRecord {
                            payload: op.payload.clone(),
                            version: 1,
                        },
                    );
                    1
                }
                RecordOperationKind::Update => {
                    let mut entry = self.records.get_mut(&op.assigned).ok_or_else(|| {
                        TesseraError::Storage(format!("record {} vanished", op.assigned))
                    })?;
                    entry.version += 1;
                    entry.payload = op.payload.clone();
                    entry.version
                }
                RecordOperationKind::Delete => {
                    let removed = self.records.remove(&op.assigned).ok_or_else(|| {
                        TesseraError::Storage(format!("record {} vanished", op.assigned))
                    })?;
                    self.tombstones.insert(op.assigned);
                    removed.1.version + 1
                }
            };
            applied.push(AppliedRecord {
                requested: op.requested,
                assigned: op.assigned,
                version,
            });
        }

        for index_op in index_operations {
            let mut entries = self.indexes.entry(index_op.index.clone()).or_default();
            for change in &index_op.changes {
                for removed in &change.removes {
                    if entries.get(&change.key) == Some(removed) {
                        entries.remove(&change.key);
                    }
                }
                if let Some(holder) = change.implied_holder() {
                    entries.insert(change.key.clone(), holder);
                }
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_api::tx::IndexKeyChange;

    #[test]
    fn test_preallocate_positions_are_sequential_per_partition() {
        let engine = MemoryStorageEngine::new();
        assert_eq!(engine.preallocate_position(10), 0);
        assert_eq!(engine.preallocate_position(10), 1);
        assert_eq!(engine.preallocate_position(11), 0);
        assert_eq!(engine.preallocate_position(10), 2);
    }

    #[test]
    fn test_apply_create_update_delete() {
        let engine = MemoryStorageEngine::new();
        let id = RecordId::new(10, 0);

        let create = ResolvedRecordOperation {
            requested: RecordId::new(10, -1),
            assigned: id,
            kind: RecordOperationKind::Create,
            payload: b"v1".to_vec(),
            previous_version: 0,
        };
        let applied = engine.apply_atomic(&[create], &[]).unwrap();
        assert_eq!(applied[0].version, 1);
        assert_eq!(engine.current_version(&id), Some(1));

        let update = ResolvedRecordOperation {
            requested: id,
            assigned: id,
            kind: RecordOperationKind::Update,
            payload: b"v2".to_vec(),
            previous_version: 1,
        };
        let applied = engine.apply_atomic(&[update], &[]).unwrap();
        assert_eq!(applied[0].version, 2);
        assert_eq!(engine.record_payload(&id), Some(b"v2".to_vec()));

        let delete = ResolvedRecordOperation {
            requested: id,
            assigned: id,
            kind: RecordOperationKind::Delete,
            payload: Vec::new(),
            previous_version: 2,
        };
        engine.apply_atomic(&[delete], &[]).unwrap();
        assert_eq!(engine.current_version(&id), None);
        assert!(engine.is_tombstone(&id));
    }

    #[test]
    fn test_index_puts_and_removes() {
        let engine = MemoryStorageEngine::new();
        engine.register_unique_index("person.name");
        let first = RecordId::new(10, 0);
        let second = RecordId::new(10, 1);

        let put = IndexOperationRequest {
            index: "person.name".to_string(),
            changes: vec![IndexKeyChange {
                key: "ada".to_string(),
                puts: vec![first],
                removes: vec![],
            }],
        };
        engine.apply_atomic(&[], &[put]).unwrap();
        assert_eq!(
            engine.lookup_unique_index_holder("person.name", "ada"),
            Some(first)
        );

        let reassign = IndexOperationRequest {
            index: "person.name".to_string(),
            changes: vec![IndexKeyChange {
                key: "ada".to_string(),
                puts: vec![second],
                removes: vec![first],
            }],
        };
        engine.apply_atomic(&[], &[reassign]).unwrap();
        assert_eq!(
            engine.lookup_unique_index_holder("person.name", "ada"),
            Some(second)
        );

        let remove = IndexOperationRequest {
            index: "person.name".to_string(),
            changes: vec![IndexKeyChange {
                key: "ada".to_string(),
                puts: vec![],
                removes: vec![second],
            }],
        };
        engine.apply_atomic(&[], &[remove]).unwrap();
        assert_eq!(engine.lookup_unique_index_holder("person.name", "ada"), None);
    }

    #[test]
    fn test_unique_index_registration() {
        let engine = MemoryStorageEngine::new();
        assert!(!engine.is_unique_index("person.name"));
        engine.register_unique_index("person.name");
        assert!(engine.is_unique_index("person.name"));
    }
}
