//! Tessera Tx - distributed transaction coordination
//!
//! Turns a client-submitted set of record/index mutations into a two-phase
//! operation: phase 1 validates and preallocates without touching visible
//! state, phase 2 applies atomically. Conflicts are detected optimistically
//! through version and unique-key checks and surface as typed errors.
//!
//! The crate also provides the submit/response context correlating
//! asynchronous submissions with their eventual responses, and the
//! client-side reconciliation of coordinator-assigned identities.

pub mod coordinator;
pub mod executor;
pub mod storage;
pub mod submit;

pub use coordinator::{PreparedTransaction, TransactionCoordinator, TxConflict, TxError};
pub use executor::TxExecutor;
pub use storage::{AppliedRecord, MemoryStorageEngine, ResolvedRecordOperation, StorageEngine};
pub use submit::{OperationIdGenerator, SessionRecordSet, SubmitContext, TrackedRecord};
