//! Tessera Consistency - election state and the operational log
//!
//! This crate holds the two pieces every coordination decision rests on:
//! - `LeaderElectionStateMachine`: per-node term/role state and vote counting
//! - `OperationLog`: the durable, strictly-ordered log of coordination
//!   requests, with an in-memory variant and a segmented on-disk variant

pub mod election;
pub mod oplog;

pub use election::{ElectionRole, LeaderElectionStateMachine};
pub use oplog::{
    LogIdStatus, MemoryOperationLog, OperationLog, OplogError, persistent::PersistentOperationalLog,
};
