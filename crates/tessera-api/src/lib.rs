//! Tessera API - shared coordination model
//!
//! This crate defines the data structures exchanged between cluster members
//! and the explicit binary codecs used to put them on the wire:
//! - Node identity and per-peer state
//! - Broadcast discovery/election messages
//! - Operational-log identifiers, entries and request payloads
//! - Distributed transaction submissions and responses

pub mod log;
pub mod message;
pub mod model;
pub mod tx;
pub mod wire;

pub use log::{LogId, LogRequest, LogRequestRegistry, OperationLogEntry};
pub use message::{BroadcastMessage, LeaderHint};
pub use model::{ConnectionCredentials, NodeData, NodeIdentity, NodeRole};
pub use wire::WireError;
