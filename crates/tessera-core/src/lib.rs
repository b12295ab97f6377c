//! Tessera Core - cluster discovery and leader-election driver
//!
//! This crate owns the per-process view of the cluster:
//! - `NodeManager`: periodic pings, inbound message dispatch, liveness
//!   eviction and election triggering over a pluggable broadcast transport
//! - `ClusterEventPublisher`: node connected/disconnected/leader elected
//!   notifications for the owning process
//! - `MessageCodec`: wire codec with group filtering and optional payload
//!   encryption

pub mod model;
pub mod service;

pub use model::ClusterConfig;
pub use service::cluster::NodeManager;
pub use service::codec::MessageCodec;
pub use service::events::{ClusterEvent, ClusterEventKind, ClusterEventListener, ClusterEventPublisher};
pub use service::transport::{
    BroadcastTransport, InMemoryHub, InMemoryPeerNetwork, MulticastTransport, PeerTransport,
};
