//! Tessera Common - shared types and utilities
//!
//! This crate provides the foundational pieces used across all Tessera
//! components:
//! - Error types
//! - Group payload encryption
//! - Utility functions

pub mod crypto;
pub mod error;
pub mod utils;

// Re-exports for convenience
pub use crypto::{CryptoError, GroupCipher};
pub use error::{AppError, TesseraError};
pub use utils::{local_ip, now_millis};

/// Default multicast group address for cluster discovery
pub const DEFAULT_MULTICAST_ADDRESS: &str = "235.1.1.1";

/// Default UDP port for cluster discovery
pub const DEFAULT_DISCOVERY_PORT: u16 = 4321;

/// Default interval between outbound pings, in milliseconds
pub const DEFAULT_PING_INTERVAL_MILLIS: u64 = 1000;

/// Default time after which a silent peer is considered gone, in milliseconds
pub const DEFAULT_MAX_INACTIVE_MILLIS: u64 = 5000;

/// Default interval between leader-liveness checks, in milliseconds
pub const DEFAULT_CHECK_LEADER_INTERVAL_MILLIS: u64 = 1000;

/// Upper bound of the randomized election backoff, in milliseconds
pub const DEFAULT_ELECTION_BACKOFF_MAX_MILLIS: u64 = 2000;
