//! Cluster configuration

use std::path::PathBuf;
use std::time::Duration;

use tessera_api::model::ConnectionCredentials;
use tessera_common::{
    DEFAULT_CHECK_LEADER_INTERVAL_MILLIS, DEFAULT_DISCOVERY_PORT, DEFAULT_ELECTION_BACKOFF_MAX_MILLIS,
    DEFAULT_MAX_INACTIVE_MILLIS, DEFAULT_MULTICAST_ADDRESS, DEFAULT_PING_INTERVAL_MILLIS,
    TesseraError,
};

/// Configuration of one cluster node
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Replication group this node belongs to; messages from other groups
    /// are discarded
    pub group_name: String,
    /// Optional shared password; when set, broadcast payloads are encrypted
    pub group_password: Option<String>,
    /// Human-readable node name; the uuid part of the identity is generated
    /// per process
    pub node_name: String,
    /// Minimum number of votes needed to elect a leader
    pub quorum: usize,
    /// Port peers use for point-to-point connections to this node
    pub tcp_port: u16,
    /// Credentials peers use for point-to-point connections
    pub credentials: ConnectionCredentials,
    /// Interval between outbound pings
    pub ping_interval: Duration,
    /// Interval between leader-liveness checks
    pub check_leader_interval: Duration,
    /// Silence after which a peer is presumed departed
    pub max_inactive: Duration,
    /// Upper bound of the randomized anti-collision election backoff
    pub election_backoff_max: Duration,
    /// Multicast group address for discovery traffic
    pub multicast_address: String,
    /// UDP port for discovery traffic
    pub discovery_port: u16,
    /// Directory of the persistent operational log, if any
    pub log_directory: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            group_name: "default".to_string(),
            group_password: None,
            node_name: String::new(),
            quorum: 2,
            tcp_port: 2424,
            credentials: ConnectionCredentials::default(),
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MILLIS),
            check_leader_interval: Duration::from_millis(DEFAULT_CHECK_LEADER_INTERVAL_MILLIS),
            max_inactive: Duration::from_millis(DEFAULT_MAX_INACTIVE_MILLIS),
            election_backoff_max: Duration::from_millis(DEFAULT_ELECTION_BACKOFF_MAX_MILLIS),
            multicast_address: DEFAULT_MULTICAST_ADDRESS.to_string(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            log_directory: None,
        }
    }
}

impl ClusterConfig {
    /// Fail-fast validation, run once at node construction
    pub fn validate(&self) -> Result<(), TesseraError> {
        if self.group_name.is_empty() {
            return Err(TesseraError::Config("group name must not be empty".to_string()));
        }
        if self.node_name.is_empty() {
            return Err(TesseraError::Config("node name must not be empty".to_string()));
        }
        if self.quorum == 0 {
            return Err(TesseraError::Config("quorum must be at least 1".to_string()));
        }
        Ok(())
    }
}
