//! Cluster data model
//!
//! Shared structures describing cluster members: identity, credentials,
//! role, and the local view of a peer's liveness and leadership status.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use tessera_common::now_millis;

use crate::wire::{self, WireError, WireResult};

/// Immutable identity of a cluster member
///
/// The uuid is generated once per process lifetime; a restarted node comes
/// back with the same name but a fresh uuid and is treated as a new member.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub name: String,
    pub uuid: String,
}

impl NodeIdentity {
    pub fn new(name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
        }
    }

    /// Create an identity with a freshly generated uuid
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub(crate) fn encode(&self, buf: &mut impl BufMut) {
        wire::put_string(buf, &self.name);
        wire::put_string(buf, &self.uuid);
    }

    pub(crate) fn decode(buf: &mut impl Buf) -> WireResult<Self> {
        Ok(Self {
            name: wire::get_string(buf)?,
            uuid: wire::get_string(buf)?,
        })
    }
}

impl Display for NodeIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.uuid)
    }
}

/// Credentials a peer accepts for point-to-point connections
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCredentials {
    pub username: String,
    pub password: String,
}

impl ConnectionCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub(crate) fn encode(&self, buf: &mut impl BufMut) {
        wire::put_string(buf, &self.username);
        wire::put_string(buf, &self.password);
    }

    pub(crate) fn decode(buf: &mut impl Buf) -> WireResult<Self> {
        Ok(Self {
            username: wire::get_string(buf)?,
            password: wire::get_string(buf)?,
        })
    }
}

/// Role a node advertises in its pings
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Ordinary replica, follows the group coordinator
    #[default]
    Replica,
    /// Elected coordinator of the replication group
    Coordinator,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Replica => "REPLICA",
            NodeRole::Coordinator => "COORDINATOR",
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            NodeRole::Replica => 0,
            NodeRole::Coordinator => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> WireResult<Self> {
        match tag {
            0 => Ok(NodeRole::Replica),
            1 => Ok(NodeRole::Coordinator),
            _ => Err(WireError::InvalidValue("role")),
        }
    }
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REPLICA" => Ok(NodeRole::Replica),
            "COORDINATOR" => Ok(NodeRole::Coordinator),
            _ => Err(format!("Invalid node role: {}", s)),
        }
    }
}

/// Local view of a peer: identity, address and liveness/leadership status
///
/// One entry per `NodeIdentity`; created on the first message from a peer,
/// refreshed on every subsequent one, removed when the peer stays silent
/// longer than the configured max-inactive interval.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeData {
    pub identity: NodeIdentity,
    pub address: String,
    pub port: u16,
    pub term: u64,
    pub leader: bool,
    pub last_ping_at: i64,
    pub credentials: ConnectionCredentials,
}

impl NodeData {
    pub fn new(identity: NodeIdentity, address: impl Into<String>, port: u16) -> Self {
        Self {
            identity,
            address: address.into(),
            port,
            term: 0,
            leader: false,
            last_ping_at: now_millis(),
            credentials: ConnectionCredentials::default(),
        }
    }

    /// Whether this peer has been silent longer than `max_inactive_millis`
    pub fn is_stale(&self, now: i64, max_inactive_millis: u64) -> bool {
        now - self.last_ping_at > max_inactive_millis as i64
    }

    pub fn touch(&mut self) {
        self.last_ping_at = now_millis();
    }
}

impl Display for NodeData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{} (term {}{})",
            self.identity,
            self.address,
            self.port,
            self.term,
            if self.leader { ", leader" } else { "" }
        )
    }
}
