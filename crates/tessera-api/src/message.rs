//! Broadcast coordination messages
//!
//! The discovery and election traffic is a single tagged union; every
//! variant is encoded with a fixed field order driven by the leading type
//! tag. Fields that do not apply to a variant are simply never written.

use bytes::{Buf, BufMut};

use crate::model::{ConnectionCredentials, NodeIdentity, NodeRole};
use crate::wire::{self, WireError, WireResult};

const TAG_PING: u8 = 0;
const TAG_START_ELECTION: u8 = 1;
const TAG_VOTE: u8 = 2;
const TAG_LEADER_ELECTED: u8 = 3;

/// A sender's belief about the current group leader, piggybacked on pings
///
/// Lets a node that never heard the leader directly materialize it and
/// converge faster after a leader change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderHint {
    pub identity: NodeIdentity,
    pub term: u64,
    pub address: String,
    pub port: u16,
    pub credentials: ConnectionCredentials,
    pub last_ping_at: i64,
}

impl LeaderHint {
    fn encode(&self, buf: &mut impl BufMut) {
        self.identity.encode(buf);
        buf.put_u64(self.term);
        wire::put_string(buf, &self.address);
        buf.put_u16(self.port);
        self.credentials.encode(buf);
        buf.put_i64(self.last_ping_at);
    }

    fn decode(buf: &mut impl Buf) -> WireResult<Self> {
        Ok(Self {
            identity: NodeIdentity::decode(buf)?,
            term: wire::get_u64(buf)?,
            address: wire::get_string(buf)?,
            port: wire::get_u16(buf)?,
            credentials: ConnectionCredentials::decode(buf)?,
            last_ping_at: wire::get_i64(buf)?,
        })
    }
}

/// Messages exchanged over the group broadcast transport
///
/// Every variant carries the replication group name, the sender identity
/// and the sender's current term.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BroadcastMessage {
    /// Periodic liveness announcement
    Ping {
        group: String,
        sender: NodeIdentity,
        term: u64,
        role: NodeRole,
        tcp_port: u16,
        credentials: ConnectionCredentials,
        leader_hint: Option<LeaderHint>,
    },
    /// A candidate asking for votes in a new term
    StartElection {
        group: String,
        sender: NodeIdentity,
        term: u64,
        last_log_id: u64,
        tcp_port: u16,
        credentials: ConnectionCredentials,
    },
    /// A vote granted to `vote_for` in `term`
    Vote {
        group: String,
        sender: NodeIdentity,
        term: u64,
        vote_for: NodeIdentity,
        last_log_id: u64,
        tcp_port: u16,
        credentials: ConnectionCredentials,
    },
    /// Announcement that the sender reached quorum in `term`
    LeaderElected {
        group: String,
        sender: NodeIdentity,
        term: u64,
        tcp_port: u16,
        credentials: ConnectionCredentials,
    },
}

impl BroadcastMessage {
    pub fn group(&self) -> &str {
        match self {
            BroadcastMessage::Ping { group, .. }
            | BroadcastMessage::StartElection { group, .. }
            | BroadcastMessage::Vote { group, .. }
            | BroadcastMessage::LeaderElected { group, .. } => group,
        }
    }

    pub fn sender(&self) -> &NodeIdentity {
        match self {
            BroadcastMessage::Ping { sender, .. }
            | BroadcastMessage::StartElection { sender, .. }
            | BroadcastMessage::Vote { sender, .. }
            | BroadcastMessage::LeaderElected { sender, .. } => sender,
        }
    }

    pub fn term(&self) -> u64 {
        match self {
            BroadcastMessage::Ping { term, .. }
            | BroadcastMessage::StartElection { term, .. }
            | BroadcastMessage::Vote { term, .. }
            | BroadcastMessage::LeaderElected { term, .. } => *term,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            BroadcastMessage::Ping { .. } => "PING",
            BroadcastMessage::StartElection { .. } => "START_ELECTION",
            BroadcastMessage::Vote { .. } => "VOTE",
            BroadcastMessage::LeaderElected { .. } => "LEADER_ELECTED",
        }
    }

    /// Serialize to the wire format (before any group encryption)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        match self {
            BroadcastMessage::Ping {
                group,
                sender,
                term,
                role,
                tcp_port,
                credentials,
                leader_hint,
            } => {
                buf.put_u8(TAG_PING);
                wire::put_string(&mut buf, group);
                sender.encode(&mut buf);
                buf.put_u64(*term);
                buf.put_u8(role.tag());
                buf.put_u16(*tcp_port);
                credentials.encode(&mut buf);
                match leader_hint {
                    Some(hint) => {
                        buf.put_u8(1);
                        hint.encode(&mut buf);
                    }
                    None => buf.put_u8(0),
                }
            }
            BroadcastMessage::StartElection {
                group,
                sender,
                term,
                last_log_id,
                tcp_port,
                credentials,
            } => {
                buf.put_u8(TAG_START_ELECTION);
                wire::put_string(&mut buf, group);
                sender.encode(&mut buf);
                buf.put_u64(*term);
                buf.put_u64(*last_log_id);
                buf.put_u16(*tcp_port);
                credentials.encode(&mut buf);
            }
            BroadcastMessage::Vote {
                group,
                sender,
                term,
                vote_for,
                last_log_id,
                tcp_port,
                credentials,
            } => {
                buf.put_u8(TAG_VOTE);
                wire::put_string(&mut buf, group);
                sender.encode(&mut buf);
                buf.put_u64(*term);
                vote_for.encode(&mut buf);
                buf.put_u64(*last_log_id);
                buf.put_u16(*tcp_port);
                credentials.encode(&mut buf);
            }
            BroadcastMessage::LeaderElected {
                group,
                sender,
                term,
                tcp_port,
                credentials,
            } => {
                buf.put_u8(TAG_LEADER_ELECTED);
                wire::put_string(&mut buf, group);
                sender.encode(&mut buf);
                buf.put_u64(*term);
                buf.put_u16(*tcp_port);
                credentials.encode(&mut buf);
            }
        }
        buf
    }

    /// Deserialize from the wire format
    pub fn decode(mut data: &[u8]) -> WireResult<Self> {
        let buf = &mut data;
        let tag = wire::get_u8(buf)?;
        let group = wire::get_string(buf)?;
        let sender = NodeIdentity::decode(buf)?;
        let term = wire::get_u64(buf)?;

        match tag {
            TAG_PING => {
                let role = NodeRole::from_tag(wire::get_u8(buf)?)?;
                let tcp_port = wire::get_u16(buf)?;
                let credentials = ConnectionCredentials::decode(buf)?;
                let leader_hint = match wire::get_u8(buf)? {
                    0 => None,
                    1 => Some(LeaderHint::decode(buf)?),
                    _ => return Err(WireError::InvalidValue("leader_hint")),
                };
                Ok(BroadcastMessage::Ping {
                    group,
                    sender,
                    term,
                    role,
                    tcp_port,
                    credentials,
                    leader_hint,
                })
            }
            TAG_START_ELECTION => Ok(BroadcastMessage::StartElection {
                group,
                sender,
                term,
                last_log_id: wire::get_u64(buf)?,
                tcp_port: wire::get_u16(buf)?,
                credentials: ConnectionCredentials::decode(buf)?,
            }),
            TAG_VOTE => Ok(BroadcastMessage::Vote {
                group,
                sender,
                term,
                vote_for: NodeIdentity::decode(buf)?,
                last_log_id: wire::get_u64(buf)?,
                tcp_port: wire::get_u16(buf)?,
                credentials: ConnectionCredentials::decode(buf)?,
            }),
            TAG_LEADER_ELECTED => Ok(BroadcastMessage::LeaderElected {
                group,
                sender,
                term,
                tcp_port: wire::get_u16(buf)?,
                credentials: ConnectionCredentials::decode(buf)?,
            }),
            other => Err(WireError::UnknownTag(other as u32)),
        }
    }
}
