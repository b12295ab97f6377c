//! Wire codec for broadcast coordination messages
//!
//! Serializes messages and optionally seals them with the group cipher.
//! On the receive side every anomaly (undecryptable bytes, malformed
//! frames, a foreign group name) results in the packet being dropped
//! silently; nothing from the network may take the discovery loop down.

use tracing::debug;

use tessera_api::message::BroadcastMessage;
use tessera_common::{GroupCipher, TesseraError};

/// Codec bound to one replication group and its optional password
pub struct MessageCodec {
    group: String,
    cipher: GroupCipher,
}

impl MessageCodec {
    pub fn new(group: impl Into<String>, group_password: Option<&str>) -> Self {
        Self {
            group: group.into(),
            cipher: GroupCipher::from_password(group_password),
        }
    }

    /// Serialize and (when configured) encrypt a message for the wire
    pub fn encode(&self, message: &BroadcastMessage) -> Result<Vec<u8>, TesseraError> {
        self.cipher
            .seal(&message.encode())
            .map_err(|e| TesseraError::Network(e.to_string()))
    }

    /// Decrypt and parse a datagram; `None` means "drop this packet"
    pub fn decode(&self, data: &[u8]) -> Option<BroadcastMessage> {
        let plain = match self.cipher.open(data) {
            Ok(plain) => plain,
            Err(e) => {
                debug!("dropping undecryptable datagram: {}", e);
                return None;
            }
        };

        let message = match BroadcastMessage::decode(&plain) {
            Ok(message) => message,
            Err(e) => {
                debug!("dropping malformed datagram: {}", e);
                return None;
            }
        };

        if message.group() != self.group {
            debug!(
                group = message.group(),
                "dropping datagram from foreign group"
            );
            return None;
        }
        Some(message)
    }
}
