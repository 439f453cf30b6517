//! Default wire format for transport messages.
//!
//! A message is a header plus a packet, serialized as JSON inside a
//! checksummed [`codec`](crate::codec) frame. Buffer filters run over the
//! framed bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec;
use crate::error::MeshResult;
use crate::packet::Packet;

/// Routing metadata carried by every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Unique per originated message; relays keep it.
    pub id: Uuid,
    /// Transport id of the participant that first sent the packet.
    pub originator: String,
    /// Only participants in the same domain apply the packet.
    pub domain: String,
    /// Remaining hop budget.
    pub ttl: u8,
    /// Originator's clock when the packet was first sent.
    pub timestamp: DateTime<Utc>,
}

impl MessageHeader {
    /// Header for a freshly originated message, stamped now.
    #[must_use]
    pub fn new(originator: impl Into<String>, domain: impl Into<String>, ttl: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            originator: originator.into(),
            domain: domain.into(),
            ttl,
            timestamp: Utc::now(),
        }
    }

    /// Header for relaying this message with a new hop budget.
    #[must_use]
    pub fn relayed(&self, ttl: u8) -> Self {
        Self {
            ttl,
            ..self.clone()
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub packet: Packet,
}

/// Serializes a message into a wire frame.
///
/// # Errors
/// [`MeshError::Wire`](crate::MeshError::Wire) if serialization fails.
pub fn encode(message: &Message) -> MeshResult<Vec<u8>> {
    codec::encode(codec::WIRE_MAGIC, message)
}

/// Parses a wire frame.
///
/// # Errors
/// [`MeshError::Wire`](crate::MeshError::Wire) for anything that is not a
/// well-formed frame.
pub fn decode(bytes: &[u8]) -> MeshResult<Message> {
    codec::decode(codec::WIRE_MAGIC, bytes)
}
