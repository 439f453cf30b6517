//! Abstract knowledge store contract.
//!
//! The store is the only resource shared between the transport and scheduled
//! tasks. Implementations must support concurrent reads and must apply a
//! whole packet as one visible unit.

use thiserror::Error;

use crate::packet::Packet;
use crate::record::Record;
use crate::value::Value;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Key is empty or otherwise unusable.
    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    /// Backend error.
    #[error("Store backend error: {0}")]
    BackendError(String),
}

/// Outcome of applying a remote packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Records that replaced (or created) the stored value.
    pub accepted: usize,
    /// Records that lost to a stored value with higher quality or newer clock.
    pub rejected: usize,
}

/// Shared key/record mapping.
///
/// # Safety Considerations
/// - `apply` must be atomic: readers see all of a packet or none of it
/// - Implementations should handle concurrent access safely
pub trait KnowledgeStore: Send + Sync {
    /// Get the record stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Record>, StoreError>;

    /// Local write. Stamps the next clock value and marks the key as modified
    /// so the next `drain_modified` picks it up.
    fn set(&self, key: &str, value: Value) -> Result<Record, StoreError>;

    /// Apply a remote packet atomically, honoring quality/clock ordering.
    /// Applied records are not marked as modified.
    fn apply(&self, packet: &Packet) -> Result<ApplySummary, StoreError>;

    /// Take every locally modified record, in modification order.
    fn drain_modified(&self) -> Result<Packet, StoreError>;

    /// All keys currently stored.
    fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Number of stored keys.
    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.keys()?.len())
    }

    /// Size accounting hook consulted by the transport before framing.
    fn packet_size(&self, packet: &Packet) -> usize {
        packet.payload_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure the trait is object-safe
    fn _assert_knowledge_store_object_safe(_: &dyn KnowledgeStore) {}

    #[test]
    fn test_store_error_display() {
        let err = StoreError::InvalidKey(String::new());
        assert!(err.to_string().contains("Invalid key"));

        let err = StoreError::BackendError("poisoned lock".to_string());
        assert!(err.to_string().contains("poisoned lock"));
    }
}
