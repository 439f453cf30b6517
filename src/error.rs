//! Error types for kyromesh.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! specific conditions. Per-packet problems (filter failures, policy
//! rejections, malformed input) are reported through transport outcomes and
//! never abort the process.

use thiserror::Error;

use crate::storage::StoreError;

/// Errors raised by buffer, record and aggregate filters.
#[derive(Debug, Error)]
pub enum FilterError {
    /// A buffer filter's output would not fit in the destination buffer.
    #[error("Buffer filter '{filter}' needs {required} bytes but capacity is {capacity}")]
    CapacityExceeded {
        filter: String,
        required: usize,
        capacity: usize,
    },

    /// A buffer filter could not transform its input.
    #[error("Buffer filter '{filter}' failed: {reason}")]
    Codec {
        filter: String,
        reason: String,
    },

    /// The stage header in front of an encoded buffer does not belong to the
    /// filter that is trying to decode it.
    #[error("Buffer header mismatch: expected '{expected}', found '{found}'")]
    HeaderMismatch {
        expected: String,
        found: String,
    },

    /// The encoded buffer is too short to hold a stage header.
    #[error("Buffer of {size} bytes is too short for a {required} byte stage header")]
    Truncated {
        size: usize,
        required: usize,
    },

    /// A record filter signalled an internal error.
    #[error("Record filter failed on '{key}': {reason}")]
    Record {
        key: String,
        reason: String,
    },

    /// An aggregate filter signalled an internal error.
    #[error("Aggregate filter failed: {reason}")]
    Aggregate {
        reason: String,
    },
}

impl FilterError {
    /// Creates a record filter error.
    #[must_use]
    pub fn record(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Record {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates an aggregate filter error.
    #[must_use]
    pub fn aggregate(reason: impl Into<String>) -> Self {
        Self::Aggregate {
            reason: reason.into(),
        }
    }

    /// Returns true if the failure means the packet cannot be sent at all.
    #[must_use]
    pub const fn aborts_packet(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::Codec { .. }
                | Self::HeaderMismatch { .. }
                | Self::Truncated { .. }
        )
    }
}

/// Top-level error type for kyromesh.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("{component} has been released")]
    UseAfterRelease {
        component: &'static str,
    },

    #[error("Capability '{capability}' is not available in this build")]
    UnsupportedCapability {
        capability: String,
    },

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Thread '{name}' is already registered")]
    DuplicateRegistration {
        name: String,
    },

    #[error("Thread '{name}' is not registered")]
    UnknownThread {
        name: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Wire format error: {message}")]
    Wire {
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl MeshError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an unsupported capability error.
    #[must_use]
    pub fn unsupported(capability: impl Into<String>) -> Self {
        Self::UnsupportedCapability {
            capability: capability.into(),
        }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns true if the component was used after being released.
    #[must_use]
    pub const fn is_release(&self) -> bool {
        matches!(self, Self::UseAfterRelease { .. })
    }

    /// Returns true if a buffer filter ran out of room.
    #[must_use]
    pub const fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::Filter(FilterError::CapacityExceeded { .. }))
    }

    /// Returns true if this is a scheduler registration error.
    #[must_use]
    pub const fn is_registration(&self) -> bool {
        matches!(self, Self::DuplicateRegistration { .. } | Self::UnknownThread { .. })
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Result type alias for kyromesh operations.
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_exceeded_message() {
        let err = FilterError::CapacityExceeded {
            filter: "deflate".to_string(),
            required: 2048,
            capacity: 1024,
        };
        let msg = format!("{err}");
        assert!(msg.contains("deflate"));
        assert!(msg.contains("2048"));
        assert!(msg.contains("1024"));
        assert!(err.aborts_packet());
    }

    #[test]
    fn test_record_filter_error_does_not_abort_packet() {
        let err = FilterError::record("name", "bad input");
        assert!(!err.aborts_packet());
        assert!(format!("{err}").contains("name"));
    }

    #[test]
    fn test_mesh_error_from_filter() {
        let err: MeshError = FilterError::CapacityExceeded {
            filter: "id".to_string(),
            required: 10,
            capacity: 5,
        }
        .into();
        assert!(err.is_capacity_exceeded());
        assert!(!err.is_release());
    }

    #[test]
    fn test_use_after_release() {
        let err = MeshError::UseAfterRelease { component: "Threader" };
        assert!(err.is_release());
        assert_eq!(format!("{err}"), "Threader has been released");
    }

    #[test]
    fn test_registration_errors() {
        let dup = MeshError::DuplicateRegistration {
            name: "worker".to_string(),
        };
        assert!(dup.is_registration());
        assert!(format!("{dup}").contains("already registered"));

        let unknown = MeshError::UnknownThread {
            name: "ghost".to_string(),
        };
        assert!(unknown.is_registration());
    }

    #[test]
    fn test_unsupported_capability() {
        let err = MeshError::unsupported("xchacha20");
        let msg = format!("{err}");
        assert!(msg.contains("xchacha20"));
        assert!(msg.contains("not available"));
    }

    #[test]
    fn test_mesh_error_from_storage() {
        let err: MeshError = StoreError::BackendError("poisoned".to_string()).into();
        assert!(err.is_storage());
    }
}
