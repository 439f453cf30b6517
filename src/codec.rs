//! Checksummed framing shared by the wire format and policy snapshots.
//!
//! Every frame is laid out as:
//! ```text
//! [magic: 4 bytes][version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
//! ```
//! JSON keeps the payload readable with the existing serde attributes and the
//! CRC catches truncated or corrupted frames before they reach a filter.

use std::io::{Cursor, Read};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{MeshError, MeshResult};

/// Current frame version.
pub const CODEC_VERSION: u8 = 1;

/// Magic bytes of a transport message.
pub const WIRE_MAGIC: [u8; 4] = *b"KMSH";

/// Magic bytes of a QoS policy snapshot.
pub const POLICY_MAGIC: [u8; 4] = *b"KMQP";

/// Reject frames claiming more than 64 MB of payload.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Fixed overhead of a frame around its JSON payload.
pub const FRAME_OVERHEAD: usize = 4 + 1 + 4 + 4;

fn wire_err(message: impl Into<String>) -> MeshError {
    MeshError::Wire {
        message: message.into(),
    }
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Serializes `value` into a frame tagged with `magic`.
///
/// # Errors
/// Returns [`MeshError::Wire`] if serialization fails or the payload is too large.
pub fn encode<T: Serialize>(magic: [u8; 4], value: &T) -> MeshResult<Vec<u8>> {
    let data = serde_json::to_vec(value).map_err(|e| wire_err(format!("serialization failed: {e}")))?;

    if data.len() > MAX_FRAME_SIZE {
        return Err(wire_err(format!(
            "frame size {} exceeds maximum {MAX_FRAME_SIZE}",
            data.len()
        )));
    }
    let len = u32::try_from(data.len()).map_err(|_| wire_err("frame length overflows u32"))?;

    let mut out = Vec::with_capacity(FRAME_OVERHEAD + data.len());
    out.extend_from_slice(&magic);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&checksum(&data).to_le_bytes());
    Ok(out)
}

/// Parses a frame tagged with `magic`, verifying its checksum.
///
/// # Errors
/// - wrong magic or unsupported version
/// - truncated input or trailing bytes
/// - CRC mismatch (data corrupted)
/// - JSON that does not match `T`
pub fn decode<T: DeserializeOwned>(magic: [u8; 4], bytes: &[u8]) -> MeshResult<T> {
    let mut reader = Cursor::new(bytes);
    let truncated = |_| wire_err(format!("truncated frame of {} bytes", bytes.len()));

    let mut found = [0u8; 4];
    reader.read_exact(&mut found).map_err(truncated)?;
    if found != magic {
        return Err(wire_err(format!(
            "invalid magic bytes: expected {magic:?}, got {found:?}"
        )));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version).map_err(truncated)?;
    if version[0] != CODEC_VERSION {
        return Err(wire_err(format!(
            "unsupported codec version: {} (expected {CODEC_VERSION})",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).map_err(truncated)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(wire_err(format!(
            "frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).map_err(truncated)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes).map_err(truncated)?;
    let stored = u32::from_le_bytes(crc_bytes);
    let computed = checksum(&data);
    if stored != computed {
        return Err(wire_err(format!(
            "CRC mismatch: stored={stored:08x}, computed={computed:08x} (data corrupted)"
        )));
    }

    let consumed = usize::try_from(reader.position()).unwrap_or(usize::MAX);
    if consumed != bytes.len() {
        return Err(wire_err(format!(
            "{} trailing bytes after frame",
            bytes.len().saturating_sub(consumed)
        )));
    }

    serde_json::from_slice(&data).map_err(|e| wire_err(format!("deserialization failed: {e}")))
}
