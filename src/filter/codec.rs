//! Built-in buffer filters.
//!
//! Compression and encryption sit behind cargo features. Constructing one in a
//! build without its feature fails immediately with
//! [`MeshError::UnsupportedCapability`] instead of failing on first use.

use crate::error::{FilterError, MeshError, MeshResult};
use crate::filter::buffer::BufferFilter;
#[cfg(any(feature = "compression", feature = "crypto"))]
use crate::filter::buffer::{id_name, write_output};

/// Passes bytes through unchanged. Useful for exercising stage framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFilter;

impl BufferFilter for IdentityFilter {
    fn id(&self) -> [u8; 8] {
        *b"identity"
    }

    fn encode(&self, _buffer: &mut [u8], used: usize) -> Result<usize, FilterError> {
        Ok(used)
    }

    fn decode(&self, _buffer: &mut [u8], used: usize) -> Result<usize, FilterError> {
        Ok(used)
    }
}

/// Deflate compression (`flate2`).
#[derive(Debug, Clone, Copy)]
pub struct CompressionFilter {
    #[cfg_attr(not(feature = "compression"), allow(dead_code))]
    level: u32,
}

impl CompressionFilter {
    const ID: [u8; 8] = *b"deflate\0";

    /// Creates a filter with the default compression level.
    ///
    /// # Errors
    /// [`MeshError::UnsupportedCapability`] if built without `compression`.
    pub fn new() -> MeshResult<Self> {
        Self::with_level(6)
    }

    /// Creates a filter with an explicit level (0-9).
    ///
    /// # Errors
    /// [`MeshError::UnsupportedCapability`] if built without `compression`,
    /// [`MeshError::InvalidConfig`] for a level above 9.
    pub fn with_level(level: u32) -> MeshResult<Self> {
        if !cfg!(feature = "compression") {
            return Err(MeshError::unsupported("compression"));
        }
        if level > 9 {
            return Err(MeshError::invalid_config(format!(
                "compression level {level} is out of range 0..=9"
            )));
        }
        Ok(Self { level })
    }
}

#[cfg(feature = "compression")]
impl BufferFilter for CompressionFilter {
    fn id(&self) -> [u8; 8] {
        Self::ID
    }

    fn encode(&self, buffer: &mut [u8], used: usize) -> Result<usize, FilterError> {
        use std::io::Write;

        let codec_err = |e: std::io::Error| FilterError::Codec {
            filter: id_name(&Self::ID),
            reason: e.to_string(),
        };

        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::with_capacity(used), flate2::Compression::new(self.level));
        encoder.write_all(&buffer[..used]).map_err(codec_err)?;
        let compressed = encoder.finish().map_err(codec_err)?;
        write_output(&Self::ID, buffer, &compressed)
    }

    fn decode(&self, buffer: &mut [u8], used: usize) -> Result<usize, FilterError> {
        use std::io::Read;

        let capacity = buffer.len();
        let mut inflated = Vec::with_capacity(capacity);
        flate2::read::DeflateDecoder::new(&buffer[..used])
            .take(capacity as u64 + 1)
            .read_to_end(&mut inflated)
            .map_err(|e| FilterError::Codec {
                filter: id_name(&Self::ID),
                reason: e.to_string(),
            })?;
        write_output(&Self::ID, buffer, &inflated)
    }
}

#[cfg(not(feature = "compression"))]
impl BufferFilter for CompressionFilter {
    fn id(&self) -> [u8; 8] {
        Self::ID
    }

    fn encode(&self, _buffer: &mut [u8], _used: usize) -> Result<usize, FilterError> {
        Err(unavailable("compression"))
    }

    fn decode(&self, _buffer: &mut [u8], _used: usize) -> Result<usize, FilterError> {
        Err(unavailable("compression"))
    }
}

/// XChaCha20-Poly1305 authenticated encryption (`chacha20poly1305`).
///
/// The 256-bit key is derived from a shared passphrase with
/// `blake3::derive_key`. Each message carries its own random 24-byte nonce in
/// front of the ciphertext, so the output grows by 40 bytes.
#[derive(Clone)]
pub struct EncryptionFilter {
    #[cfg_attr(not(feature = "crypto"), allow(dead_code))]
    key: [u8; 32],
}

impl std::fmt::Debug for EncryptionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionFilter").finish_non_exhaustive()
    }
}

impl EncryptionFilter {
    const ID: [u8; 8] = *b"xchacha\0";
    const KEY_CONTEXT: &'static str = "kyromesh 2024-06 buffer filter key";
    #[cfg(feature = "crypto")]
    const NONCE_SIZE: usize = 24;

    /// Derives the key from `passphrase`. Every participant of a domain must
    /// use the same passphrase.
    ///
    /// # Errors
    /// [`MeshError::UnsupportedCapability`] if built without `crypto`,
    /// [`MeshError::InvalidConfig`] for an empty passphrase.
    pub fn new(passphrase: &str) -> MeshResult<Self> {
        if !cfg!(feature = "crypto") {
            return Err(MeshError::unsupported("crypto"));
        }
        if passphrase.is_empty() {
            return Err(MeshError::invalid_config("encryption passphrase is empty"));
        }
        Ok(Self {
            key: blake3::derive_key(Self::KEY_CONTEXT, passphrase.as_bytes()),
        })
    }
}

#[cfg(feature = "crypto")]
impl BufferFilter for EncryptionFilter {
    fn id(&self) -> [u8; 8] {
        Self::ID
    }

    fn encode(&self, buffer: &mut [u8], used: usize) -> Result<usize, FilterError> {
        use chacha20poly1305::aead::{Aead, KeyInit};
        use chacha20poly1305::{XChaCha20Poly1305, XNonce};

        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let mut nonce = [0u8; Self::NONCE_SIZE];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), &buffer[..used])
            .map_err(|e| FilterError::Codec {
                filter: id_name(&Self::ID),
                reason: e.to_string(),
            })?;

        let mut out = Vec::with_capacity(Self::NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        write_output(&Self::ID, buffer, &out)
    }

    fn decode(&self, buffer: &mut [u8], used: usize) -> Result<usize, FilterError> {
        use chacha20poly1305::aead::{Aead, KeyInit};
        use chacha20poly1305::{XChaCha20Poly1305, XNonce};

        if used < Self::NONCE_SIZE {
            return Err(FilterError::Truncated {
                size: used,
                required: Self::NONCE_SIZE,
            });
        }

        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let (nonce, ciphertext) = buffer[..used].split_at(Self::NONCE_SIZE);
        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|e| FilterError::Codec {
                filter: id_name(&Self::ID),
                reason: e.to_string(),
            })?;
        write_output(&Self::ID, buffer, &plaintext)
    }
}

#[cfg(not(feature = "crypto"))]
impl BufferFilter for EncryptionFilter {
    fn id(&self) -> [u8; 8] {
        Self::ID
    }

    fn encode(&self, _buffer: &mut [u8], _used: usize) -> Result<usize, FilterError> {
        Err(unavailable("crypto"))
    }

    fn decode(&self, _buffer: &mut [u8], _used: usize) -> Result<usize, FilterError> {
        Err(unavailable("crypto"))
    }
}

#[cfg(any(not(feature = "compression"), not(feature = "crypto")))]
fn unavailable(capability: &str) -> FilterError {
    FilterError::Codec {
        filter: capability.to_string(),
        reason: "capability not compiled in".to_string(),
    }
}
