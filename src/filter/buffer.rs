//! Buffer filters: whole-message byte transforms.
//!
//! A chain encodes in registration order and decodes in reverse. Each stage's
//! output is prefixed with a fixed stage header:
//!
//! ```text
//! [filter id: 8 bytes][version: u32 LE][payload size: u64 LE][payload ...]
//! ```
//!
//! Filters work in place on a caller-provided buffer whose length is the
//! capacity. Nothing ever writes past it; a stage that needs more room fails
//! with [`FilterError::CapacityExceeded`] and the message is abandoned.

use std::sync::Arc;

use crate::error::FilterError;

/// Size of the header written in front of every encoded stage.
pub const STAGE_HEADER_SIZE: usize = 8 + 4 + 8;

/// Renders an 8-byte filter id for logs and errors.
#[must_use]
pub fn id_name(id: &[u8; 8]) -> String {
    String::from_utf8_lossy(id).trim_end_matches('\0').to_string()
}

/// A reversible transform over a whole encoded message.
pub trait BufferFilter: Send + Sync {
    /// Stable 8-byte identifier written into the stage header.
    fn id(&self) -> [u8; 8];

    /// Format version written into the stage header.
    fn version(&self) -> u32 {
        1
    }

    /// Transforms `buffer[..used]` in place and returns the new used size.
    ///
    /// # Errors
    /// [`FilterError::CapacityExceeded`] if the result does not fit in `buffer`.
    fn encode(&self, buffer: &mut [u8], used: usize) -> Result<usize, FilterError>;

    /// Reverses [`BufferFilter::encode`].
    ///
    /// # Errors
    /// Any error means the input could not have come from `encode`.
    fn decode(&self, buffer: &mut [u8], used: usize) -> Result<usize, FilterError>;
}

/// Copies `data` to the front of `buffer`, checking capacity.
pub(crate) fn write_output(filter: &[u8; 8], buffer: &mut [u8], data: &[u8]) -> Result<usize, FilterError> {
    if data.len() > buffer.len() {
        return Err(FilterError::CapacityExceeded {
            filter: id_name(filter),
            required: data.len(),
            capacity: buffer.len(),
        });
    }
    buffer[..data.len()].copy_from_slice(data);
    Ok(data.len())
}

/// Ordered list of buffer filters.
#[derive(Clone, Default)]
pub struct BufferFilterChain {
    filters: Vec<Arc<dyn BufferFilter>>,
}

impl std::fmt::Debug for BufferFilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.filters.iter().map(|filter| id_name(&filter.id())))
            .finish()
    }
}

impl BufferFilterChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Arc<dyn BufferFilter>) {
        self.filters.push(filter);
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs every filter's encode in registration order over `buffer[..used]`
    /// and returns the final used size.
    ///
    /// # Errors
    /// The first failing stage aborts the whole encode.
    pub fn encode(&self, buffer: &mut [u8], used: usize) -> Result<usize, FilterError> {
        let capacity = buffer.len();
        let mut used = check_used(used, capacity)?;

        for filter in &self.filters {
            let id = filter.id();
            let size = filter.encode(buffer, used)?;
            let required = size + STAGE_HEADER_SIZE;
            if required > capacity {
                return Err(FilterError::CapacityExceeded {
                    filter: id_name(&id),
                    required,
                    capacity,
                });
            }

            buffer.copy_within(0..size, STAGE_HEADER_SIZE);
            buffer[..8].copy_from_slice(&id);
            buffer[8..12].copy_from_slice(&filter.version().to_le_bytes());
            buffer[12..20].copy_from_slice(&(size as u64).to_le_bytes());
            used = required;

            tracing::trace!(filter = %id_name(&id), size = used, "buffer filter encoded");
        }

        Ok(used)
    }

    /// Runs every filter's decode in reverse registration order, validating
    /// each stage header first.
    ///
    /// # Errors
    /// Header mismatches, truncated stages and filter failures.
    pub fn decode(&self, buffer: &mut [u8], used: usize) -> Result<usize, FilterError> {
        let capacity = buffer.len();
        let mut used = check_used(used, capacity)?;

        for filter in self.filters.iter().rev() {
            let id = filter.id();
            if used < STAGE_HEADER_SIZE {
                return Err(FilterError::Truncated {
                    size: used,
                    required: STAGE_HEADER_SIZE,
                });
            }

            let mut found = [0u8; 8];
            found.copy_from_slice(&buffer[..8]);
            if found != id {
                return Err(FilterError::HeaderMismatch {
                    expected: id_name(&id),
                    found: id_name(&found),
                });
            }

            let mut size_bytes = [0u8; 8];
            size_bytes.copy_from_slice(&buffer[12..20]);
            let size = usize::try_from(u64::from_le_bytes(size_bytes)).unwrap_or(usize::MAX);
            if size > used - STAGE_HEADER_SIZE {
                return Err(FilterError::Truncated {
                    size: used - STAGE_HEADER_SIZE,
                    required: size,
                });
            }

            buffer.copy_within(STAGE_HEADER_SIZE..STAGE_HEADER_SIZE + size, 0);
            used = filter.decode(buffer, size)?;
            check_used(used, capacity)?;

            tracing::trace!(filter = %id_name(&id), size = used, "buffer filter decoded");
        }

        Ok(used)
    }

    /// Encodes an owned payload within `capacity` bytes.
    ///
    /// # Errors
    /// [`FilterError::CapacityExceeded`] when `payload` alone does not fit.
    pub fn encode_vec(&self, payload: &[u8], capacity: usize) -> Result<Vec<u8>, FilterError> {
        if payload.len() > capacity {
            return Err(FilterError::CapacityExceeded {
                filter: "chain".to_string(),
                required: payload.len(),
                capacity,
            });
        }
        let mut buffer = vec![0u8; capacity];
        buffer[..payload.len()].copy_from_slice(payload);
        let used = self.encode(&mut buffer, payload.len())?;
        buffer.truncate(used);
        Ok(buffer)
    }

    /// Decodes an owned message within `capacity` bytes.
    ///
    /// # Errors
    /// See [`BufferFilterChain::decode`].
    pub fn decode_vec(&self, message: &[u8], capacity: usize) -> Result<Vec<u8>, FilterError> {
        let mut buffer = vec![0u8; capacity.max(message.len())];
        buffer[..message.len()].copy_from_slice(message);
        let used = self.decode(&mut buffer, message.len())?;
        buffer.truncate(used);
        Ok(buffer)
    }
}

fn check_used(used: usize, capacity: usize) -> Result<usize, FilterError> {
    if used > capacity {
        return Err(FilterError::CapacityExceeded {
            filter: "chain".to_string(),
            required: used,
            capacity,
        });
    }
    Ok(used)
}
