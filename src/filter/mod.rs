//! Filter pipeline: buffer, record and aggregate chains.
//!
//! - [`buffer`] transforms whole encoded messages (compression, encryption)
//! - [`record`] transforms or removes individual records by type
//! - [`aggregate`] observes whole packets and can stage extra records
//! - [`FilterPipeline`] owns the chains of one transport

pub mod aggregate;
pub mod buffer;
pub mod codec;
pub mod pipeline;
pub mod record;

pub use aggregate::{AggregateFilter, AggregateFilterChain};
pub use buffer::{BufferFilter, BufferFilterChain, STAGE_HEADER_SIZE};
pub use codec::{CompressionFilter, EncryptionFilter, IdentityFilter};
pub use pipeline::{BoundaryFilters, FilterPipeline};
pub use record::{DiscardAll, PassThrough, RecordFilter, RecordFilterChain, RecordOutcome};
