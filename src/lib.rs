//! # KyroMesh - Replicated Knowledge over Lossy Networks
//!
//! KyroMesh is the middleware layer between a shared knowledge store and a
//! best-effort broadcast network. Participants publish key/value updates as
//! packets; every packet crosses a filter pipeline and a quality-of-service
//! policy before it leaves or enters the local store.
//!
//! ## Core Concepts
//!
//! - **Record**: A typed value with clock and quality ordering metadata
//! - **Packet**: One atomic, insertion-ordered batch of key/record updates
//! - **Filter pipeline**: Buffer, record and aggregate chains per boundary
//! - **QoS policy**: Bandwidth caps, TTLs, deadlines, simulated loss, peer trust
//! - **Threader**: Named, rate-controlled task threads over the shared store
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kyromesh::storage::InMemoryKnowledgeStore;
//! use kyromesh::transport::{ChannelHub, Transport, TransportConfig};
//! use kyromesh::{RecordTypes, Value};
//!
//! let hub = ChannelHub::new();
//! let (network, inbox) = hub.join("agent1")?;
//! let store = Arc::new(InMemoryKnowledgeStore::new());
//! let transport = Transport::new(TransportConfig::new("agent1", "demo"), store.clone(), Arc::new(network))?;
//!
//! transport.filters().add_send_filter(RecordTypes::ALL, kyromesh::filter::PassThrough)?;
//! store.set("name", Value::from("alice"))?;
//! transport.send_modifieds()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod context;
pub mod error;
pub mod packet;
pub mod record;
pub mod release;
pub mod value;

// Storage and wire framing
pub mod codec;
pub mod storage;

// Pipeline, policy, transport and scheduling
pub mod filter;
pub mod qos;
pub mod threads;
pub mod transport;

// Re-export primary types at crate root for convenience
pub use context::{Operation, TransportContext};
pub use error::{FilterError, MeshError, MeshResult};
pub use packet::Packet;
pub use record::{Record, RecordType, RecordTypes};
pub use release::Liveness;
pub use value::Value;

pub use filter::{FilterPipeline, RecordFilter, RecordOutcome};
pub use qos::{AdmissionControl, DropPolicy, DropRate, PolicySettings, QosPolicy};
pub use storage::{InMemoryKnowledgeStore, KnowledgeStore, StoreError};
pub use threads::{Task, TaskControl, TaskState, Threader};
pub use transport::{ReceiveOutcome, SendOutcome, Transport, TransportConfig};
