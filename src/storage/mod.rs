//! Knowledge store contract and the in-memory backend.
//!
//! The store is an external collaborator of the transport and the scheduler;
//! the trait is the seam, the in-memory backend is the reference behavior.

mod memory;
mod traits;

pub use memory::InMemoryKnowledgeStore;
pub use traits::{ApplySummary, KnowledgeStore, StoreError};
