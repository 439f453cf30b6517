//! QoS transport policy: bandwidth, TTL, deadlines, loss and peer trust.

pub mod admission;
pub mod bandwidth;
pub mod drop;
pub mod policy;

pub use admission::{Admission, AdmissionControl, RejectReason};
pub use bandwidth::{BandwidthMonitor, DEFAULT_WINDOW};
pub use drop::DropScheduler;
pub use policy::{DropPolicy, DropRate, PolicySettings, QosPolicy};
