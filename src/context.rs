//! Per-pass transport state handed to filters.
//!
//! A [`TransportContext`] is created by the transport right before a filter
//! pass and dropped right after it. Filters can read everything on it and can
//! append extra records, which the transport merges into the packet once the
//! aggregate filters have run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::packet::Packet;
use crate::record::Record;

/// The boundary a filter pass is running at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// No packet in flight.
    Idle,
    /// Outbound packet leaving this participant.
    Send,
    /// Inbound packet about to reach the store.
    Receive,
    /// Inbound packet being relayed onwards.
    Rebroadcast,
}

impl Operation {
    /// Lowercase name, as used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Rebroadcast => "rebroadcast",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read / append-only state for one filtering pass.
#[derive(Debug, Clone)]
pub struct TransportContext {
    operation: Operation,
    message_time: DateTime<Utc>,
    current_time: DateTime<Utc>,
    domain: String,
    originator: String,
    send_bandwidth: u64,
    receive_bandwidth: u64,
    records: Packet,
}

impl TransportContext {
    /// Creates a context whose message and current time are both "now".
    #[must_use]
    pub fn new(operation: Operation, domain: impl Into<String>, originator: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            operation,
            message_time: now,
            current_time: now,
            domain: domain.into(),
            originator: originator.into(),
            send_bandwidth: 0,
            receive_bandwidth: 0,
            records: Packet::new(),
        }
    }

    /// Overrides the originator's timestamp.
    #[must_use]
    pub fn with_message_time(mut self, message_time: DateTime<Utc>) -> Self {
        self.message_time = message_time;
        self
    }

    /// Overrides the pass start time.
    #[must_use]
    pub fn with_current_time(mut self, current_time: DateTime<Utc>) -> Self {
        self.current_time = current_time;
        self
    }

    /// Sets the measured bandwidth (bytes/sec) for send and receive.
    #[must_use]
    pub fn with_bandwidth(mut self, send: u64, receive: u64) -> Self {
        self.send_bandwidth = send;
        self.receive_bandwidth = receive;
        self
    }

    /// Boundary this pass runs at.
    #[must_use]
    pub const fn operation(&self) -> Operation {
        self.operation
    }

    /// Time the packet was stamped by its originator.
    #[must_use]
    pub const fn message_time(&self) -> DateTime<Utc> {
        self.message_time
    }

    /// Time the filter pass started.
    #[must_use]
    pub const fn current_time(&self) -> DateTime<Utc> {
        self.current_time
    }

    /// Domain the packet belongs to.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Transport id of the participant that first sent the packet.
    #[must_use]
    pub fn originator(&self) -> &str {
        &self.originator
    }

    /// Outbound bandwidth over the monitor window, in bytes/sec.
    #[must_use]
    pub const fn send_bandwidth(&self) -> u64 {
        self.send_bandwidth
    }

    /// Inbound bandwidth over the monitor window, in bytes/sec.
    #[must_use]
    pub const fn receive_bandwidth(&self) -> u64 {
        self.receive_bandwidth
    }

    /// Age of the packet at the time of this pass. Clock skew that puts the
    /// message in the future counts as zero.
    #[must_use]
    pub fn message_age(&self) -> std::time::Duration {
        (self.current_time - self.message_time)
            .to_std()
            .unwrap_or_default()
    }

    /// Stages an extra record to be merged into the packet after the
    /// aggregate filters. Staged records are not filtered again.
    pub fn add_record(&mut self, key: impl Into<String>, record: Record) {
        self.records.insert(key, record);
    }

    /// Drops every staged record.
    pub fn clear_records(&mut self) {
        self.records.clear();
    }

    /// Records staged so far.
    #[must_use]
    pub fn records(&self) -> &Packet {
        &self.records
    }

    pub(crate) fn take_records(&mut self) -> Packet {
        std::mem::take(&mut self.records)
    }

    pub(crate) fn set_operation(&mut self, operation: Operation) {
        self.operation = operation;
    }
}
