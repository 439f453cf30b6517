//! Knowledge transport: filtered, policy-governed packet exchange.
//!
//! Send path: store drain → record filters → aggregate filters → wire encode
//! → buffer filters → admission → network.
//!
//! Receive path: bytes → buffer filters (reverse) → wire decode → inbound
//! admission → record filters → aggregate filters → atomic store apply →
//! optional rebroadcast.
//!
//! Per-packet failures never escape as errors: they come back as
//! [`SendOutcome`] / [`ReceiveOutcome`] values. `Err` is reserved for misuse
//! (released components) and collaborator failures (store, network).

pub mod network;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::codec::FRAME_OVERHEAD;
use crate::context::{Operation, TransportContext};
use crate::error::{FilterError, MeshError, MeshResult};
use crate::filter::{FilterPipeline, STAGE_HEADER_SIZE};
use crate::packet::Packet;
use crate::qos::{Admission, AdmissionControl, DropScheduler, QosPolicy, RejectReason, DEFAULT_WINDOW};
use crate::release::Liveness;
use crate::storage::KnowledgeStore;

pub use network::{ChannelHub, ChannelNetwork, Datagram, Network};
pub use wire::{Message, MessageHeader};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Smallest buffer that can hold an empty frame behind one filter stage.
const MIN_QUEUE_LENGTH: usize = FRAME_OVERHEAD + STAGE_HEADER_SIZE + 2;

/// Transport settings fixed at construction.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Participant id, used as the originator of sent packets.
    pub id: String,
    /// Packets from other domains are ignored.
    pub domain: String,
    /// Buffer capacity in bytes for one encoded message.
    pub queue_length: usize,
    /// Bandwidth accounting window.
    pub bandwidth_window: Duration,
    /// Longest single sleep while a send is deferred by a bandwidth cap.
    pub max_defer: Duration,
    /// Seed for the drop-rate scheduler; `None` seeds from entropy.
    pub drop_seed: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            id: format!("agent.{}", Uuid::new_v4()),
            domain: "kyromesh".to_string(),
            queue_length: 64 * 1024,
            bandwidth_window: DEFAULT_WINDOW,
            max_defer: Duration::from_millis(250),
            drop_seed: None,
        }
    }
}

impl TransportConfig {
    /// Config for participant `id` in `domain`, defaults elsewhere.
    #[must_use]
    pub fn new(id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
            ..Self::default()
        }
    }

    fn validate(&self) -> MeshResult<()> {
        if self.id.trim().is_empty() {
            return Err(MeshError::invalid_config("transport id is empty"));
        }
        if self.domain.trim().is_empty() {
            return Err(MeshError::invalid_config("transport domain is empty"));
        }
        if self.queue_length < MIN_QUEUE_LENGTH {
            return Err(MeshError::invalid_config(format!(
                "queue_length {} is below the minimum {MIN_QUEUE_LENGTH}",
                self.queue_length
            )));
        }
        if self.max_defer.is_zero() {
            return Err(MeshError::invalid_config("max_defer must be positive"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Outcomes
// ----------------------------------------------------------------------------

/// Result of one send attempt.
#[derive(Debug)]
pub enum SendOutcome {
    /// Handed to the network.
    Sent {
        /// Records in the packet after filtering.
        records: usize,
        /// Bytes on the wire.
        bytes: usize,
    },
    /// Nothing left to send (empty input or everything filtered out).
    Empty,
    /// Refused by the QoS policy.
    Rejected(RejectReason),
    /// A buffer filter failed; nothing was sent.
    Aborted(FilterError),
}

impl SendOutcome {
    /// True for [`SendOutcome::Sent`].
    #[must_use]
    pub const fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }
}

/// Result of processing one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Filtered records were applied to the store.
    Applied {
        /// Records the store took.
        accepted: usize,
        /// Records the store refused.
        rejected: usize,
        /// Whether the packet was relayed onwards.
        rebroadcast: bool,
    },
    /// Not for this participant (other domain, or its own echo).
    Ignored,
    /// Refused by the QoS policy.
    Rejected(RejectReason),
    /// Malformed or undecodable input.
    Dropped {
        /// What was wrong with the input.
        reason: String,
    },
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// One participant's endpoint on the knowledge network.
pub struct Transport {
    config: TransportConfig,
    store: Arc<dyn KnowledgeStore>,
    network: Arc<dyn Network>,
    filters: Arc<FilterPipeline>,
    admission: AdmissionControl,
    liveness: Liveness,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .field("filters", &self.filters)
            .field("admission", &self.admission)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Creates a transport with its own default policy.
    ///
    /// # Errors
    /// [`MeshError::InvalidConfig`] for an unusable config.
    pub fn new(
        config: TransportConfig,
        store: Arc<dyn KnowledgeStore>,
        network: Arc<dyn Network>,
    ) -> MeshResult<Self> {
        Self::with_policy(config, store, network, Arc::new(QosPolicy::new()))
    }

    /// Creates a transport governed by a shared policy.
    ///
    /// # Errors
    /// [`MeshError::InvalidConfig`] for an unusable config.
    pub fn with_policy(
        config: TransportConfig,
        store: Arc<dyn KnowledgeStore>,
        network: Arc<dyn Network>,
        policy: Arc<QosPolicy>,
    ) -> MeshResult<Self> {
        config.validate()?;

        let drops = config
            .drop_seed
            .map_or_else(DropScheduler::new, DropScheduler::with_seed);
        let admission = AdmissionControl::with_drop_scheduler(policy, config.bandwidth_window, drops);

        tracing::info!(id = %config.id, domain = %config.domain, queue_length = config.queue_length, "transport created");

        Ok(Self {
            config,
            store,
            network,
            filters: Arc::new(FilterPipeline::new()),
            admission,
            liveness: Liveness::new("Transport"),
        })
    }

    /// Identity and domain this transport was built with.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Filter registration surface.
    #[must_use]
    pub fn filters(&self) -> &Arc<FilterPipeline> {
        &self.filters
    }

    /// QoS policy consulted on every send and receive.
    #[must_use]
    pub fn policy(&self) -> &Arc<QosPolicy> {
        self.admission.policy()
    }

    /// Store that sends read from and receives apply to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.store
    }

    /// Simulated-loss counters.
    #[must_use]
    pub const fn drop_scheduler(&self) -> &DropScheduler {
        self.admission.drop_scheduler()
    }

    fn context(&self, operation: Operation, originator: &str) -> TransportContext {
        TransportContext::new(operation, self.config.domain.as_str(), originator).with_bandwidth(
            self.admission.send_bandwidth(),
            self.admission.receive_bandwidth(),
        )
    }

    /// Filters and sends `packet`, blocking while a bandwidth cap defers it.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released, wire encoding and
    /// network failures.
    pub fn send(&self, packet: Packet) -> MeshResult<SendOutcome> {
        self.liveness.ensure_live()?;
        if packet.is_empty() {
            return Ok(SendOutcome::Empty);
        }

        let mut context = self.context(Operation::Send, &self.config.id);
        let filtered = self.filters.run(packet, &mut context)?;
        if filtered.is_empty() {
            tracing::debug!(id = %self.config.id, "send filtered to an empty packet");
            return Ok(SendOutcome::Empty);
        }

        let mut header = MessageHeader::new(self.config.id.as_str(), self.config.domain.as_str(), self.policy().rebroadcast_ttl()?);
        header.timestamp = context.message_time();
        let records = filtered.len();
        let accounted = self.store.packet_size(&filtered);
        let message = Message {
            header,
            packet: filtered,
        };

        let encoded = match self.encode(&message)? {
            Ok(encoded) => encoded,
            Err(error) => {
                tracing::warn!(id = %self.config.id, %error, "send aborted by buffer filter");
                return Ok(SendOutcome::Aborted(error));
            }
        };

        loop {
            match self.admission.admit_outbound(accounted, &context)? {
                Admission::Admit => break,
                Admission::Defer(wait) => {
                    std::thread::sleep(wait.min(self.config.max_defer));
                    self.liveness.ensure_live()?;
                    context = context.with_current_time(Utc::now());
                }
                Admission::Reject(reason) => {
                    tracing::debug!(id = %self.config.id, %reason, "send rejected");
                    return Ok(SendOutcome::Rejected(reason));
                }
            }
        }

        self.network.send(&encoded)?;
        self.admission.record_sent(accounted);
        tracing::debug!(id = %self.config.id, records, bytes = encoded.len(), "packet sent");

        Ok(SendOutcome::Sent {
            records,
            bytes: encoded.len(),
        })
    }

    /// Drains every locally modified record from the store and sends them as
    /// one packet.
    ///
    /// # Errors
    /// See [`Transport::send`].
    pub fn send_modifieds(&self) -> MeshResult<SendOutcome> {
        self.liveness.ensure_live()?;
        let modified = self.store.drain_modified()?;
        self.send(modified)
    }

    /// Wire-encodes and buffer-filters a message. The outer `Result` carries
    /// hard failures, the inner one a filter failure that only affects this
    /// message.
    fn encode(&self, message: &Message) -> MeshResult<Result<Vec<u8>, FilterError>> {
        let framed = wire::encode(message)?;
        let chain = self.filters.buffer_chain()?;
        Ok(chain.encode_vec(&framed, self.config.queue_length))
    }

    /// Processes bytes that arrived from `remote_host`.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released, store and network
    /// failures. Malformed input is reported as [`ReceiveOutcome::Dropped`].
    pub fn receive(&self, bytes: &[u8], remote_host: &str) -> MeshResult<ReceiveOutcome> {
        self.liveness.ensure_live()?;

        let chain = self.filters.buffer_chain()?;
        let message = match chain
            .decode_vec(bytes, self.config.queue_length)
            .map_err(MeshError::from)
            .and_then(|framed| wire::decode(&framed))
        {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(id = %self.config.id, remote_host, %error, "dropping undecodable packet");
                return Ok(ReceiveOutcome::Dropped {
                    reason: error.to_string(),
                });
            }
        };

        let Message { header, packet } = message;
        if header.domain != self.config.domain || header.originator == self.config.id {
            tracing::trace!(id = %self.config.id, domain = %header.domain, originator = %header.originator, "ignoring packet");
            return Ok(ReceiveOutcome::Ignored);
        }

        self.admission.record_received(self.store.packet_size(&packet));

        let mut context = self
            .context(Operation::Receive, &header.originator)
            .with_message_time(header.timestamp);
        if let Admission::Reject(reason) = self.admission.admit_inbound(remote_host, &context)? {
            return Ok(ReceiveOutcome::Rejected(reason));
        }

        let filtered = self.filters.run(packet, &mut context)?;
        let summary = if filtered.is_empty() {
            crate::storage::ApplySummary::default()
        } else {
            self.store.apply(&filtered)?
        };
        tracing::debug!(
            id = %self.config.id,
            originator = %header.originator,
            accepted = summary.accepted,
            rejected = summary.rejected,
            "packet applied"
        );

        let rebroadcast = self.rebroadcast(&header, filtered, context)?;

        Ok(ReceiveOutcome::Applied {
            accepted: summary.accepted,
            rejected: summary.rejected,
            rebroadcast,
        })
    }

    fn rebroadcast(&self, header: &MessageHeader, packet: Packet, mut context: TransportContext) -> MeshResult<bool> {
        if packet.is_empty() {
            return Ok(false);
        }
        let Some(ttl) = self.admission.rebroadcast_ttl(header.ttl)? else {
            return Ok(false);
        };

        context.set_operation(Operation::Rebroadcast);
        let relayed = self.filters.run(packet, &mut context)?;
        if relayed.is_empty() {
            return Ok(false);
        }

        let accounted = self.store.packet_size(&relayed);
        let message = Message {
            header: header.relayed(ttl),
            packet: relayed,
        };
        let encoded = match self.encode(&message)? {
            Ok(encoded) => encoded,
            Err(error) => {
                tracing::warn!(id = %self.config.id, %error, "rebroadcast aborted by buffer filter");
                return Ok(false);
            }
        };

        self.network.send(&encoded)?;
        self.admission.record_sent(accounted);
        tracing::debug!(id = %self.config.id, ttl, bytes = encoded.len(), "packet rebroadcast");
        Ok(true)
    }

    /// Outbound bandwidth over the accounting window, in bytes/sec.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn send_bandwidth(&self) -> MeshResult<u64> {
        self.liveness.ensure_live()?;
        Ok(self.admission.send_bandwidth())
    }

    /// Inbound bandwidth over the accounting window, in bytes/sec.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn receive_bandwidth(&self) -> MeshResult<u64> {
        self.liveness.ensure_live()?;
        Ok(self.admission.receive_bandwidth())
    }

    /// Ends the transport and drops its filters. The shared policy and store
    /// are left alone.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] if already released.
    pub fn release(&self) -> MeshResult<()> {
        self.liveness.release()?;
        self.filters.release()?;
        tracing::info!(id = %self.config.id, "transport released");
        Ok(())
    }
}
