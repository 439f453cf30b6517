//! Admission decisions for outbound, inbound and relayed packets.
//!
//! [`AdmissionControl`] combines the shared [`QosPolicy`] with the per-transport
//! bandwidth monitors and drop scheduler.

use std::sync::Arc;
use std::time::Duration;

use crate::context::TransportContext;
use crate::error::MeshResult;
use crate::qos::bandwidth::BandwidthMonitor;
use crate::qos::drop::DropScheduler;
use crate::qos::policy::{PolicySettings, QosPolicy};

/// Why a packet was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The packet is older than the configured deadline.
    DeadlineExceeded { age: Duration, deadline: Duration },
    /// Lost to the simulated drop rate.
    SimulatedLoss,
    /// The remote host or originator is banned.
    BannedPeer { peer: String },
    /// A trusted set is configured and the peer is not in it.
    UntrustedPeer { peer: String },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeadlineExceeded { age, deadline } => {
                write!(f, "deadline exceeded ({age:?} > {deadline:?})")
            }
            Self::SimulatedLoss => f.write_str("simulated loss"),
            Self::BannedPeer { peer } => write!(f, "banned peer '{peer}'"),
            Self::UntrustedPeer { peer } => write!(f, "untrusted peer '{peer}'"),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Over a bandwidth cap; retry after the duration. Never a drop.
    Defer(Duration),
    Reject(RejectReason),
}

impl Admission {
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }
}

/// Policy enforcement for one transport.
#[derive(Debug)]
pub struct AdmissionControl {
    policy: Arc<QosPolicy>,
    send: BandwidthMonitor,
    receive: BandwidthMonitor,
    total: BandwidthMonitor,
    drops: DropScheduler,
}

impl AdmissionControl {
    #[must_use]
    pub fn new(policy: Arc<QosPolicy>, window: Duration) -> Self {
        Self::with_drop_scheduler(policy, window, DropScheduler::new())
    }

    #[must_use]
    pub fn with_drop_scheduler(policy: Arc<QosPolicy>, window: Duration, drops: DropScheduler) -> Self {
        Self {
            policy,
            send: BandwidthMonitor::new(window),
            receive: BandwidthMonitor::new(window),
            total: BandwidthMonitor::new(window),
            drops,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &Arc<QosPolicy> {
        &self.policy
    }

    #[must_use]
    pub const fn drop_scheduler(&self) -> &DropScheduler {
        &self.drops
    }

    /// Outbound check, in order: send cap, total cap, deadline, drop rate.
    ///
    /// # Errors
    /// Only if the policy has been released.
    pub fn admit_outbound(&self, encoded_len: usize, context: &TransportContext) -> MeshResult<Admission> {
        let settings = self.policy.settings()?;
        let next = encoded_len as u64;

        if let Some(wait) = self.bandwidth_wait(&settings, next) {
            tracing::debug!(bytes = encoded_len, wait_ms = wait.as_millis() as u64, "send deferred by bandwidth cap");
            return Ok(Admission::Defer(wait));
        }

        if let Some(reason) = deadline_violation(&settings, context) {
            return Ok(Admission::Reject(reason));
        }

        if !self.drops.should_send(&settings.drop_rate) {
            tracing::debug!(bytes = encoded_len, dropped = self.drops.dropped(), "packet dropped by drop-rate policy");
            return Ok(Admission::Reject(RejectReason::SimulatedLoss));
        }

        Ok(Admission::Admit)
    }

    fn bandwidth_wait(&self, settings: &PolicySettings, next: u64) -> Option<Duration> {
        let send_wait = settings
            .send_bandwidth_limit
            .and_then(|limit| self.send.wait_for(next, limit));
        let total_wait = settings
            .total_bandwidth_limit
            .and_then(|limit| self.total.wait_for(next, limit));
        match (send_wait, total_wait) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Inbound check, in order: banned, trusted, deadline.
    ///
    /// # Errors
    /// Only if the policy has been released.
    pub fn admit_inbound(&self, remote_host: &str, context: &TransportContext) -> MeshResult<Admission> {
        let settings = self.policy.settings()?;
        let originator = context.originator();

        for peer in [remote_host, originator] {
            if settings.is_banned(peer) {
                tracing::debug!(peer, "ignoring packet from banned peer");
                return Ok(Admission::Reject(RejectReason::BannedPeer {
                    peer: peer.to_string(),
                }));
            }
        }

        if !settings.trusted_peers.is_empty()
            && !settings.trusted_peers.contains(remote_host)
            && !settings.trusted_peers.contains(originator)
        {
            tracing::debug!(peer = remote_host, originator, "ignoring packet from untrusted peer");
            return Ok(Admission::Reject(RejectReason::UntrustedPeer {
                peer: remote_host.to_string(),
            }));
        }

        if let Some(reason) = deadline_violation(&settings, context) {
            return Ok(Admission::Reject(reason));
        }

        Ok(Admission::Admit)
    }

    /// Hop budget for relaying a packet that arrived with `incoming_ttl`, or
    /// `None` if it must not be relayed.
    ///
    /// # Errors
    /// Only if the policy has been released.
    pub fn rebroadcast_ttl(&self, incoming_ttl: u8) -> MeshResult<Option<u8>> {
        let settings = self.policy.settings()?;

        if incoming_ttl == 0 || settings.participant_ttl == 0 || incoming_ttl > settings.participant_ttl {
            return Ok(None);
        }

        let over_send = settings
            .send_bandwidth_limit
            .is_some_and(|limit| self.send.bytes_per_second() > limit);
        let over_total = settings
            .total_bandwidth_limit
            .is_some_and(|limit| self.total.bytes_per_second() > limit);
        if over_send || over_total {
            tracing::debug!(incoming_ttl, "rebroadcast suppressed by bandwidth cap");
            return Ok(None);
        }

        Ok(Some(incoming_ttl - 1).filter(|ttl| *ttl > 0))
    }

    /// Accounts for bytes handed to the network.
    pub fn record_sent(&self, bytes: usize) {
        self.send.add(bytes as u64);
        self.total.add(bytes as u64);
    }

    /// Accounts for bytes read from the network.
    pub fn record_received(&self, bytes: usize) {
        self.receive.add(bytes as u64);
        self.total.add(bytes as u64);
    }

    #[must_use]
    pub fn send_bandwidth(&self) -> u64 {
        self.send.bytes_per_second()
    }

    #[must_use]
    pub fn receive_bandwidth(&self) -> u64 {
        self.receive.bytes_per_second()
    }

    #[must_use]
    pub fn total_bandwidth(&self) -> u64 {
        self.total.bytes_per_second()
    }
}

fn deadline_violation(settings: &PolicySettings, context: &TransportContext) -> Option<RejectReason> {
    let deadline = settings.deadline?;
    let age = context.message_age();
    if age > deadline {
        tracing::debug!(age_ms = age.as_millis() as u64, deadline_ms = deadline.as_millis() as u64, "packet past deadline");
        return Some(RejectReason::DeadlineExceeded { age, deadline });
    }
    None
}
