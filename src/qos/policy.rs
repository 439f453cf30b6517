//! QoS policy settings and their persistence.
//!
//! A [`QosPolicy`] is shared between a transport and whoever tunes it at
//! runtime. Every setter takes effect on the next packet.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::codec;
use crate::error::{MeshError, MeshResult};
use crate::release::Liveness;

/// How simulated packet loss is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Each packet is dropped independently with the configured probability.
    #[default]
    Probabilistic,
    /// Stride scheduling between a send and a drop ticket holder, giving an
    /// exact long-run ratio.
    Deterministic,
}

impl DropPolicy {
    /// Name used in policy snapshots.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Probabilistic => "probabilistic",
            Self::Deterministic => "deterministic",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "probabilistic" => Some(Self::Probabilistic),
            "deterministic" => Some(Self::Deterministic),
            _ => None,
        }
    }
}

/// Simulated loss applied to outbound packets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DropRate {
    /// Loss in percent, `0.0..=100.0`.
    pub percentage: f64,
    /// How drops are chosen.
    pub policy: DropPolicy,
    /// Once a drop starts, keep dropping until this many consecutive packets
    /// have been lost.
    pub burst: u64,
}

impl Default for DropRate {
    fn default() -> Self {
        Self {
            percentage: 0.0,
            policy: DropPolicy::Probabilistic,
            burst: 1,
        }
    }
}

impl DropRate {
    /// Creates a drop rate with no burst.
    #[must_use]
    pub fn new(percentage: f64, policy: DropPolicy) -> Self {
        Self {
            percentage,
            policy,
            burst: 1,
        }
    }

    /// Sets the burst length; see [`DropRate::burst`].
    #[must_use]
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    /// Returns true if no packet will ever be dropped.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.percentage <= 0.0
    }

    fn validate(&self) -> MeshResult<()> {
        if !self.percentage.is_finite() || !(0.0..=100.0).contains(&self.percentage) {
            return Err(MeshError::invalid_config(format!(
                "drop percentage {} is out of range 0..=100",
                self.percentage
            )));
        }
        if self.burst == 0 {
            return Err(MeshError::invalid_config("drop burst must be at least 1"));
        }
        Ok(())
    }
}

/// Plain policy state. `None` limits mean unlimited.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Hop budget stamped on outbound packets; 0 disables rebroadcast.
    pub rebroadcast_ttl: u8,
    /// Largest hop budget this participant will relay; 0 never relays.
    pub participant_ttl: u8,
    /// Outbound cap in bytes/sec.
    pub send_bandwidth_limit: Option<u64>,
    /// Send plus receive cap in bytes/sec.
    pub total_bandwidth_limit: Option<u64>,
    /// Maximum packet age.
    pub deadline: Option<Duration>,
    /// Simulated outbound loss.
    pub drop_rate: DropRate,
    /// Peers accepted on receive; empty accepts everyone not banned.
    pub trusted_peers: BTreeSet<String>,
    /// Peers always refused.
    pub banned_peers: BTreeSet<String>,
}

impl PolicySettings {
    /// Banned beats trusted. An empty trusted set trusts everyone.
    #[must_use]
    pub fn is_trusted(&self, peer: &str) -> bool {
        !self.banned_peers.contains(peer)
            && (self.trusted_peers.is_empty() || self.trusted_peers.contains(peer))
    }

    /// True if `peer` is in the banned set.
    #[must_use]
    pub fn is_banned(&self, peer: &str) -> bool {
        self.banned_peers.contains(peer)
    }

    /// Flattens every field into setting-name keys under `prefix`.
    fn to_entries(&self, prefix: &str) -> BTreeMap<String, JsonValue> {
        let mut entries = BTreeMap::new();
        let key = |name: &str| format!("{prefix}.{name}");

        entries.insert(key("rebroadcast_ttl"), JsonValue::from(self.rebroadcast_ttl));
        entries.insert(key("participant_ttl"), JsonValue::from(self.participant_ttl));
        if let Some(limit) = self.send_bandwidth_limit {
            entries.insert(key("send_bandwidth_limit"), JsonValue::from(limit));
        }
        if let Some(limit) = self.total_bandwidth_limit {
            entries.insert(key("total_bandwidth_limit"), JsonValue::from(limit));
        }
        if let Some(deadline) = self.deadline {
            entries.insert(key("deadline.secs"), JsonValue::from(deadline.as_secs()));
            entries.insert(key("deadline.nanos"), JsonValue::from(deadline.subsec_nanos()));
        }
        entries.insert(key("drop_rate.percentage"), JsonValue::from(self.drop_rate.percentage));
        entries.insert(key("drop_rate.policy"), JsonValue::from(self.drop_rate.policy.as_str()));
        entries.insert(key("drop_rate.burst"), JsonValue::from(self.drop_rate.burst));
        for peer in &self.trusted_peers {
            entries.insert(key(&format!("trusted_peers.{peer}")), JsonValue::from(1));
        }
        for peer in &self.banned_peers {
            entries.insert(key(&format!("banned_peers.{peer}")), JsonValue::from(1));
        }
        entries
    }

    /// Rebuilds settings from entries under `prefix`. Missing keys take their
    /// defaults; keys under other prefixes are ignored.
    fn from_entries(entries: &BTreeMap<String, JsonValue>, prefix: &str) -> MeshResult<Self> {
        let scope = format!("{prefix}.");
        let mut settings = Self::default();
        let (mut deadline_secs, mut deadline_nanos) = (None, None);

        for (full_key, value) in entries {
            let Some(name) = full_key.strip_prefix(&scope) else {
                continue;
            };
            let bad = || MeshError::invalid_config(format!("bad value for '{full_key}': {value}"));
            let as_u64 = || value.as_u64().ok_or_else(bad);
            let as_u8 = || as_u64().and_then(|v| u8::try_from(v).map_err(|_| bad()));

            match name {
                "rebroadcast_ttl" => settings.rebroadcast_ttl = as_u8()?,
                "participant_ttl" => settings.participant_ttl = as_u8()?,
                "send_bandwidth_limit" => settings.send_bandwidth_limit = Some(as_u64()?),
                "total_bandwidth_limit" => settings.total_bandwidth_limit = Some(as_u64()?),
                "deadline.secs" => deadline_secs = Some(as_u64()?),
                "deadline.nanos" => {
                    let nanos = as_u64()
                        .and_then(|v| u32::try_from(v).map_err(|_| bad()))
                        .and_then(|v| if v < 1_000_000_000 { Ok(v) } else { Err(bad()) })?;
                    deadline_nanos = Some(nanos);
                }
                "drop_rate.percentage" => {
                    settings.drop_rate.percentage = value.as_f64().ok_or_else(bad)?;
                }
                "drop_rate.policy" => {
                    settings.drop_rate.policy =
                        value.as_str().and_then(DropPolicy::parse).ok_or_else(bad)?;
                }
                "drop_rate.burst" => settings.drop_rate.burst = as_u64()?,
                other => {
                    if let Some(peer) = other.strip_prefix("trusted_peers.") {
                        settings.trusted_peers.insert(peer.to_string());
                    } else if let Some(peer) = other.strip_prefix("banned_peers.") {
                        settings.banned_peers.insert(peer.to_string());
                    } else {
                        tracing::debug!(key = %full_key, "ignoring unknown policy setting");
                    }
                }
            }
        }

        if deadline_secs.is_some() || deadline_nanos.is_some() {
            settings.deadline = Some(Duration::new(
                deadline_secs.unwrap_or(0),
                deadline_nanos.unwrap_or(0),
            ));
        }
        settings.drop_rate.validate()?;
        Ok(settings)
    }
}

/// Thread-safe, releasable QoS policy.
#[derive(Debug)]
pub struct QosPolicy {
    settings: RwLock<PolicySettings>,
    liveness: Liveness,
}

impl Default for QosPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl QosPolicy {
    /// A live policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(PolicySettings::default())
    }

    /// A live policy starting from `settings`.
    #[must_use]
    pub fn with_settings(settings: PolicySettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            liveness: Liveness::new("QosPolicy"),
        }
    }

    fn read(&self) -> MeshResult<RwLockReadGuard<'_, PolicySettings>> {
        self.liveness.ensure_live()?;
        self.settings
            .read()
            .map_err(|_| MeshError::internal("poisoned lock: qos policy"))
    }

    fn write(&self) -> MeshResult<RwLockWriteGuard<'_, PolicySettings>> {
        self.liveness.ensure_live()?;
        self.settings
            .write()
            .map_err(|_| MeshError::internal("poisoned lock: qos policy"))
    }

    /// Copy of the current settings.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn settings(&self) -> MeshResult<PolicySettings> {
        Ok(self.read()?.clone())
    }

    /// Replaces every setting at once.
    ///
    /// Swaps in `settings` wholesale.
    ///
    /// # Errors
    /// [`MeshError::InvalidConfig`] for an invalid drop rate,
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn replace(&self, settings: PolicySettings) -> MeshResult<()> {
        settings.drop_rate.validate()?;
        *self.write()? = settings;
        Ok(())
    }

    /// Hop budget stamped on outbound packets.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn rebroadcast_ttl(&self) -> MeshResult<u8> {
        Ok(self.read()?.rebroadcast_ttl)
    }

    /// Sets the outbound hop budget; 0 disables rebroadcast.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn set_rebroadcast_ttl(&self, ttl: u8) -> MeshResult<()> {
        self.write()?.rebroadcast_ttl = ttl;
        Ok(())
    }

    /// Largest hop budget this participant relays.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn participant_ttl(&self) -> MeshResult<u8> {
        Ok(self.read()?.participant_ttl)
    }

    /// Sets the largest hop budget this participant relays; 0 never relays.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn set_participant_ttl(&self, ttl: u8) -> MeshResult<()> {
        self.write()?.participant_ttl = ttl;
        Ok(())
    }

    /// Outbound cap in bytes/sec, `None` when unlimited.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn send_bandwidth_limit(&self) -> MeshResult<Option<u64>> {
        Ok(self.read()?.send_bandwidth_limit)
    }

    /// Caps outbound bytes/sec; `None` lifts the cap.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn set_send_bandwidth_limit(&self, limit: Option<u64>) -> MeshResult<()> {
        self.write()?.send_bandwidth_limit = limit;
        Ok(())
    }

    /// Send plus receive cap in bytes/sec, `None` when unlimited.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn total_bandwidth_limit(&self) -> MeshResult<Option<u64>> {
        Ok(self.read()?.total_bandwidth_limit)
    }

    /// Caps send plus receive bytes/sec; `None` lifts the cap.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn set_total_bandwidth_limit(&self, limit: Option<u64>) -> MeshResult<()> {
        self.write()?.total_bandwidth_limit = limit;
        Ok(())
    }

    /// Maximum packet age, `None` when packets never go stale.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn deadline(&self) -> MeshResult<Option<Duration>> {
        Ok(self.read()?.deadline)
    }

    /// Sets the maximum packet age; `None` disables the check.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn set_deadline(&self, deadline: Option<Duration>) -> MeshResult<()> {
        self.write()?.deadline = deadline;
        Ok(())
    }

    /// Simulated loss applied to outbound packets.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn drop_rate(&self) -> MeshResult<DropRate> {
        Ok(self.read()?.drop_rate)
    }

    /// Sets the simulated loss for outbound packets.
    ///
    /// # Errors
    /// [`MeshError::InvalidConfig`] for a percentage outside `0..=100` or a
    /// zero burst, [`MeshError::UseAfterRelease`] once released.
    pub fn set_drop_rate(&self, rate: DropRate) -> MeshResult<()> {
        rate.validate()?;
        self.write()?.drop_rate = rate;
        Ok(())
    }

    /// Trusts `peer`, removing it from the banned set.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn add_trusted_peer(&self, peer: &str) -> MeshResult<()> {
        let mut settings = self.write()?;
        settings.banned_peers.remove(peer);
        settings.trusted_peers.insert(peer.to_string());
        Ok(())
    }

    /// Bans `peer`, removing it from the trusted set.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn add_banned_peer(&self, peer: &str) -> MeshResult<()> {
        let mut settings = self.write()?;
        settings.trusted_peers.remove(peer);
        settings.banned_peers.insert(peer.to_string());
        Ok(())
    }

    /// Returns true if `peer` was trusted.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn remove_trusted_peer(&self, peer: &str) -> MeshResult<bool> {
        Ok(self.write()?.trusted_peers.remove(peer))
    }

    /// Returns true if `peer` was banned.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn remove_banned_peer(&self, peer: &str) -> MeshResult<bool> {
        Ok(self.write()?.banned_peers.remove(peer))
    }

    /// Trusted peers, sorted.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn trusted_peers(&self) -> MeshResult<Vec<String>> {
        Ok(self.read()?.trusted_peers.iter().cloned().collect())
    }

    /// Banned peers, sorted.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn banned_peers(&self) -> MeshResult<Vec<String>> {
        Ok(self.read()?.banned_peers.iter().cloned().collect())
    }

    /// Banned beats trusted. An empty trusted set trusts everyone.
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] once released.
    pub fn is_trusted(&self, peer: &str) -> MeshResult<bool> {
        Ok(self.read()?.is_trusted(peer))
    }

    /// Writes every setting under `prefix` to `path`, replacing the file.
    ///
    /// # Errors
    /// I/O failures, or [`MeshError::UseAfterRelease`] once released.
    pub fn save(&self, path: impl AsRef<Path>, prefix: &str) -> MeshResult<()> {
        let path = path.as_ref();
        let entries = self.read()?.to_entries(prefix);
        let bytes = codec::encode(codec::POLICY_MAGIC, &entries)?;

        let temp_path = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        let result = (|| -> MeshResult<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&temp_path, path)?;
            Ok(())
        })();

        if result.is_err() && temp_path.exists() {
            let _ = fs::remove_file(&temp_path);
        }
        result?;

        tracing::debug!(path = %path.display(), prefix, entries = entries.len(), "QoS policy saved");
        Ok(())
    }

    /// Replaces the whole policy with the settings stored under `prefix`.
    /// Settings absent from the file reset to their defaults.
    ///
    /// # Errors
    /// I/O failures, corrupt snapshots and invalid values. The in-memory
    /// policy is left untouched on error.
    pub fn load(&self, path: impl AsRef<Path>, prefix: &str) -> MeshResult<()> {
        self.liveness.ensure_live()?;
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let entries: BTreeMap<String, JsonValue> = codec::decode(codec::POLICY_MAGIC, &bytes)?;
        let settings = PolicySettings::from_entries(&entries, prefix)?;

        *self.write()? = settings;
        tracing::debug!(path = %path.display(), prefix, "QoS policy loaded");
        Ok(())
    }

    /// Ends the policy. Later calls fail with [`MeshError::UseAfterRelease`].
    ///
    /// # Errors
    /// [`MeshError::UseAfterRelease`] if already released.
    pub fn release(&self) -> MeshResult<()> {
        self.liveness.release()
    }
}
