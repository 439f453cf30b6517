//! Network collaborator seam and an in-process implementation.

use std::sync::{Arc, RwLock};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::{MeshError, MeshResult};

/// Delivers encoded messages to the other participants of a domain.
///
/// Implementations only move bytes; framing, filtering and policy happen in
/// the transport.
pub trait Network: Send + Sync {
    /// Broadcasts `bytes` to every other participant.
    fn send(&self, bytes: &[u8]) -> MeshResult<()>;
}

/// Bytes received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Host name of the sending endpoint.
    pub from: String,
    pub bytes: Vec<u8>,
}

type Members = Vec<(String, Sender<Datagram>)>;

/// Shared medium that [`ChannelNetwork`] endpoints broadcast over.
#[derive(Debug, Clone, Default)]
pub struct ChannelHub {
    members: Arc<RwLock<Members>>,
}

impl ChannelHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an endpoint named `host`. Messages for it arrive on the returned
    /// receiver.
    ///
    /// # Errors
    /// [`MeshError::InvalidConfig`] if `host` already joined.
    pub fn join(&self, host: &str) -> MeshResult<(ChannelNetwork, Receiver<Datagram>)> {
        let (tx, rx) = unbounded();
        let mut members = self
            .members
            .write()
            .map_err(|_| MeshError::internal("poisoned lock: channel hub"))?;
        if members.iter().any(|(name, _)| name == host) {
            return Err(MeshError::invalid_config(format!("host '{host}' already joined")));
        }
        members.push((host.to_string(), tx));

        Ok((
            ChannelNetwork {
                host: host.to_string(),
                hub: self.clone(),
            },
            rx,
        ))
    }

    /// Number of joined endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.read().map_or(0, |m| m.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process broadcast endpoint backed by `crossbeam-channel`.
#[derive(Debug, Clone)]
pub struct ChannelNetwork {
    host: String,
    hub: ChannelHub,
}

impl ChannelNetwork {
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Network for ChannelNetwork {
    fn send(&self, bytes: &[u8]) -> MeshResult<()> {
        let mut members = self
            .hub
            .members
            .write()
            .map_err(|_| MeshError::internal("poisoned lock: channel hub"))?;

        // endpoints whose receiver was dropped leave the hub
        members.retain(|(name, tx)| {
            if *name == self.host {
                return true;
            }
            tx.send(Datagram {
                from: self.host.clone(),
                bytes: bytes.to_vec(),
            })
            .is_ok()
        });
        Ok(())
    }
}
