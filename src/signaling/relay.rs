//! An in-process brokering service.
//!
//! The relay hands out identities (one live registration per id), routes
//! setup messages between registered endpoints and can simulate the broker
//! dropping an endpoint. Transports talk to it instead of an external server,
//! which lets several clients share one process.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{CallId, PeerId, SignalError};
use crate::identity::Identity;
use crate::media::{MediaKind, Track};

/// sent along with every offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferMetadata {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    /// older peers leave this out; the sender's relay id stands in for it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<Identity>,
}

/// peer-to-peer signals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// starts a call; `tracks` describes what the caller publishes
    Offer {
        call_id: CallId,
        metadata: OfferMetadata,
        tracks: Vec<Track>,
        sdp: RTCSessionDescription,
    },
    Answer {
        call_id: CallId,
        tracks: Vec<Track>,
        sdp: RTCSessionDescription,
    },
    Ice {
        call_id: CallId,
        candidate: RTCIceCandidateInit,
    },
    /// ends or rejects a call
    Hangup { call_id: CallId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub src: PeerId,
    pub dest: PeerId,
    pub message: SignalMessage,
}

#[derive(Debug)]
pub enum RelayEvent {
    Message(Envelope),
    /// the relay dropped this endpoint; it must register again
    Dropped,
}

#[derive(Clone, Default)]
pub struct Relay {
    endpoints: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<RelayEvent>>>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `id`. Fails with `IdInUse` while another live endpoint holds it.
    pub fn register(&self, id: &PeerId) -> Result<mpsc::UnboundedReceiver<RelayEvent>, SignalError> {
        let mut endpoints = self.endpoints();
        if let Some(existing) = endpoints.get(id) {
            if !existing.is_closed() {
                log::warn!("relay: {} is already registered", id);
                return Err(SignalError::IdInUse);
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        endpoints.insert(id.clone(), tx);
        log::debug!("relay: registered {}", id);
        Ok(rx)
    }

    pub fn unregister(&self, id: &PeerId) {
        if self.endpoints().remove(id).is_none() {
            log::debug!("relay: unregistered unknown endpoint {}", id);
        }
    }

    pub fn is_registered(&self, id: &PeerId) -> bool {
        self.endpoints()
            .get(id)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    pub fn send(&self, envelope: Envelope) -> Result<()> {
        let endpoints = self.endpoints();
        let tx = match endpoints.get(&envelope.dest) {
            Some(tx) => tx,
            None => bail!("peer not found: {}", envelope.dest),
        };
        let dest = envelope.dest.clone();
        if tx.send(RelayEvent::Message(envelope)).is_err() {
            bail!("peer unreachable: {}", dest);
        }
        Ok(())
    }

    /// disconnects `id` as if the broker had lost it
    pub fn drop_connection(&self, id: &PeerId) {
        match self.endpoints().remove(id) {
            Some(tx) => {
                log::info!("relay: dropping {}", id);
                let _ = tx.send(RelayEvent::Dropped);
            }
            None => log::warn!("relay: cannot drop unknown endpoint {}", id),
        }
    }

    fn endpoints(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, mpsc::UnboundedSender<RelayEvent>>> {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner())
    }
}
