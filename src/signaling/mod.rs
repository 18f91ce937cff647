//! The boundary to the brokering service.
//!
//! A [`Transport`] registers an identity with the broker, carries call setup
//! messages and exchanges media with the far side. It reports what happens
//! through a [`TransportEvent`] channel handed to it by the
//! [`SignalingChannel`], which owns the connection lifecycle on top of it.
//!
//! Every call, outgoing or inbound, is represented by a [`CallHandle`]: the
//! transport-specific [`CallLink`] plus a private stream of [`CallEvent`]s.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::identity::Identity;
use crate::media::{MediaBundle, MediaKind};

mod channel;
pub mod relay;
pub mod rtc;

pub use channel::{ChannelEvent, SignalingChannel};

/// the id assigned by the broker
pub type PeerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("This email is already in use. Please use a different email.")]
    IdInUse,
    #[error("Network error. Please check your connection.")]
    Network,
    #[error("Connection error")]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("not connected to the signaling service")]
    NotConnected,
    #[error("the signaling channel has been closed")]
    ChannelClosed,
    #[error("The peer you're trying to reach is unavailable: {0}")]
    PeerUnavailable(Identity),
    #[error("call negotiation failed: {0}")]
    Negotiation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ChannelStatus {
    /// no channel (logged out or torn down)
    #[display(fmt = "offline")]
    Offline,
    #[display(fmt = "connecting")]
    Connecting,
    #[display(fmt = "connected")]
    Connected,
    #[display(fmt = "disconnected")]
    Disconnected,
    #[display(fmt = "reconnecting")]
    Reconnecting,
    #[display(fmt = "failed ({})", _0)]
    Failed(SignalError),
}

/// what the caller declared when placing the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundOffer {
    pub remote: Identity,
    pub kind: MediaKind,
}

/// Emitted by a `CallHandle`
#[derive(Debug)]
pub enum CallEvent {
    RemoteStreamReceived(MediaBundle),
    Closed,
    Error(String),
}

/// The transport side of a single call.
pub trait CallLink: Send {
    /// accepts an inbound offer, publishing `local` to the caller
    fn answer(&mut self, local: &MediaBundle) -> Result<(), CallError>;
    /// ends the call; calling it again is harmless
    fn close(&mut self) -> Result<(), CallError>;
}

/// A negotiated (or negotiating) call and its private event stream.
pub struct CallHandle {
    id: CallId,
    remote: Identity,
    link: Box<dyn CallLink>,
    events: mpsc::UnboundedReceiver<CallEvent>,
}

impl CallHandle {
    pub fn new(
        id: CallId,
        remote: Identity,
        link: Box<dyn CallLink>,
        events: mpsc::UnboundedReceiver<CallEvent>,
    ) -> Self {
        Self {
            id,
            remote,
            link,
            events,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn remote(&self) -> &Identity {
        &self.remote
    }

    /// `None` once the transport has dropped its end of the stream
    pub async fn next_event(&mut self) -> Option<CallEvent> {
        self.events.recv().await
    }

    pub fn answer(&mut self, local: &MediaBundle) -> Result<(), CallError> {
        self.link.answer(local)
    }

    pub fn close(&mut self) -> Result<(), CallError> {
        self.link.close()
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

/// An inbound offer together with the handle used to answer or reject it.
#[derive(Debug)]
pub struct InboundCall {
    pub offer: InboundOffer,
    pub handle: CallHandle,
}

/// Reported by a `Transport` to its channel
#[derive(Debug)]
pub enum TransportEvent {
    /// registered with the broker (also sent after a successful reconnect)
    Opened(PeerId),
    Failed(SignalError),
    /// the broker connection dropped
    Disconnected,
    IncomingCall(InboundCall),
}

/// A brokered peer-connection service.
///
/// `connect` and `reconnect` complete asynchronously through the events
/// sender. `place_call` fails synchronously when no call can be started.
pub trait Transport: Send + Sync {
    fn connect(&self, id: &Identity, events: mpsc::UnboundedSender<TransportEvent>);
    fn reconnect(&self);
    fn place_call(
        &self,
        remote: &Identity,
        local: &MediaBundle,
        kind: MediaKind,
    ) -> Result<CallHandle, CallError>;
    fn destroy(&self);
}
