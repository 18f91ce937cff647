use futures::future::OptionFuture;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Sleep;

use super::{
    CallError, CallHandle, ChannelStatus, InboundCall, PeerId, SignalError, Transport,
    TransportEvent,
};
use crate::identity::Identity;
use crate::media::{MediaBundle, MediaKind};

/// What the channel surfaces to the call machine
#[derive(Debug)]
pub enum ChannelEvent {
    Opened(PeerId),
    Failed(SignalError),
    Status(ChannelStatus),
    IncomingCall(InboundCall),
}

/// Owns the connection to the broker for one identity.
///
/// When the connection drops, a single reconnect is scheduled after
/// `reconnect_delay`. The pending reconnect lives in the channel itself, so
/// `destroy` (or dropping the channel) cancels it.
pub struct SignalingChannel {
    transport: Arc<dyn Transport>,
    identity: Identity,
    status: ChannelStatus,
    peer_id: Option<PeerId>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    reconnect: Option<Pin<Box<Sleep>>>,
    reconnect_delay: Duration,
    closed: bool,
}

impl SignalingChannel {
    pub fn new(transport: Arc<dyn Transport>, identity: Identity, reconnect_delay: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            identity,
            status: ChannelStatus::Offline,
            peer_id: None,
            events_tx,
            events_rx,
            reconnect: None,
            reconnect_delay,
            closed: false,
        }
    }

    /// starts connecting; the outcome arrives as `Opened` or `Failed`
    pub fn connect(&mut self) {
        if self.closed {
            log::warn!("connect called on a destroyed channel");
            return;
        }
        log::info!("connecting as {}", self.identity);
        self.status = ChannelStatus::Connecting;
        self.transport
            .connect(&self.identity, self.events_tx.clone());
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect.is_some()
    }

    pub fn place_call(
        &self,
        remote: &Identity,
        local: &MediaBundle,
        kind: MediaKind,
    ) -> Result<CallHandle, CallError> {
        if self.closed {
            return Err(CallError::ChannelClosed);
        }
        if self.status != ChannelStatus::Connected {
            return Err(CallError::NotConnected);
        }
        self.transport.place_call(remote, local, kind)
    }

    pub fn answer(&self, handle: &mut CallHandle, local: &MediaBundle) -> Result<(), CallError> {
        if self.closed {
            return Err(CallError::ChannelClosed);
        }
        handle.answer(local)
    }

    /// tears the connection down for good; later calls fail with `ChannelClosed`
    pub fn destroy(&mut self) {
        if self.closed {
            return;
        }
        log::info!("destroying signaling channel for {}", self.identity);
        self.closed = true;
        self.reconnect = None;
        self.peer_id = None;
        self.status = ChannelStatus::Offline;
        self.transport.destroy();
    }

    /// Waits for the next event worth reporting. Never resolves once the
    /// channel is destroyed. Cancel safe.
    pub async fn next_event(&mut self) -> ChannelEvent {
        loop {
            if self.closed {
                return std::future::pending().await;
            }
            let reconnect = &mut self.reconnect;
            let events = &mut self.events_rx;
            let event = tokio::select! {
                Some(()) = OptionFuture::from(reconnect.as_mut()) => None,
                Some(event) = events.recv() => Some(event),
            };
            let out = match event {
                None => {
                    self.reconnect = None;
                    self.fire_reconnect()
                }
                Some(event) => self.on_transport_event(event),
            };
            if let Some(out) = out {
                return out;
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) -> Option<ChannelEvent> {
        match event {
            TransportEvent::Opened(id) => {
                log::info!("signaling channel open as {}", id);
                self.reconnect = None;
                self.status = ChannelStatus::Connected;
                self.peer_id = Some(id.clone());
                Some(ChannelEvent::Opened(id))
            }
            TransportEvent::Failed(SignalError::Network) => {
                log::warn!("signaling channel failed: network");
                self.status = ChannelStatus::Disconnected;
                self.schedule_reconnect();
                Some(ChannelEvent::Failed(SignalError::Network))
            }
            TransportEvent::Failed(e) => {
                log::error!("signaling channel failed: {}", e);
                self.reconnect = None;
                self.status = ChannelStatus::Failed(e);
                Some(ChannelEvent::Failed(e))
            }
            TransportEvent::Disconnected => {
                log::warn!("signaling channel disconnected");
                self.status = ChannelStatus::Disconnected;
                self.schedule_reconnect();
                Some(ChannelEvent::Status(ChannelStatus::Disconnected))
            }
            TransportEvent::IncomingCall(call) => Some(ChannelEvent::IncomingCall(call)),
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect.is_some() {
            return;
        }
        log::debug!("reconnecting in {:?}", self.reconnect_delay);
        self.reconnect = Some(Box::pin(tokio::time::sleep(self.reconnect_delay)));
    }

    fn fire_reconnect(&mut self) -> Option<ChannelEvent> {
        if self.closed || self.status != ChannelStatus::Disconnected {
            return None;
        }
        log::info!("attempting to reconnect as {}", self.identity);
        self.status = ChannelStatus::Reconnecting;
        self.transport.reconnect();
        Some(ChannelEvent::Status(ChannelStatus::Reconnecting))
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.destroy();
    }
}
