//! `RtcTransport` negotiates every call as a webrtc-rs `RTCPeerConnection`.
//!
//! Setup messages (offer, answer, trickled ICE, hangup) travel through a
//! [`Relay`]. Each local track is published as an RTP track (Opus for audio,
//! VP8 for video); writing samples into those tracks is the capture layer's
//! job. The remote side's bundle is built from the track list it advertised in
//! its offer or answer and is reported once the peer connection is up.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use super::relay::{Envelope, OfferMetadata, Relay, RelayEvent, SignalMessage};
use super::{
    CallError, CallEvent, CallHandle, CallId, CallLink, InboundCall, InboundOffer, PeerId,
    Transport, TransportEvent,
};
use crate::identity::Identity;
use crate::media::{MediaBundle, MediaKind, Track};

pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.services.mozilla.com:3478",
    "stun:stun.l.google.com:19302",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    /// waiting for the remote description
    WaitingForSdp,
    /// remote description set, connectivity checks running
    WaitingForIce,
    Connected,
    Disconnected,
}

struct Negotiation {
    state: PeerState,
    connection: Option<Arc<RTCPeerConnection>>,
    /// the caller's offer, kept until the callee answers
    remote_offer: Option<RTCSessionDescription>,
    /// candidates that arrived before the remote description was set
    pending_ice: Vec<RTCIceCandidateInit>,
    remote_tracks: Vec<Track>,
    delivered: bool,
}

struct RtcCall {
    id: CallId,
    /// the relay endpoint of the other side
    remote: PeerId,
    events: mpsc::UnboundedSender<CallEvent>,
    negotiation: Mutex<Negotiation>,
}

impl RtcCall {
    fn new(
        id: CallId,
        remote: PeerId,
        events: mpsc::UnboundedSender<CallEvent>,
        remote_offer: Option<RTCSessionDescription>,
        remote_tracks: Vec<Track>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote,
            events,
            negotiation: Mutex::new(Negotiation {
                state: PeerState::WaitingForSdp,
                connection: None,
                remote_offer,
                pending_ice: vec![],
                remote_tracks,
                delivered: false,
            }),
        })
    }

    fn negotiation(&self) -> MutexGuard<'_, Negotiation> {
        self.negotiation.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: CallEvent) {
        if self.events.send(event).is_err() {
            log::debug!("call {} has no listener", self.id);
        }
    }

    fn fail(&self, err: anyhow::Error) {
        log::error!("call {} failed: {}", self.id, err);
        self.negotiation().state = PeerState::Disconnected;
        self.emit(CallEvent::Error(err.to_string()));
    }

    fn on_connection_state(&self, state: RTCPeerConnectionState) {
        match state {
            RTCPeerConnectionState::Connected => {
                let tracks = {
                    let mut n = self.negotiation();
                    n.state = PeerState::Connected;
                    if n.delivered {
                        return;
                    }
                    n.delivered = true;
                    n.remote_tracks.clone()
                };
                self.emit(CallEvent::RemoteStreamReceived(MediaBundle::new(tracks)));
            }
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                let mut n = self.negotiation();
                if n.state == PeerState::Disconnected {
                    return;
                }
                n.state = PeerState::Disconnected;
                drop(n);
                self.emit(CallEvent::Closed);
            }
            _ => {}
        }
    }

    /// sets the remote description, then flushes any buffered candidates
    async fn set_remote(
        &self,
        connection: &RTCPeerConnection,
        sdp: RTCSessionDescription,
    ) -> Result<()> {
        connection.set_remote_description(sdp).await?;
        let pending = {
            let mut n = self.negotiation();
            if n.state == PeerState::WaitingForSdp {
                n.state = PeerState::WaitingForIce;
            }
            std::mem::take(&mut n.pending_ice)
        };
        for candidate in pending {
            connection.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}

struct Endpoint {
    id: Option<PeerId>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    pump: Option<JoinHandle<()>>,
    open: bool,
}

struct Shared {
    api: webrtc::api::API,
    relay: Relay,
    ice_servers: Vec<String>,
    endpoint: Mutex<Endpoint>,
    calls: Mutex<HashMap<CallId, Arc<RtcCall>>>,
}

/// A `Transport` that carries media over webrtc-rs and signals through a `Relay`.
pub struct RtcTransport {
    shared: Arc<Shared>,
}

impl RtcTransport {
    pub fn new(relay: Relay, ice_servers: Vec<String>) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                api: create_api()?,
                relay,
                ice_servers,
                endpoint: Mutex::new(Endpoint {
                    id: None,
                    events: None,
                    pump: None,
                    open: false,
                }),
                calls: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl Transport for RtcTransport {
    fn connect(&self, id: &Identity, events: mpsc::UnboundedSender<TransportEvent>) {
        {
            let mut endpoint = self.shared.endpoint();
            endpoint.id = Some(id.to_string());
            endpoint.events = Some(events);
        }
        Shared::open(&self.shared);
    }

    fn reconnect(&self) {
        Shared::open(&self.shared);
    }

    fn place_call(
        &self,
        remote: &Identity,
        local: &MediaBundle,
        kind: MediaKind,
    ) -> Result<CallHandle, CallError> {
        let me = match self.shared.own_id() {
            Some(me) => me,
            None => return Err(CallError::NotConnected),
        };
        let dest: PeerId = remote.to_string();
        if !self.shared.relay.is_registered(&dest) {
            return Err(CallError::PeerUnavailable(remote.clone()));
        }
        let caller = Identity::parse(&me).map_err(|e| CallError::Negotiation(e.to_string()))?;

        let id = CallId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let call = RtcCall::new(id, dest, tx, None, vec![]);
        self.shared.calls().insert(id, call.clone());

        let shared = self.shared.clone();
        let tracks = local.tracks().to_vec();
        let metadata = OfferMetadata {
            kind,
            caller: Some(caller),
        };
        let link_call = call.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.dial(&call, me, metadata, tracks).await {
                call.fail(e);
            }
        });

        Ok(CallHandle::new(
            id,
            remote.clone(),
            Box::new(RtcLink {
                shared: self.shared.clone(),
                call: link_call,
                closed: false,
            }),
            rx,
        ))
    }

    fn destroy(&self) {
        let id = {
            let mut endpoint = self.shared.endpoint();
            if let Some(pump) = endpoint.pump.take() {
                pump.abort();
            }
            endpoint.open = false;
            endpoint.events = None;
            endpoint.id.take()
        };
        let calls: Vec<_> = self.shared.calls().drain().map(|(_, c)| c).collect();
        if let Some(id) = id {
            for call in calls {
                self.shared.hang_up(&call, &id);
            }
            self.shared.relay.unregister(&id);
        }
    }
}

impl Shared {
    fn endpoint(&self) -> MutexGuard<'_, Endpoint> {
        self.endpoint.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<CallId, Arc<RtcCall>>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn call(&self, id: &CallId) -> Option<Arc<RtcCall>> {
        self.calls().get(id).cloned()
    }

    fn own_id(&self) -> Option<PeerId> {
        let endpoint = self.endpoint();
        if endpoint.open {
            endpoint.id.clone()
        } else {
            None
        }
    }

    /// registers with the relay and starts pumping its messages
    fn open(shared: &Arc<Shared>) {
        let mut endpoint = shared.endpoint();
        let (id, events) = match (endpoint.id.clone(), endpoint.events.clone()) {
            (Some(id), Some(events)) => (id, events),
            _ => {
                log::warn!("cannot open an endpoint that was never connected");
                return;
            }
        };
        if endpoint.open {
            log::debug!("{} is already open", id);
            return;
        }
        match shared.relay.register(&id) {
            Ok(mut rx) => {
                endpoint.open = true;
                let _ = events.send(TransportEvent::Opened(id.clone()));
                let weak = Arc::downgrade(shared);
                endpoint.pump = Some(tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        let shared = match weak.upgrade() {
                            Some(shared) => shared,
                            None => return,
                        };
                        match event {
                            RelayEvent::Message(envelope) => shared.dispatch(envelope),
                            RelayEvent::Dropped => {
                                shared.endpoint().open = false;
                                let _ = events.send(TransportEvent::Disconnected);
                                return;
                            }
                        }
                    }
                }));
            }
            Err(e) => {
                let _ = events.send(TransportEvent::Failed(e));
            }
        }
    }

    fn dispatch(self: Arc<Self>, envelope: Envelope) {
        let Envelope { src, message, .. } = envelope;
        match message {
            SignalMessage::Offer {
                call_id,
                metadata,
                tracks,
                sdp,
            } => self.on_offer(src, call_id, metadata, tracks, sdp),
            SignalMessage::Answer {
                call_id,
                tracks,
                sdp,
            } => {
                let call = match self.call(&call_id) {
                    Some(call) => call,
                    None => {
                        log::warn!("answer for unknown call {}", call_id);
                        return;
                    }
                };
                let connection = {
                    let mut n = call.negotiation();
                    n.remote_tracks = tracks;
                    n.connection.clone()
                };
                let connection = match connection {
                    Some(c) => c,
                    None => {
                        call.fail(anyhow::anyhow!("answer arrived before the offer was sent"));
                        return;
                    }
                };
                tokio::spawn(async move {
                    if let Err(e) = call.set_remote(&connection, sdp).await {
                        call.fail(e);
                    }
                });
            }
            SignalMessage::Ice { call_id, candidate } => {
                let call = match self.call(&call_id) {
                    Some(call) => call,
                    None => {
                        log::debug!("ICE candidate for unknown call {}", call_id);
                        return;
                    }
                };
                let connection = {
                    let mut n = call.negotiation();
                    let ready = matches!(n.state, PeerState::WaitingForIce | PeerState::Connected);
                    match n.connection.clone() {
                        Some(c) if ready => c,
                        _ => {
                            n.pending_ice.push(candidate);
                            return;
                        }
                    }
                };
                tokio::spawn(async move {
                    if let Err(e) = connection.add_ice_candidate(candidate).await {
                        log::error!("failed to add ICE candidate: {}", e);
                    }
                });
            }
            SignalMessage::Hangup { call_id } => {
                let call = match self.calls().remove(&call_id) {
                    Some(call) => call,
                    None => return,
                };
                log::info!("{} hung up call {}", src, call_id);
                let connection = {
                    let mut n = call.negotiation();
                    n.state = PeerState::Disconnected;
                    n.connection.take()
                };
                call.emit(CallEvent::Closed);
                close_connection(connection);
            }
        }
    }

    fn on_offer(
        self: Arc<Self>,
        src: PeerId,
        call_id: CallId,
        metadata: OfferMetadata,
        tracks: Vec<Track>,
        sdp: RTCSessionDescription,
    ) {
        let events = match self.endpoint().events.clone() {
            Some(events) => events,
            None => return,
        };
        let caller = match metadata.caller.or_else(|| Identity::parse(&src).ok()) {
            Some(caller) => caller,
            None => {
                log::warn!("dropping offer {} from unidentifiable peer {}", call_id, src);
                return;
            }
        };
        log::info!("{} offered a {} call", caller, metadata.kind);
        let (tx, rx) = mpsc::unbounded_channel();
        let call = RtcCall::new(call_id, src, tx, Some(sdp), tracks);
        self.calls().insert(call_id, call.clone());

        let handle = CallHandle::new(
            call_id,
            caller.clone(),
            Box::new(RtcLink {
                shared: self.clone(),
                call,
                closed: false,
            }),
            rx,
        );
        let inbound = InboundCall {
            offer: InboundOffer {
                remote: caller,
                kind: metadata.kind,
            },
            handle,
        };
        if events.send(TransportEvent::IncomingCall(inbound)).is_err() {
            log::warn!("dropping offer {}: nobody is listening", call_id);
        }
    }

    /// creates the connection, publishes the local tracks and sends the offer
    async fn dial(
        &self,
        call: &Arc<RtcCall>,
        me: PeerId,
        metadata: OfferMetadata,
        tracks: Vec<Track>,
    ) -> Result<()> {
        let connection = self.connect(call, &me, &tracks).await?;
        let offer = connection.create_offer(None).await?;
        // Note: this starts the gathering of ICE candidates
        connection.set_local_description(offer.clone()).await?;
        self.relay.send(Envelope {
            src: me,
            dest: call.remote.clone(),
            message: SignalMessage::Offer {
                call_id: call.id,
                metadata,
                tracks,
                sdp: offer,
            },
        })
    }

    /// applies the stored offer and replies with an answer
    async fn accept(&self, call: &Arc<RtcCall>, tracks: Vec<Track>) -> Result<()> {
        let me = match self.own_id() {
            Some(me) => me,
            None => bail!("not connected"),
        };
        let offer = match call.negotiation().remote_offer.take() {
            Some(offer) => offer,
            None => bail!("call {} was already answered", call.id),
        };
        let connection = self.connect(call, &me, &tracks).await?;
        call.set_remote(&connection, offer).await?;
        let answer = connection.create_answer(None).await?;
        connection.set_local_description(answer.clone()).await?;
        self.relay.send(Envelope {
            src: me,
            dest: call.remote.clone(),
            message: SignalMessage::Answer {
                call_id: call.id,
                tracks,
                sdp: answer,
            },
        })
    }

    /// builds the peer connection for `call` and wires its callbacks
    async fn connect(
        &self,
        call: &Arc<RtcCall>,
        me: &PeerId,
        tracks: &[Track],
    ) -> Result<Arc<RTCPeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let connection = Arc::new(self.api.new_peer_connection(config).await?);

        let stream_id = format!("{}-{}", me, call.id);
        for track in tracks {
            let local: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticRTP::new(
                codec_for(track.kind),
                track.id.clone(),
                stream_id.clone(),
            ));
            connection.add_track(local).await?;
        }

        // send discovered candidates (for self) to the remote peer
        let relay = self.relay.clone();
        let src = me.clone();
        let dest = call.remote.clone();
        let call_id = call.id;
        connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let relay = relay.clone();
            let src = src.clone();
            let dest = dest.clone();
            Box::pin(async move {
                let candidate = match c {
                    Some(c) => c,
                    None => return,
                };
                let candidate = match candidate.to_json() {
                    Ok(candidate) => candidate,
                    Err(e) => {
                        log::error!("failed to serialize ICE candidate: {}", e);
                        return;
                    }
                };
                if let Err(e) = relay.send(Envelope {
                    src,
                    dest: dest.clone(),
                    message: SignalMessage::Ice { call_id, candidate },
                }) {
                    log::error!("failed to send ice candidate to peer {}: {}", &dest, e);
                }
            })
        }));

        let weak: Weak<RtcCall> = Arc::downgrade(call);
        connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                log::info!("connection state for call {} has changed {}", call_id, state);
                if let Some(call) = weak.upgrade() {
                    call.on_connection_state(state);
                }
                Box::pin(async {})
            },
        ));

        call.negotiation().connection = Some(connection.clone());
        Ok(connection)
    }

    /// tells the remote side and closes the connection; errors are only logged
    fn hang_up(&self, call: &RtcCall, me: &PeerId) {
        let connection = {
            let mut n = call.negotiation();
            n.state = PeerState::Disconnected;
            n.connection.take()
        };
        if let Err(e) = self.relay.send(Envelope {
            src: me.clone(),
            dest: call.remote.clone(),
            message: SignalMessage::Hangup { call_id: call.id },
        }) {
            log::warn!("failed to send hangup for call {}: {}", call.id, e);
        }
        close_connection(connection);
    }
}

struct RtcLink {
    shared: Arc<Shared>,
    call: Arc<RtcCall>,
    closed: bool,
}

impl CallLink for RtcLink {
    fn answer(&mut self, local: &MediaBundle) -> Result<(), CallError> {
        if self.closed || self.shared.call(&self.call.id).is_none() {
            return Err(CallError::Negotiation("the call is no longer offered".into()));
        }
        if self.shared.own_id().is_none() {
            return Err(CallError::NotConnected);
        }
        let shared = self.shared.clone();
        let call = self.call.clone();
        let tracks = local.tracks().to_vec();
        tokio::spawn(async move {
            if let Err(e) = shared.accept(&call, tracks).await {
                call.fail(e);
            }
        });
        Ok(())
    }

    fn close(&mut self) -> Result<(), CallError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.shared.calls().remove(&self.call.id);
        let me = self.shared.endpoint().id.clone();
        match me {
            Some(me) => {
                self.shared.hang_up(&self.call, &me);
                Ok(())
            }
            None => {
                let connection = self.call.negotiation().connection.take();
                close_connection(connection);
                Err(CallError::ChannelClosed)
            }
        }
    }
}

fn close_connection(connection: Option<Arc<RTCPeerConnection>>) {
    if let Some(connection) = connection {
        tokio::spawn(async move {
            if let Err(e) = connection.close().await {
                log::warn!("failed to close peer connection: {}", e);
            }
        });
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn create_api() -> Result<webrtc::api::API> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;

    // Create a InterceptorRegistry. This is the user configurable RTP/RTCP Pipeline.
    // This provides NACKs, RTCP Reports and other features.
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}
