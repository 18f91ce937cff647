#![allow(dead_code)]

use peer_call::media::{MediaBundle, MediaKind, Track};
use peer_call::signaling::{
    CallError, CallEvent, CallHandle, CallId, CallLink, InboundCall, InboundOffer, SignalError,
    Transport, TransportEvent,
};
use peer_call::{
    Client, ClientArgs, ClientEvent, Config, Identity, MemoryStorage, NullPreview, VirtualDevices,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn id(s: &str) -> Identity {
    Identity::parse(s).unwrap()
}

#[derive(Default)]
struct CallRecord {
    events: Option<mpsc::UnboundedSender<CallEvent>>,
    answered: bool,
    closes: usize,
}

#[derive(Default)]
struct Script {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    connected_as: Option<Identity>,
    refuse_with: Option<SignalError>,
    connects: usize,
    reconnects: usize,
    destroys: usize,
    unavailable: HashSet<Identity>,
    placed: Vec<(CallId, Identity, MediaKind)>,
    calls: HashMap<CallId, CallRecord>,
}

/// A transport whose broker is the test itself: connections open at once
/// (unless refused), and inbound offers, remote streams and closes are injected
/// by hand.
#[derive(Clone, Default)]
pub struct ScriptedTransport(Arc<Mutex<Script>>);

impl ScriptedTransport {
    pub fn refuse_with(&self, error: Option<SignalError>) {
        self.0.lock().unwrap().refuse_with = error;
    }

    pub fn set_unavailable(&self, peer: &str) {
        self.0.lock().unwrap().unavailable.insert(id(peer));
    }

    fn emit(&self, event: TransportEvent) {
        let script = self.0.lock().unwrap();
        script
            .events
            .as_ref()
            .expect("transport is not connected")
            .send(event)
            .unwrap();
    }

    pub fn drop_connection(&self) {
        self.emit(TransportEvent::Disconnected);
    }

    pub fn fail(&self, error: SignalError) {
        self.emit(TransportEvent::Failed(error));
    }

    /// delivers an inbound offer and returns its call id
    pub fn offer(&self, from: &str, kind: MediaKind) -> CallId {
        let call_id = CallId::new();
        let handle = self.handle(call_id, id(from));
        self.emit(TransportEvent::IncomingCall(InboundCall {
            offer: InboundOffer {
                remote: id(from),
                kind,
            },
            handle,
        }));
        call_id
    }

    pub fn remote_stream(&self, call: CallId) {
        let bundle = MediaBundle::new(vec![
            Track::new(MediaKind::Audio, "remote microphone"),
            Track::new(MediaKind::Video, "remote camera"),
        ]);
        self.call_event(call, CallEvent::RemoteStreamReceived(bundle));
    }

    pub fn remote_close(&self, call: CallId) {
        self.call_event(call, CallEvent::Closed);
    }

    pub fn remote_error(&self, call: CallId, reason: &str) {
        self.call_event(call, CallEvent::Error(reason.to_owned()));
    }

    fn call_event(&self, call: CallId, event: CallEvent) {
        let script = self.0.lock().unwrap();
        let record = script.calls.get(&call).expect("unknown call");
        record.events.as_ref().unwrap().send(event).unwrap();
    }

    pub fn placed(&self) -> Vec<(CallId, Identity, MediaKind)> {
        self.0.lock().unwrap().placed.clone()
    }

    pub fn last_placed(&self) -> CallId {
        self.placed().last().expect("no call was placed").0
    }

    pub fn answered(&self, call: CallId) -> bool {
        self.0.lock().unwrap().calls[&call].answered
    }

    pub fn closes(&self, call: CallId) -> usize {
        self.0.lock().unwrap().calls[&call].closes
    }

    pub fn connects(&self) -> usize {
        self.0.lock().unwrap().connects
    }

    pub fn reconnects(&self) -> usize {
        self.0.lock().unwrap().reconnects
    }

    pub fn destroys(&self) -> usize {
        self.0.lock().unwrap().destroys
    }

    fn handle(&self, call_id: CallId, remote: Identity) -> CallHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.lock().unwrap().calls.insert(
            call_id,
            CallRecord {
                events: Some(tx),
                ..Default::default()
            },
        );
        CallHandle::new(
            call_id,
            remote,
            Box::new(ScriptedLink {
                id: call_id,
                script: self.clone(),
            }),
            rx,
        )
    }

    fn open(&self) {
        let script = self.0.lock().unwrap();
        let event = match (script.refuse_with, &script.connected_as) {
            (Some(error), _) => TransportEvent::Failed(error),
            (None, Some(me)) => TransportEvent::Opened(me.to_string()),
            (None, None) => return,
        };
        if let Some(events) = script.events.as_ref() {
            let _ = events.send(event);
        }
    }
}

impl Transport for ScriptedTransport {
    fn connect(&self, me: &Identity, events: mpsc::UnboundedSender<TransportEvent>) {
        {
            let mut script = self.0.lock().unwrap();
            script.connects += 1;
            script.connected_as = Some(me.clone());
            script.events = Some(events);
        }
        self.open();
    }

    fn reconnect(&self) {
        self.0.lock().unwrap().reconnects += 1;
        self.open();
    }

    fn place_call(
        &self,
        remote: &Identity,
        _local: &MediaBundle,
        kind: MediaKind,
    ) -> Result<CallHandle, CallError> {
        if self.0.lock().unwrap().unavailable.contains(remote) {
            return Err(CallError::PeerUnavailable(remote.clone()));
        }
        let call_id = CallId::new();
        let handle = self.handle(call_id, remote.clone());
        self.0
            .lock()
            .unwrap()
            .placed
            .push((call_id, remote.clone(), kind));
        Ok(handle)
    }

    fn destroy(&self) {
        let mut script = self.0.lock().unwrap();
        script.destroys += 1;
        script.events = None;
    }
}

struct ScriptedLink {
    id: CallId,
    script: ScriptedTransport,
}

impl CallLink for ScriptedLink {
    fn answer(&mut self, _local: &MediaBundle) -> Result<(), CallError> {
        let mut script = self.script.0.lock().unwrap();
        if script.events.is_none() {
            return Err(CallError::NotConnected);
        }
        if let Some(record) = script.calls.get_mut(&self.id) {
            record.answered = true;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), CallError> {
        let mut script = self.script.0.lock().unwrap();
        if let Some(record) = script.calls.get_mut(&self.id) {
            record.closes += 1;
        }
        Ok(())
    }
}

/// A running client wired to scripted collaborators.
pub struct Harness {
    pub client: Client,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    pub transport: ScriptedTransport,
    pub devices: VirtualDevices,
    pub storage: MemoryStorage,
}

impl Harness {
    pub fn start(config: Config) -> Self {
        Self::start_with(config, MemoryStorage::new(), VirtualDevices::new())
    }

    pub fn start_with(config: Config, storage: MemoryStorage, devices: VirtualDevices) -> Self {
        let transport = ScriptedTransport::default();
        let (client, events) = Client::start(ClientArgs {
            config,
            transport: Arc::new(transport.clone()),
            devices: Arc::new(devices.clone()),
            preview: Box::new(NullPreview),
            storage: Box::new(storage.clone()),
        });
        Self {
            client,
            events,
            transport,
            devices,
            storage,
        }
    }

    /// logs in and waits until the channel is open and media is held
    pub async fn login(config: Config, me: &str) -> Self {
        let mut harness = Self::start(config);
        harness.client.login(me).await.unwrap();
        harness
            .until(|e| matches!(e, ClientEvent::MediaState { audio: true, .. }).then_some(()))
            .await;
        harness
    }

    /// the next event `f` picks, skipping everything before it
    pub async fn until<T>(&mut self, mut f: impl FnMut(&ClientEvent) -> Option<T>) -> T {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(120), self.events.recv())
                .await
                .expect("timed out waiting for an event")
                .expect("client event stream closed");
            if let Some(found) = f(&event) {
                return found;
            }
        }
    }

    /// every event emitted so far
    pub fn drain(&mut self) -> Vec<ClientEvent> {
        let mut drained = vec![];
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}
