use futures::future::OptionFuture;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

use super::{CallSession, CallState, ClientEvent, EndReason, Notice, Snapshot};
use crate::client::ClientArgs;
use crate::config::Config;
use crate::error::{ClientError, ValidationError};
use crate::identity::{Identity, IdentityStore};
use crate::media::{MediaBundle, MediaController, MediaError, MediaKind};
use crate::signaling::{
    CallError, CallEvent, CallId, ChannelEvent, ChannelStatus, InboundCall, SignalError,
    SignalingChannel, Transport,
};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

/// Sent by `Client`; each command carries the sender for its reply
pub(crate) enum Command {
    Login { raw: String, reply: Reply<Identity> },
    Logout { reply: Reply<()> },
    Call {
        raw: String,
        kind: MediaKind,
        reply: Reply<()>,
    },
    Accept { reply: Reply<()> },
    Reject { reply: Reply<()> },
    HangUp { reply: Reply<()> },
    ToggleAudio { reply: Reply<bool> },
    ToggleVideo { reply: Reply<bool> },
    Snapshot { reply: oneshot::Sender<Snapshot> },
    Contacts { reply: oneshot::Sender<Vec<Identity>> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// what to do with the local bundle once it arrives
enum Purpose {
    Preview,
    Dial { remote: Identity, kind: MediaKind },
    Accept { call: CallId },
}

struct Acquisition {
    purpose: Purpose,
    task: JoinHandle<Result<MediaBundle, MediaError>>,
}

enum Input {
    Command(Command),
    /// every `Client` is gone
    Detached,
    Channel(ChannelEvent),
    Call(CallEvent),
    Expired,
    Tick(Instant),
    Acquired(Result<Result<MediaBundle, MediaError>, JoinError>),
}

/// Owns the call session and applies every transition, one input at a time.
///
/// User commands, channel events, the current call's events, timers and media
/// completions are all multiplexed in `next_input`; nothing else touches the
/// session, so no transition ever runs concurrently with another. Completions
/// of asynchronous work are re-validated against the current state before they
/// are applied.
pub(crate) struct CallMachine {
    config: Config,
    transport: Arc<dyn Transport>,
    store: IdentityStore,
    media: MediaController,
    identity: Option<Identity>,
    channel: Option<SignalingChannel>,
    session: Option<CallSession>,
    /// inbound ring timeout
    expiry: Option<Pin<Box<Sleep>>>,
    /// elapsed-time ticker of the active call
    ticker: Option<Interval>,
    acquisition: Option<Acquisition>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl CallMachine {
    pub(crate) fn new(
        args: ClientArgs,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        let ClientArgs {
            config,
            transport,
            devices,
            preview,
            storage,
        } = args;
        Self {
            store: IdentityStore::new(storage, config.history_limit),
            media: MediaController::new(devices, preview),
            config,
            transport,
            identity: None,
            channel: None,
            session: None,
            expiry: None,
            ticker: None,
            acquisition: None,
            commands,
            events,
        }
    }

    pub(crate) async fn run(mut self) {
        if self.config.auto_login {
            if let Some(id) = self.store.load() {
                log::info!("logging in with saved identity {}", id);
                self.login(id);
            }
        }
        loop {
            let input = self.next_input().await;
            if !self.on_input(input) {
                break;
            }
        }
        log::debug!("call machine stopped");
    }

    async fn next_input(&mut self) -> Input {
        let channel = OptionFuture::from(self.channel.as_mut().map(|c| c.next_event()));
        let call = OptionFuture::from(
            self.session
                .as_mut()
                .and_then(|s| s.handle.as_mut())
                .map(|h| h.next_event()),
        );
        let expiry = OptionFuture::from(self.expiry.as_mut());
        let tick = OptionFuture::from(self.ticker.as_mut().map(|t| t.tick()));
        let acquired = OptionFuture::from(self.acquisition.as_mut().map(|a| &mut a.task));

        tokio::select! {
            cmd = self.commands.recv() => match cmd {
                Some(cmd) => Input::Command(cmd),
                None => Input::Detached,
            },
            Some(event) = channel => Input::Channel(event),
            // the transport dropping its end counts as a close
            Some(event) = call => Input::Call(event.unwrap_or(CallEvent::Closed)),
            Some(()) = expiry => Input::Expired,
            Some(at) = tick => Input::Tick(at),
            Some(result) = acquired => Input::Acquired(result),
        }
    }

    /// returns false when the machine should stop
    fn on_input(&mut self, input: Input) -> bool {
        match input {
            Input::Command(cmd) => return self.on_command(cmd),
            Input::Detached => {
                log::info!("client dropped; shutting down");
                self.shutdown();
                return false;
            }
            Input::Channel(event) => self.on_channel_event(event),
            Input::Call(event) => self.on_call_event(event),
            Input::Expired => self.on_expired(),
            Input::Tick(at) => self.on_tick(at),
            Input::Acquired(result) => self.on_acquired(result),
        }
        true
    }

    fn on_command(&mut self, cmd: Command) -> bool {
        // a dropped reply only means the caller stopped waiting
        match cmd {
            Command::Login { raw, reply } => {
                let _ = reply.send(self.cmd_login(&raw));
            }
            Command::Logout { reply } => {
                let _ = reply.send(self.cmd_logout());
            }
            Command::Call { raw, kind, reply } => {
                let _ = reply.send(self.cmd_call(&raw, kind));
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.cmd_accept());
            }
            Command::Reject { reply } => {
                let _ = reply.send(self.cmd_reject());
            }
            Command::HangUp { reply } => {
                self.hang_up();
                let _ = reply.send(Ok(()));
            }
            Command::ToggleAudio { reply } => {
                let _ = reply.send(self.toggle(MediaKind::Audio));
            }
            Command::ToggleVideo { reply } => {
                let _ = reply.send(self.toggle(MediaKind::Video));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Contacts { reply } => {
                let _ = reply.send(self.store.list_contacts());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn cmd_login(&mut self, raw: &str) -> Result<Identity, ClientError> {
        if let Some(id) = &self.identity {
            return Err(ClientError::AlreadyLoggedIn(id.clone()));
        }
        let id = Identity::parse(raw)?;
        self.login(id.clone());
        Ok(id)
    }

    fn login(&mut self, id: Identity) {
        log::info!("logging in as {}", id);
        self.store.save(&id);
        let mut channel = SignalingChannel::new(
            self.transport.clone(),
            id.clone(),
            self.config.reconnect_delay(),
        );
        channel.connect();
        self.channel = Some(channel);
        self.identity = Some(id.clone());
        self.emit(ClientEvent::LoggedIn(id));
        self.emit(ClientEvent::Channel(ChannelStatus::Connecting));
        self.emit(ClientEvent::ContactsChanged(self.store.list_contacts()));
        self.emit_state();
    }

    fn cmd_logout(&mut self) -> Result<(), ClientError> {
        if self.identity.is_none() {
            return Err(ClientError::NotLoggedIn);
        }
        self.teardown();
        self.store.clear();
        Ok(())
    }

    /// ends any call, closes the channel and releases local media
    fn teardown(&mut self) {
        if self.session.is_some() {
            self.end_call(EndReason::HungUp);
        }
        if let Some(acquisition) = self.acquisition.take() {
            log::debug!("abandoning pending media request");
            acquisition.task.abort();
        }
        if let Some(mut channel) = self.channel.take() {
            channel.destroy();
        }
        self.media.release();
        if let Some(id) = self.identity.take() {
            log::info!("logged out {}", id);
        }
        self.emit_media_state();
        self.emit(ClientEvent::Channel(ChannelStatus::Offline));
        self.emit(ClientEvent::LoggedOut);
        self.emit_state();
    }

    fn shutdown(&mut self) {
        if self.identity.is_some() {
            self.teardown();
        }
    }

    fn cmd_call(&mut self, raw: &str, kind: MediaKind) -> Result<(), ClientError> {
        let me = self.identity.clone().ok_or(ClientError::NotLoggedIn)?;
        if let Some(session) = &self.session {
            return Err(ClientError::CallInProgress(session.remote.clone()));
        }
        if let Some(pending) = self.pending_dial() {
            return Err(ClientError::CallInProgress(pending.clone()));
        }
        let remote = Identity::parse(raw)?;
        if remote == me {
            return Err(ValidationError::SelfCall.into());
        }
        if self.media.bundle().is_some() {
            self.dial(remote, kind);
        } else {
            log::info!("acquiring media before calling {}", remote);
            self.request_media(Purpose::Dial { remote, kind });
        }
        Ok(())
    }

    fn dial(&mut self, remote: Identity, kind: MediaKind) {
        let result = match (&self.channel, self.media.bundle()) {
            (Some(channel), Some(bundle)) => channel.place_call(&remote, bundle, kind),
            (None, _) => Err(CallError::ChannelClosed),
            (Some(_), None) => {
                self.notify(Notice::MediaUnavailable(MediaError::Unknown));
                return;
            }
        };
        match result {
            Ok(handle) => {
                log::debug!("dialing {} ({})", remote, kind);
                self.session = Some(CallSession::outgoing(handle, kind));
                self.record_contact(&remote);
                self.emit_state();
            }
            Err(e) => {
                log::warn!("failed to call {}: {}", remote, e);
                self.notify_call_error(e);
            }
        }
    }

    fn cmd_accept(&mut self) -> Result<(), ClientError> {
        let call = match &self.session {
            Some(s) if s.state == CallState::RingingInbound => s.call_id(),
            _ => None,
        };
        let call = call.ok_or(ClientError::NoIncomingCall)?;
        if self.media.bundle().is_some() {
            self.answer();
        } else {
            log::info!("acquiring media before answering");
            // accepted; only a failed acquisition or the caller can end it now
            self.expiry = None;
            self.request_media(Purpose::Accept { call });
        }
        Ok(())
    }

    fn answer(&mut self) {
        let result = match (self.session.as_mut(), &self.channel, self.media.bundle()) {
            (Some(session), Some(channel), Some(bundle)) => match session.handle.as_mut() {
                Some(handle) => channel.answer(handle, bundle),
                None => Err(CallError::ChannelClosed),
            },
            (_, None, _) => Err(CallError::ChannelClosed),
            _ => return,
        };
        match result {
            Ok(()) => {
                self.expiry = None;
                let remote = match self.session.as_mut() {
                    Some(session) => {
                        session.state = CallState::Connecting;
                        session.remote.clone()
                    }
                    None => return,
                };
                log::debug!("answered call from {}", remote);
                self.record_contact(&remote);
                self.emit_state();
            }
            Err(e) => {
                log::warn!("failed to answer call: {}", e);
                self.end_call(EndReason::Failed);
                self.notify_call_error(e);
            }
        }
    }

    fn cmd_reject(&mut self) -> Result<(), ClientError> {
        match &self.session {
            Some(s) if s.state == CallState::RingingInbound => {}
            _ => return Err(ClientError::NoIncomingCall),
        }
        self.end_call(EndReason::Rejected);
        Ok(())
    }

    fn hang_up(&mut self) {
        match self.session.as_ref().map(|s| s.state) {
            None => {
                if let Some(acquisition) = self.acquisition.as_mut() {
                    if matches!(acquisition.purpose, Purpose::Dial { .. }) {
                        log::debug!("cancelling call waiting for media");
                        acquisition.purpose = Purpose::Preview;
                    }
                }
            }
            Some(CallState::RingingInbound) => self.end_call(EndReason::Rejected),
            Some(_) => self.end_call(EndReason::HungUp),
        }
    }

    fn toggle(&mut self, kind: MediaKind) -> Result<bool, ClientError> {
        if self.identity.is_none() {
            return Err(ClientError::NotLoggedIn);
        }
        let enabled = match kind {
            MediaKind::Audio => {
                let want = !self.media.current_audio_enabled();
                self.media.set_audio_enabled(want)
            }
            MediaKind::Video => {
                let want = !self.media.current_video_enabled();
                self.media.set_video_enabled(want)
            }
        };
        log::debug!("{} is now {}", kind, if enabled { "on" } else { "off" });
        self.emit_media_state();
        Ok(enabled)
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened(id) => {
                log::info!("connected to the signaling service as {}", id);
                self.emit(ClientEvent::Channel(ChannelStatus::Connected));
                self.emit_state();
                if self.config.acquire_on_connect && self.media.bundle().is_none() {
                    self.request_media(Purpose::Preview);
                }
            }
            ChannelEvent::Failed(SignalError::IdInUse) => {
                log::error!("identity is already in use; logging out");
                self.notify(Notice::Signal(SignalError::IdInUse));
                self.teardown();
                self.store.clear();
            }
            ChannelEvent::Failed(e) => {
                self.emit(ClientEvent::Channel(self.channel_status()));
                self.notify(Notice::Signal(e));
                self.emit_state();
            }
            ChannelEvent::Status(status) => {
                self.emit(ClientEvent::Channel(status));
                self.emit_state();
            }
            ChannelEvent::IncomingCall(call) => self.on_incoming(call),
        }
    }

    fn on_incoming(&mut self, mut call: InboundCall) {
        let from = call.offer.remote.clone();
        if let Some(session) = &self.session {
            log::info!("busy with {}; rejecting call from {}", session.remote, from);
            if let Err(e) = call.handle.close() {
                log::warn!("failed to reject call from {}: {}", from, e);
            }
            self.notify(Notice::AutoRejected { from });
            return;
        }
        let kind = call.offer.kind;
        log::debug!("incoming {} call from {}", kind, from);
        self.session = Some(CallSession::incoming(call));
        self.expiry = Some(Box::pin(tokio::time::sleep(self.config.ring_timeout())));
        self.emit(ClientEvent::IncomingCall { from, kind });
        self.emit_state();
    }

    fn on_call_event(&mut self, event: CallEvent) {
        let state = match &self.session {
            Some(s) => s.state,
            None => return,
        };
        match event {
            CallEvent::RemoteStreamReceived(bundle) => match state {
                CallState::Dialing | CallState::Connecting => self.activate(bundle),
                _ => log::debug!("ignoring remote stream while {}", state),
            },
            CallEvent::Closed if state == CallState::RingingInbound && !self.accepting() => {
                log::info!("caller cancelled before the call was answered");
                self.miss();
            }
            CallEvent::Closed => {
                log::info!("call closed by the remote side");
                self.end_call(EndReason::RemoteClosed);
            }
            CallEvent::Error(reason) => {
                log::error!("call failed: {}", reason);
                self.end_call(EndReason::Failed);
                self.notify(Notice::CallFailed(CallError::Negotiation(reason)));
            }
        }
    }

    fn activate(&mut self, remote: MediaBundle) {
        let now = Instant::now();
        let period = self.config.tick_interval();
        let tracks = remote.tracks().to_vec();
        match self.session.as_mut() {
            Some(session) => {
                log::debug!("call with {} is active", session.remote);
                session.state = CallState::Active;
                session.started_at = Some(now);
                session.remote_media = Some(remote);
            }
            None => return,
        }
        let mut ticker = tokio::time::interval_at(now + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
        self.emit(ClientEvent::RemoteMediaAttached(tracks));
        self.emit_state();
        self.emit(ClientEvent::Elapsed(Duration::ZERO));
    }

    fn on_expired(&mut self) {
        self.expiry = None;
        let ringing = matches!(&self.session, Some(s) if s.state == CallState::RingingInbound);
        if ringing {
            log::info!("inbound call was not answered in time");
            self.miss();
        } else {
            log::debug!("ring timeout fired with no ringing call");
        }
    }

    fn on_tick(&mut self, at: Instant) {
        let elapsed = match &self.session {
            Some(s) if s.state == CallState::Active => Some(s.elapsed(at)),
            _ => None,
        };
        match elapsed {
            Some(elapsed) => self.emit(ClientEvent::Elapsed(elapsed)),
            None => self.ticker = None,
        }
    }

    fn miss(&mut self) {
        let from = self.session.as_ref().map(|s| s.remote.clone());
        self.end_call(EndReason::Missed);
        if let Some(from) = from {
            self.notify(Notice::MissedCall { from });
        }
    }

    /// Ending (for local teardown) -> Ended -> Idle, releasing everything the
    /// session held. The local bundle is kept for the next call.
    fn end_call(&mut self, reason: EndReason) {
        self.expiry = None;
        self.ticker = None;
        if let Some(acquisition) = self.acquisition.as_mut() {
            if matches!(acquisition.purpose, Purpose::Accept { .. }) {
                acquisition.purpose = Purpose::Preview;
            }
        }
        let local = matches!(reason, EndReason::HungUp | EndReason::Rejected);
        match self.session.as_mut() {
            Some(session) if local => session.state = CallState::Ending,
            Some(_) => {}
            None => return,
        }
        if local {
            self.emit_state();
        }

        let mut had_remote_media = false;
        if let Some(session) = self.session.as_mut() {
            if let Some(mut handle) = session.handle.take() {
                // tolerated: the channel may already be gone
                if let Err(e) = handle.close() {
                    log::warn!("failed to close call {}: {}", handle.id(), e);
                }
            }
            if let Some(mut remote) = session.remote_media.take() {
                remote.stop();
                had_remote_media = true;
            }
            session.state = CallState::Ended;
            session.end_reason = Some(reason);
            log::debug!("call with {} ended: {:?}", session.remote, reason);
        }
        if had_remote_media {
            self.emit(ClientEvent::RemoteMediaDetached);
        }
        self.emit_state();
        self.session = None;
        self.emit_state();
    }

    fn request_media(&mut self, purpose: Purpose) {
        if let Some(acquisition) = self.acquisition.as_mut() {
            if !matches!(purpose, Purpose::Preview) {
                acquisition.purpose = purpose;
            }
            return;
        }
        let task = tokio::spawn(self.media.request(self.config.constraints.clone()));
        self.acquisition = Some(Acquisition { purpose, task });
    }

    fn on_acquired(&mut self, result: Result<Result<MediaBundle, MediaError>, JoinError>) {
        let purpose = match self.acquisition.take() {
            Some(acquisition) => acquisition.purpose,
            None => return,
        };
        let result = result.unwrap_or_else(|e| {
            log::error!("media request panicked or was cancelled: {}", e);
            Err(MediaError::Unknown)
        });
        match result {
            Ok(mut bundle) => {
                if self.identity.is_none() {
                    log::debug!("releasing media acquired after logout");
                    bundle.stop();
                    return;
                }
                self.media.attach(bundle);
                self.emit_media_state();
                match purpose {
                    Purpose::Preview => {}
                    Purpose::Dial { remote, kind } => {
                        if self.session.is_none() {
                            self.dial(remote, kind);
                        } else {
                            log::info!("not calling {}: another call is in progress", remote);
                            self.notify(Notice::CallAbandoned { to: remote });
                        }
                    }
                    Purpose::Accept { call } => {
                        if self.is_ringing(call) {
                            self.answer();
                        } else {
                            log::debug!("call {} is gone; not answering", call);
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("failed to acquire local media: {}", e);
                self.notify(Notice::MediaUnavailable(e));
                if let Purpose::Accept { call } = purpose {
                    if self.is_ringing(call) {
                        self.end_call(EndReason::Rejected);
                    }
                }
            }
        }
    }

    fn pending_dial(&self) -> Option<&Identity> {
        match self.acquisition.as_ref().map(|a| &a.purpose) {
            Some(Purpose::Dial { remote, .. }) => Some(remote),
            _ => None,
        }
    }

    /// the user accepted and media is still being acquired
    fn accepting(&self) -> bool {
        matches!(
            self.acquisition.as_ref().map(|a| &a.purpose),
            Some(Purpose::Accept { .. })
        )
    }

    fn is_ringing(&self, call: CallId) -> bool {
        matches!(&self.session, Some(s) if s.state == CallState::RingingInbound && s.call_id() == Some(call))
    }

    fn record_contact(&mut self, remote: &Identity) {
        if self.identity.as_ref() == Some(remote) {
            return;
        }
        let contacts = self.store.record_contact(remote);
        self.emit(ClientEvent::ContactsChanged(contacts));
    }

    fn channel_status(&self) -> ChannelStatus {
        self.channel
            .as_ref()
            .map(|c| c.status())
            .unwrap_or(ChannelStatus::Offline)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.identity.clone(),
            self.channel_status(),
            self.session.as_ref(),
        )
    }

    fn notify_call_error(&self, e: CallError) {
        match e {
            // should not happen in normal flow
            CallError::ChannelClosed => self.notify(Notice::Signal(SignalError::Unknown)),
            e => self.notify(Notice::CallFailed(e)),
        }
    }

    fn notify(&self, notice: Notice) {
        log::info!("notice: {}", notice);
        self.emit(ClientEvent::Notice(notice));
    }

    fn emit_media_state(&self) {
        self.emit(ClientEvent::MediaState {
            audio: self.media.current_audio_enabled(),
            video: self.media.current_video_enabled(),
        });
    }

    fn emit_state(&self) {
        let snapshot = self.snapshot();
        log::debug!("state: {} (channel {})", snapshot.state, snapshot.channel);
        self.emit(ClientEvent::StateChanged(snapshot));
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            log::trace!("no one is listening for client events");
        }
    }
}
