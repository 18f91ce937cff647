//! The call session and everything the state machine reports about it.
//!
//! A [`CallSession`] is owned by the [`machine::CallMachine`] and mutated only
//! by its transitions. Observers get [`ClientEvent`]s, most importantly a
//! fresh [`Snapshot`] after every state change.

use derive_more::Display;
use std::time::Duration;
use tokio::time::Instant;

use crate::identity::Identity;
use crate::media::{MediaBundle, MediaError, MediaKind, Track};
use crate::signaling::{CallError, CallHandle, CallId, ChannelStatus, InboundCall, SignalError};

pub(crate) mod machine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CallState {
    #[display(fmt = "idle")]
    Idle,
    /// outgoing offer sent, waiting for the remote stream
    #[display(fmt = "dialing")]
    Dialing,
    #[display(fmt = "ringing")]
    RingingInbound,
    /// inbound call answered, waiting for the remote stream
    #[display(fmt = "connecting")]
    Connecting,
    #[display(fmt = "active")]
    Active,
    #[display(fmt = "ending")]
    Ending,
    #[display(fmt = "ended")]
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Direction {
    #[display(fmt = "outgoing")]
    Outgoing,
    #[display(fmt = "incoming")]
    Incoming,
}

/// why a session reached `Ended`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    HungUp,
    Rejected,
    /// an inbound call expired or was cancelled before it was answered
    Missed,
    RemoteClosed,
    Failed,
}

pub struct CallSession {
    pub(crate) direction: Direction,
    pub(crate) remote: Identity,
    pub(crate) kind: MediaKind,
    pub(crate) state: CallState,
    pub(crate) started_at: Option<Instant>,
    pub(crate) remote_media: Option<MediaBundle>,
    pub(crate) handle: Option<CallHandle>,
    pub(crate) end_reason: Option<EndReason>,
}

impl CallSession {
    pub(crate) fn outgoing(handle: CallHandle, kind: MediaKind) -> Self {
        Self {
            direction: Direction::Outgoing,
            remote: handle.remote().clone(),
            kind,
            state: CallState::Dialing,
            started_at: None,
            remote_media: None,
            handle: Some(handle),
            end_reason: None,
        }
    }

    pub(crate) fn incoming(call: InboundCall) -> Self {
        Self {
            direction: Direction::Incoming,
            remote: call.offer.remote,
            kind: call.offer.kind,
            state: CallState::RingingInbound,
            started_at: None,
            remote_media: None,
            handle: Some(call.handle),
            end_reason: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote(&self) -> &Identity {
        &self.remote
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.handle.as_ref().map(|h| h.id())
    }

    pub fn remote_media(&self) -> Option<&MediaBundle> {
        self.remote_media.as_ref()
    }

    /// time since the call became active, measured from `now`
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default()
    }
}

/// A read-only view of the client, emitted after every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub identity: Option<Identity>,
    pub channel: ChannelStatus,
    pub state: CallState,
    pub direction: Option<Direction>,
    pub remote: Option<Identity>,
    pub kind: Option<MediaKind>,
    /// set only while `state` is `Ended`
    pub end_reason: Option<EndReason>,
}

impl Snapshot {
    pub(crate) fn new(
        identity: Option<Identity>,
        channel: ChannelStatus,
        session: Option<&CallSession>,
    ) -> Self {
        match session {
            Some(s) => Self {
                identity,
                channel,
                state: s.state,
                direction: Some(s.direction),
                remote: Some(s.remote.clone()),
                kind: Some(s.kind),
                end_reason: s.end_reason,
            },
            None => Self {
                identity,
                channel,
                state: CallState::Idle,
                direction: None,
                remote: None,
                kind: None,
                end_reason: None,
            },
        }
    }
}

/// Something the user should be told about
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Notice {
    #[display(fmt = "Missed call from {}", from)]
    MissedCall { from: Identity },
    #[display(fmt = "Rejected call from {} while busy", from)]
    AutoRejected { from: Identity },
    #[display(fmt = "Call to {} was not placed: another call came in", to)]
    CallAbandoned { to: Identity },
    #[display(fmt = "{}", _0)]
    CallFailed(CallError),
    #[display(fmt = "{}", _0)]
    MediaUnavailable(MediaError),
    #[display(fmt = "{}", _0)]
    Signal(SignalError),
}

/// Emitted by the client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    LoggedIn(Identity),
    LoggedOut,
    Channel(ChannelStatus),
    StateChanged(Snapshot),
    IncomingCall { from: Identity, kind: MediaKind },
    /// time since the call became active; emitted on activation and then on every tick
    Elapsed(Duration),
    MediaState { audio: bool, video: bool },
    RemoteMediaAttached(Vec<Track>),
    RemoteMediaDetached,
    ContactsChanged(Vec<Identity>),
    Notice(Notice),
}
