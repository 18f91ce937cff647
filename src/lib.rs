//! A peer-to-peer call client. It logs in with an email-shaped identity,
//! negotiates audio/video calls with remote parties through a brokering
//! service and manages local and remote media for the duration of a call.
//!
//! The heart of the crate is the call state machine, which runs in a single
//! background task started by [`Client::start`]. User commands go in through
//! the [`Client`] handle; everything observable comes out as [`ClientEvent`]s,
//! which [`status::project`] turns into user-facing text.
//!
//! The brokering service is abstracted behind [`signaling::Transport`]. The
//! crate ships [`signaling::rtc::RtcTransport`], which negotiates each call as a
//! [webrtc-rs](https://github.com/webrtc-rs/webrtc) peer connection and signals
//! through an in-process [`signaling::relay::Relay`]. Device access is
//! abstracted behind [`media::MediaDevices`].

pub mod call;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod media;
pub mod signaling;
pub mod status;

// public exports
pub use call::{CallState, ClientEvent, Direction, EndReason, Notice, Snapshot};
pub use client::{Client, ClientArgs};
pub use config::Config;
pub use error::{ClientError, ValidationError};
pub use identity::{FileStorage, Identity, MemoryStorage, Storage};
pub use media::{MediaDevices, MediaError, MediaKind, NullPreview, PreviewSink, VirtualDevices};
pub use signaling::{CallError, ChannelStatus, SignalError};
