use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[cfg(feature = "capture")]
mod capture;
mod virtual_devices;

#[cfg(feature = "capture")]
pub use capture::CpalDevices;
pub use virtual_devices::VirtualDevices;

/// The kind of a track, and the declared type of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[display(fmt = "audio")]
    Audio,
    #[display(fmt = "video")]
    Video,
}

impl MediaKind {
    /// how the call type is shown to the user
    pub fn call_label(&self) -> &'static str {
        match self {
            MediaKind::Audio => "Voice Call",
            MediaKind::Video => "Video Call",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
    pub enabled: bool,
    /// false once the track has been stopped
    #[serde(skip, default = "live")]
    pub live: bool,
}

fn live() -> bool {
    true
}

impl Track {
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            enabled: true,
            live: true,
        }
    }
}

/// An owned set of capture tracks, each independently enabled.
#[derive(Debug)]
pub struct MediaBundle {
    id: Uuid,
    tracks: Vec<Track>,
}

impl MediaBundle {
    pub fn new(tracks: Vec<Track>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tracks,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks_of(kind).next().is_some()
    }

    /// enabled-state of the first track of `kind`; false when there is none
    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        self.tracks_of(kind).next().map(|t| t.enabled).unwrap_or(false)
    }

    /// sets every track of `kind` and returns the resulting state
    pub fn set_enabled(&mut self, kind: MediaKind, enabled: bool) -> bool {
        for track in self.tracks.iter_mut().filter(|t| t.kind == kind) {
            track.enabled = enabled;
        }
        self.is_enabled(kind)
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| t.live)
    }

    pub fn stop(&mut self) {
        for track in self.tracks.iter_mut() {
            track.live = false;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub ideal_frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 640,
            ideal_height: 480,
            ideal_frame_rate: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// What to ask the capture backend for. `None` means the kind is not wanted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: Some(VideoConstraints::default()),
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: None,
        }
    }

    pub fn wants(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio.is_some(),
            MediaKind::Video => self.video.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("Please allow camera and microphone permissions.")]
    PermissionDenied,
    #[error("No camera/microphone found.")]
    DeviceNotFound,
    #[error("Camera/microphone is already in use.")]
    DeviceBusy,
    #[error("Could not access camera/microphone.")]
    Unknown,
}

/// Grants access to capture hardware
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaBundle, MediaError>;
}

/// Shows the local bundle to the user
pub trait PreviewSink: Send {
    fn attach(&mut self, bundle: &MediaBundle);
    fn detach(&mut self);
}

/// A preview that renders nothing
pub struct NullPreview;

impl PreviewSink for NullPreview {
    fn attach(&mut self, bundle: &MediaBundle) {
        log::debug!("preview attached: bundle {}", bundle.id());
    }

    fn detach(&mut self) {
        log::debug!("preview detached");
    }
}

/// Owns the local media bundle. At most one bundle is live at a time; it
/// survives across calls and is only released on logout.
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    preview: Box<dyn PreviewSink>,
    bundle: Option<MediaBundle>,
}

impl MediaController {
    pub fn new(devices: Arc<dyn MediaDevices>, preview: Box<dyn PreviewSink>) -> Self {
        Self {
            devices,
            preview,
            bundle: None,
        }
    }

    /// acquires a bundle and attaches it to the preview
    pub async fn acquire(
        &mut self,
        constraints: &MediaConstraints,
    ) -> Result<&MediaBundle, MediaError> {
        let bundle = self.devices.acquire(constraints).await?;
        Ok(self.attach(bundle))
    }

    /// Starts an acquisition without borrowing the controller. The caller hands
    /// the result back through `attach`.
    pub fn request(
        &self,
        constraints: MediaConstraints,
    ) -> impl Future<Output = Result<MediaBundle, MediaError>> + Send + 'static {
        let devices = self.devices.clone();
        async move { devices.acquire(&constraints).await }
    }

    /// takes ownership of `bundle`, replacing (and releasing) any previous one
    pub fn attach(&mut self, bundle: MediaBundle) -> &MediaBundle {
        self.release();
        self.preview.attach(&bundle);
        self.bundle.insert(bundle)
    }

    pub fn bundle(&self) -> Option<&MediaBundle> {
        self.bundle.as_ref()
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) -> bool {
        self.set_enabled(MediaKind::Audio, enabled)
    }

    pub fn set_video_enabled(&mut self, enabled: bool) -> bool {
        self.set_enabled(MediaKind::Video, enabled)
    }

    pub fn current_audio_enabled(&self) -> bool {
        self.current(MediaKind::Audio)
    }

    pub fn current_video_enabled(&self) -> bool {
        self.current(MediaKind::Video)
    }

    /// stops all tracks and detaches the preview; safe to call repeatedly
    pub fn release(&mut self) {
        if let Some(mut bundle) = self.bundle.take() {
            bundle.stop();
            self.preview.detach();
            log::debug!("released local media bundle {}", bundle.id());
        }
    }

    fn set_enabled(&mut self, kind: MediaKind, enabled: bool) -> bool {
        match self.bundle.as_mut() {
            Some(bundle) if bundle.has(kind) => bundle.set_enabled(kind, enabled),
            _ => {
                log::debug!("no local {} track to toggle", kind);
                false
            }
        }
    }

    fn current(&self, kind: MediaKind) -> bool {
        self.bundle
            .as_ref()
            .map(|b| b.is_enabled(kind))
            .unwrap_or(false)
    }
}
