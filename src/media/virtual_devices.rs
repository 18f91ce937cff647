use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{MediaBundle, MediaConstraints, MediaDevices, MediaError, MediaKind, Track};

/// A capture backend with no hardware behind it. Tracks are fabricated from
/// the constraints; failures and latency can be injected, which makes it the
/// backend of choice for demos and tests.
#[derive(Clone)]
pub struct VirtualDevices {
    state: Arc<Mutex<State>>,
}

struct State {
    has_microphone: bool,
    has_camera: bool,
    failure: Option<MediaError>,
    delay: Duration,
    acquisitions: usize,
}

impl Default for VirtualDevices {
    fn default() -> Self {
        Self::with_hardware(true, true)
    }
}

impl VirtualDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn microphone_only() -> Self {
        Self::with_hardware(true, false)
    }

    fn with_hardware(has_microphone: bool, has_camera: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                has_microphone,
                has_camera,
                failure: None,
                delay: Duration::ZERO,
                acquisitions: 0,
            })),
        }
    }

    /// every following acquisition fails with `failure` (or succeeds again with `None`)
    pub fn fail_with(&self, failure: Option<MediaError>) {
        self.state().failure = failure;
    }

    /// how long an acquisition takes before resolving
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = delay;
    }

    /// number of acquisition attempts so far
    pub fn acquisitions(&self) -> usize {
        self.state().acquisitions
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MediaDevices for VirtualDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaBundle, MediaError> {
        let (failure, delay, has_microphone, has_camera) = {
            let mut state = self.state();
            state.acquisitions += 1;
            (
                state.failure,
                state.delay,
                state.has_microphone,
                state.has_camera,
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = failure {
            log::warn!("virtual capture failing: {}", e);
            return Err(e);
        }

        let mut tracks = vec![];
        if constraints.wants(MediaKind::Audio) && has_microphone {
            tracks.push(Track::new(MediaKind::Audio, "virtual microphone"));
        }
        if constraints.wants(MediaKind::Video) && has_camera {
            tracks.push(Track::new(MediaKind::Video, "virtual camera"));
        }
        if tracks.is_empty() {
            return Err(MediaError::DeviceNotFound);
        }
        Ok(MediaBundle::new(tracks))
    }
}
