use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::DefaultStreamConfigError;

use super::{MediaBundle, MediaConstraints, MediaDevices, MediaError, MediaKind, Track};

/// Probes the host's default input device through cpal.
///
/// cpal only knows about audio, so a video request is satisfied without a
/// camera track; the bundle simply has no video.
#[derive(Default)]
pub struct CpalDevices;

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaBundle, MediaError> {
        let mut tracks = vec![];
        if constraints.wants(MediaKind::Audio) {
            let host = cpal::default_host();
            let input_device = host
                .default_input_device()
                .ok_or(MediaError::DeviceNotFound)?;
            // opening the default config is what fails when another process holds the device
            let config = input_device
                .default_input_config()
                .map_err(map_config_error)?;
            let label = input_device
                .name()
                .unwrap_or_else(|_| "default input".into());
            log::debug!(
                "using input device {} ({} Hz, {} channels)",
                label,
                config.sample_rate().0,
                config.channels()
            );
            tracks.push(Track::new(MediaKind::Audio, label));
        }
        if constraints.wants(MediaKind::Video) {
            log::info!("no camera backend available; continuing without video");
        }
        if tracks.is_empty() {
            return Err(MediaError::DeviceNotFound);
        }
        Ok(MediaBundle::new(tracks))
    }
}

fn map_config_error(err: DefaultStreamConfigError) -> MediaError {
    log::error!("failed to open input device: {}", err);
    match err {
        DefaultStreamConfigError::DeviceNotAvailable
        | DefaultStreamConfigError::StreamTypeNotSupported => MediaError::DeviceNotFound,
        DefaultStreamConfigError::BackendSpecific { err } => {
            let description = err.description.to_lowercase();
            if description.contains("busy") {
                MediaError::DeviceBusy
            } else if description.contains("permission") || description.contains("denied") {
                MediaError::PermissionDenied
            } else {
                MediaError::Unknown
            }
        }
    }
}
