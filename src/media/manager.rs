use crate::config::MediaConstraints;
use crate::error::{CallError, Result};
use crate::media::device::{CaptureDevice, MediaTrack};
use crate::peer::types::{LocalTrack, TrackKind};
use crate::utils::random_id;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Описание локального потока для UI и для peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalMediaState {
    pub stream: Option<LocalStream>,
    pub camera_enabled: bool,
    pub microphone_enabled: bool,
}

struct MediaHandle {
    stream_id: String,
    video: Arc<dyn MediaTrack>,
    audio: Arc<dyn MediaTrack>,
}

impl MediaHandle {
    fn describe(&self) -> LocalStream {
        LocalStream {
            id: self.stream_id.clone(),
            tracks: [&self.video, &self.audio]
                .into_iter()
                .map(|t| LocalTrack {
                    id: t.id().to_string(),
                    stream_id: self.stream_id.clone(),
                    kind: t.kind(),
                })
                .collect(),
        }
    }

    fn stop(self) {
        self.video.stop();
        self.audio.stop();
    }
}

/// Владеет локальным захватом камеры и микрофона.
/// Одновременно существует не больше одного живого handle.
pub struct MediaSourceManager {
    device: Arc<dyn CaptureDevice>,
    constraints: MediaConstraints,
    handle: Option<MediaHandle>,
}

impl MediaSourceManager {
    pub fn new(device: Arc<dyn CaptureDevice>, constraints: MediaConstraints) -> Self {
        Self {
            device,
            constraints,
            handle: None,
        }
    }

    pub async fn acquire(&mut self) -> Result<LocalStream> {
        // старый handle освобождаем до запроса нового
        self.release();

        let video = self
            .device
            .open(TrackKind::Video, &self.constraints)
            .await
            .map_err(CallError::from)?;

        let audio = match self.device.open(TrackKind::Audio, &self.constraints).await {
            Ok(track) => track,
            Err(e) => {
                warn!("Microphone capture failed, releasing camera: {}", e);
                video.stop();
                return Err(e.into());
            }
        };

        let handle = MediaHandle {
            stream_id: random_id(),
            video,
            audio,
        };
        handle.video.set_enabled(true);
        handle.audio.set_enabled(true);

        let stream = handle.describe();
        info!("Local media acquired: stream {}", stream.id);
        self.handle = Some(handle);
        Ok(stream)
    }

    /// Идемпотентно
    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            info!("Releasing local media stream {}", handle.stream_id);
            handle.stop();
        } else {
            debug!("release: no local media held");
        }
    }

    pub fn toggle_video(&mut self) -> bool {
        self.toggle(TrackKind::Video)
    }

    pub fn toggle_audio(&mut self) -> bool {
        self.toggle(TrackKind::Audio)
    }

    fn toggle(&mut self, kind: TrackKind) -> bool {
        let Some(handle) = &self.handle else {
            debug!("toggle {:?}: no local media held", kind);
            return false;
        };
        let track = match kind {
            TrackKind::Video => &handle.video,
            TrackKind::Audio => &handle.audio,
        };
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        debug!("{:?} track enabled = {}", kind, enabled);
        enabled
    }

    pub fn state(&self) -> LocalMediaState {
        match &self.handle {
            Some(handle) => LocalMediaState {
                stream: Some(handle.describe()),
                camera_enabled: handle.video.is_enabled(),
                microphone_enabled: handle.audio.is_enabled(),
            },
            None => LocalMediaState::default(),
        }
    }

    pub fn has_media(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for MediaSourceManager {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CaptureBehavior, FakeCaptureDevice};

    fn manager(device: &Arc<FakeCaptureDevice>) -> MediaSourceManager {
        MediaSourceManager::new(device.clone(), MediaConstraints::default())
    }

    #[tokio::test]
    async fn acquire_exposes_enabled_tracks() {
        let device = Arc::new(FakeCaptureDevice::new());
        let mut media = manager(&device);

        let stream = media.acquire().await.unwrap();
        assert_eq!(stream.tracks.len(), 2);
        let state = media.state();
        assert_eq!(state.stream, Some(stream));
        assert!(state.camera_enabled);
        assert!(state.microphone_enabled);
    }

    #[tokio::test]
    async fn reacquire_releases_previous_handle() {
        let device = Arc::new(FakeCaptureDevice::new());
        let mut media = manager(&device);

        media.acquire().await.unwrap();
        media.acquire().await.unwrap();
        let opened = device.opened();
        assert_eq!(opened.len(), 4);
        assert!(!opened[0].is_live());
        assert!(!opened[1].is_live());
        assert_eq!(device.live_tracks(), 2);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let device = Arc::new(FakeCaptureDevice::new());
        let mut media = manager(&device);

        media.release();
        assert_eq!(media.state(), LocalMediaState::default());

        media.acquire().await.unwrap();
        media.release();
        assert_eq!(media.state().stream, None);
        media.release();
        assert_eq!(media.state().stream, None);
        assert_eq!(device.live_tracks(), 0);
        assert!(device.opened().iter().all(|t| t.stop_count() == 1));
    }

    #[tokio::test]
    async fn toggles_flip_without_recapture() {
        let device = Arc::new(FakeCaptureDevice::new());
        let mut media = manager(&device);

        assert!(!media.toggle_video());
        media.acquire().await.unwrap();

        assert!(!media.toggle_video());
        assert!(!media.state().camera_enabled);
        assert!(media.state().microphone_enabled);
        assert!(!media.toggle_audio());
        assert!(media.toggle_video());
        assert!(media.state().camera_enabled);
        assert_eq!(device.opened().len(), 2);
    }

    #[tokio::test]
    async fn denied_permission_maps_to_access_denied() {
        let device = Arc::new(FakeCaptureDevice::with_behavior(CaptureBehavior::Deny));
        let mut media = manager(&device);
        assert!(matches!(
            media.acquire().await,
            Err(CallError::MediaAccessDenied(_))
        ));
        assert!(!media.has_media());
    }

    #[tokio::test]
    async fn partial_failure_releases_camera() {
        let device = Arc::new(FakeCaptureDevice::with_behavior(
            CaptureBehavior::NoMicrophone,
        ));
        let mut media = manager(&device);
        assert!(matches!(
            media.acquire().await,
            Err(CallError::DeviceUnavailable(_))
        ));
        assert!(!media.has_media());
        assert_eq!(device.opened().len(), 1);
        assert_eq!(device.live_tracks(), 0);
    }
}
