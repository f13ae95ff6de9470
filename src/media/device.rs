use crate::config::MediaConstraints;
use crate::error::CaptureError;
use crate::peer::types::TrackKind;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Захваченный трек камеры или микрофона
pub trait MediaTrack: Send + Sync + Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Останавливает захват. Остановленный трек повторно не используется.
    fn stop(&self);
    fn is_live(&self) -> bool;
}

/// API устройств захвата (аналог getUserMedia, по одному треку за вызов)
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn open(
        &self,
        kind: TrackKind,
        constraints: &MediaConstraints,
    ) -> Result<Arc<dyn MediaTrack>, CaptureError>;
}
