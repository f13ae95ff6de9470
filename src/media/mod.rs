pub mod device;
pub mod manager;

pub use device::{CaptureDevice, MediaTrack};
pub use manager::{LocalMediaState, LocalStream, MediaSourceManager};
