pub mod config;
pub mod controller;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{CallConfig, IceServerConfig, IceServerKind, MediaConstraints};
pub use controller::CallController;
pub use error::{CallError, NegotiationStep};
pub use media::{CaptureDevice, LocalStream, MediaTrack};
pub use peer::{CallState, ConnectionFactory, NegotiableConnection, WebRtcConnectionFactory};
pub use session::CallSnapshot;
pub use signaling::{MemoryRelay, PubSubTransport};
