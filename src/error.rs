use std::fmt;
use thiserror::Error;

/// Шаг согласования, на котором произошла ошибка
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    CreateConnection,
    AddTrack,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
    Rollback,
    Send,
    DecodePayload,
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationStep::CreateConnection => "create-connection",
            NegotiationStep::AddTrack => "add-track",
            NegotiationStep::CreateOffer => "create-offer",
            NegotiationStep::CreateAnswer => "create-answer",
            NegotiationStep::SetLocalDescription => "set-local-description",
            NegotiationStep::SetRemoteDescription => "set-remote-description",
            NegotiationStep::AddIceCandidate => "add-ice-candidate",
            NegotiationStep::Rollback => "rollback",
            NegotiationStep::Send => "send",
            NegotiationStep::DecodePayload => "decode-payload",
        };
        f.write_str(name)
    }
}

/// Ошибки звонка, видимые UI через `CallSnapshot::error`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("camera/microphone access denied: {0}")]
    MediaAccessDenied(String),

    #[error("no compatible capture device: {0}")]
    DeviceUnavailable(String),

    #[error("failed to join signaling channel: {0}")]
    ChannelJoin(String),

    #[error("negotiation failed at {step}: {reason}")]
    Negotiation {
        step: NegotiationStep,
        reason: String,
    },

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CallError {
    pub fn negotiation(step: NegotiationStep, reason: impl ToString) -> Self {
        CallError::Negotiation {
            step,
            reason: reason.to_string(),
        }
    }
}

/// Ошибка устройства захвата (камера/микрофон)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device not found: {0}")]
    NotFound(String),

    #[error("capture failed: {0}")]
    Other(String),
}

impl From<CaptureError> for CallError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied(msg) => CallError::MediaAccessDenied(msg),
            CaptureError::NotFound(msg) | CaptureError::Other(msg) => {
                CallError::DeviceUnavailable(msg)
            }
        }
    }
}

/// Ошибка pub/sub транспорта сигнализации
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("signaling transport: {0}")]
pub struct TransportError(pub String);

/// Ошибка примитива peer connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ConnectionError(pub String);

impl From<webrtc::Error> for ConnectionError {
    fn from(err: webrtc::Error) -> Self {
        ConnectionError(err.to_string())
    }
}

pub type Result<T, E = CallError> = std::result::Result<T, E>;
