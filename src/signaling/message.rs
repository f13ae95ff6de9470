use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};
use crate::utils::now_millis;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Адрес "всем участникам топика"
pub const BROADCAST: &str = "*";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Offer,
    Answer,
    IceCandidate,
    CallStart,
    CallEnd,
}

/// Сообщение сигнализации; после отправки не изменяется
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub kind: MessageKind,
    pub session_id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: i64,
}

impl SignalingMessage {
    fn new(
        kind: MessageKind,
        session_id: &str,
        from: &str,
        to: &str,
        payload: Option<Value>,
    ) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            payload,
            timestamp: now_millis(),
        }
    }

    pub fn description(session_id: &str, from: &str, to: &str, desc: &SessionDescription) -> Self {
        let kind = match desc.kind {
            SdpKind::Offer => MessageKind::Offer,
            SdpKind::Answer => MessageKind::Answer,
        };
        Self::new(kind, session_id, from, to, serde_json::to_value(desc).ok())
    }

    pub fn candidate(session_id: &str, from: &str, to: &str, candidate: &IceCandidate) -> Self {
        Self::new(
            MessageKind::IceCandidate,
            session_id,
            from,
            to,
            serde_json::to_value(candidate).ok(),
        )
    }

    pub fn call_start(session_id: &str, from: &str, to: &str) -> Self {
        Self::new(MessageKind::CallStart, session_id, from, to, None)
    }

    pub fn call_end(session_id: &str, from: &str, to: &str) -> Self {
        Self::new(MessageKind::CallEnd, session_id, from, to, None)
    }

    /// Адресовано ли сообщение участнику `peer_id`
    pub fn is_for(&self, peer_id: &str) -> bool {
        self.to == peer_id || self.to == BROADCAST
    }

    pub fn to_wire(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_wire(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
