use crate::error::{CallError, NegotiationStep, Result};
use crate::peer::types::{
    IceCandidate, PresenceRecord, SdpKind, SessionDescription, SessionIdentity,
};
use crate::signaling::message::{MessageKind, SignalingMessage};
use crate::signaling::transport::{PubSubTransport, SubscriptionHandle, TransportEvent};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Входящие события канала: один поток вместо набора обработчиков
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Участник пришёл после нас
    PeerJoined(PresenceRecord),
    /// Участник уже был в топике, когда пришли мы
    PeerPresent(PresenceRecord),
    PeerLeft {
        peer_id: String,
    },
    Offer {
        from: String,
        description: SessionDescription,
    },
    Answer {
        from: String,
        description: SessionDescription,
    },
    Candidate {
        from: String,
        candidate: IceCandidate,
    },
    CallStart {
        from: String,
    },
    CallEnd {
        from: String,
    },
    /// Адресованное нам сообщение с нечитаемым payload
    Rejected {
        from: String,
        kind: MessageKind,
        reason: String,
    },
}

/// Отправляющая половина канала, привязанная к сессии и отправителю
#[derive(Clone)]
pub struct ChannelSender {
    identity: SessionIdentity,
    handle: Arc<dyn SubscriptionHandle>,
}

impl ChannelSender {
    pub fn local_id(&self) -> &str {
        &self.identity.local_user_id
    }

    pub fn session_id(&self) -> &str {
        &self.identity.session_id
    }

    pub async fn send(&self, message: &SignalingMessage) -> Result<()> {
        let wire = message
            .to_wire()
            .map_err(|e| CallError::negotiation(NegotiationStep::Send, e))?;
        self.handle
            .publish(wire)
            .await
            .map_err(|e| CallError::negotiation(NegotiationStep::Send, e))?;
        debug!("Sent {:?} to {}", message.kind, message.to);
        Ok(())
    }

    pub async fn send_description(&self, to: &str, desc: &SessionDescription) -> Result<()> {
        let msg = SignalingMessage::description(self.session_id(), self.local_id(), to, desc);
        self.send(&msg).await
    }

    pub async fn send_candidate(&self, to: &str, candidate: &IceCandidate) -> Result<()> {
        let msg = SignalingMessage::candidate(self.session_id(), self.local_id(), to, candidate);
        self.send(&msg).await
    }

    pub async fn send_call_start(&self, to: &str) -> Result<()> {
        let msg = SignalingMessage::call_start(self.session_id(), self.local_id(), to);
        self.send(&msg).await
    }

    pub async fn send_call_end(&self, to: &str) -> Result<()> {
        let msg = SignalingMessage::call_end(self.session_id(), self.local_id(), to);
        self.send(&msg).await
    }
}

struct Membership {
    topic: String,
    sender: ChannelSender,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    ready: VecDeque<ChannelEvent>,
}

/// Канал сигнализации одного звонка: топик, ограниченный `sessionId`
pub struct SignalingChannel {
    transport: Arc<dyn PubSubTransport>,
    topic_prefix: String,
    membership: Option<Membership>,
}

impl SignalingChannel {
    pub fn new(transport: Arc<dyn PubSubTransport>, topic_prefix: impl Into<String>) -> Self {
        Self {
            transport,
            topic_prefix: topic_prefix.into(),
            membership: None,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.membership.is_some()
    }

    pub async fn join(&mut self, session_id: &str, peer_id: &str) -> Result<()> {
        if let Some(m) = &self.membership {
            return Err(CallError::ChannelJoin(format!(
                "already joined {}, leave first",
                m.topic
            )));
        }

        let topic = format!("{}:{}", self.topic_prefix, session_id);
        let subscription = self
            .transport
            .subscribe(&topic, peer_id)
            .await
            .map_err(|e| CallError::ChannelJoin(e.to_string()))?;
        info!("Joined signaling topic {} as {}", topic, peer_id);

        self.membership = Some(Membership {
            topic,
            sender: ChannelSender {
                identity: SessionIdentity {
                    session_id: session_id.to_string(),
                    local_user_id: peer_id.to_string(),
                },
                handle: subscription.handle,
            },
            events: subscription.events,
            ready: VecDeque::new(),
        });
        Ok(())
    }

    /// Идемпотентно
    pub async fn leave(&mut self) -> Result<()> {
        let Some(m) = self.membership.take() else {
            return Ok(());
        };
        info!("Leaving signaling topic {}", m.topic);
        m.sender
            .handle
            .unsubscribe()
            .await
            .map_err(|e| CallError::ChannelJoin(e.to_string()))
    }

    pub fn sender(&self) -> Option<ChannelSender> {
        self.membership.as_ref().map(|m| m.sender.clone())
    }

    pub async fn send(&self, message: &SignalingMessage) -> Result<()> {
        match &self.membership {
            Some(m) => m.sender.send(message).await,
            None => Err(CallError::negotiation(
                NegotiationStep::Send,
                "not joined to a signaling channel",
            )),
        }
    }

    /// Следующее событие, адресованное нам. Без членства ждёт бесконечно;
    /// `None` — транспорт закрыл подписку.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        let Some(m) = self.membership.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            if let Some(event) = m.ready.pop_front() {
                return Some(event);
            }
            let raw = m.events.recv().await?;
            let identity = &m.sender.identity;
            match raw {
                TransportEvent::Message(text) => {
                    if let Some(event) = decode_message(identity, &text) {
                        m.ready.push_back(event);
                    }
                }
                TransportEvent::PresenceSync(records) => {
                    m.ready.extend(
                        records
                            .into_iter()
                            .filter(|r| r.peer_id != identity.local_user_id)
                            .map(ChannelEvent::PeerPresent),
                    );
                }
                TransportEvent::PresenceJoin(record) => {
                    if record.peer_id != identity.local_user_id {
                        m.ready.push_back(ChannelEvent::PeerJoined(record));
                    }
                }
                TransportEvent::PresenceLeave(peer_id) => {
                    if peer_id != identity.local_user_id {
                        m.ready.push_back(ChannelEvent::PeerLeft { peer_id });
                    }
                }
            }
        }
    }
}

fn decode_message(identity: &SessionIdentity, raw: &str) -> Option<ChannelEvent> {
    let msg = match SignalingMessage::from_wire(raw) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Dropping unreadable signaling message: {}", e);
            return None;
        }
    };

    if msg.session_id != identity.session_id
        || msg.from == identity.local_user_id
        || !msg.is_for(&identity.local_user_id)
    {
        return None;
    }

    let from = msg.from.clone();
    let event = match msg.kind {
        MessageKind::Offer | MessageKind::Answer => {
            match payload::<SessionDescription>(&msg) {
                Ok(description) => {
                    let expected = match msg.kind {
                        MessageKind::Offer => SdpKind::Offer,
                        _ => SdpKind::Answer,
                    };
                    if description.kind != expected {
                        rejected(&msg, format!("payload type {:?}", description.kind))
                    } else if msg.kind == MessageKind::Offer {
                        ChannelEvent::Offer { from, description }
                    } else {
                        ChannelEvent::Answer { from, description }
                    }
                }
                Err(reason) => rejected(&msg, reason),
            }
        }
        MessageKind::IceCandidate => match payload::<IceCandidate>(&msg) {
            Ok(candidate) => ChannelEvent::Candidate { from, candidate },
            Err(reason) => rejected(&msg, reason),
        },
        MessageKind::CallStart => ChannelEvent::CallStart { from },
        MessageKind::CallEnd => ChannelEvent::CallEnd { from },
    };
    Some(event)
}

fn payload<T: DeserializeOwned>(msg: &SignalingMessage) -> std::result::Result<T, String> {
    let value = msg.payload.clone().ok_or_else(|| "missing payload".to_string())?;
    serde_json::from_value(value).map_err(|e| e.to_string())
}

fn rejected(msg: &SignalingMessage, reason: String) -> ChannelEvent {
    warn!("Rejecting {:?} from {}: {}", msg.kind, msg.from, reason);
    ChannelEvent::Rejected {
        from: msg.from.clone(),
        kind: msg.kind,
        reason,
    }
}
