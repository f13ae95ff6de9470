use crate::error::TransportError;
use crate::peer::types::PresenceRecord;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Что транспорт доставляет подписчику топика
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Сырой JSON сообщения сигнализации
    Message(String),
    /// Участники, уже присутствовавшие в топике на момент подписки
    PresenceSync(Vec<PresenceRecord>),
    PresenceJoin(PresenceRecord),
    PresenceLeave(String),
}

pub struct Subscription {
    pub handle: Arc<dyn SubscriptionHandle>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Ретранслируемый pub/sub транспорт (черный ящик)
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Подписка на топик с объявлением присутствия `member_id`
    async fn subscribe(&self, topic: &str, member_id: &str)
        -> Result<Subscription, TransportError>;
}

#[async_trait]
pub trait SubscriptionHandle: Send + Sync {
    async fn publish(&self, payload: String) -> Result<(), TransportError>;
    async fn unsubscribe(&self) -> Result<(), TransportError>;
}
