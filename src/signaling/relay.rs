use crate::error::TransportError;
use crate::peer::types::PresenceRecord;
use crate::signaling::transport::{
    PubSubTransport, Subscription, SubscriptionHandle, TransportEvent,
};
use crate::utils::now_millis;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

struct Member {
    key: u64,
    record: PresenceRecord,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct RelayState {
    topics: HashMap<String, Vec<Member>>,
    next_key: u64,
}

/// Pub/sub ретранслятор внутри процесса: топики, присутствие, широковещательная
/// рассылка (отправитель тоже получает своё сообщение).
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Участники топика в порядке подписки
    pub fn members(&self, topic: &str) -> Vec<String> {
        self.lock()
            .topics
            .get(topic)
            .map(|members| members.iter().map(|m| m.record.peer_id.clone()).collect())
            .unwrap_or_default()
    }

    fn remove(&self, topic: &str, key: u64) {
        let mut state = self.lock();
        let Some(members) = state.topics.get_mut(topic) else {
            return;
        };
        let Some(pos) = members.iter().position(|m| m.key == key) else {
            return;
        };
        let gone = members.remove(pos);
        debug!("{} left topic {}", gone.record.peer_id, topic);
        for member in members.iter() {
            let _ = member
                .tx
                .send(TransportEvent::PresenceLeave(gone.record.peer_id.clone()));
        }
        if members.is_empty() {
            state.topics.remove(topic);
        }
    }
}

#[async_trait]
impl PubSubTransport for MemoryRelay {
    async fn subscribe(
        &self,
        topic: &str,
        member_id: &str,
    ) -> Result<Subscription, TransportError> {
        if member_id.is_empty() {
            return Err(TransportError("member id is empty".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let record = PresenceRecord {
            peer_id: member_id.to_string(),
            joined_at: now_millis(),
        };

        let key = {
            let mut state = self.lock();
            state.next_key += 1;
            let key = state.next_key;
            let members = state.topics.entry(topic.to_string()).or_default();

            let present = members.iter().map(|m| m.record.clone()).collect();
            let _ = tx.send(TransportEvent::PresenceSync(present));
            for member in members.iter() {
                let _ = member.tx.send(TransportEvent::PresenceJoin(record.clone()));
            }
            members.push(Member { key, record, tx });
            key
        };
        debug!("{} subscribed to topic {}", member_id, topic);

        Ok(Subscription {
            handle: Arc::new(MemoryHandle {
                relay: self.clone(),
                topic: topic.to_string(),
                key,
                active: AtomicBool::new(true),
            }),
            events: rx,
        })
    }
}

struct MemoryHandle {
    relay: MemoryRelay,
    topic: String,
    key: u64,
    active: AtomicBool,
}

#[async_trait]
impl SubscriptionHandle for MemoryHandle {
    async fn publish(&self, payload: String) -> Result<(), TransportError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(TransportError(format!("not subscribed to {}", self.topic)));
        }
        let state = self.relay.lock();
        if let Some(members) = state.topics.get(&self.topic) {
            for member in members {
                let _ = member.tx.send(TransportEvent::Message(payload.clone()));
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        if self.active.swap(false, Ordering::SeqCst) {
            self.relay.remove(&self.topic, self.key);
        }
        Ok(())
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.relay.remove(&self.topic, self.key);
        }
    }
}
