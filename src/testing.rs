//! Подделки устройств, транспорта и соединения для тестов.
//! Доступны при feature `test-util`.

use crate::config::MediaConstraints;
use crate::error::{CaptureError, ConnectionError, TransportError};
use crate::media::{CaptureDevice, MediaTrack};
use crate::peer::connection::{ConnectionFactory, NegotiableConnection};
use crate::peer::types::{
    ConnectionEvent, IceCandidate, LocalTrack, PeerConnectionState, RemoteTrack, SdpKind,
    SessionDescription, TrackKind,
};
use crate::signaling::{MemoryRelay, PubSubTransport, Subscription, SubscriptionHandle};
use crate::utils::random_id;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stops: AtomicUsize,
}

impl FakeTrack {
    fn new(kind: TrackKind) -> Self {
        Self {
            id: format!("{:?}-{}", kind, random_id()).to_lowercase(),
            kind,
            enabled: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.stop_count() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureBehavior {
    Grant,
    Deny,
    NoCamera,
    NoMicrophone,
    /// Запрос разрешения без ответа: `open` не завершается
    Hang,
}

/// Устройство захвата, выдающее фиктивные треки
pub struct FakeCaptureDevice {
    behavior: CaptureBehavior,
    opened: Mutex<Vec<Arc<FakeTrack>>>,
}

impl Default for FakeCaptureDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCaptureDevice {
    pub fn new() -> Self {
        Self::with_behavior(CaptureBehavior::Grant)
    }

    pub fn with_behavior(behavior: CaptureBehavior) -> Self {
        Self {
            behavior,
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Все когда-либо открытые треки, по порядку
    pub fn opened(&self) -> Vec<Arc<FakeTrack>> {
        lock(&self.opened).clone()
    }

    pub fn live_tracks(&self) -> usize {
        lock(&self.opened).iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl CaptureDevice for FakeCaptureDevice {
    async fn open(
        &self,
        kind: TrackKind,
        _constraints: &MediaConstraints,
    ) -> Result<Arc<dyn MediaTrack>, CaptureError> {
        match (self.behavior, kind) {
            (CaptureBehavior::Hang, _) => std::future::pending::<()>().await,
            (CaptureBehavior::Deny, _) => {
                return Err(CaptureError::PermissionDenied("user dismissed prompt".into()))
            }
            (CaptureBehavior::NoCamera, TrackKind::Video) => {
                return Err(CaptureError::NotFound("no camera".into()))
            }
            (CaptureBehavior::NoMicrophone, TrackKind::Audio) => {
                return Err(CaptureError::NotFound("no microphone".into()))
            }
            _ => {}
        }
        let track = Arc::new(FakeTrack::new(kind));
        lock(&self.opened).push(track.clone());
        Ok(track)
    }
}

/// Операции FakeConnection, которые можно сломать или подвесить
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    AddTrack,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
    Rollback,
    Close,
}

#[derive(Default)]
struct FakeConnectionState {
    ops: Vec<String>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    early_candidates: usize,
    tracks: Vec<LocalTrack>,
    failing: HashSet<FakeOp>,
    stalled: HashSet<FakeOp>,
    version: u32,
    closes: usize,
    connected: bool,
    remote_tracks_sent: bool,
}

/// Детерминированный примитив соединения: пишет журнал операций,
/// выдаёт кандидаты после set_local и сообщает Connected, когда
/// обе стороны описаны и применён хотя бы один удалённый кандидат.
pub struct FakeConnection {
    label: String,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Mutex<FakeConnectionState>,
}

impl FakeConnection {
    pub fn new(label: impl Into<String>, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            label: label.into(),
            events,
            state: Mutex::new(FakeConnectionState::default()),
        }
    }

    /// SDP с DTLS fingerprint, выведенным из метки
    pub fn sdp_for(label: &str, kind: &str) -> String {
        let digest = Sha256::digest(label.as_bytes());
        let fingerprint = digest[..8]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\na=x-kind:{}\r\na=fingerprint:sha-256 {}\r\n",
            label, kind, fingerprint
        )
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn fail(&self, op: FakeOp) {
        lock(&self.state).failing.insert(op);
    }

    /// Операция никогда не завершится
    pub fn stall(&self, op: FakeOp) {
        lock(&self.state).stalled.insert(op);
    }

    /// Подать событие так, как будто его сообщил примитив
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn ops(&self) -> Vec<String> {
        lock(&self.state).ops.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        lock(&self.state).ops.iter().filter(|o| *o == op).count()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).applied.clone()
    }

    /// Попытки применить кандидат до remote description
    pub fn early_candidates(&self) -> usize {
        lock(&self.state).early_candidates
    }

    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        lock(&self.state).tracks.clone()
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    /// Записывает операцию; возвращает (сломана, подвешена)
    fn record(&self, op: FakeOp, name: String) -> (bool, bool) {
        let mut st = lock(&self.state);
        st.ops.push(name);
        (st.failing.contains(&op), st.stalled.contains(&op))
    }

    async fn enter(&self, op: FakeOp, name: impl Into<String>) -> Result<(), ConnectionError> {
        let (failing, stalled) = self.record(op, name.into());
        if stalled {
            std::future::pending::<()>().await;
        }
        if failing {
            return Err(ConnectionError(format!("{:?} failed", op)));
        }
        Ok(())
    }

    fn maybe_connect(&self, st: &mut FakeConnectionState) {
        if st.connected || st.closes > 0 {
            return;
        }
        if st.local.is_some() && st.remote.is_some() && !st.applied.is_empty() {
            st.connected = true;
            self.emit(ConnectionEvent::StateChanged(PeerConnectionState::Connecting));
            self.emit(ConnectionEvent::StateChanged(PeerConnectionState::Connected));
        }
    }

    fn host_candidate(&self, n: u8) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 10.0.0.{} 5000{} typ host ufrag {}",
                n, n, n, self.label
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn description(&self, kind: SdpKind) -> SessionDescription {
        let mut st = lock(&self.state);
        st.version += 1;
        let sdp = format!(
            "{}a=x-version:{}\r\n",
            Self::sdp_for(&self.label, &format!("{:?}", kind).to_lowercase()),
            st.version
        );
        SessionDescription { kind, sdp }
    }
}

fn kind_name(kind: SdpKind) -> &'static str {
    match kind {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
    }
}

#[async_trait]
impl NegotiableConnection for FakeConnection {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), ConnectionError> {
        self.enter(FakeOp::AddTrack, "add_track").await?;
        lock(&self.state).tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        self.enter(FakeOp::CreateOffer, "create_offer").await?;
        Ok(self.description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        self.enter(FakeOp::CreateAnswer, "create_answer").await?;
        if lock(&self.state).remote.is_none() {
            return Err(ConnectionError("no remote offer".into()));
        }
        Ok(self.description(SdpKind::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), ConnectionError> {
        self.enter(
            FakeOp::SetLocalDescription,
            format!("set_local:{}", kind_name(desc.kind)),
        )
        .await?;
        let first = {
            let mut st = lock(&self.state);
            let first = st.local.is_none();
            st.local = Some(desc);
            first
        };
        if first {
            self.emit(ConnectionEvent::LocalCandidate(self.host_candidate(1)));
            self.emit(ConnectionEvent::LocalCandidate(self.host_candidate(2)));
            self.emit(ConnectionEvent::GatheringComplete);
        }
        let mut st = lock(&self.state);
        self.maybe_connect(&mut st);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.enter(
            FakeOp::SetRemoteDescription,
            format!("set_remote:{}", kind_name(desc.kind)),
        )
        .await?;
        if !desc.sdp.starts_with("v=0") {
            return Err(ConnectionError("malformed sdp".into()));
        }
        let mut st = lock(&self.state);
        st.remote = Some(desc);
        if !st.remote_tracks_sent {
            st.remote_tracks_sent = true;
            let stream_id = format!("remote-{}", self.label);
            for (id, kind) in [("remote-audio", TrackKind::Audio), ("remote-video", TrackKind::Video)] {
                self.emit(ConnectionEvent::RemoteTrack(RemoteTrack {
                    id: id.to_string(),
                    stream_id: stream_id.clone(),
                    kind,
                }));
            }
        }
        self.maybe_connect(&mut st);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ConnectionError> {
        self.enter(FakeOp::Rollback, "rollback").await?;
        lock(&self.state).local = None;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.enter(FakeOp::AddIceCandidate, "add_candidate").await?;
        let mut st = lock(&self.state);
        if st.remote.is_none() {
            st.early_candidates += 1;
            return Err(ConnectionError("remote description not set".into()));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(ConnectionError(format!(
                "malformed candidate: {}",
                candidate.candidate
            )));
        }
        st.applied.push(candidate);
        self.maybe_connect(&mut st);
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let (failing, _) = self.record(FakeOp::Close, "close".into());
        lock(&self.state).closes += 1;
        self.emit(ConnectionEvent::StateChanged(PeerConnectionState::Closed));
        if failing {
            return Err(ConnectionError("close failed".into()));
        }
        Ok(())
    }
}

/// Фабрика FakeConnection; запоминает все созданные соединения
#[derive(Default)]
pub struct FakeConnectionFactory {
    created: Mutex<Vec<Arc<FakeConnection>>>,
    failing: Mutex<Vec<FakeOp>>,
    stalled: Mutex<Vec<FakeOp>>,
    refuse: AtomicBool,
}

impl FakeConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Следующие create() завершатся ошибкой
    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Сломать операцию у всех последующих соединений
    pub fn fail(&self, op: FakeOp) {
        lock(&self.failing).push(op);
    }

    pub fn stall(&self, op: FakeOp) {
        lock(&self.stalled).push(op);
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        lock(&self.created).clone()
    }

    pub fn last(&self) -> Option<Arc<FakeConnection>> {
        lock(&self.created).last().cloned()
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn NegotiableConnection>, ConnectionError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError("peer connection unavailable".into()));
        }
        let conn = Arc::new(FakeConnection::new(format!("pc-{}", random_id()), events));
        for op in lock(&self.failing).iter() {
            conn.fail(*op);
        }
        for op in lock(&self.stalled).iter() {
            conn.stall(*op);
        }
        lock(&self.created).push(conn.clone());
        Ok(conn)
    }
}

/// Транспорт, который не принимает подписки
pub struct RefusingTransport;

#[async_trait]
impl PubSubTransport for RefusingTransport {
    async fn subscribe(
        &self,
        topic: &str,
        _member_id: &str,
    ) -> Result<Subscription, TransportError> {
        Err(TransportError(format!("subscribe to {} refused", topic)))
    }
}

/// Обёртка над MemoryRelay, считающая публикации и отписки
#[derive(Clone, Default)]
pub struct RecordingTransport {
    relay: MemoryRelay,
    publishes: Arc<AtomicUsize>,
    unsubscribes: Arc<AtomicUsize>,
    fail_unsubscribe: Arc<AtomicBool>,
}

impl RecordingTransport {
    pub fn new(relay: MemoryRelay) -> Self {
        Self {
            relay,
            ..Self::default()
        }
    }

    pub fn publish_count(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    /// Отписка отработает, но вернёт ошибку
    pub fn fail_unsubscribe(&self) {
        self.fail_unsubscribe.store(true, Ordering::SeqCst);
    }
}

struct RecordingHandle {
    inner: Arc<dyn SubscriptionHandle>,
    publishes: Arc<AtomicUsize>,
    unsubscribes: Arc<AtomicUsize>,
    fail_unsubscribe: Arc<AtomicBool>,
}

#[async_trait]
impl SubscriptionHandle for RecordingHandle {
    async fn publish(&self, payload: String) -> Result<(), TransportError> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        self.inner.publish(payload).await
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.inner.unsubscribe().await?;
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(TransportError("unsubscribe acknowledgement lost".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubTransport for RecordingTransport {
    async fn subscribe(
        &self,
        topic: &str,
        member_id: &str,
    ) -> Result<Subscription, TransportError> {
        let sub = self.relay.subscribe(topic, member_id).await?;
        Ok(Subscription {
            handle: Arc::new(RecordingHandle {
                inner: sub.handle,
                publishes: self.publishes.clone(),
                unsubscribes: self.unsubscribes.clone(),
                fail_unsubscribe: self.fail_unsubscribe.clone(),
            }),
            events: sub.events,
        })
    }
}
