use coach_rtc::peer::{ConnectionEvent, IceCandidate, PeerConnectionState, SessionDescription};
use coach_rtc::signaling::{
    MessageKind, SignalingMessage, Subscription, SubscriptionHandle, TransportEvent,
};
use coach_rtc::testing::{
    CaptureBehavior, FakeCaptureDevice, FakeConnection, FakeConnectionFactory, FakeOp,
    RecordingTransport, RefusingTransport,
};
use coach_rtc::{
    CallConfig, CallController, CallError, CallSnapshot, CallState, MemoryRelay, PubSubTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const TOPIC: &str = "coaching-session:s1";

struct Peer {
    controller: CallController,
    device: Arc<FakeCaptureDevice>,
    connections: Arc<FakeConnectionFactory>,
    transport: RecordingTransport,
}

impl Peer {
    fn connection(&self) -> Arc<FakeConnection> {
        self.connections.last().expect("connection created")
    }
}

fn config() -> CallConfig {
    CallConfig {
        ice_servers: vec![],
        connect_timeout_ms: Some(5_000),
        ..CallConfig::default()
    }
}

fn peer_with(relay: &MemoryRelay, config: CallConfig, behavior: CaptureBehavior) -> Peer {
    let device = Arc::new(FakeCaptureDevice::with_behavior(behavior));
    let connections = Arc::new(FakeConnectionFactory::new());
    let transport = RecordingTransport::new(relay.clone());
    let controller = CallController::new(
        config,
        Arc::new(transport.clone()),
        device.clone(),
        connections.clone(),
    )
    .unwrap();
    Peer {
        controller,
        device,
        connections,
        transport,
    }
}

fn peer(relay: &MemoryRelay) -> Peer {
    peer_with(relay, config(), CaptureBehavior::Grant)
}

async fn wait_for(
    controller: &CallController,
    mut pred: impl FnMut(&CallSnapshot) -> bool,
) -> CallSnapshot {
    let mut rx = controller.subscribe();
    timeout(Duration::from_secs(3), async {
        rx.wait_for(|s| pred(s)).await.map(|s| s.clone())
    })
    .await
    .expect("snapshot condition not reached in time")
    .expect("controller alive")
}

async fn wait_state(controller: &CallController, state: CallState) -> CallSnapshot {
    wait_for(controller, |s| s.lifecycle == state).await
}

async fn connected_pair(relay: &MemoryRelay) -> (Peer, Peer) {
    let a = peer(relay);
    let b = peer(relay);
    a.controller.start_call("s1", "userA").await.unwrap();
    sleep(Duration::from_millis(50)).await;
    b.controller.start_call("s1", "userB").await.unwrap();
    wait_state(&a.controller, CallState::Connected).await;
    wait_state(&b.controller, CallState::Connected).await;
    (a, b)
}

async fn next_message(sub: &mut Subscription) -> SignalingMessage {
    loop {
        let event = timeout(Duration::from_secs(2), sub.events.recv())
            .await
            .expect("message in time")
            .expect("subscription open");
        if let TransportEvent::Message(raw) = event {
            return SignalingMessage::from_wire(&raw).unwrap();
        }
    }
}

#[tokio::test]
async fn first_joiner_initiates_and_both_connect() {
    let relay = MemoryRelay::new();
    let (a, b) = connected_pair(&relay).await;

    let a_conn = a.connection();
    let b_conn = b.connection();
    assert_eq!(a_conn.count("create_offer"), 1);
    assert_eq!(a_conn.count("create_answer"), 0);
    assert_eq!(b_conn.count("create_offer"), 0);
    assert_eq!(b_conn.count("create_answer"), 1);
    assert_eq!(a_conn.early_candidates(), 0);
    assert_eq!(b_conn.early_candidates(), 0);
    assert_eq!(a_conn.local_tracks().len(), 2);

    let sa = a.controller.snapshot();
    let sb = b.controller.snapshot();
    assert_eq!(sa.peer_id.as_deref(), Some("userB"));
    assert_eq!(sb.peer_id.as_deref(), Some("userA"));
    assert!(sa.has_remote_stream());
    assert!(sb.has_remote_stream());
    assert!(sa.local_stream.is_some());
    assert!(sa.camera_enabled && sa.microphone_enabled);
    assert!(sa.verification_code.is_some());
    assert_eq!(sa.verification_code, sb.verification_code);
    assert_eq!(sa.error, None);
}

#[tokio::test]
async fn offer_goes_to_newcomer_and_answer_comes_back() {
    let relay = MemoryRelay::new();
    let a = peer(&relay);
    a.controller.start_call("s1", "userA").await.unwrap();

    // B представлен "сырым" участником топика
    let mut b = relay.subscribe(TOPIC, "userB").await.unwrap();
    let offer = loop {
        let msg = next_message(&mut b).await;
        if msg.from == "userA" && msg.kind == MessageKind::Offer {
            break msg;
        }
    };
    assert_eq!(offer.to, "userB");
    assert_eq!(offer.session_id, "s1");

    let desc: SessionDescription = serde_json::from_value(offer.payload.unwrap()).unwrap();
    let answer = SessionDescription::answer(FakeConnection::sdp_for("userB", "answer"));
    let reply = SignalingMessage::description("s1", "userB", "userA", &answer);
    b.handle.publish(reply.to_wire().unwrap()).await.unwrap();

    let conn = a.connection();
    timeout(Duration::from_secs(2), async {
        while conn.remote_description().is_none() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(conn.local_description(), Some(desc));
    assert_eq!(conn.remote_description(), Some(answer));
}

#[tokio::test]
async fn early_candidate_is_buffered_until_offer_applied() {
    let relay = MemoryRelay::new();
    // A уже в топике, B приходит вторым и ждёт offer
    let mut a = relay.subscribe(TOPIC, "userA").await.unwrap();
    let b = peer(&relay);
    b.controller.start_call("s1", "userB").await.unwrap();

    let call_start = next_message(&mut a).await;
    assert_eq!(call_start.kind, MessageKind::CallStart);
    assert_eq!(call_start.from, "userB");

    let candidate = IceCandidate {
        candidate: "candidate:7 1 udp 1686052607 203.0.113.7 40000 typ srflx".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    };
    let early = SignalingMessage::candidate("s1", "userA", "userB", &candidate);
    a.handle.publish(early.to_wire().unwrap()).await.unwrap();

    sleep(Duration::from_millis(50)).await;
    let conn = b.connection();
    assert!(conn.applied_candidates().is_empty());
    assert_eq!(conn.count("add_candidate"), 0);

    let offer = SessionDescription::offer(FakeConnection::sdp_for("userA", "offer"));
    let msg = SignalingMessage::description("s1", "userA", "userB", &offer);
    a.handle.publish(msg.to_wire().unwrap()).await.unwrap();

    let answer = loop {
        let msg = next_message(&mut a).await;
        if msg.kind == MessageKind::Answer {
            break msg;
        }
    };
    assert_eq!(answer.to, "userA");
    assert_eq!(conn.applied_candidates(), vec![candidate]);
    assert_eq!(conn.early_candidates(), 0);

    // удалённая сторона описана и кандидат применён: соединение установлено
    wait_state(&b.controller, CallState::Connected).await;
}

#[tokio::test]
async fn end_call_while_connecting_sends_nothing() {
    let relay = MemoryRelay::new();
    let a = peer(&relay);
    a.controller.start_call("s1", "userA").await.unwrap();
    assert_eq!(a.controller.state(), CallState::Connecting);
    assert_eq!(a.device.live_tracks(), 2);

    a.controller.end_call().await;

    let snap = a.controller.snapshot();
    assert_eq!(snap.lifecycle, CallState::Ended);
    assert_eq!(snap.local_stream, None);
    assert_eq!(snap.error, None);
    assert_eq!(a.transport.publish_count(), 0);
    assert_eq!(a.transport.unsubscribe_count(), 1);
    assert_eq!(a.device.live_tracks(), 0);
    assert_eq!(a.connection().close_count(), 1);
    assert!(relay.members(TOPIC).is_empty());
}

#[tokio::test]
async fn cleanup_runs_once_even_when_steps_fail() {
    let relay = MemoryRelay::new();
    let (a, b) = connected_pair(&relay).await;
    a.connection().fail(FakeOp::Close);
    a.transport.fail_unsubscribe();

    a.controller.end_call().await;
    a.controller.end_call().await;

    let snap = a.controller.snapshot();
    assert_eq!(snap.lifecycle, CallState::Ended);
    assert!(matches!(snap.error, Some(CallError::ConnectionFailed(_))));
    assert_eq!(a.connection().close_count(), 1);
    assert_eq!(a.transport.unsubscribe_count(), 1);
    assert_eq!(a.device.live_tracks(), 0);
    assert!(a.device.opened().iter().all(|t| t.stop_count() == 1));

    // call-end ушёл к B
    let sb = wait_state(&b.controller, CallState::Ended).await;
    assert_eq!(sb.error, None);
    assert_eq!(b.connection().close_count(), 1);
}

#[tokio::test]
async fn remote_hangup_ends_call_without_echo() {
    let relay = MemoryRelay::new();
    let (a, b) = connected_pair(&relay).await;
    let published_by_a = a.transport.publish_count();

    b.controller.end_call().await;
    let sa = wait_state(&a.controller, CallState::Ended).await;

    assert_eq!(sa.error, None);
    assert!(!sa.has_remote_stream());
    assert_eq!(a.transport.publish_count(), published_by_a);
    assert_eq!(a.device.live_tracks(), 0);
    assert_eq!(a.connection().close_count(), 1);
}

#[tokio::test]
async fn start_call_is_noop_while_active() {
    let relay = MemoryRelay::new();
    let a = peer(&relay);
    a.controller.start_call("s1", "userA").await.unwrap();
    a.controller.start_call("s1", "userA").await.unwrap();
    a.controller.start_call("s2", "userA").await.unwrap();

    assert_eq!(a.connections.connections().len(), 1);
    assert_eq!(a.device.opened().len(), 2);
    assert_eq!(relay.members(TOPIC), vec!["userA"]);
    assert!(relay.members("coaching-session:s2").is_empty());
    a.controller.end_call().await;
}

#[tokio::test]
async fn restart_after_end_uses_fresh_resources() {
    let relay = MemoryRelay::new();
    let a = peer(&relay);
    a.controller.start_call("s1", "userA").await.unwrap();
    a.controller.end_call().await;
    a.controller.start_call("s1", "userA").await.unwrap();

    assert_eq!(a.controller.state(), CallState::Connecting);
    assert_eq!(a.connections.connections().len(), 2);
    assert_eq!(a.device.live_tracks(), 2);
    assert_eq!(relay.members(TOPIC), vec!["userA"]);
    a.controller.end_call().await;
}

#[tokio::test]
async fn end_call_from_idle_is_safe() {
    let relay = MemoryRelay::new();
    let a = peer(&relay);
    a.controller.end_call().await;
    assert_eq!(a.controller.state(), CallState::Ended);
    assert_eq!(a.transport.unsubscribe_count(), 0);
    assert!(!a.controller.toggle_camera().await);
}

#[tokio::test]
async fn media_denied_fails_setup_and_touches_nothing_else() {
    let relay = MemoryRelay::new();
    let a = peer_with(&relay, config(), CaptureBehavior::Deny);

    let err = a.controller.start_call("s1", "userA").await.unwrap_err();
    assert!(matches!(err, CallError::MediaAccessDenied(_)));

    let snap = a.controller.snapshot();
    assert_eq!(snap.lifecycle, CallState::Failed);
    assert_eq!(snap.error, Some(err));
    assert!(relay.members(TOPIC).is_empty());
    assert!(a.connections.connections().is_empty());

    a.controller.end_call().await;
    assert_eq!(a.controller.state(), CallState::Ended);
}

#[tokio::test]
async fn channel_refusal_releases_media() {
    let device = Arc::new(FakeCaptureDevice::new());
    let connections = Arc::new(FakeConnectionFactory::new());
    let controller = CallController::new(
        config(),
        Arc::new(RefusingTransport),
        device.clone(),
        connections.clone(),
    )
    .unwrap();

    let err = controller.start_call("s1", "userA").await.unwrap_err();
    assert!(matches!(err, CallError::ChannelJoin(_)));
    assert_eq!(device.opened().len(), 2);
    assert_eq!(device.live_tracks(), 0);
    assert!(connections.connections().is_empty());
    assert_eq!(controller.state(), CallState::Failed);
}

#[tokio::test]
async fn connection_refusal_leaves_channel() {
    let relay = MemoryRelay::new();
    let a = peer(&relay);
    a.connections.refuse();

    let err = a.controller.start_call("s1", "userA").await.unwrap_err();
    assert!(matches!(err, CallError::Negotiation { .. }));
    assert_eq!(a.transport.unsubscribe_count(), 1);
    assert_eq!(a.device.live_tracks(), 0);
    assert!(relay.members(TOPIC).is_empty());
}

#[tokio::test]
async fn connect_timeout_moves_call_to_failed() {
    let relay = MemoryRelay::new();
    let a = peer_with(
        &relay,
        CallConfig {
            connect_timeout_ms: Some(100),
            ..config()
        },
        CaptureBehavior::Grant,
    );
    a.controller.start_call("s1", "userA").await.unwrap();

    let snap = wait_state(&a.controller, CallState::Failed).await;
    assert!(matches!(snap.error, Some(CallError::ConnectionFailed(_))));
    // таймаут не завершает звонок сам
    assert_eq!(a.device.live_tracks(), 2);

    a.controller.end_call().await;
    assert_eq!(a.controller.state(), CallState::Ended);
    assert_eq!(a.device.live_tracks(), 0);
}

#[tokio::test]
async fn end_preempts_stalled_negotiation() {
    let relay = MemoryRelay::new();
    let a = peer(&relay);
    let b = peer(&relay);
    a.connections.stall(FakeOp::CreateOffer);

    a.controller.start_call("s1", "userA").await.unwrap();
    b.controller.start_call("s1", "userB").await.unwrap();

    let conn = a.connection();
    timeout(Duration::from_secs(2), async {
        while conn.count("create_offer") == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // тоглы обслуживаются, пока шаг висит
    assert!(!a.controller.toggle_camera().await);

    timeout(Duration::from_secs(2), a.controller.end_call())
        .await
        .expect("end_call must not wait for the stalled step");
    assert_eq!(a.controller.state(), CallState::Ended);
    assert_eq!(conn.close_count(), 1);
    assert_eq!(conn.count("set_local:offer"), 0);

    // A уже знал B, поэтому отправил call-end
    wait_state(&b.controller, CallState::Ended).await;
}

#[tokio::test]
async fn end_call_interrupts_pending_capture() {
    let relay = MemoryRelay::new();
    let a = Arc::new(peer_with(&relay, config(), CaptureBehavior::Hang));
    let starting = tokio::spawn({
        let a = a.clone();
        async move { a.controller.start_call("s1", "userA").await }
    });
    wait_state(&a.controller, CallState::Connecting).await;

    let toggling = tokio::spawn({
        let a = a.clone();
        async move { a.controller.toggle_camera().await }
    });
    timeout(Duration::from_secs(2), a.controller.end_call())
        .await
        .expect("end_call must not wait for the capture prompt");

    let snap = a.controller.snapshot();
    assert_eq!(snap.lifecycle, CallState::Ended);
    assert_eq!(snap.error, None);
    assert_eq!(snap.local_stream, None);
    // отмена пользователем не считается ошибкой настройки
    timeout(Duration::from_secs(2), starting)
        .await
        .expect("start_call returns after end_call")
        .unwrap()
        .unwrap();
    assert!(!toggling.await.unwrap());

    assert!(a.device.opened().is_empty());
    assert!(a.connections.connections().is_empty());
    assert!(relay.members(TOPIC).is_empty());
    assert_eq!(a.transport.publish_count(), 0);

    // повторный end_call ничего не ломает
    a.controller.end_call().await;
    assert_eq!(a.controller.state(), CallState::Ended);
}

#[tokio::test]
async fn toggles_are_reflected_in_snapshot() {
    let relay = MemoryRelay::new();
    let a = peer(&relay);
    a.controller.start_call("s1", "userA").await.unwrap();

    assert!(!a.controller.toggle_camera().await);
    assert!(!a.controller.toggle_microphone().await);
    let snap = a.controller.snapshot();
    assert!(!snap.camera_enabled);
    assert!(!snap.microphone_enabled);
    assert_eq!(a.device.opened().len(), 2);

    assert!(a.controller.toggle_camera().await);
    assert!(a.controller.snapshot().camera_enabled);
    a.controller.end_call().await;
    assert!(!a.controller.toggle_microphone().await);
}

#[tokio::test]
async fn transport_failure_is_reported_and_recoverable() {
    let relay = MemoryRelay::new();
    let (a, _b) = connected_pair(&relay).await;
    let conn = a.connection();

    conn.emit(ConnectionEvent::StateChanged(PeerConnectionState::Disconnected));
    let snap = wait_state(&a.controller, CallState::Failed).await;
    assert!(matches!(snap.error, Some(CallError::ConnectionFailed(_))));
    assert_eq!(a.device.live_tracks(), 2);

    conn.emit(ConnectionEvent::StateChanged(PeerConnectionState::Connected));
    wait_state(&a.controller, CallState::Connected).await;
}

#[tokio::test]
async fn peer_leaving_clears_peer_id_and_ignores_newcomers() {
    let relay = MemoryRelay::new();
    let a = relay.subscribe(TOPIC, "userA").await.unwrap();
    let b = peer(&relay);
    b.controller.start_call("s1", "userB").await.unwrap();

    wait_for(&b.controller, |s| s.peer_id.as_deref() == Some("userA")).await;
    a.handle.unsubscribe().await.unwrap();
    let snap = wait_for(&b.controller, |s| s.peer_id.is_none()).await;
    assert_eq!(snap.lifecycle, CallState::Connecting);

    // новичок после ухода участника не получает ни offer, ни call-start
    let mut c = relay.subscribe(TOPIC, "userC").await.unwrap();
    sleep(Duration::from_millis(200)).await;
    while let Ok(event) = c.events.try_recv() {
        assert!(!matches!(event, TransportEvent::Message(_)), "unexpected {:?}", event);
    }
    assert_eq!(b.controller.snapshot().peer_id, None);
    assert_eq!(b.connection().count("create_offer"), 0);
    assert_eq!(b.connection().count("set_remote:offer"), 0);

    // битое сообщение от постороннего не роняет звонок
    let mut stray = SignalingMessage::call_start("s1", "userC", "userB");
    stray.kind = MessageKind::IceCandidate;
    c.handle.publish(stray.to_wire().unwrap()).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    let snap = b.controller.snapshot();
    assert_eq!(snap.lifecycle, CallState::Connecting);
    assert_eq!(snap.error, None);
    b.controller.end_call().await;
}

#[tokio::test]
async fn concurrent_starts_still_pick_one_initiator() {
    let relay = MemoryRelay::new();
    let a = peer(&relay);
    let b = peer(&relay);
    let (ra, rb) = tokio::join!(
        a.controller.start_call("s1", "userA"),
        b.controller.start_call("s1", "userB")
    );
    ra.unwrap();
    rb.unwrap();

    wait_state(&a.controller, CallState::Connected).await;
    wait_state(&b.controller, CallState::Connected).await;
    let offers = a.connection().count("create_offer") + b.connection().count("create_offer");
    let rollbacks = a.connection().count("rollback") + b.connection().count("rollback");
    assert_eq!(offers - rollbacks, 1);
}
