use crate::config::CallConfig;
use crate::error::{CallError, NegotiationStep, Result};
use crate::media::{CaptureDevice, LocalStream, MediaSourceManager};
use crate::peer::connection::ConnectionFactory;
use crate::peer::negotiation::{NegotiationEngine, NegotiationEvent, NegotiationOutcome};
use crate::peer::state::{CallState, ConnectionStateMachine, LifecycleEvent};
use crate::peer::types::{ConnectionEvent, PeerConnectionState, RemoteTrack, SessionIdentity};
use crate::signaling::{PubSubTransport, SignalingChannel};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Наблюдаемое состояние звонка для UI
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallSnapshot {
    pub lifecycle: CallState,
    pub session: Option<SessionIdentity>,
    pub local_stream: Option<LocalStream>,
    pub remote_tracks: Vec<RemoteTrack>,
    pub peer_id: Option<String>,
    /// Последняя ошибка; более поздняя заменяет предыдущую
    pub error: Option<CallError>,
    pub camera_enabled: bool,
    pub microphone_enabled: bool,
    pub verification_code: Option<String>,
}

impl CallSnapshot {
    pub fn has_remote_stream(&self) -> bool {
        !self.remote_tracks.is_empty()
    }
}

pub(crate) enum Command {
    ToggleCamera(oneshot::Sender<bool>),
    ToggleMicrophone(oneshot::Sender<bool>),
    End(oneshot::Sender<()>),
}

/// Зависимости одного звонка
pub(crate) struct CallDeps {
    pub transport: Arc<dyn PubSubTransport>,
    pub device: Arc<dyn CaptureDevice>,
    pub connections: Arc<dyn ConnectionFactory>,
}

/// Один звонок: владеет медиа, каналом, движком согласования и машиной
/// состояний. Все события обрабатываются по одному в `run`.
pub(crate) struct CallSession {
    identity: SessionIdentity,
    config: CallConfig,
    media: MediaSourceManager,
    channel: SignalingChannel,
    connections: Arc<dyn ConnectionFactory>,
    engine: Option<NegotiationEngine>,
    connection_tx: mpsc::UnboundedSender<ConnectionEvent>,
    connection_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    machine: ConnectionStateMachine,
    snapshot: Arc<watch::Sender<CallSnapshot>>,
}

impl CallSession {
    pub(crate) fn new(
        identity: SessionIdentity,
        config: CallConfig,
        deps: CallDeps,
        snapshot: Arc<watch::Sender<CallSnapshot>>,
    ) -> Self {
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        Self {
            media: MediaSourceManager::new(deps.device, config.media.clone()),
            channel: SignalingChannel::new(deps.transport, config.topic_prefix.clone()),
            connections: deps.connections,
            identity,
            config,
            engine: None,
            connection_tx,
            connection_rx,
            machine: ConnectionStateMachine::new(),
            snapshot,
        }
    }

    fn ended(&self) -> bool {
        self.machine.state() == CallState::Ended
    }

    fn advance(&mut self, event: LifecycleEvent) -> bool {
        match self.machine.apply(event) {
            Some(transition) => {
                self.snapshot.send_modify(|s| s.lifecycle = transition.to);
                true
            }
            None => false,
        }
    }

    fn report(&self, err: CallError) {
        error!("Call {}: {}", self.identity.session_id, err);
        self.snapshot.send_modify(|s| s.error = Some(err));
    }

    /// Сбрасывает снимок и переводит звонок в `connecting`
    pub(crate) fn begin(&mut self) {
        self.snapshot.send_replace(CallSnapshot {
            session: Some(self.identity.clone()),
            ..CallSnapshot::default()
        });
        self.advance(LifecycleEvent::CallStarted);
    }

    /// Тело задачи звонка: настройка, затем цикл диспетчеризации.
    /// Итог настройки уходит в `ready`.
    pub(crate) async fn start(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let result = self.establish(&mut commands).await;
        let proceed = result.is_ok() && !self.ended();
        let _ = ready.send(result);
        if proceed {
            self.run(commands).await;
        }
    }

    /// Медиа, канал, соединение, треки. При ошибке всё частично
    /// созданное освобождается, звонок переходит в `failed`.
    /// Команда end прерывает настройку на любом шаге.
    async fn establish(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Result<()> {
        let mut deferred = Vec::new();
        let mut end_reply = None;
        let result = {
            let setup = self.setup();
            tokio::pin!(setup);
            loop {
                tokio::select! {
                    biased;
                    result = &mut setup => break Some(result),
                    command = commands.recv() => match command {
                        Some(Command::End(reply)) => {
                            end_reply = Some(reply);
                            break None;
                        }
                        // до появления медиа переключать нечего
                        Some(toggle) => deferred.push(toggle),
                        None => break None,
                    },
                }
            }
        };

        match result {
            Some(Ok(())) => {
                for command in deferred {
                    self.on_command(command).await;
                }
                Ok(())
            }
            Some(Err(e)) => {
                warn!("Call setup failed, cleaning up: {}", e);
                if let Err(leave_err) = self.channel.leave().await {
                    warn!("Failed to leave channel after setup failure: {}", leave_err);
                }
                self.media.release();
                if let Some(mut engine) = self.engine.take() {
                    if let Err(close_err) = engine.close().await {
                        warn!("Failed to close connection after setup failure: {}", close_err);
                    }
                }
                self.snapshot.send_modify(|s| {
                    s.local_stream = None;
                    s.camera_enabled = false;
                    s.microphone_enabled = false;
                });
                self.report(e.clone());
                self.advance(LifecycleEvent::SetupFailed);
                Err(e)
            }
            None => {
                info!("Call setup abandoned, ending call");
                self.finish(true).await;
                if let Some(reply) = end_reply {
                    let _ = reply.send(());
                }
                Ok(())
            }
        }
    }

    async fn setup(&mut self) -> Result<()> {
        let stream = self.media.acquire().await?;
        let media_state = self.media.state();
        self.snapshot.send_modify(|s| {
            s.local_stream = Some(stream.clone());
            s.camera_enabled = media_state.camera_enabled;
            s.microphone_enabled = media_state.microphone_enabled;
        });

        self.channel
            .join(&self.identity.session_id, &self.identity.local_user_id)
            .await?;
        let sender = self.channel.sender().ok_or_else(|| {
            CallError::ChannelJoin("channel has no membership after join".into())
        })?;

        let connection = self
            .connections
            .create(self.connection_tx.clone())
            .await
            .map_err(|e| CallError::negotiation(NegotiationStep::CreateConnection, e))?;
        let engine = self.engine.insert(NegotiationEngine::new(connection, sender));

        let outcomes = engine
            .handle(NegotiationEvent::LocalMediaReady(stream.tracks))
            .await;
        for outcome in outcomes {
            if let NegotiationOutcome::Failed(e) = outcome {
                return Err(e);
            }
        }
        self.advance(LifecycleEvent::MediaAttached);
        Ok(())
    }

    /// Цикл диспетчеризации звонка. Завершается вместе со звонком.
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let deadline = self.config.connect_timeout().map(|d| Instant::now() + d);

        while !self.ended() {
            let timer_armed = deadline.is_some() && self.machine.state() == CallState::Connecting;
            let wake_at = deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!("Controller gone, ending call {}", self.identity.session_id);
                        self.finish(true).await;
                    }
                },
                event = self.channel.recv() => match event {
                    Some(event) => self.dispatch(event.into(), &mut commands).await,
                    None => {
                        self.report(CallError::ChannelJoin("signaling subscription closed".into()));
                        self.finish(false).await;
                    }
                },
                Some(event) = self.connection_rx.recv() => {
                    self.dispatch(event.into(), &mut commands).await
                }
                _ = sleep_until(wake_at), if timer_armed => self.on_connect_timeout(),
            }
        }
        debug!("Call loop for {} stopped", self.identity.session_id);
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::ToggleCamera(reply) => {
                let enabled = self.media.toggle_video();
                publish_media(&self.snapshot, &self.media);
                let _ = reply.send(enabled);
            }
            Command::ToggleMicrophone(reply) => {
                let enabled = self.media.toggle_audio();
                publish_media(&self.snapshot, &self.media);
                let _ = reply.send(enabled);
            }
            Command::End(reply) => {
                self.finish(true).await;
                let _ = reply.send(());
            }
        }
    }

    /// Передаёт событие движку. Команда end прерывает незавершённый шаг:
    /// его результат отбрасывается.
    async fn dispatch(
        &mut self,
        event: NegotiationEvent,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };

        let mut end_reply = None;
        let outcomes = {
            let handling = engine.handle(event);
            tokio::pin!(handling);
            loop {
                tokio::select! {
                    biased;
                    outcomes = &mut handling => break Some(outcomes),
                    command = commands.recv() => match command {
                        Some(Command::ToggleCamera(reply)) => {
                            let enabled = self.media.toggle_video();
                            publish_media(&self.snapshot, &self.media);
                            let _ = reply.send(enabled);
                        }
                        Some(Command::ToggleMicrophone(reply)) => {
                            let enabled = self.media.toggle_audio();
                            publish_media(&self.snapshot, &self.media);
                            let _ = reply.send(enabled);
                        }
                        Some(Command::End(reply)) => {
                            end_reply = Some(reply);
                            break None;
                        }
                        None => break None,
                    },
                }
            }
        };

        let Some(outcomes) = outcomes else {
            info!("Negotiation step abandoned, ending call");
            self.finish(true).await;
            if let Some(reply) = end_reply {
                let _ = reply.send(());
            }
            return;
        };

        for outcome in outcomes {
            if self.ended() {
                break;
            }
            self.apply_outcome(outcome).await;
        }
    }

    async fn apply_outcome(&mut self, outcome: NegotiationOutcome) {
        match outcome {
            NegotiationOutcome::PeerDiscovered { peer, role } => {
                info!("Peer {} discovered, local role {:?}", peer.peer_id, role);
                self.snapshot.send_modify(|s| s.peer_id = Some(peer.peer_id));
            }
            NegotiationOutcome::PeerLost { peer_id } => {
                self.snapshot.send_modify(|s| {
                    if s.peer_id.as_deref() == Some(peer_id.as_str()) {
                        s.peer_id = None;
                    }
                    s.remote_tracks.clear();
                    s.verification_code = None;
                });
            }
            NegotiationOutcome::RemoteHangup { peer_id } => {
                info!("Call ended by {}", peer_id);
                self.finish(false).await;
            }
            NegotiationOutcome::ConnectionState(st) => self.on_transport(st),
            NegotiationOutcome::RemoteStream(track) => {
                self.snapshot.send_modify(|s| {
                    if !s.remote_tracks.iter().any(|t| t.id == track.id) {
                        s.remote_tracks.push(track);
                    }
                });
            }
            NegotiationOutcome::Negotiated { verification_code } => {
                if let Some(code) = &verification_code {
                    info!("Negotiation complete, verification code {}", code);
                }
                self.snapshot
                    .send_modify(|s| s.verification_code = verification_code);
            }
            NegotiationOutcome::Failed(e) => {
                self.report(e);
                self.advance(LifecycleEvent::SetupFailed);
            }
        }
    }

    fn on_transport(&mut self, st: PeerConnectionState) {
        let was = self.machine.state();
        if self.advance(LifecycleEvent::Transport(st)) && self.machine.state() == CallState::Failed
        {
            self.report(CallError::ConnectionFailed(format!(
                "connection reported {:?} while {}",
                st, was
            )));
        }
    }

    fn on_connect_timeout(&mut self) {
        if self.advance(LifecycleEvent::ConnectTimedOut) {
            let ms = self.config.connect_timeout_ms.unwrap_or_default();
            self.report(CallError::ConnectionFailed(format!(
                "timed out after {} ms waiting for connection",
                ms
            )));
        }
    }

    /// Завершение звонка. Все четыре шага выполняются ровно один раз,
    /// ошибка одного не отменяет остальные.
    async fn finish(&mut self, notify_peer: bool) {
        if !self.advance(LifecycleEvent::EndRequested) {
            return;
        }

        let mut last_error = None;

        if notify_peer {
            if let Some(engine) = &self.engine {
                if let Some(peer_id) = engine.remote_peer() {
                    if let Err(e) = engine.sender().send_call_end(peer_id).await {
                        warn!("Failed to send call-end to {}: {}", peer_id, e);
                        last_error = Some(e);
                    }
                }
            }
        }

        if let Err(e) = self.channel.leave().await {
            warn!("Failed to leave signaling channel: {}", e);
            last_error = Some(e);
        }

        self.media.release();

        // без движка поздние события соединения отбрасываются в dispatch
        if let Some(mut engine) = self.engine.take() {
            if let Err(e) = engine.close().await {
                warn!("Failed to close connection: {}", e);
                last_error = Some(e);
            }
        }

        self.snapshot.send_modify(|s| {
            s.local_stream = None;
            s.remote_tracks.clear();
            s.camera_enabled = false;
            s.microphone_enabled = false;
            if let Some(e) = last_error {
                s.error = Some(e);
            }
        });
        info!("Call {} ended", self.identity.session_id);
    }
}

fn publish_media(snapshot: &watch::Sender<CallSnapshot>, media: &MediaSourceManager) {
    let state = media.state();
    snapshot.send_modify(|s| {
        s.local_stream = state.stream;
        s.camera_enabled = state.camera_enabled;
        s.microphone_enabled = state.microphone_enabled;
    });
}
