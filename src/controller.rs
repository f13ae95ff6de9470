use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::media::CaptureDevice;
use crate::peer::connection::ConnectionFactory;
use crate::peer::state::CallState;
use crate::peer::types::SessionIdentity;
use crate::session::{CallDeps, CallSession, CallSnapshot, Command};
use crate::signaling::PubSubTransport;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ActiveCall {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Публичный API звонка для UI: start/end/toggle и наблюдаемый `CallSnapshot`.
/// Каждый звонок получает собственный канал сигнализации.
pub struct CallController {
    config: CallConfig,
    transport: Arc<dyn PubSubTransport>,
    device: Arc<dyn CaptureDevice>,
    connections: Arc<dyn ConnectionFactory>,
    snapshot: Arc<watch::Sender<CallSnapshot>>,
    active: Mutex<Option<ActiveCall>>,
}

impl CallController {
    pub fn new(
        config: CallConfig,
        transport: Arc<dyn PubSubTransport>,
        device: Arc<dyn CaptureDevice>,
        connections: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let (snapshot, _) = watch::channel(CallSnapshot::default());
        Ok(Self {
            config,
            transport,
            device,
            connections,
            snapshot: Arc::new(snapshot),
            active: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.snapshot.borrow().lifecycle
    }

    /// Начинает звонок. Пока звонок `connecting`/`connected`, ничего не делает.
    /// Ошибка настройки также отражается в `error` снимка.
    /// Настройка идёт в задаче звонка, `end_call` может прервать её.
    pub async fn start_call(&self, session_id: &str, user_id: &str) -> Result<()> {
        if session_id.is_empty() || user_id.is_empty() {
            return Err(CallError::InvalidConfig(
                "session id and user id are required".into(),
            ));
        }

        let mut active = self.active.lock().await;
        let state = self.state();
        if state.is_active() {
            debug!("start_call ignored: call is {}", state);
            return Ok(());
        }
        if let Some(previous) = active.take() {
            info!("Ending previous call ({}) before restart", state);
            shutdown(previous).await;
        }

        info!("Starting call {} as {}", session_id, user_id);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut session = CallSession::new(
            SessionIdentity {
                session_id: session_id.to_string(),
                local_user_id: user_id.to_string(),
            },
            self.config.clone(),
            CallDeps {
                transport: self.transport.clone(),
                device: self.device.clone(),
                connections: self.connections.clone(),
            },
            self.snapshot.clone(),
        );
        session.begin();
        *active = Some(ActiveCall {
            commands,
            task: tokio::spawn(session.start(command_rx, ready_tx)),
        });
        drop(active);

        ready_rx.await.unwrap_or_else(|_| {
            Err(CallError::ConnectionFailed(
                "call task stopped during setup".into(),
            ))
        })
    }

    /// Завершает звонок из любого состояния; итог всегда `ended`.
    pub async fn end_call(&self) {
        let mut active = self.active.lock().await;
        if let Some(call) = active.take() {
            shutdown(call).await;
        }
        self.snapshot.send_modify(|s| {
            if s.lifecycle != CallState::Ended {
                s.lifecycle = CallState::Ended;
            }
        });
    }

    /// Новое значение флага камеры; `false`, если медиа нет
    pub async fn toggle_camera(&self) -> bool {
        self.request(Command::ToggleCamera).await
    }

    pub async fn toggle_microphone(&self) -> bool {
        self.request(Command::ToggleMicrophone).await
    }

    async fn request(&self, make: fn(oneshot::Sender<bool>) -> Command) -> bool {
        let commands = match self.active.lock().await.as_ref() {
            Some(call) => call.commands.clone(),
            None => return false,
        };
        let (tx, rx) = oneshot::channel();
        if commands.send(make(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

async fn shutdown(call: ActiveCall) {
    let (tx, rx) = oneshot::channel();
    if call.commands.send(Command::End(tx)).is_ok() {
        let _ = rx.await;
    }
    if let Err(e) = call.task.await {
        warn!("Call task did not stop cleanly: {}", e);
    }
}
