use crate::peer::types::PeerConnectionState;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

/// Жизненный цикл звонка
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// Не терминальное: решение о завершении принимает контроллер
    Failed,
    /// Терминальное
    Ended,
}

impl CallState {
    pub fn is_active(self) -> bool {
        matches!(self, CallState::Connecting | CallState::Connected)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Connecting => "connecting",
            CallState::Connected => "connected",
            CallState::Failed => "failed",
            CallState::Ended => "ended",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Запрошен захват медиа
    CallStarted,
    /// Локальные треки добавлены в соединение
    MediaAttached,
    /// Состояние нижележащего соединения, без интерпретации
    Transport(PeerConnectionState),
    /// Не удалось подготовить звонок (медиа, канал, соединение)
    SetupFailed,
    ConnectTimedOut,
    EndRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CallState,
    pub to: CallState,
}

/// Сводит готовность медиа и состояние соединения в один жизненный цикл.
/// `connected` только когда оба условия выполнены.
#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    state: CallState,
    media_attached: bool,
    transport: Option<PeerConnectionState>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    fn path_established(&self) -> bool {
        self.transport == Some(PeerConnectionState::Connected)
    }

    pub fn apply(&mut self, event: LifecycleEvent) -> Option<Transition> {
        if self.state == CallState::Ended {
            debug!("Ignoring {:?}: call already ended", event);
            return None;
        }

        let next = match event {
            LifecycleEvent::CallStarted => match self.state {
                CallState::Idle => Some(CallState::Connecting),
                _ => None,
            },
            LifecycleEvent::MediaAttached => {
                self.media_attached = true;
                match self.state {
                    CallState::Connecting | CallState::Failed if self.path_established() => {
                        Some(CallState::Connected)
                    }
                    _ => None,
                }
            }
            LifecycleEvent::Transport(st) => {
                self.transport = Some(st);
                match (self.state, st) {
                    (CallState::Connecting | CallState::Failed, PeerConnectionState::Connected)
                        if self.media_attached =>
                    {
                        Some(CallState::Connected)
                    }
                    (
                        CallState::Connecting | CallState::Connected,
                        PeerConnectionState::Failed
                        | PeerConnectionState::Disconnected
                        | PeerConnectionState::Closed,
                    ) => Some(CallState::Failed),
                    _ => None,
                }
            }
            LifecycleEvent::SetupFailed | LifecycleEvent::ConnectTimedOut => match self.state {
                CallState::Connecting => Some(CallState::Failed),
                _ => None,
            },
            LifecycleEvent::EndRequested => Some(CallState::Ended),
        };

        let to = next.filter(|to| *to != self.state)?;
        let transition = Transition {
            from: self.state,
            to,
        };
        info!("Call state {} -> {} ({:?})", transition.from, to, event);
        self.state = to;
        Some(transition)
    }
}
