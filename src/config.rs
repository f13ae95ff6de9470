// Конфигурация звонка и логирования
// Логирование можно отключить только в режиме разработки

use crate::error::{CallError, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Публичные STUN серверы по умолчанию
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<IceServerConfig>> = Lazy::new(|| {
    vec![
        IceServerConfig {
            id: "default-stun".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        IceServerConfig {
            id: "default-stun-1".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

pub const DEFAULT_TOPIC_PREFIX: &str = "coaching-session";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IceServerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IceServerKind,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Ограничения захвата камеры и микрофона
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CallConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub media: MediaConstraints,
    /// `None` — ждать соединения бесконечно
    pub connect_timeout_ms: Option<u64>,
    pub topic_prefix: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            media: MediaConstraints::default(),
            connect_timeout_ms: Some(DEFAULT_CONNECT_TIMEOUT_MS),
            topic_prefix: DEFAULT_TOPIC_PREFIX.into(),
        }
    }
}

impl CallConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: CallConfig =
            serde_json::from_str(raw).map_err(|e| CallError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(CallError::InvalidConfig(format!(
                    "ICE server {} has an empty url",
                    server.id
                )));
            }

            if server.kind == IceServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(CallError::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }

        if self.connect_timeout_ms == Some(0) {
            return Err(CallError::InvalidConfig(
                "connect timeout must be positive".into(),
            ));
        }

        if self.topic_prefix.is_empty() {
            return Err(CallError::InvalidConfig("topic prefix is empty".into()));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}
