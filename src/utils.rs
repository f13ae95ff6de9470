use crate::config::{IceServerConfig, IceServerKind};
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Текущее время в миллисекундах (epoch)
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &IceServerConfig) -> String {
    // Если url уже начинается с "turn:" или "stun:", возвращаем как есть
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        let scheme = match config.kind {
            IceServerKind::Turn => "turn:",
            IceServerKind::Stun => "stun:",
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(kind: IceServerKind, url: &str) -> IceServerConfig {
        IceServerConfig {
            id: "s".into(),
            kind,
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    #[test]
    fn scheme_added_by_kind() {
        assert_eq!(
            add_ice_url_scheme(&server(IceServerKind::Turn, "relay.example.com:3478")),
            "turn:relay.example.com:3478"
        );
        assert_eq!(
            add_ice_url_scheme(&server(IceServerKind::Stun, "stun.example.com")),
            "stun:stun.example.com"
        );
        assert_eq!(
            add_ice_url_scheme(&server(IceServerKind::Stun, "stun:already.example.com")),
            "stun:already.example.com"
        );
    }

    #[test]
    fn random_ids_are_hex() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_id());
    }
}
