use crate::config;
use crate::peer::types::IceCandidate;
use tracing::debug;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

/// Включено ли логирование с учётом dev-флага
pub fn enabled() -> bool {
    if !config::LOGGING_ENABLED {
        return false;
    }
    #[cfg(debug_assertions)]
    {
        // В режиме разработки дополнительно проверяем dev::ENABLE_LOGGING
        if !config::dev::ENABLE_LOGGING {
            return false;
        }
    }
    true
}

/// Подключает fmt-подписчик с временными метками. Повторный вызов ничего не делает.
pub fn init() {
    if !enabled() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_target(false)
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn log_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index, cand.username_fragment
    );
}
