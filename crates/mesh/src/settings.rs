use std::time::Duration;

use meshdev_store::CacheSettings;

/// Tunables for one manager, read once from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub header_poll: Duration,
    pub header_timeout: Duration,
    pub rollback_poll: Duration,
    pub rollback_timeout: Duration,
    /// Server-side-apply field manager.
    pub field_manager: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            header_poll: Duration::from_millis(100),
            header_timeout: Duration::from_millis(8000),
            rollback_poll: Duration::from_millis(200),
            rollback_timeout: Duration::from_millis(5000),
            field_manager: meshdev_core::conventions::PRODUCT.to_string(),
        }
    }
}

fn env_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            cache: CacheSettings::from_env(),
            header_poll: env_ms("MESHDEV_HEADER_POLL_MS", d.header_poll),
            header_timeout: env_ms("MESHDEV_HEADER_TIMEOUT_MS", d.header_timeout),
            rollback_poll: env_ms("MESHDEV_ROLLBACK_POLL_MS", d.rollback_poll),
            rollback_timeout: env_ms("MESHDEV_ROLLBACK_TIMEOUT_MS", d.rollback_timeout),
            field_manager: std::env::var("MESHDEV_FIELD_MANAGER")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(d.field_manager),
        }
    }
}
