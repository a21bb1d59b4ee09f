use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "chat_sync.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub server_url: String,
    pub poll_interval: Duration,
    /// Max distance between a local compose time and the server timestamp of
    /// the confirmed copy for content-based correlation.
    pub correlation_window: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub event_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            poll_interval: Duration::from_secs(1),
            correlation_window: Duration::from_secs(120),
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(15),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    server_url: Option<String>,
    poll_interval_ms: Option<u64>,
    correlation_window_secs: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    event_capacity: Option<usize>,
}

impl SettingsFile {
    fn apply(self, settings: &mut SyncSettings) {
        if let Some(v) = self.server_url {
            settings.server_url = v;
        }
        if let Some(v) = self.poll_interval_ms {
            settings.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = self.correlation_window_secs {
            settings.correlation_window = Duration::from_secs(v);
        }
        if let Some(v) = self.reconnect_initial_ms {
            settings.reconnect_initial_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.reconnect_max_ms {
            settings.reconnect_max_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.event_capacity {
            settings.event_capacity = v;
        }
    }
}

/// Defaults, then the TOML file at `path` if it exists, then environment.
pub fn load_settings(path: Option<&Path>) -> Result<SyncSettings, ConfigError> {
    let mut settings = SyncSettings::default();

    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let file_cfg: SettingsFile =
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?;
            file_cfg.apply(&mut settings);
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => return Err(ConfigError::Read { path, source }),
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    validate(&settings)?;
    Ok(settings)
}

pub(crate) fn apply_env_overrides(
    settings: &mut SyncSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(v) = lookup("CHAT_SYNC_SERVER_URL") {
        settings.server_url = v;
    }

    let number = |key: &str| -> Option<u64> {
        let raw = lookup(key)?;
        match raw.trim().parse::<u64>() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                warn!(key, value = %raw, "ignoring non-numeric setting override");
                None
            }
        }
    };

    if let Some(v) = number("CHAT_SYNC__POLL_INTERVAL_MS") {
        settings.poll_interval = Duration::from_millis(v);
    }
    if let Some(v) = number("CHAT_SYNC__CORRELATION_WINDOW_SECS") {
        settings.correlation_window = Duration::from_secs(v);
    }
    if let Some(v) = number("CHAT_SYNC__RECONNECT_INITIAL_MS") {
        settings.reconnect_initial_delay = Duration::from_millis(v);
    }
    if let Some(v) = number("CHAT_SYNC__RECONNECT_MAX_MS") {
        settings.reconnect_max_delay = Duration::from_millis(v);
    }
}

pub(crate) fn validate(settings: &SyncSettings) -> Result<(), ConfigError> {
    if !(settings.server_url.starts_with("http://") || settings.server_url.starts_with("https://")) {
        return Err(ConfigError::Invalid {
            key: "server_url",
            reason: "must start with http:// or https://".into(),
        });
    }
    if settings.poll_interval.is_zero() {
        return Err(ConfigError::Invalid {
            key: "poll_interval",
            reason: "must be greater than zero".into(),
        });
    }
    if settings.reconnect_initial_delay.is_zero() {
        return Err(ConfigError::Invalid {
            key: "reconnect_initial_delay",
            reason: "must be greater than zero".into(),
        });
    }
    if settings.reconnect_max_delay < settings.reconnect_initial_delay {
        return Err(ConfigError::Invalid {
            key: "reconnect_max_delay",
            reason: "must not be smaller than reconnect_initial_delay".into(),
        });
    }
    if settings.event_capacity == 0 {
        return Err(ConfigError::Invalid {
            key: "event_capacity",
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
