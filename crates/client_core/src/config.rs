use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::{controller::DuplicateAdds, error::SyncError};

pub const SETTINGS_FILE: &str = "board.toml";
pub const DEFAULT_HANDSHAKE: &str = "Hello, world";
const PUSH_PATH: &str = "websocket";
const DEFAULT_SNAPSHOT_RETRY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub server_url: String,
    pub push_url: String,
    /// Sent once on every push connection; the server does not interpret it.
    pub handshake: String,
    pub duplicate_adds: DuplicateAdds,
    pub max_buffered_events: usize,
    /// Delay before refetching after a failed snapshot. Zero disables the
    /// automatic retry and leaves it to [`crate::SyncHandle::resync`].
    pub snapshot_retry: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".into(),
            push_url: "ws://localhost:8080/websocket".into(),
            handshake: DEFAULT_HANDSHAKE.into(),
            duplicate_adds: DuplicateAdds::default(),
            max_buffered_events: 1024,
            snapshot_retry: DEFAULT_SNAPSHOT_RETRY,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    push_url: Option<String>,
    handshake: Option<String>,
    duplicate_adds: Option<DuplicateAdds>,
    max_buffered_events: Option<usize>,
    snapshot_retry_ms: Option<u64>,
}

impl SyncSettings {
    /// Points the client at another server, deriving the push url from it.
    pub fn with_server_url(mut self, server_url: &str) -> Result<Self, SyncError> {
        self.push_url = push_url_for(server_url)?;
        self.server_url = server_url.to_string();
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_buffered_events == 0 {
            return Err(SyncError::InvalidSetting {
                name: "max_buffered_events",
                reason: "must be at least 1".into(),
            });
        }
        let push_url = Url::parse(&self.push_url).map_err(|err| SyncError::InvalidSetting {
            name: "push_url",
            reason: err.to_string(),
        })?;
        if !matches!(push_url.scheme(), "ws" | "wss") {
            return Err(SyncError::InvalidSetting {
                name: "push_url",
                reason: "must start with ws:// or wss://".into(),
            });
        }
        Ok(())
    }
}

/// Defaults, then `board.toml` in the working directory, then `BOARD__*`
/// environment variables.
pub fn load_settings() -> Result<SyncSettings, SyncError> {
    load_settings_with(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_with(
    file: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<SyncSettings, SyncError> {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string(file) {
        apply_file_settings(&mut settings, &raw)?;
    }
    apply_env_settings(&mut settings, env)?;

    settings.validate()?;
    Ok(settings)
}

fn apply_file_settings(settings: &mut SyncSettings, raw: &str) -> Result<(), SyncError> {
    let file_cfg: FileSettings = toml::from_str(raw).map_err(|err| SyncError::InvalidSetting {
        name: "board.toml",
        reason: err.to_string(),
    })?;

    if let Some(server_url) = file_cfg.server_url {
        settings.push_url = push_url_for(&server_url)?;
        settings.server_url = server_url;
    }
    if let Some(v) = file_cfg.push_url {
        settings.push_url = v;
    }
    if let Some(v) = file_cfg.handshake {
        settings.handshake = v;
    }
    if let Some(v) = file_cfg.duplicate_adds {
        settings.duplicate_adds = v;
    }
    if let Some(v) = file_cfg.max_buffered_events {
        settings.max_buffered_events = v;
    }
    if let Some(v) = file_cfg.snapshot_retry_ms {
        settings.snapshot_retry = Duration::from_millis(v);
    }
    Ok(())
}

fn apply_env_settings(
    settings: &mut SyncSettings,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), SyncError> {
    if let Some(v) = env("BOARD__SERVER_URL") {
        settings.push_url = push_url_for(&v)?;
        settings.server_url = v;
    }
    if let Some(v) = env("BOARD__PUSH_URL") {
        settings.push_url = v;
    }
    if let Some(v) = env("BOARD__HANDSHAKE") {
        settings.handshake = v;
    }
    if let Some(v) = env("BOARD__DUPLICATE_ADDS") {
        settings.duplicate_adds = v.parse().map_err(|reason| SyncError::InvalidSetting {
            name: "BOARD__DUPLICATE_ADDS",
            reason,
        })?;
    }
    if let Some(v) = env("BOARD__MAX_BUFFERED_EVENTS") {
        settings.max_buffered_events =
            v.trim().parse().map_err(|_| SyncError::InvalidSetting {
                name: "BOARD__MAX_BUFFERED_EVENTS",
                reason: format!("'{v}' is not a count"),
            })?;
    }
    if let Some(v) = env("BOARD__SNAPSHOT_RETRY_MS") {
        let millis: u64 = v.trim().parse().map_err(|_| SyncError::InvalidSetting {
            name: "BOARD__SNAPSHOT_RETRY_MS",
            reason: format!("'{v}' is not a number of milliseconds"),
        })?;
        settings.snapshot_retry = Duration::from_millis(millis);
    }
    Ok(())
}

/// `http://host:port/base` becomes `ws://host:port/base/websocket`.
pub fn push_url_for(server_url: &str) -> Result<String, SyncError> {
    let invalid = |reason: String| SyncError::InvalidSetting {
        name: "server_url",
        reason,
    };
    let mut url = Url::parse(server_url).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return Err(invalid("must start with http:// or https://".into())),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid(format!("cannot switch scheme to {scheme}")))?;
    let path = format!("{}/{PUSH_PATH}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url.to_string())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
