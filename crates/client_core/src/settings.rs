use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use shared::protocol::PUBLISH_DESTINATION;
use url::Url;

use crate::{error::SettingsError, transport::BrokerEndpoint};

pub const DEFAULT_SETTINGS_FILE: &str = "inbox.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub base_url: String,
    pub ws_path: String,
    pub publish_destination: String,
    pub reconnect_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub heartbeat_ms: u64,
    pub conversations_path: String,
    pub page_size: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            ws_path: "/ws".into(),
            publish_destination: PUBLISH_DESTINATION.into(),
            reconnect_interval_ms: 3_000,
            connect_timeout_ms: 10_000,
            heartbeat_ms: 10_000,
            conversations_path: "/chat/conversations".into(),
            page_size: 20,
        }
    }
}

impl ClientSettings {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(1))
    }

    /// `{base_url}{ws_path}` with the scheme switched to ws/wss.
    pub fn ws_url(&self) -> Result<Url, SettingsError> {
        let mut url = self.parsed_base_url()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| SettingsError::InvalidBaseUrl(self.base_url.clone()))?;
        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            self.ws_path.trim_start_matches('/')
        );
        url.set_path(&path);
        Ok(url)
    }

    pub fn conversations_url(&self) -> Result<String, SettingsError> {
        let url = self.parsed_base_url()?;
        Ok(format!(
            "{}/{}",
            url.as_str().trim_end_matches('/'),
            self.conversations_path.trim_start_matches('/')
        ))
    }

    pub fn broker_endpoint(&self) -> Result<BrokerEndpoint, SettingsError> {
        let url = self.ws_url()?;
        let host = url.host_str().unwrap_or("localhost").to_string();
        Ok(BrokerEndpoint {
            url,
            host,
            heartbeat: Duration::from_millis(self.heartbeat_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms.max(1)),
        })
    }

    fn parsed_base_url(&self) -> Result<Url, SettingsError> {
        let url = Url::parse(self.base_url.trim())
            .map_err(|_| SettingsError::InvalidBaseUrl(self.base_url.clone()))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(SettingsError::InvalidBaseUrl(self.base_url.clone()));
        }
        Ok(url)
    }
}

/// Defaults, then `INBOX_CONFIG` (or `inbox.toml` when present), then
/// `APP__*` environment overrides.
pub fn load_settings() -> Result<ClientSettings, SettingsError> {
    let explicit = std::env::var("INBOX_CONFIG").ok().map(PathBuf::from);
    load_settings_from(explicit.as_deref(), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ClientSettings, SettingsError> {
    let mut settings = match path {
        Some(path) => read_file(path)?,
        None if Path::new(DEFAULT_SETTINGS_FILE).exists() => {
            read_file(Path::new(DEFAULT_SETTINGS_FILE))?
        }
        None => ClientSettings::default(),
    };

    if let Some(v) = env("APP__BASE_URL") {
        settings.base_url = v;
    }
    if let Some(v) = env("APP__CONVERSATIONS_PATH") {
        settings.conversations_path = v;
    }
    if let Some(v) = env("APP__RECONNECT_INTERVAL_MS") {
        settings.reconnect_interval_ms = parse_number("APP__RECONNECT_INTERVAL_MS", v)?;
    }
    if let Some(v) = env("APP__CONNECT_TIMEOUT_MS") {
        settings.connect_timeout_ms = parse_number("APP__CONNECT_TIMEOUT_MS", v)?;
    }
    if let Some(v) = env("APP__HEARTBEAT_MS") {
        settings.heartbeat_ms = parse_number("APP__HEARTBEAT_MS", v)?;
    }
    if let Some(v) = env("APP__PAGE_SIZE") {
        settings.page_size = parse_number("APP__PAGE_SIZE", v)?;
    }

    Ok(settings)
}

fn read_file(path: &Path) -> Result<ClientSettings, SettingsError> {
    let raw = fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| SettingsError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, SettingsError> {
    value
        .trim()
        .parse()
        .map_err(|_| SettingsError::InvalidValue { key, value })
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
