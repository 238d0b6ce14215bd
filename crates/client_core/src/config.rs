use std::{collections::HashMap, fs, path::Path, sync::Arc, time::Duration};

use serde::Deserialize;
use shared::domain::TransportKind;
use tracing::warn;
use url::Url;

use crate::{
    connection::{Backoff, ConnectionConfig},
    sync::{DeviceClassifier, FixedDeviceClass, UserAgentClassifier},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// Classify from the configured user agent.
    #[default]
    Auto,
    Constrained,
    Unconstrained,
}

impl DeviceClass {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "constrained" | "mobile" => Some(Self::Constrained),
            "unconstrained" | "desktop" => Some(Self::Unconstrained),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub ws_url: Option<String>,
    pub transport: TransportKind,
    pub cache_url: String,
    pub device_class: DeviceClass,
    pub user_agent: String,
    pub reconnect_base_ms: u64,
    pub reconnect_growth: f64,
    pub reconnect_cap_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub poll_interval_ms: u64,
    pub poll_min_interval_ms: u64,
    pub push_window_ms: u64,
    pub gap_threshold_ms: u64,
    pub sync_batch_size: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            ws_url: None,
            transport: TransportKind::Socket,
            cache_url: "sqlite://./data/client.db".into(),
            device_class: DeviceClass::Auto,
            user_agent: concat!("realtime-chat/", env!("CARGO_PKG_VERSION")).into(),
            reconnect_base_ms: 1_000,
            reconnect_growth: 1.5,
            reconnect_cap_ms: 30_000,
            heartbeat_interval_secs: 30,
            poll_interval_ms: 3_000,
            poll_min_interval_ms: 3_000,
            push_window_ms: 5_000,
            gap_threshold_ms: 5_000,
            sync_batch_size: 50,
        }
    }
}

impl ClientSettings {
    /// Socket endpoint, derived from `server_url` when not set explicitly.
    pub fn ws_url(&self) -> String {
        if let Some(url) = self.ws_url.as_deref().filter(|url| !url.trim().is_empty()) {
            return url.trim().to_string();
        }
        match Url::parse(self.server_url.trim()) {
            Ok(mut url) => {
                let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
                if url.set_scheme(scheme).is_err() {
                    warn!(server_url = %self.server_url, "cannot derive socket scheme");
                }
                let path = format!("{}/ws", url.path().trim_end_matches('/'));
                url.set_path(&path);
                url.to_string()
            }
            Err(err) => {
                warn!(server_url = %self.server_url, error = %err, "invalid server url");
                format!("{}/ws", self.server_base())
            }
        }
    }

    pub fn server_base(&self) -> String {
        self.server_url.trim().trim_end_matches('/').to_string()
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.reconnect_base_ms),
            growth: self.reconnect_growth.max(1.0),
            cap: Duration::from_millis(self.reconnect_cap_ms.max(self.reconnect_base_ms)),
        }
    }

    pub fn connection_config(&self, constrained: bool) -> ConnectionConfig {
        ConnectionConfig {
            transport: self.transport,
            backoff: self.backoff(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            constrained,
        }
    }

    pub fn gap_threshold(&self) -> Duration {
        Duration::from_millis(self.gap_threshold_ms)
    }

    pub fn poll_min_interval(&self) -> Duration {
        Duration::from_millis(self.poll_min_interval_ms)
    }

    pub fn push_window(&self) -> Duration {
        Duration::from_millis(self.push_window_ms)
    }

    pub fn classifier(&self) -> Arc<dyn DeviceClassifier> {
        match self.device_class {
            DeviceClass::Auto => Arc::new(UserAgentClassifier::new(self.user_agent.clone())),
            DeviceClass::Constrained => Arc::new(FixedDeviceClass(true)),
            DeviceClass::Unconstrained => Arc::new(FixedDeviceClass(false)),
        }
    }

    /// Applies one `key = value` override. Returns false for unknown keys
    /// and unparsable values, leaving the setting untouched.
    pub fn apply(&mut self, key: &str, value: &str) -> bool {
        fn parse<T: std::str::FromStr>(slot: &mut T, value: &str) -> bool {
            match value.trim().parse() {
                Ok(parsed) => {
                    *slot = parsed;
                    true
                }
                Err(_) => false,
            }
        }

        let applied = match key.trim().to_ascii_lowercase().as_str() {
            "server_url" => {
                self.server_url = value.trim().to_string();
                true
            }
            "ws_url" => {
                self.ws_url = Some(value.trim().to_string()).filter(|url| !url.is_empty());
                true
            }
            "transport" => TransportKind::parse(value)
                .map(|kind| self.transport = kind)
                .is_some(),
            "cache_url" => {
                self.cache_url = normalize_cache_url(value);
                true
            }
            "device_class" => DeviceClass::parse(value)
                .map(|class| self.device_class = class)
                .is_some(),
            "user_agent" => {
                self.user_agent = value.to_string();
                true
            }
            "reconnect_base_ms" => parse(&mut self.reconnect_base_ms, value),
            "reconnect_growth" => parse(&mut self.reconnect_growth, value),
            "reconnect_cap_ms" => parse(&mut self.reconnect_cap_ms, value),
            "heartbeat_interval_secs" => parse(&mut self.heartbeat_interval_secs, value),
            "poll_interval_ms" => parse(&mut self.poll_interval_ms, value),
            "poll_min_interval_ms" => parse(&mut self.poll_min_interval_ms, value),
            "push_window_ms" => parse(&mut self.push_window_ms, value),
            "gap_threshold_ms" => parse(&mut self.gap_threshold_ms, value),
            "sync_batch_size" => parse(&mut self.sync_batch_size, value),
            _ => false,
        };
        if !applied {
            warn!(key, value, "ignoring client setting");
        }
        applied
    }

    /// Applies `APP__*` variables from `vars`; other variables are skipped.
    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(key) = key.strip_prefix("APP__") {
                self.apply(key, &value);
            }
        }
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new("client.toml"))
}

/// Defaults, then the toml file at `path` if it exists, then `APP__*`
/// environment overrides.
pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in file_cfg {
                    let value = match value {
                        toml::Value::String(value) => value,
                        other => other.to_string(),
                    };
                    settings.apply(&key, &value);
                }
            }
            Err(err) => warn!(path = %path.display(), error = %err, "invalid settings file"),
        }
    }

    settings.apply_env(std::env::vars());
    settings
}

fn normalize_cache_url(raw_cache_url: &str) -> String {
    let raw_cache_url = raw_cache_url.trim();

    if raw_cache_url.is_empty() {
        return ClientSettings::default().cache_url;
    }

    if raw_cache_url.starts_with("sqlite::memory:") || raw_cache_url.contains("://") {
        return raw_cache_url.to_string();
    }

    if let Some(path) = raw_cache_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_cache_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
