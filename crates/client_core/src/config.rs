use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use tracing::warn;
use url::Url;

pub const DEFAULT_TYPING_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub channel_url: Option<String>,
    pub typing_timeout_ms: u64,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000/api".into(),
            channel_url: None,
            typing_timeout_ms: DEFAULT_TYPING_TIMEOUT_MS,
            event_buffer: 1024,
        }
    }
}

impl ClientSettings {
    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    /// Channel URL, derived from the API URL when not configured.
    pub fn resolved_channel_url(&self) -> anyhow::Result<String> {
        if let Some(channel_url) = &self.channel_url {
            let parsed = Url::parse(channel_url)
                .with_context(|| format!("invalid channel url '{channel_url}'"))?;
            if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
                return Err(anyhow!("channel url must start with ws:// or wss://"));
            }
            return Ok(channel_url.clone());
        }
        derive_channel_url(&self.api_base_url)
    }

    pub fn api_base(&self) -> anyhow::Result<String> {
        let parsed = Url::parse(&self.api_base_url)
            .with_context(|| format!("invalid api base url '{}'", self.api_base_url))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(anyhow!("api base url must start with http:// or https://"));
        }
        Ok(self.api_base_url.trim_end_matches('/').to_string())
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match parse_settings_file(&raw) {
            Ok(file_cfg) => apply_file_overrides(&mut settings, &file_cfg),
            Err(err) => warn!(
                path = %path.display(),
                "config: ignoring settings file: {err:#}"
            ),
        }
    }

    if let Ok(v) = std::env::var("CHAT_API_URL") {
        settings.api_base_url = v;
    }
    if let Ok(v) = std::env::var("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Ok(v) = std::env::var("CHAT_CHANNEL_URL") {
        settings.channel_url = Some(v);
    }
    if let Ok(v) = std::env::var("APP__CHANNEL_URL") {
        settings.channel_url = Some(v);
    }

    if let Ok(v) = std::env::var("APP__TYPING_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.typing_timeout_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__EVENT_BUFFER") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.event_buffer = parsed.max(1);
        }
    }

    settings
}

/// Reads a flat table of scalars. Numbers and booleans may be written with
/// or without quotes.
fn parse_settings_file(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    let table: toml::Table = toml::from_str(raw).context("malformed toml")?;
    let mut file_cfg = HashMap::with_capacity(table.len());
    for (key, value) in table {
        let value = match value {
            toml::Value::String(v) => v,
            toml::Value::Integer(v) => v.to_string(),
            toml::Value::Float(v) => v.to_string(),
            toml::Value::Boolean(v) => v.to_string(),
            other => {
                warn!("config: key '{key}' skipped, expected a scalar, got {}", other.type_str());
                continue;
            }
        };
        file_cfg.insert(key, value);
    }
    Ok(file_cfg)
}

fn apply_file_overrides(settings: &mut ClientSettings, file_cfg: &HashMap<String, String>) {
    if let Some(v) = file_cfg.get("api_base_url") {
        settings.api_base_url = v.clone();
    }
    if let Some(v) = file_cfg.get("channel_url") {
        settings.channel_url = Some(v.clone());
    }
    if let Some(v) = file_cfg.get("typing_timeout_ms") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.typing_timeout_ms = parsed,
            Err(_) => warn!("config: typing_timeout_ms '{v}' is not a number"),
        }
    }
    if let Some(v) = file_cfg.get("event_buffer") {
        match v.parse::<usize>() {
            Ok(parsed) => settings.event_buffer = parsed.max(1),
            Err(_) => warn!("config: event_buffer '{v}' is not a number"),
        }
    }
}

fn derive_channel_url(api_base_url: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(api_base_url)
        .with_context(|| format!("invalid api base url '{api_base_url}'"))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return Err(anyhow!("api base url must start with http:// or https://")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot derive channel url from '{api_base_url}'"))?;
    url.set_path("/ws");
    url.set_query(None);
    Ok(url.to_string())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
