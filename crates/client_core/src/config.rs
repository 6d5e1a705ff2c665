use std::{fs, path::Path, time::Duration};

use anyhow::Context;

pub const DEFAULT_CONFIG_FILE: &str = "chat.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub database_url: String,
    pub typing_debounce_ms: u64,
    pub event_buffer: usize,
    pub command_buffer: usize,
    pub publish_presence: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/chat.db".into(),
            typing_debounce_ms: 3_000,
            event_buffer: 256,
            command_buffer: 64,
            publish_presence: true,
        }
    }
}

impl SyncSettings {
    pub fn typing_debounce(&self) -> Duration {
        Duration::from_millis(self.typing_debounce_ms)
    }
}

pub fn load_settings() -> SyncSettings {
    load_settings_from(DEFAULT_CONFIG_FILE)
}

/// Defaults, then the flat key/value file at `path` if it exists, then
/// environment overrides. Values that fail to parse keep the previous layer.
pub fn load_settings_from(path: impl AsRef<Path>) -> SyncSettings {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string(path.as_ref()) {
        if let Ok(file_cfg) = toml::from_str::<toml::Table>(&raw) {
            apply_overrides(&mut settings, |key| file_cfg.get(key).map(toml_to_string));
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn apply_env_overrides(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("CHAT_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(parsed) = lookup("APP__TYPING_DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
        settings.typing_debounce_ms = parsed;
    }
    if let Some(parsed) = lookup("APP__EVENT_BUFFER").and_then(|v| v.parse().ok()) {
        settings.event_buffer = parsed;
    }
    if let Some(parsed) = lookup("APP__COMMAND_BUFFER").and_then(|v| v.parse().ok()) {
        settings.command_buffer = parsed;
    }
    if let Some(parsed) = lookup("APP__PUBLISH_PRESENCE").and_then(|v| parse_bool(&v)) {
        settings.publish_presence = parsed;
    }
}

fn apply_overrides(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("database_url") {
        settings.database_url = v;
    }
    if let Some(parsed) = lookup("typing_debounce_ms").and_then(|v| v.parse().ok()) {
        settings.typing_debounce_ms = parsed;
    }
    if let Some(parsed) = lookup("event_buffer").and_then(|v| v.parse().ok()) {
        settings.event_buffer = parsed;
    }
    if let Some(parsed) = lookup("command_buffer").and_then(|v| v.parse().ok()) {
        settings.command_buffer = parsed;
    }
    if let Some(parsed) = lookup("publish_presence").and_then(|v| parse_bool(&v)) {
        settings.publish_presence = parsed;
    }
}

fn toml_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Turn a bare file path into a sqlite url. The store creates the parent
/// directory when it opens the url.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return SyncSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

/// Read a settings file strictly, for callers that want parse errors.
pub fn read_settings_file(path: impl AsRef<Path>) -> anyhow::Result<SyncSettings> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    let file_cfg = toml::from_str::<toml::Table>(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;
    let mut settings = SyncSettings::default();
    apply_overrides(&mut settings, |key| file_cfg.get(key).map(toml_to_string));
    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
