use std::{collections::HashMap, fs, path::Path, time::Duration};

use shared::domain::PubKey;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "reconcile.toml";

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub database_url: String,
    /// Rows per storage page, both for cold start and for `load_more`.
    pub page_size: usize,
    /// Messages exposed by the visible window.
    pub window_size: usize,
    pub pin_refresh_interval: Duration,
    pub ack_timeout: Duration,
    pub bus_capacity: usize,
    /// Hops of missing reply parents fetched by id during cold start.
    pub parent_hydration_rounds: usize,
    pub own_pubkey: Option<PubKey>,
    pub own_codeset: u8,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/messages.db".into(),
            page_size: 1000,
            window_size: 50,
            pin_refresh_interval: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(30),
            bus_capacity: 1024,
            parent_hydration_rounds: 3,
            own_pubkey: None,
            own_codeset: 0,
        }
    }
}

/// Defaults, then `reconcile.toml` in the working directory, then `APP__*`
/// environment variables.
pub fn load_settings() -> EngineSettings {
    let mut settings = EngineSettings::default();
    apply_file(&mut settings, Path::new(DEFAULT_SETTINGS_FILE));
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn apply_file(settings: &mut EngineSettings, path: &Path) {
    let Ok(raw) = fs::read_to_string(path) else {
        return;
    };
    match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
        Ok(file_cfg) => apply_toml(settings, &file_cfg),
        Err(err) => warn!(path = %path.display(), error = %err, "config: ignoring unreadable settings file"),
    }
}

fn apply_toml(settings: &mut EngineSettings, file_cfg: &HashMap<String, toml::Value>) {
    let int = |key: &str| file_cfg.get(key).and_then(toml::Value::as_integer);

    if let Some(v) = file_cfg.get("database_url").and_then(toml::Value::as_str) {
        settings.database_url = v.to_string();
    }
    if let Some(v) = int("page_size").and_then(|v| usize::try_from(v).ok()) {
        settings.page_size = v;
    }
    if let Some(v) = int("window_size").and_then(|v| usize::try_from(v).ok()) {
        settings.window_size = v;
    }
    if let Some(v) = int("pin_refresh_secs").and_then(|v| u64::try_from(v).ok()) {
        settings.pin_refresh_interval = Duration::from_secs(v);
    }
    if let Some(v) = int("ack_timeout_secs").and_then(|v| u64::try_from(v).ok()) {
        settings.ack_timeout = Duration::from_secs(v);
    }
    if let Some(v) = int("bus_capacity").and_then(|v| usize::try_from(v).ok()) {
        settings.bus_capacity = v;
    }
    if let Some(v) = int("parent_hydration_rounds").and_then(|v| usize::try_from(v).ok()) {
        settings.parent_hydration_rounds = v;
    }
    if let Some(v) = file_cfg.get("own_pubkey").and_then(toml::Value::as_str) {
        settings.own_pubkey = Some(PubKey::from(v));
    }
    if let Some(v) = int("own_codeset").and_then(|v| u8::try_from(v).ok()) {
        settings.own_codeset = v;
    }
}

pub fn apply_env_overrides<F>(settings: &mut EngineSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = parsed(&lookup, "APP__PAGE_SIZE") {
        settings.page_size = v;
    }
    if let Some(v) = parsed(&lookup, "APP__WINDOW_SIZE") {
        settings.window_size = v;
    }
    if let Some(v) = parsed(&lookup, "APP__PIN_REFRESH_SECS") {
        settings.pin_refresh_interval = Duration::from_secs(v);
    }
    if let Some(v) = parsed(&lookup, "APP__ACK_TIMEOUT_SECS") {
        settings.ack_timeout = Duration::from_secs(v);
    }
    if let Some(v) = parsed(&lookup, "APP__BUS_CAPACITY") {
        settings.bus_capacity = v;
    }
    if let Some(v) = parsed(&lookup, "APP__PARENT_HYDRATION_ROUNDS") {
        settings.parent_hydration_rounds = v;
    }

    if let Some(v) = lookup("APP__OWN_PUBKEY") {
        settings.own_pubkey = (!v.is_empty()).then(|| PubKey::new(v));
    }
    if let Some(v) = parsed(&lookup, "APP__OWN_CODESET") {
        settings.own_codeset = v;
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "config: ignoring unparsable override");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
