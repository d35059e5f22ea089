use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Backend route that mints a short-lived realtime credential.
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_realtime_url")]
    pub realtime_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_data_channel_label")]
    pub data_channel_label: String,
    /// STUN/TURN urls. Empty means host candidates only.
    #[serde(default)]
    pub ice_servers: Vec<String>,
    #[serde(default)]
    pub mic_device: String,
    #[serde(default)]
    pub speaker_device: String,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default)]
    pub schedule: ScheduleSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Local wall-clock time ("HH:MM") at which the session is opened.
    #[serde(default = "default_open_at")]
    pub open_at: String,
    /// Local wall-clock time ("HH:MM") at which the session is closed.
    #[serde(default = "default_close_at")]
    pub close_at: String,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Settings {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn mic_device_name(&self) -> Option<&str> {
        non_empty(&self.mic_device)
    }

    pub fn speaker_device_name(&self) -> Option<&str> {
        non_empty(&self.speaker_device)
    }
}

impl ScheduleSettings {
    /// Parsed (open, close) thresholds, or an error naming the bad field.
    pub fn thresholds(&self) -> Result<(NaiveTime, NaiveTime), String> {
        let open = parse_clock(&self.open_at)
            .ok_or_else(|| format!("invalid schedule.open_at '{}'", self.open_at))?;
        let close = parse_clock(&self.close_at)
            .ok_or_else(|| format!("invalid schedule.close_at '{}'", self.close_at))?;
        Ok((open, close))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            realtime_url: default_realtime_url(),
            model: default_model(),
            data_channel_label: default_data_channel_label(),
            ice_servers: Vec::new(),
            mic_device: String::new(),
            speaker_device: String::new(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            schedule: ScheduleSettings::default(),
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            open_at: default_open_at(),
            close_at: default_close_at(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_clock(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

fn default_token_url() -> String {
    "http://localhost:2000/token".into()
}
fn default_realtime_url() -> String {
    "https://api.openai.com/v1/realtime/calls".into()
}
fn default_model() -> String {
    "gpt-realtime-mini-2025-10-06".into()
}
fn default_data_channel_label() -> String {
    "oai-events".into()
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_backoff_ms() -> u64 {
    3000
}
fn default_true() -> bool {
    true
}
fn default_open_at() -> String {
    "07:59".into()
}
fn default_close_at() -> String {
    "18:01".into()
}
fn default_check_interval_secs() -> u64 {
    60
}

pub fn settings_path() -> Result<PathBuf, String> {
    if let Ok(custom) = std::env::var("REALTALK_SETTINGS") {
        if !custom.trim().is_empty() {
            return Ok(PathBuf::from(custom));
        }
    }
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("RealTalk").join("settings.json"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".realtalk").join("settings.json"));
    }
    Err("Failed to resolve data directory".into())
}

pub fn load() -> Settings {
    match settings_path() {
        Ok(p) => load_from(&p),
        Err(_) => Settings::default(),
    }
}

pub fn load_from(path: &Path) -> Settings {
    match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            log::warn!(
                "[settings] ignoring malformed {}: {}",
                path.display(),
                e
            );
            Settings::default()
        }),
        Err(_) => Settings::default(),
    }
}

pub fn save(settings: &Settings) -> Result<(), String> {
    save_to(&settings_path()?, settings)
}

pub fn save_to(path: &Path, settings: &Settings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    fs::write(path, json).map_err(|e| format!("Failed to write settings: {}", e))?;
    Ok(())
}
