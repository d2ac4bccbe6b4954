// Configuration loading and validation (config/live.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::connection::SyncSettings;
use crate::presentation::{PresentationTimings, SpinStage, MAX_CYCLE_DURATION};

/// File name of the live-view configuration inside `config/` and `defaults/`.
pub const CONFIG_FILE: &str = "live.toml";

/// Upper bound on slots per event.
pub const MAX_SLOTS: u32 = 999;

/// Longest payment window: one week.
pub const MAX_PAYMENT_WINDOW_MINUTES: u64 = 7 * 24 * 60;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub event: EventConfig,
    pub draw: DrawConfig,
    pub sync: SyncSettings,
    pub presentation: PresentationTimings,
    pub payment: PaymentConfig,
    pub websocket: WebsocketConfig,
    pub db_path: String,
    /// Remote store used for fetches instead of the local database.
    pub store: Option<StoreConfig>,
}

// ---------------------------------------------------------------------------
// live.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire live.toml file.
#[derive(Debug, Clone, Deserialize)]
struct LiveFile {
    event: EventConfig,
    #[serde(default)]
    draw: DrawConfig,
    #[serde(default)]
    sync: SyncSection,
    #[serde(default)]
    presentation: PresentationSection,
    #[serde(default)]
    payment: PaymentConfig,
    #[serde(default)]
    websocket: WebsocketConfig,
    #[serde(default)]
    database: DatabaseSection,
    #[serde(default)]
    store: Option<StoreConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_slot_count")]
    pub slot_count: u32,
    /// ISO-8601 time the draw opens; drives the console countdown.
    #[serde(default)]
    pub draw_at: Option<String>,
}

fn default_slot_count() -> u32 {
    24
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DrawConfig {
    /// Only participants with a `paid` status are drawn.
    #[serde(default)]
    pub require_paid: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SyncSection {
    grace_window_ms: u64,
    poll_interval_ms: u64,
    health_check_ms: u64,
    degraded_after_ms: u64,
    heartbeat_ms: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        let d = SyncSettings::default();
        SyncSection {
            grace_window_ms: d.grace_window.as_millis() as u64,
            poll_interval_ms: d.poll_interval.as_millis() as u64,
            health_check_ms: d.health_check.as_millis() as u64,
            degraded_after_ms: d.degraded_after.as_millis() as u64,
            heartbeat_ms: d.heartbeat.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct PresentationSection {
    drawing_delay_ms: u64,
    reveal_hold_ms: u64,
    complete_hold_ms: u64,
    spin: Vec<SpinStage>,
}

impl Default for PresentationSection {
    fn default() -> Self {
        let d = PresentationTimings::default();
        PresentationSection {
            drawing_delay_ms: d.drawing_delay.as_millis() as u64,
            reveal_hold_ms: d.reveal_hold.as_millis() as u64,
            complete_hold_ms: d.complete_hold.as_millis() as u64,
            spin: d.spin_stages,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    /// Minutes a pending participant has to pay before expiring.
    pub window_minutes: u64,
    /// How often overdue payments are swept.
    pub sweep_interval_secs: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        PaymentConfig {
            window_minutes: 30,
            sweep_interval_secs: 30,
        }
    }
}

impl PaymentConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_minutes.saturating_mul(60))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebsocketConfig {
    /// Accept push notifications from an external notifier over WebSocket
    /// instead of the in-process change feed.
    pub enabled: bool,
    pub port: u16,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        WebsocketConfig {
            enabled: false,
            port: 9137,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DatabaseSection {
    path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub base_url: String,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/live.toml` relative to
/// `base_dir`. Does not copy defaults; see [`load_config`].
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join(CONFIG_FILE);
    let text = read_file(&path)?;
    let file: LiveFile = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.clone(),
        source: e,
    })?;

    let sync = SyncSettings {
        grace_window: Duration::from_millis(file.sync.grace_window_ms),
        poll_interval: Duration::from_millis(file.sync.poll_interval_ms),
        health_check: Duration::from_millis(file.sync.health_check_ms),
        degraded_after: Duration::from_millis(file.sync.degraded_after_ms),
        heartbeat: Duration::from_millis(file.sync.heartbeat_ms),
    };

    let presentation = PresentationTimings {
        drawing_delay: Duration::from_millis(file.presentation.drawing_delay_ms),
        spin_stages: file.presentation.spin,
        reveal_hold: Duration::from_millis(file.presentation.reveal_hold_ms),
        complete_hold: Duration::from_millis(file.presentation.complete_hold_ms),
    };

    let db_path = file.database.path.unwrap_or_else(default_db_path);

    let config = Config {
        event: file.event,
        draw: file.draw,
        sync,
        presentation,
        payment: file.payment,
        websocket: file.websocket,
        db_path,
        store: file.store,
    };

    validate(&config)?;

    Ok(config)
}

/// Ensure all config files exist by copying missing ones from `defaults/`.
/// Returns the list of files that were copied.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() {
        if !config_dir.exists() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "neither defaults/ nor config/ directory found in {}; \
                     run from the project root or ensure defaults/ is present",
                    base_dir.display()
                ),
            });
        }
        return Ok(vec![]);
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;

    let entries = std::fs::read_dir(&defaults_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to read defaults directory: {e}"),
    })?;

    let mut copied = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read defaults entry: {e}"),
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };
        let target = config_dir.join(file_name);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(mut dest) => {
                let content = std::fs::read(&path).map_err(|e| ConfigError::DefaultsCopyError {
                    message: format!("failed to read {}: {e}", path.display()),
                })?;
                std::io::Write::write_all(&mut dest, &content).map_err(|e| {
                    ConfigError::DefaultsCopyError {
                        message: format!("failed to write {}: {e}", target.display()),
                    }
                })?;
                copied.push(target);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(ConfigError::DefaultsCopyError {
                    message: format!("failed to create {}: {e}", target.display()),
                });
            }
        }
    }

    Ok(copied)
}

/// Loads config relative to the current working directory, copying defaults
/// first.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

/// Database location when `[database] path` is not set: the platform data
/// directory, or the working directory when none can be determined.
pub fn default_db_path() -> String {
    directories::ProjectDirs::from("org", "sweepdraw", "sweepdraw")
        .map(|dirs| dirs.data_dir().join("sweepdraw.db").display().to_string())
        .unwrap_or_else(|| "sweepdraw.db".to_string())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.event.id.trim().is_empty() {
        return Err(invalid("event.id", "must not be empty"));
    }

    if config.event.slot_count == 0 || config.event.slot_count > MAX_SLOTS {
        return Err(invalid(
            "event.slot_count",
            format!("must be between 1 and {MAX_SLOTS}, got {}", config.event.slot_count),
        ));
    }

    if let Some(draw_at) = &config.event.draw_at {
        if chrono::DateTime::parse_from_rfc3339(draw_at).is_err() {
            return Err(invalid(
                "event.draw_at",
                format!("must be an RFC 3339 timestamp, got {draw_at:?}"),
            ));
        }
    }

    let sync = &config.sync;
    let durations: &[(&str, Duration)] = &[
        ("sync.grace_window_ms", sync.grace_window),
        ("sync.poll_interval_ms", sync.poll_interval),
        ("sync.health_check_ms", sync.health_check),
        ("sync.degraded_after_ms", sync.degraded_after),
        ("sync.heartbeat_ms", sync.heartbeat),
    ];
    for (name, value) in durations {
        if value.is_zero() {
            return Err(invalid(name, "must be > 0"));
        }
    }

    if sync.heartbeat >= sync.grace_window {
        return Err(invalid(
            "sync.heartbeat_ms",
            format!(
                "must be shorter than sync.grace_window_ms ({}ms)",
                sync.grace_window.as_millis()
            ),
        ));
    }

    let timings = &config.presentation;
    if timings.total_spin_ticks() == 0 {
        return Err(invalid("presentation.spin", "needs at least one tick"));
    }
    if timings.spin_stages.iter().any(|s| s.ticks > 0 && s.interval_ms == 0) {
        return Err(invalid("presentation.spin", "interval_ms must be > 0"));
    }
    let cycle = timings.cycle_duration();
    if cycle > MAX_CYCLE_DURATION {
        return Err(invalid(
            "presentation",
            format!(
                "reveal cycle lasts {}ms, must not exceed {}ms",
                cycle.as_millis(),
                MAX_CYCLE_DURATION.as_millis()
            ),
        ));
    }

    let window = config.payment.window_minutes;
    if window == 0 || window > MAX_PAYMENT_WINDOW_MINUTES {
        return Err(invalid(
            "payment.window_minutes",
            format!("must be between 1 and {MAX_PAYMENT_WINDOW_MINUTES}, got {window}"),
        ));
    }
    if config.payment.sweep_interval_secs == 0 {
        return Err(invalid("payment.sweep_interval_secs", "must be > 0"));
    }

    if let Some(store) = &config.store {
        if !(store.base_url.starts_with("http://") || store.base_url.starts_with("https://")) {
            return Err(invalid("store.base_url", "must be an http(s) URL"));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
