use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const MCP_SUBDIR: &str = "mcp";
pub const SETTINGS_FILE_NAME: &str = "bridge.settings.toml";
pub const CATALOG_FILE_NAME: &str = "library.db";
pub const DEFAULT_REMOTE: &str = "remote:photos";

/// Fully resolved runtime settings. Every polling interval and timeout the
/// bridge uses is read from here.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub config_dir: PathBuf,
    pub db_path: PathBuf,
    pub poll_interval: Duration,
    pub response_timeout: Duration,
    pub monitor_interval: Duration,
    pub monitor_backoff: Duration,
    pub catalog_retry_attempts: u32,
    pub catalog_retry_delay: Duration,
    pub default_remote: String,
    pub rclone_binary: String,
    pub mock_upload_delay: Duration,
    pub status_preview_chars: usize,
    pub dead_letter: bool,
    pub editor_command: Option<String>,
}

impl BridgeConfig {
    pub fn with_config_dir(config_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        Self {
            db_path: config_dir.join(CATALOG_FILE_NAME),
            config_dir,
            poll_interval: Duration::from_millis(100),
            response_timeout: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(1),
            monitor_backoff: Duration::from_secs(5),
            catalog_retry_attempts: 3,
            catalog_retry_delay: Duration::from_millis(200),
            default_remote: String::from(DEFAULT_REMOTE),
            rclone_binary: String::from("rclone"),
            mock_upload_delay: Duration::from_secs(1),
            status_preview_chars: 200,
            dead_letter: true,
            editor_command: None,
        }
    }

    pub fn mcp_dir(&self) -> PathBuf {
        self.config_dir.join(MCP_SUBDIR)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.mcp_dir().join(SETTINGS_FILE_NAME)
    }

    /// Resolves defaults, then `mcp/bridge.settings.toml`, then `DT_MCP_*`
    /// environment variables. `config_dir_override` (the `--config-dir` flag)
    /// wins over everything for the directory itself.
    pub fn resolve(config_dir_override: Option<&Path>) -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let config_dir = match config_dir_override {
            Some(dir) => dir.to_path_buf(),
            None => match non_empty(env("DT_MCP_CONFIG_DIR")) {
                Some(dir) => PathBuf::from(dir),
                None => default_config_dir()?,
            },
        };

        let settings_path = config_dir.join(MCP_SUBDIR).join(SETTINGS_FILE_NAME);
        let settings_raw = match fs::read_to_string(settings_path.as_path()) {
            Ok(raw) => Some(raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(ConfigError::ReadFile {
                    path: settings_path.display().to_string(),
                    message: err.to_string(),
                })
            }
        };

        select_config(config_dir, settings_raw.as_deref(), env)
    }
}

/// Optional overrides, shared by the TOML file and the environment layer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BridgeSettingsOverlay {
    pub db_path: Option<PathBuf>,
    pub poll_interval_ms: Option<u64>,
    pub response_timeout_ms: Option<u64>,
    pub monitor_interval_ms: Option<u64>,
    pub monitor_backoff_ms: Option<u64>,
    pub catalog_retry_attempts: Option<u32>,
    pub catalog_retry_delay_ms: Option<u64>,
    pub default_remote: Option<String>,
    pub rclone_binary: Option<String>,
    pub mock_upload_delay_ms: Option<u64>,
    pub status_preview_chars: Option<usize>,
    pub dead_letter: Option<bool>,
    pub editor_command: Option<String>,
}

impl BridgeSettingsOverlay {
    fn apply_to(&self, cfg: &mut BridgeConfig) {
        if let Some(path) = &self.db_path {
            cfg.db_path = if path.is_absolute() {
                path.clone()
            } else {
                cfg.config_dir.join(path)
            };
        }
        apply_ms(&mut cfg.poll_interval, self.poll_interval_ms);
        apply_ms(&mut cfg.response_timeout, self.response_timeout_ms);
        apply_ms(&mut cfg.monitor_interval, self.monitor_interval_ms);
        apply_ms(&mut cfg.monitor_backoff, self.monitor_backoff_ms);
        apply_ms(&mut cfg.catalog_retry_delay, self.catalog_retry_delay_ms);
        apply_ms(&mut cfg.mock_upload_delay, self.mock_upload_delay_ms);
        if let Some(attempts) = self.catalog_retry_attempts {
            cfg.catalog_retry_attempts = attempts.max(1);
        }
        if let Some(remote) = non_empty(self.default_remote.clone()) {
            cfg.default_remote = remote;
        }
        if let Some(binary) = non_empty(self.rclone_binary.clone()) {
            cfg.rclone_binary = binary;
        }
        if let Some(chars) = self.status_preview_chars {
            cfg.status_preview_chars = chars.max(1);
        }
        if let Some(enabled) = self.dead_letter {
            cfg.dead_letter = enabled;
        }
        if let Some(editor) = non_empty(self.editor_command.clone()) {
            cfg.editor_command = Some(editor);
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cannot locate a config directory: neither XDG_CONFIG_HOME nor HOME is set")]
    NoConfigDir,
    #[error("failed to read bridge settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse bridge settings TOML: {0}")]
    ParseToml(String),
    #[error("environment variable {key} has invalid value '{value}'")]
    InvalidEnv { key: String, value: String },
}

pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    if let Some(xdg) = non_empty(std::env::var("XDG_CONFIG_HOME").ok()) {
        return Ok(PathBuf::from(xdg).join("darktable"));
    }
    let home = non_empty(std::env::var("HOME").ok()).ok_or(ConfigError::NoConfigDir)?;
    Ok(PathBuf::from(home).join(".config").join("darktable"))
}

fn select_config(
    config_dir: PathBuf,
    settings_raw: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, ConfigError> {
    let mut cfg = BridgeConfig::with_config_dir(config_dir);
    if let Some(raw) = settings_raw {
        let file_overlay: BridgeSettingsOverlay =
            toml::from_str(raw).map_err(|e| ConfigError::ParseToml(e.to_string()))?;
        file_overlay.apply_to(&mut cfg);
    }
    env_overlay(env)?.apply_to(&mut cfg);
    Ok(cfg)
}

fn env_overlay(env: impl Fn(&str) -> Option<String>) -> Result<BridgeSettingsOverlay, ConfigError> {
    let read = |key: &str| non_empty(env(key));
    Ok(BridgeSettingsOverlay {
        db_path: read("DT_MCP_DB").map(PathBuf::from),
        poll_interval_ms: parse_env(&read, "DT_MCP_POLL_INTERVAL_MS")?,
        response_timeout_ms: parse_env(&read, "DT_MCP_RESPONSE_TIMEOUT_MS")?,
        monitor_interval_ms: parse_env(&read, "DT_MCP_MONITOR_INTERVAL_MS")?,
        monitor_backoff_ms: parse_env(&read, "DT_MCP_MONITOR_BACKOFF_MS")?,
        catalog_retry_attempts: None,
        catalog_retry_delay_ms: None,
        default_remote: read("DT_MCP_DEFAULT_REMOTE"),
        rclone_binary: read("DT_MCP_RCLONE"),
        mock_upload_delay_ms: None,
        status_preview_chars: None,
        dead_letter: read("DT_MCP_DEAD_LETTER")
            .map(|value| parse_bool(value.as_str()).ok_or(value))
            .transpose()
            .map_err(|value| ConfigError::InvalidEnv {
                key: String::from("DT_MCP_DEAD_LETTER"),
                value,
            })?,
        editor_command: read("DT_MCP_EDITOR"),
    })
}

fn parse_env<T: std::str::FromStr>(
    read: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = read(key) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn apply_ms(slot: &mut Duration, value: Option<u64>) {
    if let Some(ms) = value {
        *slot = Duration::from_millis(ms);
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
