use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::escape::unescape;
use crate::protocol::{CommandLabel, DEFAULT_HISTORY_LIMIT, DEFAULT_UNSUPPORTED_PATTERN, InputFilter};
use crate::serial::{DEFAULT_BAUD_RATE, validate_baud_rate};

const MAX_RECENT_PORTS: usize = 10;

/// Application settings
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub default_baud: u32,
    /// Line terminator as typed, e.g. `\r\n`. Unescaped when used.
    pub line_end: String,
    /// `true` shows device bytes as text, `false` as hex pairs.
    pub translate_hex: bool,
    pub history_limit: usize,
    /// Empty disables the outgoing input filter.
    pub unsupported_input_pattern: String,
    pub reconnect_interval_ms: u64,
    pub push_base_delay_ms: u64,
    pub push_step_delay_ms: u64,
    pub list_sentinel_ms: u64,
    pub remove_sentinel_ms: u64,
    pub mkdir_sentinel_ms: u64,
    pub run_sentinel_ms: u64,
    /// How long a finished command stays pending to swallow trailing echo.
    pub settle_ms: u64,
    /// Copy files with the external tool instead of through the REPL.
    pub use_download_tool: bool,
    pub download_tool: String,
    pub flash_tool: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_baud: DEFAULT_BAUD_RATE,
            line_end: "\\r\\n".to_string(),
            translate_hex: true,
            history_limit: DEFAULT_HISTORY_LIMIT,
            unsupported_input_pattern: DEFAULT_UNSUPPORTED_PATTERN.to_string(),
            reconnect_interval_ms: 1000,
            push_base_delay_ms: 50,
            push_step_delay_ms: 5,
            list_sentinel_ms: 400,
            remove_sentinel_ms: 100,
            mkdir_sentinel_ms: 400,
            run_sentinel_ms: 1000,
            settle_ms: 125,
            use_download_tool: false,
            download_tool: "python QuecPyComTools.py".to_string(),
            flash_tool: "QuecPythonDownload".to_string(),
        }
    }
}

impl AppSettings {
    pub fn line_end(&self) -> String {
        unescape(&self.line_end)
    }

    pub fn input_filter(&self) -> Result<InputFilter> {
        InputFilter::new(&self.unsupported_input_pattern)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn push_delays(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.push_base_delay_ms),
            Duration::from_millis(self.push_step_delay_ms),
        )
    }

    /// When to re-emit the command token for replies with no terminator of their own.
    pub fn sentinel_delay(&self, label: CommandLabel) -> Option<Duration> {
        let ms = match label {
            CommandLabel::ListDir | CommandLabel::BootstrapList => self.list_sentinel_ms,
            CommandLabel::RemoveFile | CommandLabel::RemoveDir => self.remove_sentinel_ms,
            CommandLabel::CreateDir => self.mkdir_sentinel_ms,
            CommandLabel::RunScript => self.run_sentinel_ms,
            CommandLabel::DownloadFile | CommandLabel::SelectiveDownload => return None,
        };
        Some(Duration::from_millis(ms))
    }

    /// How long `label` stays pending after its reply completed.
    pub fn settle_delay(&self, label: CommandLabel) -> Duration {
        match label {
            CommandLabel::RunScript => Duration::ZERO,
            _ => Duration::from_millis(self.settle_ms),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_baud_rate(&self.default_baud.to_string())?;
        if self.history_limit == 0 {
            return Err(AppError::ValidationError(
                "History limit must be greater than 0".to_string(),
            ));
        }
        self.input_filter()?;
        Ok(())
    }
}

/// A port we connected to before.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PortProfile {
    pub port: String,
    pub baud: u32,
    pub last_used: DateTime<Utc>,
}

/// Main configuration structure
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub settings: AppSettings,
    #[serde(default)]
    pub recent_ports: Vec<PortProfile>,
}

/// Loads and persists `config.toml`.
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a configuration manager with a custom config path (useful for testing)
    pub fn with_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = Self::load_config_from_path(&config_path)?;
        config.settings.validate()?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// `~/.config/mcuterm`, created on first use.
    pub fn config_dir() -> Result<PathBuf> {
        let home_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .ok_or_else(|| AppError::ConfigError("HOME directory not found".to_string()))?;

        let config_dir = home_dir.join(".config").join("mcuterm");
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).map_err(|e| {
                AppError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }
        Ok(config_dir)
    }

    fn get_config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    fn load_config_from_path(config_path: &Path) -> Result<Config> {
        if !config_path.exists() {
            return Ok(Config::default());
        }

        let config_content = fs::read_to_string(config_path)
            .map_err(|e| AppError::ConfigError(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&config_content)
            .map_err(|e| AppError::ConfigError(format!("Failed to parse config file: {}", e)))
    }

    /// Persist current config to disk
    pub fn save(&self) -> Result<()> {
        let toml = toml::to_string_pretty(&self.config)
            .map_err(|e| AppError::ConfigError(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|e| AppError::ConfigError(format!("Failed to create config directory: {}", e)))?;
        }
        fs::write(&self.config_path, toml)
            .map_err(|e| AppError::ConfigError(format!("Failed to write config: {}", e)))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> &AppSettings {
        &self.config.settings
    }

    pub fn settings_mut(&mut self) -> &mut AppSettings {
        &mut self.config.settings
    }

    /// Most recently used first.
    pub fn recent_ports(&self) -> &[PortProfile] {
        &self.config.recent_ports
    }

    /// Record a successful connection and persist.
    pub fn touch_port(&mut self, port: &str, baud: u32) -> Result<()> {
        let ports = &mut self.config.recent_ports;
        ports.retain(|p| p.port != port);
        ports.insert(
            0,
            PortProfile {
                port: port.to_string(),
                baud,
                last_used: Utc::now(),
            },
        );
        ports.truncate(MAX_RECENT_PORTS);
        self.save()
    }
}
