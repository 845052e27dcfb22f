//! boardctl configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub manager: ManagerSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub upload: UploadSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(default = "GeneralSettings::default_log_level")]
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl GeneralSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Board manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Grace period before a missing board is dropped, in milliseconds
    #[serde(default = "ManagerSettings::default_drop_delay")]
    pub drop_delay_ms: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            drop_delay_ms: Self::default_drop_delay(),
        }
    }
}

impl ManagerSettings {
    fn default_drop_delay() -> u64 {
        5000
    }

    pub fn manager_config(&self) -> board::ManagerConfig {
        board::ManagerConfig {
            drop_delay: Duration::from_millis(self.drop_delay_ms),
        }
    }
}

/// Task pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "PoolSettings::default_max_threads")]
    pub max_threads: usize,
    /// Idle worker lifetime in milliseconds (0 = keep forever)
    #[serde(default = "PoolSettings::default_idle_timeout")]
    pub idle_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_threads: Self::default_max_threads(),
            idle_timeout_ms: Self::default_idle_timeout(),
        }
    }
}

impl PoolSettings {
    fn default_max_threads() -> usize {
        16
    }

    fn default_idle_timeout() -> u64 {
        10_000
    }

    pub fn pool_config(&self) -> pool::PoolConfig {
        pool::PoolConfig {
            max_threads: self.max_threads,
            idle_timeout: (self.idle_timeout_ms > 0)
                .then(|| Duration::from_millis(self.idle_timeout_ms)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Devices to watch (VID:PID patterns); empty watches everything
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Reset the board after a successful upload
    #[serde(default = "UploadSettings::default_reset_after")]
    pub reset_after: bool,
    /// How long to wait for a board to come back in bootloader mode after
    /// asking it to reboot, in milliseconds
    #[serde(default = "UploadSettings::default_reboot_delay")]
    pub reboot_delay_ms: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            reset_after: Self::default_reset_after(),
            reboot_delay_ms: Self::default_reboot_delay(),
        }
    }
}

impl UploadSettings {
    fn default_reset_after() -> bool {
        true
    }

    fn default_reboot_delay() -> u64 {
        4000
    }

    pub fn reboot_delay(&self) -> Duration {
        Duration::from_millis(self.reboot_delay_ms)
    }
}

impl CliConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/boardctl/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::debug!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: CliConfig = toml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("boardctl").join("config.toml")
        } else {
            PathBuf::from(".config/boardctl/config.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.pool.max_threads == 0 {
            return Err(anyhow!("pool.max_threads must be at least 1"));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        if filter == "*" {
            return Ok(());
        }

        let Some((vid, pid)) = filter.split_once(':') else {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x16c0:0x0478' or '0x16c0:*')",
                filter
            ));
        };

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| {
                anyhow!(
                    "Invalid {} '{}', must start with '0x' (e.g., '0x16c0')",
                    name,
                    id
                )
            })?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}
