use crate::core::bluetooth::{
    DEFAULT_ACTION_TIMEOUT_MS, DEFAULT_POLL_PERIOD_MS, DEFAULT_RESYNC_AFTER_PERIODS, DEFAULT_SCAN_DURATION_SECS,
};
use crate::core::battery_monitor::DEFAULT_BUFFER_CAP;
use crate::core::solar_charger::TemperatureEncoding;
use crate::utils::ensure_directory_exists;
use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

pub const CONFIG_FILE_NAME: &str = "monitor_config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Poll period in milliseconds. Follow-up queries go out after half of it.
    pub poll_period_ms: u64,

    /// Poll periods without a decoded update before pending actions are
    /// flushed and the device is asked for home data again.
    pub resync_after_periods: u32,

    /// Timeout for queued actions that do not give one explicitly.
    pub action_timeout_ms: u64,

    /// Battery monitor reassembly buffer size before it is thrown away.
    pub read_buffer_cap: usize,

    /// How negative charger temperatures are encoded.
    pub charger_temperature: TemperatureEncoding,

    /// How long the binary scans for devices.
    pub scan_duration_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            poll_period_ms: DEFAULT_POLL_PERIOD_MS,
            resync_after_periods: DEFAULT_RESYNC_AFTER_PERIODS,
            action_timeout_ms: DEFAULT_ACTION_TIMEOUT_MS,
            read_buffer_cap: DEFAULT_BUFFER_CAP,
            charger_temperature: TemperatureEncoding::default(),
            scan_duration_secs: DEFAULT_SCAN_DURATION_SECS,
        }
    }
}

impl MonitorConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms.max(1))
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    /// Time without updates after which the connection resyncs
    pub fn resync_after(&self) -> Duration {
        self.poll_period() * self.resync_after_periods.max(1)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    /// Loads the config from `config_dir`, falling back to defaults when
    /// the file does not exist.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path_str);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(&file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the current config into `config_dir`.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        ensure_directory_exists(config_dir).await?;

        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize monitor config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(&file_path, config_json).await?;

        info!("Monitor config saved to {:?}.", file_path_str);
        Ok(())
    }
}
