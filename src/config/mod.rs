pub mod monitor_config;

pub use monitor_config::{MonitorConfig, CONFIG_FILE_NAME};
