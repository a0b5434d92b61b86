use chrono::Local;
use log::{Level, LevelFilter, SetLoggerError};
use std::io::Write;

/// Formats one log line the way the monitor writes them.
pub fn format_line(timestamp: &str, level: Level, target: &str, message: &str) -> String {
    format!("{} [{}] {}: {}", timestamp, level, target, message)
}

/// Installs the global logger at `level`. `RUST_LOG` still overrides it.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    env_logger::builder()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}",
                format_line(
                    &Local::now().to_rfc3339(),
                    record.level(),
                    record.target(),
                    &record.args().to_string(),
                )
            )
        })
        .try_init()
}
