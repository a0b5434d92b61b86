//! Core functionality for the solar monitor
//! This module contains the protocol decoders and the device connections.

pub mod battery_monitor;
pub mod bluetooth;
pub mod codec;
pub mod solar_charger;
pub mod telemetry;

// Re-export commonly used types
pub use battery_monitor::BatteryMonitorDecoder;
pub use bluetooth::MonitorService;
pub use solar_charger::{SolarChargerDecoder, TemperatureEncoding};
pub use telemetry::{ConnectionState, DeviceType, EventSink, LogSink, MonitorEvent};
