//! Solar monitor library
//! Connects to BLE solar charge controllers and battery monitors, decodes
//! their telemetry and reports it as typed events.

// Module declarations
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod utils;

pub use config::MonitorConfig;
pub use core::bluetooth::{ConnectionHandle, MonitorService, Peripheral};
pub use core::telemetry::{EventSink, MonitorEvent};
pub use error::{MonitorError, TransportError};
