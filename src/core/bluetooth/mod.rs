//! Bluetooth functionality for the solar monitor
//! This module handles connecting to monitored devices, serializing GATT
//! operations and turning their notifications into telemetry.

pub mod commands;
pub mod connection;
pub mod constants;
pub mod manager;
pub mod notification;
pub mod queue;
pub mod transport;

#[cfg(feature = "bluest")]
pub mod bluest_transport;
#[cfg(feature = "bluest")]
pub mod scanner;

// Re-export types that should be publicly accessible
pub use commands::{BatteryMonitorCommands, SolarChargerCommands};
pub use connection::{ChainOutcome, ConnectionHandle, ConnectionSnapshot, ServiceProfile};
pub use constants::*; // Re-export all constants
pub use manager::MonitorService;
pub use notification::{NotificationEvent, NotificationHandler};
pub use queue::{Action, ActionHandle, ActionId, ActionKind, ActionQueue, ActionTarget, Operation};
pub use transport::{GattCharacteristic, GattService, NotificationStream, Peripheral};

#[cfg(feature = "bluest")]
pub use bluest_transport::BluestPeripheral;
#[cfg(feature = "bluest")]
pub use scanner::DeviceScanner;
