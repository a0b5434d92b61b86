//! Constants used throughout the application
//! This module contains the GATT UUIDs of both device types and the
//! default timing values of the poll loop.

use uuid::Uuid;

/// Standard Bluetooth Service UUIDs
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_MODEL_NUMBER: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration descriptor
pub const UUID_CCCD: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Value written to the CCCD to enable notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Solar charge controller data service and its read/write/notify characteristic
pub const UUID_SOLAR_CHARGER_SERVICE: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
pub const UUID_SOLAR_CHARGER_DATA_CHAR: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Battery monitor data service, its notify characteristic and its command characteristic
pub const UUID_BATTERY_MONITOR_SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_MONITOR_DATA_CHAR: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_MONITOR_CONF_CHAR: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);

/// Poll period in milliseconds
pub const DEFAULT_POLL_PERIOD_MS: u64 = 1000;

/// Poll periods without an update before the connection resyncs
pub const DEFAULT_RESYNC_AFTER_PERIODS: u32 = 3;

/// Timeout applied to queued actions in milliseconds
pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 5000;

/// Scan duration in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 10;
