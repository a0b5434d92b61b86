//! Error types at the library seams.

use thiserror::Error;
use uuid::Uuid;

use crate::core::telemetry::DeviceType;

/// Failures reported by a `Peripheral` implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device is not connected")]
    Disconnected,
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("descriptor {0} not found")]
    DescriptorNotFound(Uuid),
    #[error("bluetooth error: {0}")]
    Platform(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Failures surfaced to callers of the connection and registry APIs.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("no connection for device {0}")]
    UnknownDevice(String),
    #[error("device {0} is not connected")]
    NotConnected(String),
    #[error("device {address} is {actual:?}, command needs {expected:?}")]
    WrongDeviceType {
        address: String,
        expected: DeviceType,
        actual: DeviceType,
    },
    #[error("{name} {value} is out of range (0..={max})")]
    OutOfRange { name: &'static str, value: u32, max: u32 },
    #[error("connection task for {0} has stopped")]
    ConnectionClosed(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
