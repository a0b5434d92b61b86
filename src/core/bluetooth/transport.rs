//! The BLE capability a connection is driven through
//! Implemented over a platform stack in production and by a mock in tests.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::error::TransportResult;

/// Notification payloads for one characteristic. The stream ending means
/// the link went down.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// GATT operations on one remote device.
///
/// Callers never issue two operations at once on the same peripheral; the
/// connection's action queue guarantees it.
#[async_trait]
pub trait Peripheral: Send + Sync {
    /// Stable platform identifier for the device
    fn address(&self) -> String;

    fn name(&self) -> Option<String> {
        None
    }

    async fn connect(&self) -> TransportResult<()>;

    async fn disconnect(&self) -> TransportResult<()>;

    async fn discover_services(&self) -> TransportResult<Vec<GattService>>;

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> TransportResult<Vec<u8>>;

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> TransportResult<()>;

    async fn read_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> TransportResult<Vec<u8>>;

    async fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> TransportResult<()>;

    /// Starts delivering change notifications for `characteristic`.
    async fn notifications(&self, service: Uuid, characteristic: Uuid) -> TransportResult<NotificationStream>;
}
