//! `Peripheral` over the bluest BLE stack

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device};
use futures_util::{stream, StreamExt};
use log::{debug, error, info};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::core::bluetooth::constants::UUID_CCCD;
use crate::core::bluetooth::transport::{GattCharacteristic, GattService, NotificationStream, Peripheral};
use crate::error::{TransportError, TransportResult};

impl From<bluest::Error> for TransportError {
    fn from(e: bluest::Error) -> Self {
        TransportError::Platform(e.to_string())
    }
}

/// A remote device reached through a bluest adapter
#[derive(Clone)]
pub struct BluestPeripheral {
    adapter: Adapter,
    device: Device,
    characteristics: Arc<Mutex<HashMap<(Uuid, Uuid), Characteristic>>>,
}

impl BluestPeripheral {
    pub fn new(adapter: Adapter, device: Device) -> Self {
        Self {
            adapter,
            device,
            characteristics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cached(&self, service: Uuid, characteristic: Uuid) -> Option<Characteristic> {
        self.characteristics
            .lock()
            .ok()
            .and_then(|map| map.get(&(service, characteristic)).cloned())
    }

    async fn characteristic(&self, service: Uuid, characteristic: Uuid) -> TransportResult<Characteristic> {
        if let Some(found) = self.cached(service, characteristic) {
            return Ok(found);
        }
        let services = self.device.services().await?;
        let svc = services
            .iter()
            .find(|s| s.uuid() == service)
            .ok_or(TransportError::ServiceNotFound(service))?;
        let found = svc
            .characteristics()
            .await?
            .into_iter()
            .find(|c| c.uuid() == characteristic)
            .ok_or(TransportError::CharacteristicNotFound(characteristic))?;
        if let Ok(mut map) = self.characteristics.lock() {
            map.insert((service, characteristic), found.clone());
        }
        Ok(found)
    }

    async fn descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> TransportResult<bluest::Descriptor> {
        let c = self.characteristic(service, characteristic).await?;
        c.descriptors()
            .await?
            .into_iter()
            .find(|d| d.uuid() == descriptor)
            .ok_or(TransportError::DescriptorNotFound(descriptor))
    }
}

#[async_trait]
impl Peripheral for BluestPeripheral {
    fn address(&self) -> String {
        self.device.id().to_string()
    }

    fn name(&self) -> Option<String> {
        self.device.name().ok()
    }

    async fn connect(&self) -> TransportResult<()> {
        if !self.device.is_connected().await {
            info!("Initiating connection to {}...", self.device.id());
            self.adapter.connect_device(&self.device).await?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if self.device.is_connected().await {
            info!("Disconnecting from device {}", self.device.id());
            self.adapter.disconnect_device(&self.device).await?;
        } else {
            info!("Device {} not connected", self.device.id());
        }
        if let Ok(mut map) = self.characteristics.lock() {
            map.clear();
        }
        Ok(())
    }

    async fn discover_services(&self) -> TransportResult<Vec<GattService>> {
        let mut discovered = Vec::new();
        for service in self.device.discover_services().await? {
            let mut characteristics = Vec::new();
            for c in service.characteristics().await? {
                let descriptors = match c.descriptors().await {
                    Ok(descriptors) => descriptors.iter().map(|d| d.uuid()).collect(),
                    Err(e) => {
                        debug!("No descriptors for {}: {}", c.uuid(), e);
                        Vec::new()
                    }
                };
                if let Ok(mut map) = self.characteristics.lock() {
                    map.insert((service.uuid(), c.uuid()), c.clone());
                }
                characteristics.push(GattCharacteristic {
                    uuid: c.uuid(),
                    descriptors,
                });
            }
            discovered.push(GattService {
                uuid: service.uuid(),
                characteristics,
            });
        }
        Ok(discovered)
    }

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> TransportResult<Vec<u8>> {
        let c = self.characteristic(service, characteristic).await?;
        Ok(c.read().await?)
    }

    async fn write_characteristic(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> TransportResult<()> {
        let c = self.characteristic(service, characteristic).await?;
        c.write(value).await?;
        Ok(())
    }

    async fn read_descriptor(&self, service: Uuid, characteristic: Uuid, descriptor: Uuid) -> TransportResult<Vec<u8>> {
        let d = self.descriptor(service, characteristic, descriptor).await?;
        Ok(d.read().await?)
    }

    async fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> TransportResult<()> {
        // bluest subscribes through `notify()`; writing the CCCD by hand is
        // rejected on some platforms
        if descriptor == UUID_CCCD {
            debug!("Notifications for {} are enabled by the subscription", characteristic);
            return Ok(());
        }
        let d = self.descriptor(service, characteristic, descriptor).await?;
        d.write(value).await?;
        Ok(())
    }

    async fn notifications(&self, service: Uuid, characteristic: Uuid) -> TransportResult<NotificationStream> {
        let c = self.characteristic(service, characteristic).await?;
        let (subscribed_tx, subscribed_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // The bluest stream borrows the characteristic, so it lives in its own task
        tokio::spawn(async move {
            let mut notifications = match c.notify().await {
                Ok(stream) => {
                    let _ = subscribed_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = subscribed_tx.send(Err(TransportError::from(e)));
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    next = notifications.next() => match next {
                        Some(Ok(value)) => {
                            if tx.send(value).is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("Error in notification stream: {}", e);
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        subscribed_rx
            .await
            .map_err(|_| TransportError::Platform("notification task stopped".to_string()))??;
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|value| (value, rx)) }).boxed())
    }
}
