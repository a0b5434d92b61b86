use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::{UUID_BATTERY_MONITOR_SERVICE, UUID_SOLAR_CHARGER_SERVICE};

/// Finds devices advertising the solar charger or battery monitor services
pub struct DeviceScanner {
    adapter: Adapter,
    cancel_token: CancellationToken,
}

impl DeviceScanner {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Token that ends a running scan early
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Scans for up to `duration` and returns every matching device, keyed by id.
    pub async fn scan(&self, duration: Duration) -> Result<HashMap<String, Device>> {
        let services = [UUID_SOLAR_CHARGER_SERVICE, UUID_BATTERY_MONITOR_SERVICE];
        let mut found = HashMap::new();

        // Devices already connected to the host do not advertise
        info!("Checking for connected devices");
        for device in self.adapter.connected_devices_with_services(&services).await? {
            info!("Found connected device {}", device.id());
            found.insert(device.id().to_string(), device);
        }

        info!("Starting bluetooth scan");
        let mut scan_stream = self.adapter.scan(&services).await?;
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered) => {
                            let device = discovered.device;
                            debug!("Found device - Device: {:?}, RSSI: {:?}", device, discovered.rssi);
                            let id = device.id().to_string();
                            if !found.contains_key(&id) {
                                info!("Found device {} ({:?})", id, device.name().ok());
                                found.insert(id, device);
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = &mut deadline => {
                    info!("Scan finished after {:?}", duration);
                    break;
                }
                _ = self.cancel_token.cancelled() => {
                    info!("Scan cancelled");
                    break;
                }
            }
        }
        Ok(found)
    }
}
