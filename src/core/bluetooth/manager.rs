//! Monitor service for all connected devices
//! This module owns the connection of every device and is the only place
//! connections are created or torn down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{info, warn};
use tokio::sync::Mutex;

use crate::config::MonitorConfig;
use crate::core::bluetooth::connection::{ChainOutcome, ConnectionHandle};
use crate::core::bluetooth::queue::ActionHandle;
use crate::core::bluetooth::transport::Peripheral;
use crate::core::telemetry::{DeviceType, EventSink};
use crate::error::MonitorError;
use crate::utils::display_name;

/// Registry of device connections
pub struct MonitorService {
    /// Map of device addresses to their connection
    connections: Arc<Mutex<HashMap<String, ConnectionHandle>>>,
    config: MonitorConfig,
    /// Where every connection reports its events
    sink: Arc<dyn EventSink>,
}

impl MonitorService {
    pub fn new(config: MonitorConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            config,
            sink,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Connects to a device. A device that already has a connection keeps it,
    /// and re-establishes its link if that was lost.
    pub async fn connect(&self, peripheral: Arc<dyn Peripheral>) -> Result<ConnectionHandle, MonitorError> {
        let address = peripheral.address();
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(&address) {
            if !existing.is_closed() {
                info!("Device {} already has a connection", address);
                existing.connect().await?;
                return Ok(existing.clone());
            }
        }

        info!(
            "Connecting to {}",
            display_name(peripheral.name().as_deref(), &address)
        );
        let handle = ConnectionHandle::spawn(peripheral, &self.config, self.sink.clone());
        handle.connect().await?;
        connections.insert(address, handle.clone());
        Ok(handle)
    }

    /// Closes and forgets a device's connection. Returns whether there was one.
    pub async fn disconnect(&self, address: &str) -> bool {
        let removed = self.connections.lock().await.remove(address);
        match removed {
            Some(handle) => {
                if let Err(e) = handle.close().await {
                    warn!("Failed to close connection to {}: {}", address, e);
                }
                true
            }
            None => {
                info!("Device {} not connected", address);
                false
            }
        }
    }

    pub async fn connection(&self, address: &str) -> Option<ConnectionHandle> {
        self.connections.lock().await.get(address).cloned()
    }

    pub async fn addresses(&self) -> Vec<String> {
        self.connections.lock().await.keys().cloned().collect()
    }

    async fn handles(&self) -> Vec<ConnectionHandle> {
        self.connections.lock().await.values().cloned().collect()
    }

    async fn handles_of(&self, device_type: DeviceType) -> Vec<ConnectionHandle> {
        self.handles()
            .await
            .into_iter()
            .filter(|h| h.device_type() == device_type)
            .collect()
    }

    async fn require(&self, address: &str) -> Result<ConnectionHandle, MonitorError> {
        self.connection(address)
            .await
            .ok_or_else(|| MonitorError::UnknownDevice(address.to_string()))
    }

    /// Triggers a home-data poll on one device, or on all of them.
    /// Devices that are not ready yet are skipped.
    pub async fn sync(&self, address: Option<&str>) -> Result<Vec<ActionHandle>, MonitorError> {
        let targets = match address {
            Some(address) => vec![self.require(address).await?],
            None => self.handles().await,
        };
        let mut started = Vec::new();
        for handle in targets {
            match handle.sync().await {
                Ok(Some(action)) => started.push(action),
                Ok(None) => info!("Device {} is not ready to sync", handle.address()),
                Err(e) => warn!("Failed to sync {}: {}", handle.address(), e),
            }
        }
        Ok(started)
    }

    pub async fn write_command(
        &self,
        address: &str,
        payload: Vec<u8>,
        timeout: Duration,
        await_notification: bool,
    ) -> Result<ActionHandle, MonitorError> {
        self.require(address)
            .await?
            .write_command(payload, timeout, await_notification)
            .await
    }

    pub async fn write_all_commands(
        &self,
        address: &str,
        payloads: Vec<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ChainOutcome, MonitorError> {
        self.require(address).await?.write_all_commands(payloads, timeout).await
    }

    /// Sets the capacity on every connected battery monitor.
    pub async fn set_battery_capacity(&self, capacity_ah: f64) -> Vec<ActionHandle> {
        let mut started = Vec::new();
        for handle in self.handles_of(DeviceType::BatteryMonitor).await {
            match handle.set_battery_capacity(capacity_ah).await {
                Ok(action) => started.push(action),
                Err(e) => warn!("Failed to set battery capacity on {}: {}", handle.address(), e),
            }
        }
        started
    }

    /// Starts recording on every connected battery monitor.
    pub async fn start_recording(&self) -> Vec<ActionHandle> {
        let mut started = Vec::new();
        for handle in self.handles_of(DeviceType::BatteryMonitor).await {
            match handle.start_recording().await {
                Ok(action) => started.push(action),
                Err(e) => warn!("Failed to start recording on {}: {}", handle.address(), e),
            }
        }
        started
    }

    /// Requests a recording page from every battery monitor, concurrently
    /// across devices.
    pub async fn load_recording_page(&self, size: u8, index: u8) -> Vec<(String, Result<ChainOutcome, MonitorError>)> {
        let handles = self.handles_of(DeviceType::BatteryMonitor).await;
        join_all(handles.into_iter().map(|handle| async move {
            let outcome = handle.load_recording_page(size, index).await;
            (handle.address().to_string(), outcome)
        }))
        .await
    }

    pub async fn load_charger_history(&self, address: &str, day: u8) -> Result<ActionHandle, MonitorError> {
        self.require(address).await?.load_charger_history(day).await
    }

    /// Closes every connection.
    pub async fn shutdown(&self) {
        let handles: Vec<ConnectionHandle> = self.connections.lock().await.drain().map(|(_, h)| h).collect();
        info!("Shutting down {} connections", handles.len());
        join_all(handles.iter().map(|h| h.close())).await;
    }
}
