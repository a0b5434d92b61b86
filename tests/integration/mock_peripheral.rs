//! Mock BLE peripheral for integration tests.
//!
//! Records every transport call, answers writes through a scripted
//! responder and tracks how many operations overlap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use solar_monitor_lib::core::bluetooth::{
    GattCharacteristic, GattService, NotificationStream, Peripheral, UUID_BATTERY_MONITOR_CONF_CHAR,
    UUID_BATTERY_MONITOR_DATA_CHAR, UUID_BATTERY_MONITOR_SERVICE, UUID_CCCD, UUID_DEVICE_INFORMATION_SERVICE,
    UUID_MODEL_NUMBER, UUID_SOLAR_CHARGER_DATA_CHAR, UUID_SOLAR_CHARGER_SERVICE,
};
use solar_monitor_lib::core::bluetooth::{BatteryMonitorCommands, SolarChargerCommands};
use solar_monitor_lib::core::telemetry::MonitorEvent;
use solar_monitor_lib::TransportError;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const HOME_FRAME: &str = "0103260064010803e701072119000000000000023603af025c000000020000006300056a7200000000ad9a";
pub const CHART_FRAME: &str = "01030a198900000532010f0100f764";

// ── Call record ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Connect,
    Disconnect,
    Discover,
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    ReadDescriptor(Uuid),
    WriteDescriptor(Uuid, Vec<u8>),
    Subscribe(Uuid),
}

/// Maps a write to the notifications the device sends back.
pub type Responder = Box<dyn Fn(Uuid, &[u8]) -> Vec<(Uuid, Vec<u8>)> + Send + Sync>;

// ── MockPeripheral ────────────────────────────────────────────

pub struct MockPeripheral {
    address: String,
    services: Vec<GattService>,
    pub calls: Mutex<Vec<MockCall>>,
    responder: Mutex<Option<Responder>>,
    subscribers: Mutex<HashMap<Uuid, mpsc::UnboundedSender<Vec<u8>>>>,
    /// Delay applied to every operation, in call order, cycling
    delays: Mutex<Vec<Duration>>,
    /// Number of upcoming writes that never complete
    hung_writes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    operations: AtomicUsize,
}

/// Counts an operation as in flight until dropped, including when aborted.
struct InFlight<'a>(&'a MockPeripheral);

impl<'a> InFlight<'a> {
    fn enter(mock: &'a MockPeripheral) -> Self {
        let now = mock.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        mock.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(mock)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn characteristic(uuid: Uuid, descriptors: &[Uuid]) -> GattCharacteristic {
    GattCharacteristic {
        uuid,
        descriptors: descriptors.to_vec(),
    }
}

pub fn device_info_service() -> GattService {
    GattService {
        uuid: UUID_DEVICE_INFORMATION_SERVICE,
        characteristics: vec![characteristic(UUID_MODEL_NUMBER, &[])],
    }
}

pub fn solar_service() -> GattService {
    GattService {
        uuid: UUID_SOLAR_CHARGER_SERVICE,
        characteristics: vec![characteristic(UUID_SOLAR_CHARGER_DATA_CHAR, &[UUID_CCCD])],
    }
}

pub fn battery_service() -> GattService {
    GattService {
        uuid: UUID_BATTERY_MONITOR_SERVICE,
        characteristics: vec![
            characteristic(UUID_BATTERY_MONITOR_DATA_CHAR, &[UUID_CCCD]),
            characteristic(UUID_BATTERY_MONITOR_CONF_CHAR, &[]),
        ],
    }
}

/// Answers home and chart queries like a real charger.
pub fn solar_responder() -> Responder {
    Box::new(|characteristic, value| {
        if characteristic != UUID_SOLAR_CHARGER_DATA_CHAR {
            return Vec::new();
        }
        if value == SolarChargerCommands::HOME_DATA {
            vec![(characteristic, hex::decode(HOME_FRAME).unwrap())]
        } else if SolarChargerCommands::requested_day(value).is_some() {
            vec![(characteristic, hex::decode(CHART_FRAME).unwrap())]
        } else {
            Vec::new()
        }
    })
}

/// Answers the home-data poll with a live packet split over two notifications.
pub fn battery_responder() -> Responder {
    Box::new(|characteristic, value| {
        if characteristic == UUID_BATTERY_MONITOR_CONF_CHAR && value == BatteryMonitorCommands::HOME_DATA {
            vec![
                (UUID_BATTERY_MONITOR_DATA_CHAR, hex::decode("bb2043c105").unwrap()),
                (UUID_BATTERY_MONITOR_DATA_CHAR, hex::decode("2954d825ee").unwrap()),
            ]
        } else {
            Vec::new()
        }
    })
}

#[allow(dead_code)]
impl MockPeripheral {
    pub fn new(address: &str, services: Vec<GattService>) -> Self {
        Self {
            address: address.to_string(),
            services,
            calls: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            subscribers: Mutex::new(HashMap::new()),
            delays: Mutex::new(Vec::new()),
            hung_writes: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            operations: AtomicUsize::new(0),
        }
    }

    pub fn solar_charger(address: &str) -> Arc<Self> {
        let mock = Self::new(address, vec![device_info_service(), solar_service()]);
        mock.set_responder(solar_responder());
        Arc::new(mock)
    }

    pub fn battery_monitor(address: &str) -> Arc<Self> {
        let mock = Self::new(address, vec![device_info_service(), battery_service()]);
        mock.set_responder(battery_responder());
        Arc::new(mock)
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock().unwrap() = Some(responder);
    }

    pub fn clear_responder(&self) {
        *self.responder.lock().unwrap() = None;
    }

    pub fn set_delays(&self, delays: Vec<Duration>) {
        *self.delays.lock().unwrap() = delays;
    }

    pub fn hang_writes(&self, count: usize) {
        self.hung_writes.store(count, Ordering::SeqCst);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn writes_to(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Write(target, value) if target == uuid => Some(value),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &MockCall) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    /// Sends an unsolicited notification.
    pub fn notify(&self, characteristic: Uuid, value: &[u8]) {
        if let Some(tx) = self.subscribers.lock().unwrap().get(&characteristic) {
            let _ = tx.send(value.to_vec());
        }
    }

    /// Ends every notification stream, as a dropped link does.
    pub fn drop_link(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    async fn delay(&self) {
        let index = self.operations.fetch_add(1, Ordering::SeqCst);
        let delay = {
            let delays = self.delays.lock().unwrap();
            if delays.is_empty() {
                Duration::ZERO
            } else {
                delays[index % delays.len()]
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Peripheral for MockPeripheral {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn name(&self) -> Option<String> {
        Some("Mock".to_string())
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.record(MockCall::Connect);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record(MockCall::Disconnect);
        self.drop_link();
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, TransportError> {
        self.record(MockCall::Discover);
        Ok(self.services.clone())
    }

    async fn read_characteristic(&self, _service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let _guard = InFlight::enter(self);
        self.delay().await;
        self.record(MockCall::Read(characteristic));
        if characteristic == UUID_MODEL_NUMBER {
            Ok(b"BT-TH-1\0".to_vec())
        } else {
            Err(TransportError::CharacteristicNotFound(characteristic))
        }
    }

    async fn write_characteristic(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let _guard = InFlight::enter(self);
        self.record(MockCall::Write(characteristic, value.to_vec()));
        let hang = self
            .hung_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hang {
            std::future::pending::<()>().await;
        }
        self.delay().await;

        let replies = match self.responder.lock().unwrap().as_ref() {
            Some(responder) => responder(characteristic, value),
            None => Vec::new(),
        };
        for (target, reply) in replies {
            self.notify(target, &reply);
        }
        Ok(())
    }

    async fn read_descriptor(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let _guard = InFlight::enter(self);
        self.record(MockCall::ReadDescriptor(descriptor));
        Ok(vec![0x00, 0x00])
    }

    async fn write_descriptor(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let _guard = InFlight::enter(self);
        self.delay().await;
        self.record(MockCall::WriteDescriptor(descriptor, value.to_vec()));
        Ok(())
    }

    async fn notifications(&self, _service: Uuid, characteristic: Uuid) -> Result<NotificationStream, TransportError> {
        self.record(MockCall::Subscribe(characteristic));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().insert(characteristic, tx);
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) }).boxed())
    }
}

// ── Event helpers ─────────────────────────────────────────────

/// Waits (in paused time) for the first event matching `pred`.
pub async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>, pred: F) -> MonitorEvent
where
    F: Fn(&MonitorEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collects every event currently queued.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
