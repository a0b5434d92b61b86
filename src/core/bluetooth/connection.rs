//! Connection handling for one monitored device
//! Each device is driven by its own task which owns the transport, the action
//! queue and the protocol decoders. Callers talk to it through a `ConnectionHandle`.

use std::cell::OnceCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::core::battery_monitor::{BatteryMonitorDecoder, BatteryMonitorOutput};
use crate::core::bluetooth::commands::{BatteryMonitorCommands, SolarChargerCommands};
use crate::core::bluetooth::constants::*;
use crate::core::bluetooth::notification::{NotificationEvent, NotificationHandler};
use crate::core::bluetooth::queue::{
    Action, ActionHandle, ActionId, ActionKind, ActionQueue, ActionTarget, Operation,
};
use crate::core::bluetooth::transport::{GattService, Peripheral};
use crate::core::solar_charger::SolarChargerDecoder;
use crate::core::telemetry::{ConnectionState, DeviceType, EventSink, MonitorEvent};
use crate::error::{MonitorError, TransportResult};

/// GATT layout of a device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceProfile {
    pub service: Uuid,
    /// Characteristic that notifies telemetry
    pub data: Uuid,
    /// Characteristic commands are written to
    pub command: Uuid,
}

impl ServiceProfile {
    pub fn for_device(device_type: DeviceType) -> Option<Self> {
        match device_type {
            DeviceType::SolarCharger => Some(Self {
                service: UUID_SOLAR_CHARGER_SERVICE,
                data: UUID_SOLAR_CHARGER_DATA_CHAR,
                command: UUID_SOLAR_CHARGER_DATA_CHAR,
            }),
            DeviceType::BatteryMonitor => Some(Self {
                service: UUID_BATTERY_MONITOR_SERVICE,
                data: UUID_BATTERY_MONITOR_DATA_CHAR,
                command: UUID_BATTERY_MONITOR_CONF_CHAR,
            }),
            DeviceType::Unknown => None,
        }
    }

    /// Device type whose data service has this uuid
    pub fn identify(service: Uuid) -> Option<DeviceType> {
        if service == UUID_SOLAR_CHARGER_SERVICE {
            Some(DeviceType::SolarCharger)
        } else if service == UUID_BATTERY_MONITOR_SERVICE {
            Some(DeviceType::BatteryMonitor)
        } else {
            None
        }
    }
}

/// Observable connection status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub device_type: DeviceType,
    /// Last time a frame was decoded (or the link came up)
    pub last_updated: DateTime<Local>,
}

/// Result of a chained command sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    Completed,
    /// The command at `index` timed out or failed; later ones were not sent.
    Aborted { index: usize },
}

enum Command {
    Connect,
    Queue(Action),
    Abort(ActionId),
    Sync(oneshot::Sender<Option<ActionHandle>>),
    Close(oneshot::Sender<()>),
}

enum Event {
    Connected(TransportResult<()>),
    Discovered(TransportResult<Vec<GattService>>),
    OperationFinished {
        id: ActionId,
        result: TransportResult<Vec<u8>>,
    },
    Notification(NotificationEvent),
    ActionTimeout(ActionId),
    InitialSync,
    FollowUp(Vec<u8>),
    Model(Vec<u8>),
}

/// Cloneable handle to a connection task.
///
/// The task stops when `close` is called or every handle is dropped.
#[derive(Clone)]
pub struct ConnectionHandle {
    address: String,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    ids: Arc<AtomicU64>,
    action_timeout: Duration,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("address", &self.address)
            .field("snapshot", &*self.snapshot.borrow())
            .finish()
    }
}

impl ConnectionHandle {
    /// Spawns the connection task. Nothing happens on the link until `connect`.
    pub fn spawn(peripheral: Arc<dyn Peripheral>, config: &MonitorConfig, sink: Arc<dyn EventSink>) -> Self {
        let address = peripheral.address();
        let ids = Arc::new(AtomicU64::new(1));
        let (command_tx, command_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot {
            state: ConnectionState::Disconnected,
            device_type: DeviceType::Unknown,
            last_updated: Local::now(),
        });

        let connection = MonitorConnection {
            peripheral,
            address: address.clone(),
            config: config.clone(),
            sink,
            ids: ids.clone(),
            events: event_tx,
            snapshot: snapshot_tx,
            device_type: OnceCell::new(),
            state: ConnectionState::Disconnected,
            linked: false,
            watchdog_mark: Instant::now(),
            follow_up_pending: false,
            queue: ActionQueue::new(),
            in_flight: None,
            solar: SolarChargerDecoder::new(config.charger_temperature),
            battery: BatteryMonitorDecoder::new(config.read_buffer_cap),
            notifications: NotificationHandler::new(),
            poll: None,
            timers: CancellationToken::new(),
        };
        tokio::spawn(connection.run(command_rx, event_rx));

        Self {
            address,
            commands: command_tx,
            snapshot: snapshot_rx,
            ids,
            action_timeout: config.action_timeout(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn device_type(&self) -> DeviceType {
        self.snapshot.borrow().device_type
    }

    /// Receiver that observes every snapshot change
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub fn next_action_id(&self) -> ActionId {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, command: Command) -> Result<(), MonitorError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MonitorError::ConnectionClosed(self.address.clone()))
    }

    /// Requests the link. Does nothing if one exists or is being set up.
    pub async fn connect(&self) -> Result<(), MonitorError> {
        self.send(Command::Connect).await
    }

    /// Queues an immediate home-data poll. `None` if the device is not
    /// connected and typed yet.
    pub async fn sync(&self) -> Result<Option<ActionHandle>, MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Sync(tx)).await?;
        rx.await.map_err(|_| MonitorError::ConnectionClosed(self.address.clone()))
    }

    /// Queues an arbitrary action built by the caller.
    pub async fn queue_action(&self, action: Action) -> Result<(), MonitorError> {
        self.send(Command::Queue(action)).await
    }

    fn ready_profile(&self) -> Result<ServiceProfile, MonitorError> {
        let snapshot = self.snapshot();
        if snapshot.state != ConnectionState::Connected {
            return Err(MonitorError::NotConnected(self.address.clone()));
        }
        ServiceProfile::for_device(snapshot.device_type).ok_or_else(|| MonitorError::NotConnected(self.address.clone()))
    }

    fn require(&self, expected: DeviceType) -> Result<ServiceProfile, MonitorError> {
        let profile = self.ready_profile()?;
        let actual = self.device_type();
        if actual != expected {
            return Err(MonitorError::WrongDeviceType {
                address: self.address.clone(),
                expected,
                actual,
            });
        }
        Ok(profile)
    }

    async fn write_to(
        &self,
        profile: ServiceProfile,
        payload: Vec<u8>,
        timeout: Duration,
        await_notification: bool,
    ) -> Result<ActionHandle, MonitorError> {
        let kind = if await_notification {
            ActionKind::WriteThenAwaitNotification(profile.data)
        } else {
            ActionKind::Write
        };
        let target = ActionTarget::Characteristic {
            service: profile.service,
            characteristic: profile.command,
        };
        let (action, handle) = Action::new(self.next_action_id(), kind, target, Some(payload), timeout).with_handle();
        self.queue_action(action).await?;
        Ok(handle)
    }

    /// Writes a raw command to the device's command characteristic.
    ///
    /// With `await_notification` the action only completes when the device
    /// answers on its data characteristic, and the handle yields the answer.
    pub async fn write_command(
        &self,
        payload: Vec<u8>,
        timeout: Duration,
        await_notification: bool,
    ) -> Result<ActionHandle, MonitorError> {
        let profile = self.ready_profile()?;
        self.write_to(profile, payload, timeout, await_notification).await
    }

    /// Writes commands one after another, each only after the previous one
    /// completed. Stops at the first one that times out or fails.
    pub async fn write_all_commands(&self, payloads: Vec<Vec<u8>>, timeout: Duration) -> Result<ChainOutcome, MonitorError> {
        let profile = self.ready_profile()?;
        for (index, payload) in payloads.into_iter().enumerate() {
            let handle = self.write_to(profile, payload, timeout, false).await?;
            if handle.wait().await.is_none() {
                warn!("[{}] Command {} of chain did not complete", self.address, index);
                return Ok(ChainOutcome::Aborted { index });
            }
        }
        Ok(ChainOutcome::Completed)
    }

    /// Removes a queued action, resolving it with `None`. An action already
    /// in flight is left to finish or time out.
    pub async fn abort_action(&self, id: ActionId) -> Result<(), MonitorError> {
        self.send(Command::Abort(id)).await
    }

    pub async fn set_battery_capacity(&self, capacity_ah: f64) -> Result<ActionHandle, MonitorError> {
        let profile = self.require(DeviceType::BatteryMonitor)?;
        let payload = BatteryMonitorCommands::set_battery_capacity(capacity_ah);
        self.write_to(profile, payload, self.action_timeout, false).await
    }

    pub async fn start_recording(&self) -> Result<ActionHandle, MonitorError> {
        let profile = self.require(DeviceType::BatteryMonitor)?;
        let payload = BatteryMonitorCommands::START_RECORDING.to_vec();
        self.write_to(profile, payload, self.action_timeout, false).await
    }

    /// Asks the battery monitor for a page of recorded samples. The samples
    /// arrive later as `RecordedSamples` events. Size and index are 0-99.
    pub async fn load_recording_page(&self, size: u8, index: u8) -> Result<ChainOutcome, MonitorError> {
        self.require(DeviceType::BatteryMonitor)?;
        let payloads = BatteryMonitorCommands::load_recording_page(size, index)
            .ok_or_else(|| {
                let (name, value) = if size > BatteryMonitorCommands::MAX_PAGE_VALUE {
                    ("page size", size)
                } else {
                    ("page index", index)
                };
                MonitorError::OutOfRange {
                    name,
                    value: u32::from(value),
                    max: u32::from(BatteryMonitorCommands::MAX_PAGE_VALUE),
                }
            })?
            .to_vec();
        self.write_all_commands(payloads, self.action_timeout).await
    }

    /// Asks the solar charger for the totals of `day` days ago. The answer
    /// arrives as a `History` field.
    pub async fn load_charger_history(&self, day: u8) -> Result<ActionHandle, MonitorError> {
        let profile = self.require(DeviceType::SolarCharger)?;
        let payload = SolarChargerCommands::history_for_day(day).to_vec();
        self.write_to(profile, payload, self.action_timeout, true).await
    }

    /// Tears the connection down and waits for the task to finish.
    /// Queued actions resolve with `None`.
    pub async fn close(&self) -> Result<(), MonitorError> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close(tx)).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}

/// State owned by the connection task.
struct MonitorConnection {
    peripheral: Arc<dyn Peripheral>,
    address: String,
    config: MonitorConfig,
    sink: Arc<dyn EventSink>,
    ids: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<Event>,
    snapshot: watch::Sender<ConnectionSnapshot>,
    /// Set once per connection lifetime, by the first matching data service
    device_type: OnceCell<DeviceType>,
    state: ConnectionState,
    /// A transport link exists or is being set up
    linked: bool,
    watchdog_mark: Instant,
    /// A follow-up query is scheduled and not yet queued
    follow_up_pending: bool,
    queue: ActionQueue,
    in_flight: Option<(ActionId, JoinHandle<()>)>,
    solar: SolarChargerDecoder,
    battery: BatteryMonitorDecoder,
    notifications: NotificationHandler,
    poll: Option<Interval>,
    timers: CancellationToken,
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn perform(peripheral: &dyn Peripheral, op: &Operation) -> TransportResult<Vec<u8>> {
    let payload = op.payload.as_deref().unwrap_or_default();
    match (op.kind, op.target) {
        (ActionKind::Read, ActionTarget::Characteristic { service, characteristic }) => {
            peripheral.read_characteristic(service, characteristic).await
        }
        (
            ActionKind::Read,
            ActionTarget::Descriptor {
                service,
                characteristic,
                descriptor,
            },
        ) => peripheral.read_descriptor(service, characteristic, descriptor).await,
        (_, ActionTarget::Characteristic { service, characteristic }) => peripheral
            .write_characteristic(service, characteristic, payload)
            .await
            .map(|_| Vec::new()),
        (
            _,
            ActionTarget::Descriptor {
                service,
                characteristic,
                descriptor,
            },
        ) => peripheral
            .write_descriptor(service, characteristic, descriptor, payload)
            .await
            .map(|_| Vec::new()),
    }
}

impl MonitorConnection {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut events: mpsc::UnboundedReceiver<Event>) {
        debug!("[{}] Connection task started", self.address);
        let mut closed_by = None;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close(done)) => {
                        closed_by = Some(done);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = next_tick(&mut self.poll) => self.on_poll_tick(),
            }
        }
        self.teardown().await;
        // Handles observe the task as gone before `close` returns
        drop(commands);
        if let Some(done) = closed_by {
            let _ = done.send(());
        }
        debug!("[{}] Connection task stopped", self.address);
    }

    fn next_id(&self) -> ActionId {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: MonitorEvent) {
        self.sink.emit(event);
    }

    fn profile(&self) -> Option<ServiceProfile> {
        self.device_type.get().copied().and_then(ServiceProfile::for_device)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Queue(action) => self.queue_action(action),
            Command::Abort(id) => {
                if self.queue.in_flight() == Some(id) {
                    debug!("[{}] Action {} is in flight, leaving it to its timeout", self.address, id);
                } else if self.queue.contains(id) {
                    info!("[{}] Queued action {} aborted", self.address, id);
                    self.queue.abort(id);
                }
            }
            Command::Sync(reply) => {
                let _ = reply.send(self.sync());
            }
            Command::Close(_) => {}
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected(result) => self.on_connected(result),
            Event::Discovered(result) => self.on_services_discovered(result),
            Event::OperationFinished { id, result } => {
                let value = match result {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!("[{}] Action {} failed: {}", self.address, id, e);
                        None
                    }
                };
                if let Some(next) = self.queue.complete(id, value) {
                    self.start(next);
                }
            }
            Event::Notification(NotificationEvent::Value { characteristic, value }) => {
                self.on_notification(characteristic, &value)
            }
            Event::Notification(NotificationEvent::Ended) => self.on_link_lost(),
            Event::ActionTimeout(id) => self.on_action_timeout(id),
            Event::InitialSync => {
                self.sync();
            }
            Event::FollowUp(payload) => self.follow_up(payload),
            Event::Model(raw) => {
                let model = String::from_utf8_lossy(&raw).trim_matches(char::from(0)).trim().to_string();
                info!("[{}] Device model is: {}", self.address, model);
                self.emit(MonitorEvent::DeviceModel {
                    device: self.address.clone(),
                    model,
                });
            }
        }
    }

    /// Posts `event` back to this task after `delay` unless the task stops first.
    fn schedule(&self, delay: Duration, event: Event) {
        let events = self.events.clone();
        let token = self.timers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(event);
                }
            }
        });
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.snapshot.send_modify(|s| s.state = state);
        self.emit(MonitorEvent::ConnectionStateChanged {
            device: self.address.clone(),
            state,
        });
    }

    fn mark_updated(&mut self) {
        self.watchdog_mark = Instant::now();
        self.snapshot.send_modify(|s| s.last_updated = Local::now());
    }

    fn connect(&mut self) {
        if self.linked {
            debug!("[{}] Already connected or connecting", self.address);
            return;
        }
        self.linked = true;
        info!("[{}] Initiating connection...", self.address);
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = peripheral.connect().await;
            let _ = events.send(Event::Connected(result));
        });
    }

    fn on_connected(&mut self, result: TransportResult<()>) {
        if let Err(e) = result {
            error!("[{}] Connection failed: {}", self.address, e);
            self.linked = false;
            self.emit(MonitorEvent::ConnectionStateChanged {
                device: self.address.clone(),
                state: ConnectionState::Disconnected,
            });
            return;
        }
        info!("[{}] Connection successful, discovering services...", self.address);
        self.mark_updated();
        self.set_state(ConnectionState::Connected);

        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = peripheral.discover_services().await;
            let _ = events.send(Event::Discovered(result));
        });
    }

    fn on_services_discovered(&mut self, result: TransportResult<Vec<GattService>>) {
        let services = match result {
            Ok(services) => services,
            Err(e) => {
                error!("[{}] Service discovery failed: {}", self.address, e);
                self.on_link_lost();
                return;
            }
        };
        self.mark_updated();
        let typed_before = self.device_type.get().copied();

        for service in &services {
            debug!("[{}] Discovered service: {}", self.address, service.uuid);
            for characteristic in &service.characteristics {
                debug!("[{}]   characteristic: {}", self.address, characteristic.uuid);
            }

            if service.uuid == UUID_DEVICE_INFORMATION_SERVICE {
                if service.characteristic(UUID_MODEL_NUMBER).is_some() {
                    self.queue_model_read();
                }
                continue;
            }

            let Some(found) = ServiceProfile::identify(service.uuid) else {
                continue;
            };
            match typed_before {
                // Reconnected: keep the type, subscribe again
                Some(device_type) if device_type == found => self.start_monitoring(service),
                Some(_) => {}
                None => {
                    if self.device_type.set(found).is_ok() {
                        info!("[{}] Identified as {:?}", self.address, found);
                        self.snapshot.send_modify(|s| s.device_type = found);
                        self.emit(MonitorEvent::DeviceTyped {
                            device: self.address.clone(),
                            device_type: found,
                        });
                        self.start_monitoring(service);
                    } else {
                        debug!("[{}] Already typed, ignoring service {}", self.address, service.uuid);
                    }
                }
            }
        }
    }

    fn queue_model_read(&mut self) {
        let events = self.events.clone();
        let action = Action::new(
            self.next_id(),
            ActionKind::Read,
            ActionTarget::Characteristic {
                service: UUID_DEVICE_INFORMATION_SERVICE,
                characteristic: UUID_MODEL_NUMBER,
            },
            None,
            self.config.action_timeout(),
        )
        .with_callback(move |value| {
            if let Some(raw) = value {
                let _ = events.send(Event::Model(raw));
            }
        });
        self.queue_action(action);
    }

    /// Subscribes to the data characteristic and starts polling.
    fn start_monitoring(&mut self, service: &GattService) {
        let Some(profile) = self.profile() else {
            return;
        };
        let Some(data) = service.characteristic(profile.data) else {
            warn!("[{}] Data characteristic {} not found", self.address, profile.data);
            return;
        };

        let events = self.events.clone();
        self.notifications.start(self.peripheral.clone(), profile.service, profile.data, move |event| {
            let _ = events.send(Event::Notification(event));
        });

        if data.descriptors.contains(&UUID_CCCD) {
            let action = Action::new(
                self.next_id(),
                ActionKind::Write,
                ActionTarget::Descriptor {
                    service: profile.service,
                    characteristic: profile.data,
                    descriptor: UUID_CCCD,
                },
                Some(ENABLE_NOTIFICATION_VALUE.to_vec()),
                self.config.action_timeout(),
            );
            self.queue_action(action);
        }

        let period = self.config.poll_period();
        self.schedule(period / 2, Event::InitialSync);
        let mut poll = tokio::time::interval_at(Instant::now() + period, period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.poll = Some(poll);
    }

    fn home_data_command(&self) -> Option<Vec<u8>> {
        match self.device_type.get()? {
            DeviceType::SolarCharger => Some(SolarChargerCommands::HOME_DATA.to_vec()),
            DeviceType::BatteryMonitor => Some(BatteryMonitorCommands::HOME_DATA.to_vec()),
            DeviceType::Unknown => None,
        }
    }

    /// Queues a home-data poll. Returns `None` unless connected and typed.
    fn sync(&mut self) -> Option<ActionHandle> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        let profile = self.profile()?;
        let payload = self.home_data_command()?;
        let (action, handle) = Action::new(
            self.next_id(),
            ActionKind::Write,
            ActionTarget::Characteristic {
                service: profile.service,
                characteristic: profile.command,
            },
            Some(payload),
            self.config.action_timeout(),
        )
        .with_handle();
        self.queue_action(action);
        Some(handle)
    }

    fn follow_up(&mut self, payload: Vec<u8>) {
        self.follow_up_pending = false;
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(profile) = self.profile() else {
            return;
        };
        let action = Action::new(
            self.next_id(),
            ActionKind::Write,
            ActionTarget::Characteristic {
                service: profile.service,
                characteristic: profile.command,
            },
            Some(payload),
            self.config.action_timeout(),
        );
        self.queue_action(action);
    }

    fn queue_action(&mut self, action: Action) {
        let id = action.id;
        let timeout = action.timeout;
        if let Some(op) = self.queue.push(action) {
            self.start(op);
        }
        self.schedule(timeout, Event::ActionTimeout(id));
    }

    /// Hands an operation to the transport. Only called for the queue head.
    fn start(&mut self, op: Operation) {
        if op.kind != ActionKind::Read {
            if let ActionTarget::Characteristic { characteristic, .. } = op.target {
                if characteristic == UUID_SOLAR_CHARGER_DATA_CHAR {
                    if let Some(payload) = &op.payload {
                        self.solar.record_write(payload);
                    }
                }
            }
        }
        debug!(
            "[{}] Starting action {} {:?} {}",
            self.address,
            op.id,
            op.kind,
            op.payload.as_deref().map(hex::encode).unwrap_or_default()
        );

        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        let id = op.id;
        let task = tokio::spawn(async move {
            let result = perform(peripheral.as_ref(), &op).await;
            let _ = events.send(Event::OperationFinished { id, result });
        });
        self.in_flight = Some((id, task));
    }

    fn on_action_timeout(&mut self, id: ActionId) {
        if !self.queue.contains(id) {
            return;
        }
        warn!("[{}] Action {} timed out", self.address, id);
        if let Some((_, task)) = self.in_flight.take_if(|(task_id, _)| *task_id == id) {
            task.abort();
        }
        if let Some(next) = self.queue.abort(id) {
            self.start(next);
        }
    }

    fn on_notification(&mut self, characteristic: Uuid, value: &[u8]) {
        match self.device_type.get() {
            Some(DeviceType::SolarCharger) if characteristic == UUID_SOLAR_CHARGER_DATA_CHAR => {
                self.on_solar_charger_data(value)
            }
            Some(DeviceType::BatteryMonitor) if characteristic == UUID_BATTERY_MONITOR_DATA_CHAR => {
                self.on_battery_monitor_data(value)
            }
            _ => debug!("[{}] Ignoring notification on {}", self.address, characteristic),
        }
        if let Some(next) = self.queue.notification(characteristic, value) {
            self.start(next);
        }
    }

    fn on_solar_charger_data(&mut self, value: &[u8]) {
        let Some(frame) = self.solar.decode(value) else {
            return;
        };
        self.mark_updated();
        for field in frame.fields.iter().cloned() {
            self.emit(MonitorEvent::SolarCharger {
                device: self.address.clone(),
                field,
            });
        }
        // The firmware garbles overlapping queries; only ask for the other
        // frame once this one is processed, and keep a single alternation
        // going however many answers arrive.
        if self.follow_up_pending {
            debug!("[{}] Follow-up already scheduled", self.address);
            return;
        }
        self.follow_up_pending = true;
        self.schedule(self.config.poll_period() / 2, Event::FollowUp(frame.follow_up()));
    }

    fn on_battery_monitor_data(&mut self, value: &[u8]) {
        let update = self.battery.push(value);
        if update.packets > 0 {
            self.mark_updated();
        }
        let device = &self.address;
        for output in update.outputs {
            let event = match output {
                BatteryMonitorOutput::Field(field) => MonitorEvent::BatteryMonitor {
                    device: device.clone(),
                    field,
                },
                BatteryMonitorOutput::RecordedSamples(samples) => MonitorEvent::RecordedSamples {
                    device: device.clone(),
                    samples,
                },
                BatteryMonitorOutput::HistoryIndex(records) => MonitorEvent::HistoryIndex {
                    device: device.clone(),
                    records,
                },
            };
            self.sink.emit(event);
        }
    }

    fn on_poll_tick(&mut self) {
        if self.state != ConnectionState::Connected {
            warn!("[{}] Sync task stopped", self.address);
            self.poll = None;
            return;
        }
        let dt = self.watchdog_mark.elapsed();
        if dt > self.config.resync_after() {
            let flushed = self.queue.clear_pending();
            warn!(
                "[{}] Out of sync by {}ms. Flushed {} pending actions",
                self.address,
                dt.as_millis(),
                flushed
            );
            // Not again on the next tick
            self.watchdog_mark = Instant::now();
            self.sync();
        }
    }

    fn on_link_lost(&mut self) {
        if !self.linked {
            return;
        }
        warn!("[{}] Link lost", self.address);
        self.linked = false;
        self.notifications.stop();
        self.battery.reset();
        self.set_state(ConnectionState::Disconnected);
    }

    async fn teardown(&mut self) {
        info!("[{}] Closing connection", self.address);
        self.timers.cancel();
        self.notifications.stop();
        self.poll = None;
        if let Some((_, task)) = self.in_flight.take() {
            task.abort();
        }
        // Dropping the queued actions resolves their handles with `None`
        self.queue = ActionQueue::new();
        if self.linked {
            self.linked = false;
            if let Err(e) = self.peripheral.disconnect().await {
                error!("[{}] Failed to disconnect: {}", self.address, e);
            } else {
                info!("[{}] Successfully disconnected", self.address);
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }
}
