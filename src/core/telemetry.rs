//! Typed telemetry produced by the decoders and the events handed to observers.

use chrono::NaiveDateTime;
use log::info;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

/// What a connected device turned out to be after service discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceType {
    Unknown,
    SolarCharger,
    BatteryMonitor,
}

/// Link state of a single device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Operating state reported by the charge controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChargerStatus {
    Standby,
    Starting,
    Mppt,
    Equalize,
    Boost,
    Float,
    CurrentLimited,
}

impl ChargerStatus {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Standby),
            1 => Some(Self::Starting),
            2 => Some(Self::Mppt),
            3 => Some(Self::Equalize),
            4 => Some(Self::Boost),
            5 => Some(Self::Float),
            6 => Some(Self::CurrentLimited),
            _ => None,
        }
    }
}

/// One day of charger history, answered by a chart-data query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargerHistory {
    /// Days before today (0 = today)
    pub day_index: u8,
    /// Charge energy in Wh
    pub total_energy: f64,
    /// DC load energy in Wh
    pub load_energy: f64,
    /// Peak charge power in W
    pub peak_power: f64,
    pub min_voltage: f64,
    pub max_voltage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SolarChargerField {
    ChargeVoltage(f64),
    ChargeCurrent(f64),
    SolarVoltage(f64),
    ChargerTemp(i32),
    BatteryTemp(i32),
    BatteryLevel(u32),
    TodayPeakPower(f64),
    TodayChargeEnergy(f64),
    TodayDcLoadEnergy(f64),
    TodayMinBatteryVoltage(f64),
    TodayMaxBatteryVoltage(f64),
    TotalChargeEnergy(f64),
    Status(ChargerStatus),
    History(ChargerHistory),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BatteryMonitorField {
    Voltage(f64),
    Current(f64),
    Power(f64),
    IsCharging(bool),
    RemainingAh(f64),
    TotalChargeEnergy(f64),
    TotalDischargeEnergy(f64),
    RemainingTimeInMinutes(u64),
    BatteryCapacity(f64),
    IsRecording(bool),
    RecordProgressInMinutes(u64),
    RecordedDataStart(NaiveDateTime),
    IsTempInFahrenheit(bool),
    /// Degrees Celsius
    Temperature(f64),
    /// A known field code that carries no scale rule; raw value bytes.
    Other { code: u8, raw: Vec<u8> },
}

/// One recorded sample from the battery monitor's logger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoltageCurrent {
    pub voltage: f64,
    /// Negative while discharging
    pub current: f64,
}

/// An entry of the battery monitor's recording index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BatteryMonitorHistoryRecord {
    pub start: NaiveDateTime,
    pub sample_count: u32,
}

/// Everything a connection reports to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    ConnectionStateChanged {
        device: String,
        state: ConnectionState,
    },
    DeviceTyped {
        device: String,
        device_type: DeviceType,
    },
    DeviceModel {
        device: String,
        model: String,
    },
    SolarCharger {
        device: String,
        field: SolarChargerField,
    },
    BatteryMonitor {
        device: String,
        field: BatteryMonitorField,
    },
    RecordedSamples {
        device: String,
        samples: Vec<VoltageCurrent>,
    },
    HistoryIndex {
        device: String,
        records: Vec<BatteryMonitorHistoryRecord>,
    },
}

impl MonitorEvent {
    pub fn device(&self) -> &str {
        match self {
            Self::ConnectionStateChanged { device, .. }
            | Self::DeviceTyped { device, .. }
            | Self::DeviceModel { device, .. }
            | Self::SolarCharger { device, .. }
            | Self::BatteryMonitor { device, .. }
            | Self::RecordedSamples { device, .. }
            | Self::HistoryIndex { device, .. } => device,
        }
    }
}

/// Receives events from connections. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MonitorEvent);
}

impl EventSink for mpsc::UnboundedSender<MonitorEvent> {
    fn emit(&self, event: MonitorEvent) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.send(event);
    }
}

impl EventSink for broadcast::Sender<MonitorEvent> {
    fn emit(&self, event: MonitorEvent) {
        let _ = self.send(event);
    }
}

/// Writes every event to the log at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: MonitorEvent) {
        info!("[{}] {:?}", event.device(), event);
    }
}
