//! Solar charge controller frame decoding
//! The controller answers Modbus-style register reads with two fixed-length frames,
//! told apart by length and header only.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::core::bluetooth::commands::SolarChargerCommands;
use crate::core::codec::be_uint;
use crate::core::telemetry::{ChargerHistory, ChargerStatus, SolarChargerField};

/// Length of the home-data (live snapshot) frame
pub const HOME_FRAME_LEN: usize = 43;
/// Length of the chart-data (one day of history) frame
pub const CHART_FRAME_LEN: usize = 15;

const HOME_HEADER: [u8; 3] = [0x01, 0x03, 0x26];
const CHART_HEADER: [u8; 3] = [0x01, 0x03, 0x0a];

/// How the controller's single-byte temperatures are read.
///
/// Firmware revisions disagree on negative values, so this stays switchable
/// until it is checked against a unit below freezing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureEncoding {
    /// Values of 128 and above are negative: `128 - t`
    #[default]
    SignBit,
    /// The byte is taken as-is
    Unsigned,
}

impl TemperatureEncoding {
    pub fn decode(self, raw: u8) -> i32 {
        let t = i32::from(raw);
        match self {
            Self::SignBit if t >= 128 => 128 - t,
            _ => t,
        }
    }
}

/// Which query a decoded frame answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolarFrameKind {
    HomeData,
    ChartData,
}

/// Fields decoded from one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SolarChargerFrame {
    pub kind: SolarFrameKind,
    pub fields: Vec<SolarChargerField>,
}

impl SolarChargerFrame {
    /// The query to send next. The firmware garbles answers when both
    /// queries are in flight, so the two are alternated one at a time.
    pub fn follow_up(&self) -> Vec<u8> {
        match self.kind {
            SolarFrameKind::HomeData => SolarChargerCommands::CHART_DATA.to_vec(),
            SolarFrameKind::ChartData => SolarChargerCommands::HOME_DATA.to_vec(),
        }
    }
}

/// Per-connection decoder state.
#[derive(Debug, Default)]
pub struct SolarChargerDecoder {
    temperature: TemperatureEncoding,
    /// Day offset asked for by the last history request written
    pending_day: Option<u8>,
}

impl SolarChargerDecoder {
    pub fn new(temperature: TemperatureEncoding) -> Self {
        Self {
            temperature,
            pending_day: None,
        }
    }

    /// Records an outbound write so the next chart frame can be matched to
    /// the day it answers. The reply itself does not carry the day.
    pub fn record_write(&mut self, payload: &[u8]) {
        if let Some(day) = SolarChargerCommands::requested_day(payload) {
            self.pending_day = Some(day);
        }
    }

    /// Decodes one notification. Returns `None` for anything that is not a
    /// well-formed home or chart frame.
    pub fn decode(&mut self, data: &[u8]) -> Option<SolarChargerFrame> {
        debug!("Solar charger frame {} bytes {}", data.len(), hex::encode(data));
        if data.len() == HOME_FRAME_LEN && data[0..3] == HOME_HEADER {
            Some(self.decode_home(data))
        } else if data.len() == CHART_FRAME_LEN && data[0..3] == CHART_HEADER {
            Some(self.decode_chart(data))
        } else {
            if !data.is_empty() {
                warn!("Ignoring unexpected solar charger frame of {} bytes", data.len());
            }
            None
        }
    }

    fn decode_home(&self, data: &[u8]) -> SolarChargerFrame {
        let mut fields = vec![
            SolarChargerField::BatteryLevel(be_uint(&data[3..5]) as u32),
            SolarChargerField::ChargeVoltage(be_uint(&data[5..7]) as f64 / 10.0),
            SolarChargerField::ChargeCurrent(be_uint(&data[7..9]) as f64 / 100.0),
            SolarChargerField::ChargerTemp(self.temperature.decode(data[11])),
            SolarChargerField::BatteryTemp(self.temperature.decode(data[12])),
            SolarChargerField::SolarVoltage(be_uint(&data[19..21]) as f64 / 10.0),
            SolarChargerField::TodayPeakPower(be_uint(&data[21..23]) as f64),
            SolarChargerField::TodayChargeEnergy(be_uint(&data[23..25]) as f64),
        ];
        match ChargerStatus::from_code(data[28]) {
            Some(status) => fields.push(SolarChargerField::Status(status)),
            None => debug!("Unknown charger status code {:#04x}", data[28]),
        }
        fields.push(SolarChargerField::TotalChargeEnergy(be_uint(&data[33..37]) as f64));

        SolarChargerFrame {
            kind: SolarFrameKind::HomeData,
            fields,
        }
    }

    fn decode_chart(&mut self, data: &[u8]) -> SolarChargerFrame {
        let day_index = self.pending_day.take().unwrap_or(0);
        let history = ChargerHistory {
            day_index,
            total_energy: be_uint(&data[3..5]) as f64,
            load_energy: be_uint(&data[5..7]) as f64,
            peak_power: be_uint(&data[7..9]) as f64,
            max_voltage: be_uint(&data[9..11]) as f64 / 10.0,
            min_voltage: be_uint(&data[11..13]) as f64 / 10.0,
        };

        let mut fields = Vec::with_capacity(6);
        if day_index == 0 {
            fields.extend([
                SolarChargerField::TodayChargeEnergy(history.total_energy),
                SolarChargerField::TodayDcLoadEnergy(history.load_energy),
                SolarChargerField::TodayPeakPower(history.peak_power),
                SolarChargerField::TodayMaxBatteryVoltage(history.max_voltage),
                SolarChargerField::TodayMinBatteryVoltage(history.min_voltage),
            ]);
        }
        fields.push(SolarChargerField::History(history));

        SolarChargerFrame {
            kind: SolarFrameKind::ChartData,
            fields,
        }
    }
}
