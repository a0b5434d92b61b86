//! Battery monitor stream decoding
//! This module reassembles the monitor's delimiter-framed packets across
//! notifications and turns their code-tagged fields into telemetry.
//!
//! A packet looks like `BB 20 43 C1 05 29 54 D8 25 EE`: a start marker
//! (`BB` live data, `AA` recorded data), then value bytes each followed by
//! the code naming them, then `EE`. Values are packed decimal, so a byte
//! with a hex-letter nibble is always a code.

use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, trace, warn};

use crate::core::codec::{bcd_byte, decimal_digits, find_any, is_tag};
use crate::core::telemetry::{BatteryMonitorField, BatteryMonitorHistoryRecord, VoltageCurrent};

/// Start of a live-data packet
pub const LIVE_START: u8 = 0xBB;
/// Start of a recorded-data packet
pub const RECORD_START: u8 = 0xAA;
/// End of any packet
pub const PACKET_END: u8 = 0xEE;

/// Reassembly buffers larger than this are dropped as out of sync
pub const DEFAULT_BUFFER_CAP: usize = 16 * 1024;

/// Field codes understood by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryMonitorTag {
    RecordedVoltage,
    RecordedChargeCurrent,
    RecordedDischargeCurrent,
    RecordedDataIndex,
    BatteryCapacity,
    OverTempProtection,
    VoltageAlign,
    CurrentAlign,
    TemperatureEnabled,
    LanStatus,
    Voltage,
    Current,
    SetItem2,
    SetItem3,
    LanAddr,
    OverVoltageProtectionStatus,
    Status,
    IsCharging,
    RemainingAh,
    TotalDischargeEnergy,
    TotalChargeEnergy,
    RecordProgressInMinutes,
    RemainingTimeInMinutes,
    Power,
    TempData,
    Config,
    IsRecording,
    RecordedDataStartDate,
    RecordedDataStartTime,
    Password,
    IsTempInFahrenheit,
}

impl BatteryMonitorTag {
    pub fn from_byte(code: u8) -> Option<Self> {
        use BatteryMonitorTag::*;
        let tag = match code {
            0xa0 => RecordedVoltage,
            0xa1 => RecordedChargeCurrent,
            0xa2 => RecordedDischargeCurrent,
            0xa3 => RecordedDataIndex,
            0xb0 => BatteryCapacity,
            0xb1 => OverTempProtection,
            0xb2 => VoltageAlign,
            0xb3 => CurrentAlign,
            0xb4 => TemperatureEnabled,
            0xb7 => LanStatus,
            0xc0 => Voltage,
            0xc1 => Current,
            0xc2 => SetItem2,
            0xc3 => SetItem3,
            0xc4 => LanAddr,
            0xc5 => OverVoltageProtectionStatus,
            0xd0 => Status,
            0xd1 => IsCharging,
            0xd2 => RemainingAh,
            0xd3 => TotalDischargeEnergy,
            0xd4 => TotalChargeEnergy,
            0xd5 => RecordProgressInMinutes,
            0xd6 => RemainingTimeInMinutes,
            0xd8 => Power,
            0xd9 => TempData,
            0xe0 => Config,
            0xf1 => IsRecording,
            0xf2 => RecordedDataStartDate,
            0xf3 => RecordedDataStartTime,
            0xf6 => Password,
            0xf7 => IsTempInFahrenheit,
            _ => return None,
        };
        Some(tag)
    }
}

/// One item produced while decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum BatteryMonitorOutput {
    Field(BatteryMonitorField),
    RecordedSamples(Vec<VoltageCurrent>),
    HistoryIndex(Vec<BatteryMonitorHistoryRecord>),
}

/// Result of feeding one notification to the decoder.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BatteryMonitorUpdate {
    /// Complete packets extracted from the buffer
    pub packets: usize,
    /// Outputs in wire order
    pub outputs: Vec<BatteryMonitorOutput>,
}

/// Batches collected while walking one packet.
#[derive(Default)]
struct PacketBatch {
    samples: Vec<VoltageCurrent>,
    records: Vec<BatteryMonitorHistoryRecord>,
}

/// Per-connection decoder; owns the reassembly buffer.
#[derive(Debug)]
pub struct BatteryMonitorDecoder {
    buffer: Vec<u8>,
    buffer_cap: usize,
    fahrenheit: bool,
    start_date: Option<NaiveDate>,
    last_voltage: Option<f64>,
    /// History index records already reported since the last reset
    reported: HashSet<BatteryMonitorHistoryRecord>,
}

impl Default for BatteryMonitorDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAP)
    }
}

impl BatteryMonitorDecoder {
    pub fn new(buffer_cap: usize) -> Self {
        Self {
            buffer: Vec::new(),
            buffer_cap,
            fahrenheit: false,
            start_date: None,
            last_voltage: None,
            reported: HashSet::new(),
        }
    }

    /// Bytes waiting for the rest of their packet
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.buffer_cap);
    }

    /// Appends a notification and decodes every packet it completes.
    pub fn push(&mut self, data: &[u8]) -> BatteryMonitorUpdate {
        let mut update = BatteryMonitorUpdate::default();
        if data.is_empty() {
            return update;
        }
        debug!("Battery monitor data {} bytes {}", data.len(), hex::encode(data));
        self.buffer.extend_from_slice(data);

        loop {
            let end = self.buffer.iter().position(|b| *b == PACKET_END);
            let start = find_any(&self.buffer, &[LIVE_START, RECORD_START]);
            match (start, end) {
                (_, None) => break,
                (Some(s), Some(e)) if s < e => {
                    let packet: Vec<u8> = self.buffer.drain(..=e).skip(s).collect();
                    self.parse_packet(&packet, &mut update.outputs);
                    update.packets += 1;
                }
                (_, Some(e)) => {
                    debug!("Discarding {} bytes without a packet start", e + 1);
                    self.buffer.drain(..=e);
                }
            }
        }

        if self.buffer.len() > self.buffer_cap {
            warn!(
                "Battery monitor read buffer reached {} bytes, discarding",
                self.buffer.len()
            );
            self.buffer.clear();
        }
        update
    }

    /// Walks `packet` (start marker through end marker inclusive).
    fn parse_packet(&mut self, packet: &[u8], out: &mut Vec<BatteryMonitorOutput>) {
        let body = &packet[1..packet.len() - 1];
        let mut batch = PacketBatch::default();
        let mut value: Vec<u8> = Vec::new();

        for &b in body {
            if is_tag(b) {
                self.apply(b, &value, &mut batch, out);
                value.clear();
            } else {
                value.push(b);
            }
        }

        if !batch.samples.is_empty() {
            out.push(BatteryMonitorOutput::RecordedSamples(batch.samples));
        }
        if !batch.records.is_empty() {
            self.reported.extend(batch.records.iter().copied());
            out.push(BatteryMonitorOutput::HistoryIndex(batch.records));
        }
    }

    fn apply(
        &mut self,
        code: u8,
        value: &[u8],
        batch: &mut PacketBatch,
        out: &mut Vec<BatteryMonitorOutput>,
    ) {
        let Some(tag) = BatteryMonitorTag::from_byte(code) else {
            trace!("Unknown field code {:#04x} with {}", code, hex::encode(value));
            return;
        };
        if value.is_empty() {
            return;
        }

        use BatteryMonitorField as F;
        use BatteryMonitorTag as T;
        let field = match tag {
            T::Voltage => scaled(value, 100.0).map(F::Voltage),
            T::Current => scaled(value, 100.0).map(F::Current),
            T::Power => scaled(value, 100.0).map(F::Power),
            T::TotalChargeEnergy => scaled(value, 100.0).map(F::TotalChargeEnergy),
            T::TotalDischargeEnergy => scaled(value, 100.0).map(F::TotalDischargeEnergy),
            T::RemainingAh => scaled(value, 1000.0).map(F::RemainingAh),
            T::BatteryCapacity => scaled(value, 10.0).map(F::BatteryCapacity),
            T::IsCharging => Some(F::IsCharging(value[0] == 0x01)),
            T::IsRecording => Some(F::IsRecording(value[0] == 0x01)),
            T::RemainingTimeInMinutes => decimal_digits(value).map(F::RemainingTimeInMinutes),
            T::RecordProgressInMinutes => decimal_digits(value).map(F::RecordProgressInMinutes),
            T::IsTempInFahrenheit => {
                self.fahrenheit = value[0] == 0x01;
                Some(F::IsTempInFahrenheit(self.fahrenheit))
            }
            T::TempData => decimal_digits(value).map(|raw| {
                let raw = raw as f64;
                if self.fahrenheit {
                    F::Temperature((raw - 32.0 - 5.0) * 5.0 / 9.0)
                } else {
                    F::Temperature(raw - 100.0)
                }
            }),
            T::RecordedDataStartDate => {
                self.start_date = decode_date(value);
                None
            }
            T::RecordedDataStartTime => match (self.start_date, decode_time(value)) {
                (Some(date), Some((h, m, s))) => date.and_hms_opt(h, m, s).map(F::RecordedDataStart),
                _ => {
                    debug!("Recording start time without a valid start date");
                    None
                }
            },
            T::RecordedVoltage => {
                self.last_voltage = scaled(value, 100.0);
                None
            }
            T::RecordedChargeCurrent | T::RecordedDischargeCurrent => {
                let sign = if tag == T::RecordedDischargeCurrent { -1.0 } else { 1.0 };
                match (self.last_voltage, scaled(value, 100.0)) {
                    (Some(voltage), Some(current)) => batch.samples.push(VoltageCurrent {
                        voltage,
                        current: sign * current,
                    }),
                    _ => debug!("Recorded current without a preceding voltage"),
                }
                None
            }
            T::RecordedDataIndex => {
                match decode_index_record(value) {
                    Some(record)
                        if !self.reported.contains(&record)
                            && !batch.records.iter().any(|r| {
                                r.start == record.start || r.sample_count == record.sample_count
                            }) =>
                    {
                        batch.records.push(record)
                    }
                    Some(record) => trace!("Duplicate history index record {:?}", record),
                    None => debug!("Malformed history index record {}", hex::encode(value)),
                }
                None
            }
            _ => Some(F::Other {
                code,
                raw: value.to_vec(),
            }),
        };

        if let Some(field) = field {
            out.push(BatteryMonitorOutput::Field(field));
        }
    }
}

fn scaled(value: &[u8], divisor: f64) -> Option<f64> {
    decimal_digits(value).map(|v| v as f64 / divisor)
}

fn decode_date(value: &[u8]) -> Option<NaiveDate> {
    let [y, m, d, ..] = value else { return None };
    NaiveDate::from_ymd_opt(
        2000 + i32::from(bcd_byte(*y)?),
        u32::from(bcd_byte(*m)?),
        u32::from(bcd_byte(*d)?),
    )
}

fn decode_time(value: &[u8]) -> Option<(u32, u32, u32)> {
    let [h, m, s, ..] = value else { return None };
    Some((
        u32::from(bcd_byte(*h)?),
        u32::from(bcd_byte(*m)?),
        u32::from(bcd_byte(*s)?),
    ))
}

/// Ten bytes: `yy mm dd hh mm ss` then a four-byte sample count.
fn decode_index_record(value: &[u8]) -> Option<BatteryMonitorHistoryRecord> {
    if value.len() != 10 {
        return None;
    }
    let (h, m, s) = decode_time(&value[3..6])?;
    let start: NaiveDateTime = decode_date(&value[0..3])?.and_hms_opt(h, m, s)?;
    let sample_count = u32::try_from(decimal_digits(&value[6..10])?).ok()?;
    Some(BatteryMonitorHistoryRecord { start, sample_count })
}
