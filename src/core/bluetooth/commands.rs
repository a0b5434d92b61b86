//! Outbound command frames
//! This module contains every command that can be written to the two device types

use crate::core::codec::{to_bcd, with_crc};

/// Solar charge controller commands (Modbus-style register reads)
pub struct SolarChargerCommands;

impl SolarChargerCommands {
    /// Live snapshot: read 0x13 registers from 0x0101
    pub const HOME_DATA: [u8; 8] = [0x01, 0x03, 0x01, 0x01, 0x00, 0x13, 0x54, 0x3B];
    /// Today's history: same as `history_for_day(0)`
    pub const CHART_DATA: [u8; 8] = [0x01, 0x03, 0x04, 0x00, 0x00, 0x05, 0x84, 0xF9];

    /// History of `days` days ago, signed with a Modbus CRC.
    pub fn history_for_day(days: u8) -> [u8; 8] {
        let frame = with_crc(&[0x01, 0x03, 0x04, days, 0x00, 0x05]);
        let mut out = [0u8; 8];
        out.copy_from_slice(&frame);
        out
    }

    /// The day a history request asks for, if `payload` is one.
    pub fn requested_day(payload: &[u8]) -> Option<u8> {
        match payload {
            [0x01, 0x03, 0x04, day, 0x00, 0x05, _, _] => Some(*day),
            _ => None,
        }
    }
}

/// Battery monitor commands: `BB <value> <code> 0C EE`
pub struct BatteryMonitorCommands;

impl BatteryMonitorCommands {
    pub const HOME_DATA: [u8; 5] = [0xBB, 0x9A, 0xA9, 0x0C, 0xEE];
    pub const START_RECORDING: [u8; 5] = [0xBB, 0x31, 0xF4, 0x0C, 0xEE];

    const SET_CAPACITY_CODE: u8 = 0xB0;
    const PAGE_SIZE_CODE: u8 = 0xB9;
    const PAGE_INDEX_CODE: u8 = 0xB8;

    fn frame(value: &[u8], code: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(value.len() + 4);
        out.push(0xBB);
        out.extend_from_slice(value);
        out.extend_from_slice(&[code, 0x0C, 0xEE]);
        out
    }

    /// Sets the nominal capacity in Ah, sent in tenths of an Ah.
    pub fn set_battery_capacity(capacity_ah: f64) -> Vec<u8> {
        let tenths = (capacity_ah.clamp(0.0, 9999.9) * 10.0).round() as u64;
        Self::frame(&to_bcd(tenths, 3), Self::SET_CAPACITY_CODE)
    }

    /// Largest page size or index a single packed-decimal byte can carry
    pub const MAX_PAGE_VALUE: u8 = 99;

    /// Requests one page of recorded data: page size first, then page index.
    /// `None` when either value is above `MAX_PAGE_VALUE`.
    pub fn load_recording_page(size: u8, index: u8) -> Option<[Vec<u8>; 2]> {
        if size > Self::MAX_PAGE_VALUE || index > Self::MAX_PAGE_VALUE {
            return None;
        }
        Some([
            Self::frame(&to_bcd(u64::from(size), 1), Self::PAGE_SIZE_CODE),
            Self::frame(&to_bcd(u64::from(index), 1), Self::PAGE_INDEX_CODE),
        ])
    }
}
