//! Byte-level helpers shared by the two protocol decoders and the command catalog.

use crc16::{MODBUS, State};

/// Reads up to eight bytes as a big-endian unsigned integer.
///
/// The solar charger firmware renders register values as hex digit pairs,
/// which is exactly a big-endian binary read.
pub fn be_uint(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Interprets bytes as packed decimal digits, two per byte.
///
/// The battery monitor writes `12 34` to mean the number 1234: the hex
/// rendering of the bytes is read back in base ten. Returns `None` when a
/// nibble is not a decimal digit or the value does not fit in a `u64`.
pub fn decimal_digits(bytes: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    for b in bytes {
        let hi = b >> 4;
        let lo = b & 0x0F;
        if hi > 9 || lo > 9 {
            return None;
        }
        value = value.checked_mul(100)?.checked_add(u64::from(hi * 10 + lo))?;
    }
    Some(value)
}

/// Decodes a single packed decimal byte (`0x24` -> 24).
pub fn bcd_byte(b: u8) -> Option<u8> {
    decimal_digits(&[b]).map(|v| v as u8)
}

/// Encodes `value` as `width` bytes of packed decimal, most significant first.
///
/// Values that need more digits than `width` allows are clamped to all nines.
pub fn to_bcd(value: u64, width: usize) -> Vec<u8> {
    let max = 10u64.checked_pow(2 * width as u32).map_or(u64::MAX, |m| m - 1);
    let mut v = value.min(max);
    let mut out = vec![0u8; width];
    for slot in out.iter_mut().rev() {
        let two = (v % 100) as u8;
        *slot = ((two / 10) << 4) | (two % 10);
        v /= 100;
    }
    out
}

/// Modbus CRC16 (reflected polynomial 0xA001, initial value 0xFFFF).
pub fn crc16_modbus(data: &[u8]) -> u16 {
    State::<MODBUS>::calculate(data)
}

/// Returns `frame` followed by its Modbus CRC, low byte first.
pub fn with_crc(frame: &[u8]) -> Vec<u8> {
    let mut out = frame.to_vec();
    out.extend_from_slice(&crc16_modbus(frame).to_le_bytes());
    out
}

/// Position of the first byte in `haystack` that equals any of `needles`.
pub fn find_any(haystack: &[u8], needles: &[u8]) -> Option<usize> {
    haystack.iter().position(|b| needles.contains(b))
}

/// True when either nibble of `byte` is a hex letter.
///
/// The battery monitor only ever sends decimal nibbles as data, so any byte
/// with a nibble of 0xA or above marks a field code.
pub fn is_tag(byte: u8) -> bool {
    byte & 0xF0 >= 0xA0 || byte & 0x0F >= 0x0A
}
