//! Numeric payload codecs.
//!
//! # Legacy ("BCD") encoding
//!
//! Legacy firmware transfers 24-bit values as six hex digits, least significant
//! byte first, each byte written high nibble first. For a value `0x12ABCD` the
//! wire string is `CDAB12`: digit positions `[4,5,2,3,0,1]` of the wire string
//! hold the big-endian nibbles of the value.
//!
//! Single byte values (high speed ratio) use the first two digits only.
//!
//! # Advanced encoding
//!
//! Advanced firmware uses plain zero-padded big-endian hex: 8 digits for 32-bit
//! fields, 16 digits for 64-bit fields. Signed quantities are sent as their
//! two's complement bit pattern.

use crate::error::{MountError, MountResult};

/// Largest value representable in a legacy 24-bit field.
pub const LEGACY_MAX: u32 = 0x00FF_FFFF;

fn malformed(payload: &str, reason: &'static str) -> MountError {
    MountError::MalformedResponse {
        payload: payload.to_string(),
        reason,
    }
}

fn hex_digit(c: u8) -> Option<u32> {
    (c as char).to_digit(16)
}

/// Decode a 6-digit legacy payload into its 24-bit value.
pub fn decode_legacy_u24(payload: &str) -> MountResult<u32> {
    let bytes = payload.as_bytes();
    if bytes.len() != 6 {
        return Err(malformed(payload, "expected 6 hex digits"));
    }

    let mut value = 0u32;
    for &i in &[4usize, 5, 2, 3, 0, 1] {
        let nibble = hex_digit(bytes[i]).ok_or_else(|| malformed(payload, "non-hex digit"))?;
        value = (value << 4) | nibble;
    }
    Ok(value)
}

/// Encode the low 24 bits of `value` as a legacy payload.
pub fn encode_legacy_u24(value: u32) -> String {
    format!(
        "{:02X}{:02X}{:02X}",
        value & 0xFF,
        (value >> 8) & 0xFF,
        (value >> 16) & 0xFF
    )
}

/// Decode the leading byte of a legacy payload (`"10"` -> 16).
pub fn decode_legacy_u8(payload: &str) -> MountResult<u8> {
    let digits = payload
        .get(..2)
        .ok_or_else(|| malformed(payload, "expected at least 2 hex digits"))?;
    u8::from_str_radix(digits, 16).map_err(|_| malformed(payload, "non-hex digit"))
}

/// Re-pack a legacy-decoded firmware word into big-endian byte order.
///
/// The version reply is transferred byte-swapped like every legacy value, but
/// its bytes are meaningful as `major.minor.mount_code` in wire order.
pub fn repack_firmware_word(decoded: u32) -> u32 {
    ((decoded & 0xFF) << 16) | (decoded & 0xFF00) | ((decoded & 0xFF_0000) >> 16)
}

/// Encode a 32-bit advanced field (8 hex digits).
pub fn encode_hex_u32(value: u32) -> String {
    format!("{:08X}", value)
}

/// Encode a signed 32-bit advanced field as its two's complement pattern.
pub fn encode_hex_i32(value: i32) -> String {
    encode_hex_u32(value as u32)
}

/// Encode a signed 64-bit advanced field (16 hex digits).
pub fn encode_hex_i64(value: i64) -> String {
    format!("{:016X}", value as u64)
}

/// Decode an 8-digit advanced field.
pub fn decode_hex_u32(payload: &str) -> MountResult<u32> {
    let digits = payload
        .get(..8)
        .ok_or_else(|| malformed(payload, "expected 8 hex digits"))?;
    u32::from_str_radix(digits, 16).map_err(|_| malformed(payload, "non-hex digit"))
}

/// Decode an 8-digit advanced field holding a signed position.
pub fn decode_hex_i32(payload: &str) -> MountResult<i32> {
    decode_hex_u32(payload).map(|v| v as i32)
}
