//! Power subsystem: output level DAC and the power calibration path.
//!
//! Output power is a Q8.8 dBm value per channel. The calibration opcodes
//! (CALPWR, CALPTBL, CALZMON, CALVFY) ride the same busy flag and bus
//! requester as POWER since they program the same level hardware.

use super::{check_channel, BusTransaction};
use crate::arbiter::Requester;
use crate::status::ErrorCode;

/// Q8.8 dBm limits of the output stage.
pub const PWR_MIN_Q8: u16 = 0x0500; // 5.0 dBm
pub const PWR_MAX_Q8: u16 = 0x2900; // 41.0 dBm

/// Calibration table size, entries per channel.
pub const PWR_TBL_ENTRIES: usize = 251;

/// Register selectors on the level DAC device.
const REG_LEVEL: u8 = 0x01;
const REG_CAL_POINT: u8 = 0x02;
const REG_CAL_TABLE: u8 = 0x03;
const REG_CAL_ZMON: u8 = 0x04;
const REG_CAL_VERIFY: u8 = 0x05;

fn level_q8(payload: &[u8]) -> u16 {
    u16::from_le_bytes([payload[1], payload[2]])
}

fn check_level(q8: u16) -> Result<(), ErrorCode> {
    if !(PWR_MIN_Q8..=PWR_MAX_Q8).contains(&q8) {
        return Err(ErrorCode::PowerInvalid);
    }
    Ok(())
}

/// POWER: set output level for one channel.
pub fn set_power(payload: &[u8]) -> Result<BusTransaction, ErrorCode> {
    debug_assert_eq!(payload.len(), 3);
    check_channel(payload[0], ErrorCode::PowerInvalid)?;
    check_level(level_q8(payload))?;
    let bytes = [REG_LEVEL, payload[0], payload[1], payload[2]];
    Ok(BusTransaction::new(Requester::Power, &bytes))
}

/// CALPWR: one calibration point, channel + measured Q8.8 dBm.
pub fn cal_power(payload: &[u8]) -> Result<BusTransaction, ErrorCode> {
    debug_assert_eq!(payload.len(), 3);
    check_channel(payload[0], ErrorCode::PowerInvalid)?;
    let bytes = [REG_CAL_POINT, payload[0], payload[1], payload[2]];
    Ok(BusTransaction::new(Requester::Power, &bytes))
}

/// CALPTBL: a chunk of the 251-entry calibration table. Payload is a u16
/// LE entry offset followed by 16-bit entries.
pub fn cal_table(payload: &[u8]) -> Result<BusTransaction, ErrorCode> {
    debug_assert!(payload.len() >= 2);
    let body = &payload[2..];
    if body.is_empty() || body.len() % 2 != 0 {
        return Err(ErrorCode::InvalidLength);
    }
    let offset = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let entries = body.len() / 2;
    if offset + entries > PWR_TBL_ENTRIES {
        return Err(ErrorCode::PowerInvalid);
    }
    let mut bytes = heapless::Vec::<u8, { super::MAX_XACT_BYTES }>::new();
    // Header + chunk always fit the transaction bound
    let _ = bytes.push(REG_CAL_TABLE);
    let _ = bytes.extend_from_slice(payload);
    Ok(BusTransaction::new(Requester::Power, &bytes))
}

/// CALZMON: Z-monitor ADC calibration constants.
pub fn cal_zmon(payload: &[u8]) -> Result<BusTransaction, ErrorCode> {
    debug_assert_eq!(payload.len(), 4);
    let mut bytes = [0u8; 5];
    bytes[0] = REG_CAL_ZMON;
    bytes[1..].copy_from_slice(payload);
    Ok(BusTransaction::new(Requester::Power, &bytes))
}

/// CALVFY: read back and verify one channel's table.
pub fn cal_verify(payload: &[u8]) -> Result<BusTransaction, ErrorCode> {
    debug_assert_eq!(payload.len(), 1);
    check_channel(payload[0], ErrorCode::PowerInvalid)?;
    Ok(BusTransaction::new(
        Requester::Power,
        &[REG_CAL_VERIFY, payload[0]],
    ))
}
