//! Phase subsystem: per-channel phase shifter.

use super::{check_channel, BusTransaction};
use crate::arbiter::Requester;
use crate::status::ErrorCode;

/// Phase is commanded in tenths of a degree, 0.0 to 359.9.
pub const PHASE_MAX_DECIDEG: u16 = 3599;

const REG_PHASE: u8 = 0x01;

/// PHASE: channel + u16 LE deci-degrees.
pub fn set_phase(payload: &[u8]) -> Result<BusTransaction, ErrorCode> {
    debug_assert_eq!(payload.len(), 3);
    check_channel(payload[0], ErrorCode::UnknownPhsState)?;
    let decideg = u16::from_le_bytes([payload[1], payload[2]]);
    if decideg > PHASE_MAX_DECIDEG {
        return Err(ErrorCode::UnknownPhsState);
    }
    let bytes = [REG_PHASE, payload[0], payload[1], payload[2]];
    Ok(BusTransaction::new(Requester::Phase, &bytes))
}
