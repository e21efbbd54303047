//! Bias subsystem: per-channel PA bias switches.

use super::{check_channel, BusTransaction};
use crate::arbiter::Requester;
use crate::status::ErrorCode;

const REG_BIAS: u8 = 0x01;

/// BIAS: channel + on/off byte.
pub fn set_bias(payload: &[u8]) -> Result<BusTransaction, ErrorCode> {
    debug_assert_eq!(payload.len(), 2);
    check_channel(payload[0], ErrorCode::UnknownBiasState)?;
    if payload[1] > 1 {
        return Err(ErrorCode::UnknownBiasState);
    }
    Ok(BusTransaction::new(
        Requester::Bias,
        &[REG_BIAS, payload[0], payload[1]],
    ))
}
