//! Pulse subsystem: pulse width and the Z-monitor measurement point.
//!
//! Pulse timing lives in fabric registers rather than behind the serial
//! bus, so a PULSE command is a synchronous register write; PLS_BUSY is
//! only up while the write is applied.

use super::check_channel;
use crate::status::ErrorCode;

/// Pulse width bounds in 100 ns units.
pub const PULSE_MIN_TICKS: u32 = 1;
pub const PULSE_MAX_TICKS: u32 = 10_000_000; // 1 s

/// Parsed pulse timing for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PulseConfig {
    /// Width in 100 ns units.
    pub width: u32,
    /// Z-monitor measurement point, offset from the rising edge.
    pub measure_at: u32,
}

/// PULSE: channel + u32 LE width + u32 LE measure-at offset, both in
/// 100 ns units. The measurement point must land inside the pulse.
pub fn set_pulse(payload: &[u8]) -> Result<(u8, PulseConfig), ErrorCode> {
    debug_assert_eq!(payload.len(), 9);
    check_channel(payload[0], ErrorCode::UnknownPulseState)?;
    let width = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    let measure_at = u32::from_le_bytes([payload[5], payload[6], payload[7], payload[8]]);
    if !(PULSE_MIN_TICKS..=PULSE_MAX_TICKS).contains(&width) {
        return Err(ErrorCode::UnknownPulseState);
    }
    if measure_at >= width {
        return Err(ErrorCode::UnknownPulseState);
    }
    Ok((payload[0], PulseConfig { width, measure_at }))
}
