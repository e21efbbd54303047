//! Frequency subsystem: synthesizer tuning.
//!
//! A FREQ command carries the target in Hz. Tuning programs a chain of
//! divider stages in the low-noise and high-speed synthesizers plus the
//! common error/output dividers; each stage accepts a bounded divisor
//! range and reports its own error code when the computed value falls
//! outside it.

use super::BusTransaction;
use crate::arbiter::Requester;
use crate::status::ErrorCode;

pub const FREQ_MIN_HZ: u32 = 2_400_000_000;
pub const FREQ_MAX_HZ: u32 = 2_500_000_000;

/// Synthesizer reference oscillator.
pub const SYNTH_REF_HZ: u32 = 100_000_000;

/// The phase accumulator only settles on multiples of the channel raster.
pub const CHANNEL_RASTER_HZ: u32 = 100_000;

/// Divider stages of the synthesizer chain, each with its own failure
/// code. The numeric suffixes are the register page numbers of the parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthStage {
    LowNoise5,
    LowNoise6,
    LowNoise8,
    LowNoise11,
    LowNoise15,
    LowNoise16,
    LowNoise20,
    LowNoise21,
    LowNoise23,
    HiSpeed2,
    HiSpeed4,
    HiSpeed6,
    HiSpeed7,
    HiSpeed8,
    CommonFerr,
    CommonFout,
}

impl SynthStage {
    pub fn error_code(self) -> ErrorCode {
        match self {
            SynthStage::LowNoise5 => ErrorCode::LowNoise5BadDiv,
            SynthStage::LowNoise6 => ErrorCode::LowNoise6BadDiv,
            SynthStage::LowNoise8 => ErrorCode::LowNoise8BadDiv,
            SynthStage::LowNoise11 => ErrorCode::LowNoise11BadDiv,
            SynthStage::LowNoise15 => ErrorCode::LowNoise15BadDiv,
            SynthStage::LowNoise16 => ErrorCode::LowNoise16BadDiv,
            SynthStage::LowNoise20 => ErrorCode::LowNoise20BadDiv,
            SynthStage::LowNoise21 => ErrorCode::LowNoise21BadDiv,
            SynthStage::LowNoise23 => ErrorCode::LowNoise23BadDiv,
            SynthStage::HiSpeed2 => ErrorCode::HiSpeed2BadDiv,
            SynthStage::HiSpeed4 => ErrorCode::HiSpeed4BadDiv,
            SynthStage::HiSpeed6 => ErrorCode::HiSpeed6BadDiv,
            SynthStage::HiSpeed7 => ErrorCode::HiSpeed7BadDiv,
            SynthStage::HiSpeed8 => ErrorCode::HiSpeed8BadDiv,
            SynthStage::CommonFerr => ErrorCode::CommonFerrBadDiv,
            SynthStage::CommonFout => ErrorCode::CommonFoutBadDiv,
        }
    }

    /// Permitted divisor range for the stage register.
    pub fn divisor_range(self) -> core::ops::RangeInclusive<u32> {
        match self {
            SynthStage::CommonFout => 24..=25,
            SynthStage::CommonFerr => 0..=1023,
            SynthStage::LowNoise5
            | SynthStage::LowNoise6
            | SynthStage::LowNoise8
            | SynthStage::LowNoise11
            | SynthStage::LowNoise15
            | SynthStage::LowNoise16
            | SynthStage::LowNoise20
            | SynthStage::LowNoise21
            | SynthStage::LowNoise23 => 1..=4095,
            SynthStage::HiSpeed2
            | SynthStage::HiSpeed4
            | SynthStage::HiSpeed6
            | SynthStage::HiSpeed7
            | SynthStage::HiSpeed8 => 1..=255,
        }
    }
}

/// Validate one computed stage divisor.
pub fn check_stage(stage: SynthStage, divisor: u32) -> Result<(), ErrorCode> {
    if stage.divisor_range().contains(&divisor) {
        Ok(())
    } else {
        Err(stage.error_code())
    }
}

const LOWNOISE_STAGES: [(SynthStage, u32); 9] = [
    (SynthStage::LowNoise5, 5),
    (SynthStage::LowNoise6, 6),
    (SynthStage::LowNoise8, 8),
    (SynthStage::LowNoise11, 11),
    (SynthStage::LowNoise15, 15),
    (SynthStage::LowNoise16, 16),
    (SynthStage::LowNoise20, 20),
    (SynthStage::LowNoise21, 21),
    (SynthStage::LowNoise23, 23),
];

const HISPEED_STAGES: [(SynthStage, u32); 5] = [
    (SynthStage::HiSpeed2, 2),
    (SynthStage::HiSpeed4, 4),
    (SynthStage::HiSpeed6, 6),
    (SynthStage::HiSpeed7, 7),
    (SynthStage::HiSpeed8, 8),
];

/// Computed divider plan for one tuning transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunePlan {
    pub hz: u32,
    pub fout_div: u32,
    pub ferr_div: u32,
    pub lownoise_divs: [u32; LOWNOISE_STAGES.len()],
    pub hispeed_divs: [u32; HISPEED_STAGES.len()],
}

/// Build a divider plan for `hz`, validating every stage.
pub fn plan(hz: u32) -> Result<TunePlan, ErrorCode> {
    if !(FREQ_MIN_HZ..=FREQ_MAX_HZ).contains(&hz) || hz % CHANNEL_RASTER_HZ != 0 {
        // Outside the band or off the raster the accumulator never settles
        return Err(ErrorCode::FreqConverge);
    }

    let fout_div = hz / SYNTH_REF_HZ;
    check_stage(SynthStage::CommonFout, fout_div)?;
    let ferr_div = (hz % SYNTH_REF_HZ) / CHANNEL_RASTER_HZ;
    check_stage(SynthStage::CommonFerr, ferr_div)?;

    let khz = hz / 1000;
    let mut lownoise_divs = [0u32; LOWNOISE_STAGES.len()];
    for (slot, (stage, base)) in lownoise_divs.iter_mut().zip(LOWNOISE_STAGES) {
        let div = khz / (base * 1000);
        check_stage(stage, div)?;
        *slot = div;
    }
    let mut hispeed_divs = [0u32; HISPEED_STAGES.len()];
    for (slot, (stage, base)) in hispeed_divs.iter_mut().zip(HISPEED_STAGES) {
        let div = fout_div * base;
        check_stage(stage, div)?;
        *slot = div;
    }

    Ok(TunePlan {
        hz,
        fout_div,
        ferr_div,
        lownoise_divs,
        hispeed_divs,
    })
}

/// Validate a FREQ payload and build the tuning transaction.
pub fn tune(payload: &[u8]) -> Result<BusTransaction, ErrorCode> {
    debug_assert_eq!(payload.len(), 4);
    let hz = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let plan = plan(hz)?;

    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&hz.to_le_bytes());
    bytes[4] = plan.fout_div as u8;
    bytes[5..7].copy_from_slice(&(plan.ferr_div as u16).to_le_bytes());
    bytes[7] = plan.hispeed_divs[0] as u8;
    Ok(BusTransaction::new(Requester::Frequency, &bytes))
}
