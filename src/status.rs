//! Error taxonomy, alarm aggregation, and status response serialization.
//!
//! Every response carries one error code (`SUCCESS` when none), a snapshot
//! of the state register, and the bit-packed alarm vector. Responses are a
//! fixed size per protocol revision (26 bytes originally, 48 in later
//! firmware) and are zero-padded up to that size, never beyond it.

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

use crate::framing::FrameError;
use crate::opcodes::Opcode;
use crate::state::StateFlags;

/// Protocol error codes, one per response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0x01,
    InvalidOpcode = 0x02,
    InvalidState = 0x03,
    UnknownFrqState = 0x04,
    UnknownPwrState = 0x05,
    UnknownPhsState = 0x06,
    UnknownBiasState = 0x07,
    UnknownSpiState = 0x08,
    SpiNoData = 0x09,
    FreqConverge = 0x0A,
    OpcodeNotSupported = 0x0B,
    LowNoise5BadDiv = 0x0C,
    LowNoise6BadDiv = 0x0D,
    LowNoise8BadDiv = 0x0E,
    LowNoise11BadDiv = 0x0F,
    LowNoise15BadDiv = 0x10,
    LowNoise16BadDiv = 0x11,
    LowNoise20BadDiv = 0x12,
    LowNoise21BadDiv = 0x13,
    LowNoise23BadDiv = 0x14,
    HiSpeed2BadDiv = 0x15,
    HiSpeed4BadDiv = 0x16,
    HiSpeed6BadDiv = 0x17,
    HiSpeed7BadDiv = 0x18,
    HiSpeed8BadDiv = 0x19,
    CommonFerrBadDiv = 0x1A,
    CommonFoutBadDiv = 0x1B,
    PowerInvalid = 0x1C,
    PulseOverrun = 0x1D,
    UnknownPulseState = 0x1E,
    PatternOverrun = 0x1F,
    PatternRunning = 0x20,
    PatternAddr = 0x21,
    PatternState = 0x22,
    RspFifoFull = 0x23,
    InvalidLength = 0x24,
    WrPtnRam = 0x25,
    MeasType = 0x26,
    PtnFifoFull = 0x30,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => ErrorCode::Success,
            0x02 => ErrorCode::InvalidOpcode,
            0x03 => ErrorCode::InvalidState,
            0x04 => ErrorCode::UnknownFrqState,
            0x05 => ErrorCode::UnknownPwrState,
            0x06 => ErrorCode::UnknownPhsState,
            0x07 => ErrorCode::UnknownBiasState,
            0x08 => ErrorCode::UnknownSpiState,
            0x09 => ErrorCode::SpiNoData,
            0x0A => ErrorCode::FreqConverge,
            0x0B => ErrorCode::OpcodeNotSupported,
            0x0C => ErrorCode::LowNoise5BadDiv,
            0x0D => ErrorCode::LowNoise6BadDiv,
            0x0E => ErrorCode::LowNoise8BadDiv,
            0x0F => ErrorCode::LowNoise11BadDiv,
            0x10 => ErrorCode::LowNoise15BadDiv,
            0x11 => ErrorCode::LowNoise16BadDiv,
            0x12 => ErrorCode::LowNoise20BadDiv,
            0x13 => ErrorCode::LowNoise21BadDiv,
            0x14 => ErrorCode::LowNoise23BadDiv,
            0x15 => ErrorCode::HiSpeed2BadDiv,
            0x16 => ErrorCode::HiSpeed4BadDiv,
            0x17 => ErrorCode::HiSpeed6BadDiv,
            0x18 => ErrorCode::HiSpeed7BadDiv,
            0x19 => ErrorCode::HiSpeed8BadDiv,
            0x1A => ErrorCode::CommonFerrBadDiv,
            0x1B => ErrorCode::CommonFoutBadDiv,
            0x1C => ErrorCode::PowerInvalid,
            0x1D => ErrorCode::PulseOverrun,
            0x1E => ErrorCode::UnknownPulseState,
            0x1F => ErrorCode::PatternOverrun,
            0x20 => ErrorCode::PatternRunning,
            0x21 => ErrorCode::PatternAddr,
            0x22 => ErrorCode::PatternState,
            0x23 => ErrorCode::RspFifoFull,
            0x24 => ErrorCode::InvalidLength,
            0x25 => ErrorCode::WrPtnRam,
            0x26 => ErrorCode::MeasType,
            0x30 => ErrorCode::PtnFifoFull,
            _ => return None,
        })
    }

    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

/// Monitored alarm conditions, one bit position each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AlarmId {
    OverPower = 0,
    UnderPower = 1,
    OverFrequency = 2,
    UnderFrequency = 3,
    PllUnlock = 4,
    OverTemperature = 5,
    PulseWidth = 6,
    DutyCycle = 7,
}

impl AlarmId {
    pub const COUNT: usize = 8;

    pub fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Bit-packed alarm vector as carried in every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlarmSnapshot {
    pub enable: u8,
    pub read: u8,
    pub latch: u8,
}

/// The alarm triples. `enable` is host-writable, `read` mirrors the live
/// condition inputs each evaluation cycle, `latch` is sticky.
#[derive(Debug, Default)]
pub struct AlarmBank {
    enable: u8,
    read: u8,
    latch: u8,
    prev_read: u8,
}

impl AlarmBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enables(&mut self, mask: u8) {
        self.enable = mask;
    }

    /// Clear latched conditions named in `mask`. RESET passes 0xFF.
    pub fn clear_latches(&mut self, mask: u8) {
        self.latch &= !mask;
    }

    /// One evaluation cycle: overwrite `read` with the injected live
    /// values and latch any enabled condition on its rising edge.
    pub fn evaluate(&mut self, readings: u8) {
        let rising = readings & !self.prev_read;
        self.latch |= rising & self.enable;
        self.prev_read = readings;
        self.read = readings;
    }

    pub fn snapshot(&self) -> AlarmSnapshot {
        AlarmSnapshot {
            enable: self.enable,
            read: self.read,
            latch: self.latch,
        }
    }

    pub fn is_latched(&self, id: AlarmId) -> bool {
        self.latch & id.bit() != 0
    }
}

/// Fixed response size per protocol revision. Negotiated via the LENGTH
/// opcode, never inferred from response content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseVersion {
    /// Original 26-byte status response.
    Rev1,
    /// Extended 48-byte response carried by later firmware.
    Rev2,
}

impl ResponseVersion {
    pub fn size(self) -> usize {
        match self {
            ResponseVersion::Rev1 => 26,
            ResponseVersion::Rev2 => 48,
        }
    }

    pub fn from_size(size: u16) -> Option<Self> {
        match size {
            26 => Some(ResponseVersion::Rev1),
            48 => Some(ResponseVersion::Rev2),
            _ => None,
        }
    }

    pub fn max_payload(self) -> usize {
        self.size() - RESPONSE_HEADER_LEN
    }
}

/// Length prefix, opcode echo, error code, state snapshot, alarm vector.
pub const RESPONSE_HEADER_LEN: usize = 9;

/// Largest response any revision can emit.
pub const MAX_RESPONSE_SIZE: usize = 48;

pub const MAX_RESPONSE_PAYLOAD: usize = MAX_RESPONSE_SIZE - RESPONSE_HEADER_LEN;

const_assert!(MAX_RESPONSE_SIZE >= RESPONSE_HEADER_LEN);
const_assert!(MAX_RESPONSE_SIZE <= crate::opcodes::SECTOR_SIZE);

pub type ResponseBytes = ArrayVec<u8, MAX_RESPONSE_SIZE>;

/// One serialized status response, transient, one per transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub opcode: u8,
    pub error: ErrorCode,
    pub state: StateFlags,
    pub alarms: AlarmSnapshot,
    pub payload: heapless::Vec<u8, MAX_RESPONSE_PAYLOAD>,
}

impl StatusResponse {
    pub fn new(opcode: Opcode, error: ErrorCode) -> Self {
        StatusResponse {
            opcode: opcode.as_u8(),
            error,
            state: StateFlags::empty(),
            alarms: AlarmSnapshot::default(),
            payload: heapless::Vec::new(),
        }
    }

    /// Serialize to exactly `version.size()` bytes, zero-padded. Payload
    /// bytes beyond the revision's capacity are dropped; the mandatory
    /// header fields are always present.
    pub fn encode(&self, version: ResponseVersion) -> ResponseBytes {
        let size = version.size();
        let mut out = ResponseBytes::new();
        out.extend((size as u16).to_le_bytes());
        out.push(self.opcode);
        out.push(self.error.as_u8());
        out.extend(self.state.bits().to_le_bytes());
        out.push(self.alarms.enable);
        out.push(self.alarms.read);
        out.push(self.alarms.latch);
        let take = self.payload.len().min(version.max_payload());
        out.try_extend_from_slice(&self.payload[..take])
            .unwrap_or_default();
        while out.len() < size {
            out.push(0);
        }
        out
    }

    /// Decode a response of the declared fixed size. Trailing zero padding
    /// is retained in `payload` so encode/decode round-trips bit-exact.
    pub fn decode(bytes: &[u8], version: ResponseVersion) -> Result<Self, FrameError> {
        let size = version.size();
        if bytes.len() < size {
            return Err(FrameError::Truncated);
        }
        let declared = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        if declared != size {
            return Err(FrameError::InvalidLength {
                opcode: bytes[2],
                len: declared,
            });
        }
        let error = ErrorCode::from_u8(bytes[3]).ok_or(FrameError::BadErrorCode { code: bytes[3] })?;
        let mut payload = heapless::Vec::new();
        payload
            .extend_from_slice(&bytes[RESPONSE_HEADER_LEN..size])
            .unwrap_or_default();
        Ok(StatusResponse {
            opcode: bytes[2],
            error,
            state: StateFlags::from_bits(u16::from_le_bytes([bytes[4], bytes[5]])),
            alarms: AlarmSnapshot {
                enable: bytes[6],
                read: bytes[7],
                latch: bytes[8],
            },
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for value in 0u8..=0x40 {
            if let Some(code) = ErrorCode::from_u8(value) {
                assert_eq!(code.as_u8(), value);
            }
        }
        assert_eq!(ErrorCode::from_u8(0x00), None);
        assert_eq!(ErrorCode::from_u8(0x27), None);
        assert_eq!(ErrorCode::PtnFifoFull.as_u8(), 0x30);
    }

    #[test]
    fn test_alarm_latch_is_sticky() {
        let mut bank = AlarmBank::new();
        bank.set_enables(AlarmId::OverPower.bit());

        bank.evaluate(AlarmId::OverPower.bit());
        assert!(bank.is_latched(AlarmId::OverPower));

        // Latch survives the condition going away
        bank.evaluate(0);
        assert!(bank.is_latched(AlarmId::OverPower));
        assert_eq!(bank.snapshot().read, 0);

        bank.clear_latches(AlarmId::OverPower.bit());
        assert!(!bank.is_latched(AlarmId::OverPower));
    }

    #[test]
    fn test_disabled_alarm_never_latches() {
        let mut bank = AlarmBank::new();
        bank.evaluate(AlarmId::PllUnlock.bit());
        assert!(!bank.is_latched(AlarmId::PllUnlock));
        // Read bit still mirrors the live input
        assert_eq!(bank.snapshot().read, AlarmId::PllUnlock.bit());
    }

    #[test]
    fn test_latch_requires_rising_edge() {
        let mut bank = AlarmBank::new();
        // Condition already true when the host enables it: no edge, no latch
        bank.evaluate(AlarmId::OverTemperature.bit());
        bank.set_enables(AlarmId::OverTemperature.bit());
        bank.evaluate(AlarmId::OverTemperature.bit());
        assert!(!bank.is_latched(AlarmId::OverTemperature));

        // Drop and re-assert: that's an edge
        bank.evaluate(0);
        bank.evaluate(AlarmId::OverTemperature.bit());
        assert!(bank.is_latched(AlarmId::OverTemperature));
    }

    #[test]
    fn test_response_roundtrip_both_revisions() {
        for version in [ResponseVersion::Rev1, ResponseVersion::Rev2] {
            let mut rsp = StatusResponse::new(Opcode::Freq, ErrorCode::Success);
            rsp.state = StateFlags::from_bits(0x0024);
            rsp.alarms = AlarmSnapshot {
                enable: 0x81,
                read: 0x01,
                latch: 0x80,
            };
            rsp.payload.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

            let bytes = rsp.encode(version);
            assert_eq!(bytes.len(), version.size());

            let decoded = StatusResponse::decode(&bytes, version).unwrap();
            assert_eq!(decoded.opcode, rsp.opcode);
            assert_eq!(decoded.error, rsp.error);
            assert_eq!(decoded.state, rsp.state);
            assert_eq!(decoded.alarms, rsp.alarms);
            assert_eq!(&decoded.payload[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
            // Padding is zeros
            assert!(decoded.payload[4..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_response_never_exceeds_declared_size() {
        let mut rsp = StatusResponse::new(Opcode::Status, ErrorCode::Success);
        for i in 0..MAX_RESPONSE_PAYLOAD {
            rsp.payload.push(i as u8).unwrap();
        }
        let bytes = rsp.encode(ResponseVersion::Rev1);
        assert_eq!(bytes.len(), 26);
        let bytes = rsp.encode(ResponseVersion::Rev2);
        assert_eq!(bytes.len(), 48);
    }

    #[test]
    fn test_decode_rejects_bad_length_prefix() {
        let rsp = StatusResponse::new(Opcode::Status, ErrorCode::Success);
        let bytes = rsp.encode(ResponseVersion::Rev1);
        assert!(StatusResponse::decode(&bytes, ResponseVersion::Rev2).is_err());
    }
}
