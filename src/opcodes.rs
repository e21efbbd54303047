//! Opcode space for the instrument command protocol.
//!
//! Opcodes are 7-bit values partitioned by range: `0x00`-`0x1F` general and
//! configuration, `0x20`-`0x23` pattern control, `0x30`-`0x32` measurement.
//! Each opcode carries a one-byte payload length on the wire; the expected
//! size class is fixed per opcode and checked at the frame boundary.

use serde::{Deserialize, Serialize};

/// Commands and responses travel in whole transport sectors; partial final
/// sectors are zero-padded.
pub const SECTOR_SIZE: usize = 512;

/// Minimum bytes buffered before the decoder attempts an opcode+length
/// header.
pub const MIN_DECODE_BYTES: usize = 2;

/// High bit of the opcode byte is reserved; legal opcodes are 7-bit.
pub const OPCODE_MASK: u8 = 0x7F;

/// Number of RF output channels addressed by the channel byte.
pub const NUM_CHANNELS: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // General & config, 0x00 based
    Terminator = 0x00,
    Status = 0x01,
    Freq = 0x02,
    Power = 0x03,
    Phase = 0x04,
    Pulse = 0x05,
    Bias = 0x06,
    Mode = 0x07,
    Length = 0x08,
    TrigConf = 0x09,
    SyncConf = 0x0A,
    PaIntfCfg = 0x0B,
    Config = 0x0C,
    Reset = 0x0D,
    CalPwr = 0x0E,
    CalPtbl = 0x0F,
    CalZmon = 0x10,
    CalVfy = 0x11,
    Alarms = 0x12,
    Ovrd = 0x13,

    // Pattern control, 0x20 based
    PatClk = 0x20,
    PatAdr = 0x21,
    PatCtl = 0x22,
    Branch = 0x23,

    // Static measurement, 0x30 based
    ZmSize = 0x30,
    ZmCtl = 0x31,
    Meas = 0x32,
}

/// Expected payload size class for an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLen {
    Exact(usize),
    AtLeast(usize),
}

impl PayloadLen {
    pub fn accepts(self, len: usize) -> bool {
        match self {
            PayloadLen::Exact(n) => len == n,
            PayloadLen::AtLeast(n) => len >= n,
        }
    }
}

impl Opcode {
    /// Decode a 7-bit opcode value. Values outside the defined set are
    /// rejected; the dispatcher reports them as `ERR_INVALID_OPCODE`.
    pub fn from_u7(value: u8) -> Option<Self> {
        if value & !OPCODE_MASK != 0 {
            return None;
        }
        Some(match value {
            0x00 => Opcode::Terminator,
            0x01 => Opcode::Status,
            0x02 => Opcode::Freq,
            0x03 => Opcode::Power,
            0x04 => Opcode::Phase,
            0x05 => Opcode::Pulse,
            0x06 => Opcode::Bias,
            0x07 => Opcode::Mode,
            0x08 => Opcode::Length,
            0x09 => Opcode::TrigConf,
            0x0A => Opcode::SyncConf,
            0x0B => Opcode::PaIntfCfg,
            0x0C => Opcode::Config,
            0x0D => Opcode::Reset,
            0x0E => Opcode::CalPwr,
            0x0F => Opcode::CalPtbl,
            0x10 => Opcode::CalZmon,
            0x11 => Opcode::CalVfy,
            0x12 => Opcode::Alarms,
            0x13 => Opcode::Ovrd,
            0x20 => Opcode::PatClk,
            0x21 => Opcode::PatAdr,
            0x22 => Opcode::PatCtl,
            0x23 => Opcode::Branch,
            0x30 => Opcode::ZmSize,
            0x31 => Opcode::ZmCtl,
            0x32 => Opcode::Meas,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Wire payload size class.
    pub fn payload_len(self) -> PayloadLen {
        use PayloadLen::{AtLeast, Exact};
        match self {
            Opcode::Terminator | Opcode::Status | Opcode::Reset => Exact(0),
            Opcode::Freq => Exact(4),          // u32 LE Hz
            Opcode::Power => Exact(3),         // channel + Q8.8 dBm
            Opcode::Phase => Exact(3),         // channel + deci-degrees
            Opcode::Pulse => Exact(9),         // channel + width + measure-at
            Opcode::Bias => Exact(2),          // channel + on/off
            Opcode::Mode => Exact(4),          // u32 LE mode bits
            Opcode::Length => Exact(2),        // u16 LE response size
            Opcode::TrigConf => Exact(2),      // channel + trigger bits
            Opcode::SyncConf => Exact(4),      // two u16 sync words
            Opcode::PaIntfCfg => Exact(4),
            Opcode::Config => Exact(4),
            Opcode::CalPwr => Exact(3),        // channel + Q8.8 cal point
            Opcode::CalPtbl => AtLeast(2),     // u16 LE offset + table chunk
            Opcode::CalZmon => Exact(4),
            Opcode::CalVfy => Exact(1),        // channel
            Opcode::Alarms => Exact(2),        // action + condition mask
            Opcode::Ovrd => Exact(3),          // channel + u16 LE index
            Opcode::PatClk => Exact(12),       // 96-bit pattern write word
            Opcode::PatAdr => Exact(2),        // u16 LE address
            Opcode::PatCtl => Exact(1),        // control bits
            Opcode::Branch => Exact(2),        // u16 LE branch target
            Opcode::ZmSize => Exact(2),
            Opcode::ZmCtl => Exact(2),
            Opcode::Meas => Exact(2),          // channel + measurement type
        }
    }

    /// Status/measurement queries and the terminator are accepted in any
    /// busy state.
    pub fn always_accepted(self) -> bool {
        matches!(
            self,
            Opcode::Terminator
                | Opcode::Status
                | Opcode::ZmSize
                | Opcode::ZmCtl
                | Opcode::Meas
        )
    }

    pub fn is_pattern(self) -> bool {
        matches!(
            self,
            Opcode::PatClk | Opcode::PatAdr | Opcode::PatCtl | Opcode::Branch
        )
    }
}

/// Pattern control byte, host-written via PATCTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PatternCtl(u8);

impl PatternCtl {
    /// Writing no action bits halts playback at the current word.
    pub const STOP: u8 = 0x00;
    pub const RUN: u8 = 0x01;
    pub const STEP: u8 = 0x02;
    pub const RESET: u8 = 0x04;
    pub const ABORT: u8 = 0x08;
    pub const END: u8 = 0x10;

    const KNOWN: u8 = Self::RUN | Self::STEP | Self::RESET | Self::ABORT | Self::END;

    pub fn from_bits(bits: u8) -> Self {
        PatternCtl(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn run(self) -> bool {
        self.0 & Self::RUN != 0
    }

    pub fn step(self) -> bool {
        self.0 & Self::STEP != 0
    }

    pub fn reset(self) -> bool {
        self.0 & Self::RESET != 0
    }

    pub fn abort(self) -> bool {
        self.0 & Self::ABORT != 0
    }

    pub fn end(self) -> bool {
        self.0 & Self::END != 0
    }

    /// True when no reserved bits are set and at most one action is
    /// requested; an empty write is STOP. END is never a legal host
    /// action; it marks the sentinel word in pattern memory.
    pub fn is_valid_host_action(self) -> bool {
        if self.0 & !Self::KNOWN != 0 || self.end() {
            return false;
        }
        (self.0 & Self::KNOWN).count_ones() <= 1
    }
}

/// 16-bit trigger configuration word. The low byte carries the channel
/// number; bits 8-15 are the trigger flags.
///
/// Bit 13 reads as NOW (software trigger) under protocol Rev2 semantics;
/// Rev1 firmware treated it as INVERT. This implementation is Rev2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TriggerConf(u16);

impl TriggerConf {
    pub const EN: u16 = 0x0100;
    pub const EXT: u16 = 0x0200;
    pub const SRC: u16 = 0x0400;
    pub const RFGT: u16 = 0x0800;
    pub const CONT: u16 = 0x1000;
    pub const NOW: u16 = 0x2000;
    pub const ABRT: u16 = 0x4000;
    pub const ARM: u16 = 0x8000;

    pub fn from_bits(bits: u16) -> Self {
        TriggerConf(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn channel(self) -> u8 {
        (self.0 & 0x00FF) as u8
    }

    pub fn enabled(self) -> bool {
        self.0 & Self::EN != 0
    }

    pub fn external(self) -> bool {
        self.0 & Self::EXT != 0
    }

    pub fn source(self) -> bool {
        self.0 & Self::SRC != 0
    }

    pub fn rf_gated(self) -> bool {
        self.0 & Self::RFGT != 0
    }

    pub fn continuous(self) -> bool {
        self.0 & Self::CONT != 0
    }

    pub fn now(self) -> bool {
        self.0 & Self::NOW != 0
    }

    pub fn abort(self) -> bool {
        self.0 & Self::ABRT != 0
    }

    pub fn armed(self) -> bool {
        self.0 & Self::ARM != 0
    }
}
