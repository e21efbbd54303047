//! Global busy-state bitmask.
//!
//! The hardware keeps one 16-bit state register shared by every subsystem.
//! Here the register is a single owned [`SystemState`] with a narrow
//! mutation API; each subsystem only ever toggles its own busy bit through
//! the dispatcher, so no field has more than one writer.

use serde::{Deserialize, Serialize};

/// Named bits of the overall state register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateFlags(u16);

impl StateFlags {
    pub const RESET: StateFlags = StateFlags(0x0001);
    pub const INITIALIZING: StateFlags = StateFlags(0x0002);
    pub const INITIALIZED: StateFlags = StateFlags(0x0004);
    pub const MMC_BUSY: StateFlags = StateFlags(0x0008);
    pub const OPC_BUSY: StateFlags = StateFlags(0x0010);
    pub const FRQ_BUSY: StateFlags = StateFlags(0x0020);
    pub const PWR_BUSY: StateFlags = StateFlags(0x0040);
    pub const PHS_BUSY: StateFlags = StateFlags(0x0080);
    pub const PLS_BUSY: StateFlags = StateFlags(0x0100);
    pub const BIAS_BUSY: StateFlags = StateFlags(0x0200);
    pub const MODE_BUSY: StateFlags = StateFlags(0x0400);
    pub const PTN_BUSY: StateFlags = StateFlags(0x0800);
    pub const SPI_BUSY: StateFlags = StateFlags(0x1000);
    pub const RSP_READY: StateFlags = StateFlags(0x2000);

    const ALL_BUSY: StateFlags = StateFlags(
        Self::MMC_BUSY.0
            | Self::OPC_BUSY.0
            | Self::FRQ_BUSY.0
            | Self::PWR_BUSY.0
            | Self::PHS_BUSY.0
            | Self::PLS_BUSY.0
            | Self::BIAS_BUSY.0
            | Self::MODE_BUSY.0
            | Self::PTN_BUSY.0
            | Self::SPI_BUSY.0,
    );

    pub fn empty() -> Self {
        StateFlags(0)
    }

    pub fn from_bits(bits: u16) -> Self {
        StateFlags(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: StateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: StateFlags) -> bool {
        self.0 & other.0 != 0
    }
}

/// Subsystems that gate reentrant dispatch with a busy flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubsystemId {
    Frequency,
    Power,
    Phase,
    Pulse,
    Bias,
    Mode,
    Pattern,
}

impl SubsystemId {
    pub fn busy_flag(self) -> StateFlags {
        match self {
            SubsystemId::Frequency => StateFlags::FRQ_BUSY,
            SubsystemId::Power => StateFlags::PWR_BUSY,
            SubsystemId::Phase => StateFlags::PHS_BUSY,
            SubsystemId::Pulse => StateFlags::PLS_BUSY,
            SubsystemId::Bias => StateFlags::BIAS_BUSY,
            SubsystemId::Mode => StateFlags::MODE_BUSY,
            SubsystemId::Pattern => StateFlags::PTN_BUSY,
        }
    }
}

/// The process-wide state register. Created at RESET, mutated for the
/// lifetime of the instrument.
#[derive(Debug)]
pub struct SystemState {
    flags: StateFlags,
}

impl SystemState {
    pub fn new() -> Self {
        // Power-up mirrors a hardware reset
        SystemState {
            flags: StateFlags::from_bits(StateFlags::RESET.bits() | StateFlags::INITIALIZING.bits()),
        }
    }

    pub fn snapshot(&self) -> StateFlags {
        self.flags
    }

    pub fn is_initialized(&self) -> bool {
        self.flags.contains(StateFlags::INITIALIZED)
    }

    pub fn is_busy(&self, id: SubsystemId) -> bool {
        self.flags.contains(id.busy_flag())
    }

    /// Set by the dispatcher when it accepts a command for `id`; cleared
    /// only by [`clear_busy`](Self::clear_busy) from the owning handler's
    /// completion path, or by RESET.
    pub fn set_busy(&mut self, id: SubsystemId) {
        debug_assert!(
            !self.flags.contains(id.busy_flag()),
            "busy flag for {id:?} already set"
        );
        self.flags.0 |= id.busy_flag().0;
    }

    pub fn clear_busy(&mut self, id: SubsystemId) {
        self.flags.0 &= !id.busy_flag().0;
    }

    /// Transport-side busy bits, toggled around feed/dispatch.
    pub fn set_transport_busy(&mut self, mmc: bool, opc: bool) {
        let mask = StateFlags::MMC_BUSY.0 | StateFlags::OPC_BUSY.0;
        self.flags.0 &= !mask;
        if mmc {
            self.flags.0 |= StateFlags::MMC_BUSY.0;
        }
        if opc {
            self.flags.0 |= StateFlags::OPC_BUSY.0;
        }
    }

    pub fn set_spi_busy(&mut self, busy: bool) {
        if busy {
            self.flags.0 |= StateFlags::SPI_BUSY.0;
        } else {
            self.flags.0 &= !StateFlags::SPI_BUSY.0;
        }
    }

    pub fn set_rsp_ready(&mut self, ready: bool) {
        if ready {
            self.flags.0 |= StateFlags::RSP_READY.0;
        } else {
            self.flags.0 &= !StateFlags::RSP_READY.0;
        }
    }

    /// RESET: drop every busy flag and re-enter INITIALIZING.
    pub fn begin_reset(&mut self) {
        self.flags.0 &= !(StateFlags::ALL_BUSY.0 | StateFlags::INITIALIZED.0 | StateFlags::RSP_READY.0);
        self.flags.0 |= StateFlags::RESET.0 | StateFlags::INITIALIZING.0;
    }

    /// Subsystem self-check finished; the happy path ends at INITIALIZED.
    pub fn finish_init(&mut self) {
        self.flags.0 &= !(StateFlags::RESET.0 | StateFlags::INITIALIZING.0);
        self.flags.0 |= StateFlags::INITIALIZED.0;
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_up_state() {
        let state = SystemState::new();
        assert!(state.snapshot().contains(StateFlags::RESET));
        assert!(state.snapshot().contains(StateFlags::INITIALIZING));
        assert!(!state.is_initialized());
    }

    #[test]
    fn test_init_happy_path() {
        let mut state = SystemState::new();
        state.finish_init();
        assert!(state.is_initialized());
        assert!(!state.snapshot().contains(StateFlags::INITIALIZING));
        assert!(!state.snapshot().contains(StateFlags::RESET));
    }

    #[test]
    fn test_busy_flags_are_per_subsystem() {
        let mut state = SystemState::new();
        state.finish_init();

        state.set_busy(SubsystemId::Frequency);
        assert!(state.is_busy(SubsystemId::Frequency));
        assert!(!state.is_busy(SubsystemId::Power));

        state.set_busy(SubsystemId::Power);
        state.clear_busy(SubsystemId::Frequency);
        assert!(!state.is_busy(SubsystemId::Frequency));
        assert!(state.is_busy(SubsystemId::Power));
    }

    #[test]
    fn test_reset_clears_all_busy() {
        let mut state = SystemState::new();
        state.finish_init();
        state.set_busy(SubsystemId::Frequency);
        state.set_busy(SubsystemId::Pattern);
        state.set_spi_busy(true);
        state.set_rsp_ready(true);

        state.begin_reset();
        let flags = state.snapshot();
        assert!(flags.contains(StateFlags::RESET));
        assert!(flags.contains(StateFlags::INITIALIZING));
        assert!(!flags.intersects(StateFlags::FRQ_BUSY));
        assert!(!flags.intersects(StateFlags::PTN_BUSY));
        assert!(!flags.intersects(StateFlags::SPI_BUSY));
        assert!(!flags.intersects(StateFlags::RSP_READY));
        assert!(!flags.contains(StateFlags::INITIALIZED));
    }
}
