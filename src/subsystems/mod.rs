//! Subsystem handlers and the shared device bus.
//!
//! The analog subsystems (synthesizer, level DACs, phase shifters, bias
//! switches) are black boxes behind one shared serial bus: they accept a
//! transaction and eventually raise a completion. Each handler here is an
//! independently tickable state machine that owns exactly one busy flag
//! and talks to its peers only through the system state register and the
//! bus arbiter, never by calling another handler.

pub mod bias;
pub mod frequency;
pub mod phase;
pub mod power;
pub mod pulse;

use heapless::Vec;
use tracing::trace;

use crate::arbiter::{BusArbiter, Requester};
use crate::state::SubsystemId;
use crate::status::ErrorCode;

/// Longest device transaction body (a calibration table chunk).
pub const MAX_XACT_BYTES: usize = 255;

/// One command queued toward a bus device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusTransaction {
    pub requester: Requester,
    pub bytes: Vec<u8, MAX_XACT_BYTES>,
}

impl BusTransaction {
    pub fn new(requester: Requester, bytes: &[u8]) -> Self {
        let mut body = Vec::new();
        // Callers build bounded bodies; truncation cannot occur
        let _ = body.extend_from_slice(bytes);
        BusTransaction {
            requester,
            bytes: body,
        }
    }
}

/// A black-box device on the arbitrated bus: accepts a transaction and
/// eventually raises a completion signal. No further structure assumed.
pub trait Device: Send {
    fn start(&mut self, xact: &BusTransaction);
    /// Advance one system tick; `true` when the transaction completed.
    fn poll(&mut self) -> bool;
}

/// Deterministic stand-in device completing after a fixed tick count.
#[derive(Debug)]
pub struct StubDevice {
    latency_ticks: u32,
    remaining: u32,
    executed: u32,
}

impl StubDevice {
    pub fn new(latency_ticks: u32) -> Self {
        StubDevice {
            latency_ticks,
            remaining: 0,
            executed: 0,
        }
    }

    pub fn executed(&self) -> u32 {
        self.executed
    }
}

impl Device for StubDevice {
    fn start(&mut self, _xact: &BusTransaction) {
        self.remaining = self.latency_ticks.max(1);
    }

    fn poll(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.executed += 1;
            return true;
        }
        false
    }
}

/// The single shared serial bus. Mutual exclusion is the arbiter's job;
/// the bus itself only tracks the in-flight transaction.
pub struct SerialBus {
    device: Box<dyn Device>,
    active: bool,
}

impl SerialBus {
    pub fn new(device: Box<dyn Device>) -> Self {
        SerialBus {
            device,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn start(&mut self, xact: &BusTransaction) {
        debug_assert!(!self.active, "bus transaction started while active");
        trace!(requester = ?xact.requester, len = xact.bytes.len(), "bus transaction start");
        self.device.start(xact);
        self.active = true;
    }

    /// One system tick. Returns `true` when the in-flight transaction
    /// completed this tick.
    pub fn tick(&mut self) -> bool {
        if !self.active {
            return false;
        }
        if self.device.poll() {
            self.active = false;
            return true;
        }
        false
    }

    /// RESET: abandon whatever was in flight.
    pub fn clear(&mut self) {
        self.active = false;
    }
}

impl core::fmt::Debug for SerialBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SerialBus")
            .field("active", &self.active)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerPhase {
    Idle,
    WaitGrant,
    Executing,
}

/// Completion raised by a handler when its device transaction finishes.
#[derive(Debug, Clone, Copy)]
pub struct HandlerCompletion {
    pub subsystem: SubsystemId,
    /// Response slot to mark ready; pattern playback words carry none.
    pub slot: Option<u32>,
    pub error: ErrorCode,
}

/// Per-subsystem transaction executor: waits for the arbiter grant, runs
/// the device transaction, releases, and reports completion.
#[derive(Debug)]
pub struct DeviceHandler {
    subsystem: SubsystemId,
    requester: Requester,
    phase: HandlerPhase,
    pending: Option<BusTransaction>,
    slot: Option<u32>,
}

impl DeviceHandler {
    pub fn new(subsystem: SubsystemId, requester: Requester) -> Self {
        DeviceHandler {
            subsystem,
            requester,
            phase: HandlerPhase::Idle,
            pending: None,
            slot: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase == HandlerPhase::Idle
    }

    pub fn requester(&self) -> Requester {
        self.requester
    }

    /// Accept a validated transaction. The dispatcher has already set the
    /// subsystem's busy flag; requesting the bus without it is a
    /// dispatcher bug.
    pub fn submit(&mut self, xact: BusTransaction, slot: Option<u32>, arbiter: &mut BusArbiter) {
        debug_assert!(self.is_idle(), "{:?} handler submit while busy", self.subsystem);
        self.pending = Some(xact);
        self.slot = slot;
        self.phase = HandlerPhase::WaitGrant;
        arbiter.request(self.requester);
    }

    /// Start the device transaction once the grant arrives and the bus is
    /// free.
    pub fn try_start(&mut self, arbiter: &BusArbiter, bus: &mut SerialBus) {
        if self.phase != HandlerPhase::WaitGrant {
            return;
        }
        if arbiter.owns(self.requester) && !bus.is_active() {
            if let Some(xact) = self.pending.take() {
                bus.start(&xact);
                self.phase = HandlerPhase::Executing;
            }
        }
    }

    /// The bus signalled completion while this handler held the grant.
    pub fn on_bus_done(&mut self, arbiter: &mut BusArbiter) -> HandlerCompletion {
        debug_assert_eq!(self.phase, HandlerPhase::Executing);
        arbiter.release(self.requester);
        self.phase = HandlerPhase::Idle;
        HandlerCompletion {
            subsystem: self.subsystem,
            slot: self.slot.take(),
            error: ErrorCode::Success,
        }
    }

    pub fn is_executing(&self) -> bool {
        self.phase == HandlerPhase::Executing
    }

    /// RESET: drop any pending or in-flight work without completion.
    pub fn force_reset(&mut self) {
        self.phase = HandlerPhase::Idle;
        self.pending = None;
        self.slot = None;
    }
}

/// Channel byte validation shared by the channel-addressed subsystems.
pub(crate) fn check_channel(channel: u8, error: ErrorCode) -> Result<(), ErrorCode> {
    if channel >= crate::opcodes::NUM_CHANNELS {
        return Err(error);
    }
    Ok(())
}
