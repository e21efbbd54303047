//! Serial-bus arbiter.
//!
//! A single shared serial bus reaches every synthesizer/DAC device; the
//! arbiter hands out exclusive single-owner grants to a small closed set
//! of requesters. Arbitration is fixed-priority in declaration order
//! (initialization first, bias last) and never preempts an in-flight
//! grant; a higher-priority request waits for release. Starvation is an
//! accepted trade-off for this small cooperative set.

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Bus requesters in priority order, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Requester {
    Init = 0,
    Frequency = 1,
    Power = 2,
    Phase = 3,
    Pattern = 4,
    Bias = 5,
}

impl Requester {
    pub const COUNT: usize = 6;

    const PRIORITY_ORDER: [Requester; Self::COUNT] = [
        Requester::Init,
        Requester::Frequency,
        Requester::Power,
        Requester::Phase,
        Requester::Pattern,
        Requester::Bias,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ArbiterStats {
    pub grants: u32,
    pub queued_requests: u32,
}

/// Exclusive grant bookkeeping for the shared bus.
#[derive(Debug, Default)]
pub struct BusArbiter {
    owner: Option<Requester>,
    pending: [bool; Requester::COUNT],
    stats: ArbiterStats,
}

impl BusArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the bus. Returns `true` when the grant is immediate; a
    /// denied request stays queued until [`release`](Self::release) makes
    /// the bus available.
    pub fn request(&mut self, requester: Requester) -> bool {
        debug_assert!(
            self.owner != Some(requester),
            "{requester:?} requested the bus while owning it"
        );
        if self.owner.is_none() {
            self.owner = Some(requester);
            self.stats.grants += 1;
            trace!(?requester, "bus granted");
            return true;
        }
        if !self.pending[requester.index()] {
            self.pending[requester.index()] = true;
            self.stats.queued_requests += 1;
            trace!(?requester, owner = ?self.owner, "bus busy, request queued");
        }
        false
    }

    /// Release the bus and grant the highest-priority pending requester,
    /// if any. Returns the new owner.
    pub fn release(&mut self, requester: Requester) -> Option<Requester> {
        debug_assert_eq!(
            self.owner,
            Some(requester),
            "release from a non-owning requester"
        );
        self.owner = None;
        for next in Requester::PRIORITY_ORDER {
            if self.pending[next.index()] {
                self.pending[next.index()] = false;
                self.owner = Some(next);
                self.stats.grants += 1;
                trace!(?next, "bus handed to pending requester");
                break;
            }
        }
        self.owner
    }

    pub fn owner(&self) -> Option<Requester> {
        self.owner
    }

    pub fn owns(&self, requester: Requester) -> bool {
        self.owner == Some(requester)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.iter().any(|&p| p)
    }

    pub fn stats(&self) -> ArbiterStats {
        self.stats
    }

    /// Drop the grant and all queued requests. Only RESET does this.
    pub fn clear(&mut self) {
        self.owner = None;
        self.pending = [false; Requester::COUNT];
    }
}
