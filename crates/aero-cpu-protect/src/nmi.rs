//! Non-maskable interrupt latch.

use crate::cpu::ProtectCore;
use crate::error::{Fault, Result};
use crate::exceptions::Vector;
use crate::interrupt::InterruptKind;
use crate::mem::Machine;

/// `active` masks further NMIs until the next IRET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmiLatch {
    pub gate: bool,
    pub active: bool,
    pub pending: bool,
}

impl NmiLatch {
    pub const fn new(gate: bool) -> Self {
        Self {
            gate,
            active: false,
            pending: false,
        }
    }

    pub fn reset(&mut self) {
        self.active = false;
        self.pending = false;
    }

    /// Whether an NMI should be taken at the next instruction boundary.
    #[inline]
    pub fn deliverable(&self) -> bool {
        self.gate && !self.active && self.pending
    }
}

impl Default for NmiLatch {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ProtectCore {
    /// Latch an NMI edge. Returns `true` when the dispatcher must end the current
    /// cycle slice (budget forced to 1) and call [`ProtectCore::nmi_interrupt`].
    pub fn raise_nmi(&mut self) -> bool {
        self.nmi.pending = true;
        self.check_nmi()
    }

    pub fn check_nmi(&self) -> bool {
        self.nmi.deliverable()
    }

    /// Deliver INT 2.
    pub fn nmi_interrupt<M: Machine>(&mut self, m: &mut M) -> Result<()> {
        if self.nmi.active {
            return Err(Fault::invariant(
                "NMI delivery requested while an NMI is already active",
            ));
        }
        self.nmi.active = true;
        self.nmi.pending = false;
        let eip = self.state.eip;
        self.interrupt(
            m,
            Vector::NonMaskableInterrupt.number(),
            InterruptKind::empty(),
            eip,
        )
    }
}
