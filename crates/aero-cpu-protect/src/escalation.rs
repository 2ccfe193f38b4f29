//! Exception nesting: double and triple fault escalation.

use tracing::warn;

use crate::cpu::ProtectCore;
use crate::error::{Fault, Result};
use crate::exceptions::Vector;
use crate::interrupt::InterruptKind;
use crate::mem::Machine;
use crate::state::PendingException;

pub const VECTOR_COUNT: usize = 32;

/// Per-vector nesting counters and the stack of vectors whose handlers have not
/// yet returned with IRET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionEscalator {
    levels: [u32; VECTOR_COUNT],
    in_progress: Vec<u8>,
    reported_double_fault: bool,
    reported_triple_fault: bool,
}

impl Default for ExceptionEscalator {
    fn default() -> Self {
        Self {
            levels: [0; VECTOR_COUNT],
            in_progress: Vec::new(),
            reported_double_fault: false,
            reported_triple_fault: false,
        }
    }
}

impl ExceptionEscalator {
    /// Clear all nesting state. One-shot report flags survive.
    pub fn reset(&mut self) {
        self.levels = [0; VECTOR_COUNT];
        self.in_progress.clear();
    }

    #[inline]
    pub fn level(&self, vector: u8) -> u32 {
        self.levels[(vector as usize) % VECTOR_COUNT]
    }

    pub fn levels(&self) -> &[u32; VECTOR_COUNT] {
        &self.levels
    }

    pub fn in_progress(&self) -> &[u8] {
        &self.in_progress
    }

    /// Rebuild from persisted state.
    pub fn restore(&mut self, levels: [u32; VECTOR_COUNT], in_progress: Vec<u8>) {
        self.levels = levels;
        self.in_progress = in_progress;
    }

    pub(crate) fn enter(&mut self, vector: u8) {
        self.levels[vector as usize] += 1;
        self.in_progress.push(vector);
    }

    /// Undo [`Self::enter`] right after dispatch. PF and GP do this so that
    /// demand-paged guests can take recursive page faults.
    pub(crate) fn leave_after_dispatch(&mut self, vector: u8) {
        let level = &mut self.levels[vector as usize];
        if *level > 0 {
            *level -= 1;
        }
        if let Some(&top) = self.in_progress.last() {
            if top == vector {
                self.in_progress.pop();
            } else {
                warn!(vector, top, "top of fault stack is not the exception being handled");
            }
        }
    }

    /// IRET ends the innermost handler.
    pub(crate) fn leave_on_iret(&mut self) {
        if let Some(which) = self.in_progress.pop() {
            let level = &mut self.levels[which as usize % VECTOR_COUNT];
            if *level > 0 {
                *level -= 1;
            }
        }
    }
}

impl ProtectCore {
    /// Raise exception `which` with `error` and dispatch it through the IDT/IVT.
    ///
    /// A vector that is already being delivered escalates to #DF; a fault while #DF
    /// is being delivered is a triple fault.
    pub fn exception<M: Machine>(&mut self, m: &mut M, which: u8, error: u32) -> Result<()> {
        self.exception_nested(m, which, error, 0)
    }

    pub(crate) fn exception_nested<M: Machine>(
        &mut self,
        m: &mut M,
        mut which: u8,
        mut error: u32,
        depth: u32,
    ) -> Result<()> {
        if which as usize >= VECTOR_COUNT {
            return Err(Fault::invariant(format!(
                "exception vector {which:#x} out of range"
            )));
        }
        if depth >= self.config.max_exception_depth {
            return self.triple_fault(m);
        }

        let df = Vector::DoubleFault.number();
        if self.escalator.level(which) != 0 {
            if self.escalator.level(df) != 0 && self.config.triple_fault_reset {
                return self.triple_fault(m);
            }
            if self.config.always_report_double_fault || !self.escalator.reported_double_fault {
                warn!("exception {which} already in progress, triggering double fault instead");
                self.escalator.reported_double_fault = true;
            }
            which = df;
            error = 0;
        }

        // #DE does not take part in escalation.
        let counted = self.config.double_fault_enable && which != Vector::DivideError.number();
        if counted {
            self.escalator.enter(which);
        }

        self.state.exception = PendingException { which, error };
        let mut kind = InterruptKind::EXCEPTION;
        if which >= 8 {
            kind |= InterruptKind::HAS_ERROR;
        }
        let eip = self.state.eip;
        let result = match self.interrupt(m, which, kind, eip) {
            Ok(()) => Ok(()),
            Err(fault) => self.dispatch_fault_nested(m, fault, depth + 1),
        };

        if counted
            && (which == Vector::PageFault.number() || which == Vector::GeneralProtection.number())
        {
            self.escalator.leave_after_dispatch(which);
        }
        result
    }

    fn triple_fault<M: Machine>(&mut self, m: &mut M) -> Result<()> {
        if self.config.always_report_triple_fault || !self.escalator.reported_triple_fault {
            warn!("double fault already in progress: triple fault, resetting CPU");
            self.escalator.reported_triple_fault = true;
        }
        if self.config.triple_fault_reset {
            m.reset_processor();
            self.reset();
        }
        Err(Fault::TripleFault)
    }
}
