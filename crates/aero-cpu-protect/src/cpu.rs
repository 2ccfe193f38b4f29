use crate::config::ProtectConfig;
use crate::error::{Fault, Result};
use crate::escalation::ExceptionEscalator;
use crate::exceptions::Vector;
use crate::mem::{Machine, PagingControl};
use crate::nmi::NmiLatch;
use crate::state::ProcessorState;
use crate::tss::TaskStateCache;

/// The protection engine: processor state plus the bookkeeping that is not part of
/// the architectural register file (TSS cache, fault nesting, NMI latch).
///
/// Single-threaded. All entry points take the machine collaborators by `&mut` and
/// must not be called concurrently from several threads.
#[derive(Debug, Clone)]
pub struct ProtectCore {
    pub state: ProcessorState,
    pub tss: TaskStateCache,
    pub escalator: ExceptionEscalator,
    pub nmi: NmiLatch,
    pub config: ProtectConfig,
}

impl Default for ProtectCore {
    fn default() -> Self {
        Self::new(ProtectConfig::default())
    }
}

impl ProtectCore {
    pub fn new(config: ProtectConfig) -> Self {
        Self {
            state: ProcessorState::default(),
            tss: TaskStateCache::default(),
            escalator: ExceptionEscalator::default(),
            nmi: NmiLatch::new(config.nmi_gate),
            config,
        }
    }

    /// RESET#: architectural state, TSS cache, fault nesting and the NMI latch.
    pub fn reset(&mut self) {
        self.state.reset();
        self.tss = TaskStateCache::default();
        self.escalator.reset();
        self.nmi.reset();
    }

    #[inline]
    pub fn cpl(&self) -> u8 {
        self.state.cpl
    }

    #[inline]
    pub fn current_tss_selector(&self) -> u16 {
        self.tss.selector
    }

    #[inline]
    pub(crate) fn set_cpl<P: PagingControl + ?Sized>(&mut self, paging: &mut P, cpl: u8) {
        self.state.set_cpl(paging, cpl);
    }

    /// Hand a failed transfer back to the exception machinery.
    ///
    /// Guest faults are delivered through [`ProtectCore::exception`] (page faults
    /// update CR2 first); triple faults and invariant violations are returned as-is.
    pub fn dispatch_fault<M: Machine>(&mut self, m: &mut M, fault: Fault) -> Result<()> {
        self.dispatch_fault_nested(m, fault, 0)
    }

    pub(crate) fn dispatch_fault_nested<M: Machine>(
        &mut self,
        m: &mut M,
        fault: Fault,
        depth: u32,
    ) -> Result<()> {
        match fault {
            Fault::Exception { vector, error_code } => {
                self.exception_nested(m, vector.number(), error_code, depth)
            }
            Fault::PageFault { linear, error_code } => {
                self.state.cr2 = linear;
                self.exception_nested(m, Vector::PageFault.number(), error_code, depth)
            }
            other => Err(other),
        }
    }

    /// Run a transfer and, if it faulted, deliver the fault to the guest.
    pub fn execute<M: Machine>(
        &mut self,
        m: &mut M,
        op: impl FnOnce(&mut Self, &mut M) -> Result<()>,
    ) -> Result<()> {
        match op(self, m) {
            Ok(()) => Ok(()),
            Err(fault) => self.dispatch_fault(m, fault),
        }
    }
}
