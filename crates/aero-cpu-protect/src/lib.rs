//! x86 segment protection and control-transfer engine.
//!
//! [`ProtectCore`] owns the processor's protection state and implements segment
//! loads, far JMP/CALL/RET, interrupt and exception delivery, IRET, hardware task
//! switches and the system instructions that inspect or change protection state.
//! Memory, paging and reset wiring are supplied by the host through [`Machine`].
//!
//! Every operation validates before it commits: a guest-visible fault raised by a
//! check leaves the architectural state untouched.
#![forbid(unsafe_code)]

mod config;
mod cpu;
mod descriptor;
mod error;
mod escalation;
mod exceptions;
mod frame;
mod interrupt;
mod iret;
mod mem;
mod nmi;
mod segment;
mod state;
mod system;
mod table;
mod task;
mod transfer;
mod tss;

/// In-memory machine for tests: a flat bus that records paging and reset calls.
///
/// Only built for this crate's own tests or with the `test-utils` feature; it is not
/// part of the engine API.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use crate::config::ProtectConfig;
pub use crate::cpu::ProtectCore;
pub use crate::descriptor::{selector, types, Descriptor, DescriptorKind};
pub use crate::error::{BusFault, Fault, Result};
pub use crate::escalation::{ExceptionEscalator, VECTOR_COUNT};
pub use crate::exceptions::Vector;
pub use crate::interrupt::InterruptKind;
pub use crate::mem::{CpuBus, Machine, PagingControl, SystemControl};
pub use crate::nmi::NmiLatch;
pub use crate::state::{
    Gprs, PendingException, ProcessorState, SegReg, SegmentCache, StackState, CR0_EM, CR0_ET,
    CR0_MP, CR0_PE, CR0_PG, CR0_TS, FLAG_AC, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_ID, FLAG_IF,
    FLAG_IOPL, FLAG_NT, FLAG_OF, FLAG_PF, FLAG_RESERVED1, FLAG_SF, FLAG_TF, FLAG_VM, FLAG_ZF,
    FMASK_ALL, FMASK_NORMAL, FMASK_TEST,
};
pub use crate::table::{GlobalDescriptorTable, InterruptDescriptorTable};
pub use crate::task::TaskSwitch;
pub use crate::tss::{tss16, tss32, TaskStateCache};

#[cfg(any(test, feature = "test-utils"))]
pub use crate::test_utils::{FlatTestBus, PagingEvent};
