//! Return frames pushed by far CALL and interrupt delivery.

use crate::error::Result;
use crate::mem::CpuBus;
use crate::state::ProcessorState;

/// Values pushed, in push order: `[flags], cs, eip, [error]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransferFrame {
    pub flags: Option<u32>,
    pub cs: u16,
    pub eip: u32,
    pub error: Option<u32>,
}

impl TransferFrame {
    pub fn call(cs: u16, eip: u32) -> Self {
        Self {
            flags: None,
            cs,
            eip,
            error: None,
        }
    }

    pub fn interrupt(flags: u32, cs: u16, eip: u32, error: Option<u32>) -> Self {
        Self {
            flags: Some(flags),
            cs,
            eip,
            error,
        }
    }
}

/// Push `frame` onto the current stack in 16- or 32-bit slots.
///
/// Stops at the first faulting write; ESP then reflects only the slots written.
pub(crate) fn push_transfer_frame<B: CpuBus + ?Sized>(
    state: &mut ProcessorState,
    bus: &mut B,
    use32: bool,
    frame: &TransferFrame,
) -> Result<()> {
    if let Some(flags) = frame.flags {
        state.push(bus, use32, flags)?;
    }
    state.push(bus, use32, frame.cs as u32)?;
    state.push(bus, use32, frame.eip)?;
    if let Some(error) = frame.error {
        state.push(bus, use32, error)?;
    }
    Ok(())
}
