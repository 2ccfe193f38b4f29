//! Cache of the currently loaded task state segment.

use crate::descriptor::{selector, Descriptor, DescriptorKind};
use crate::error::Result;
use crate::mem::CpuBus;
use crate::state::{with_supervisor_access, ProcessorState};

/// Byte offsets inside a 32-bit TSS.
pub mod tss32 {
    pub const BACK_LINK: u32 = 0x00;
    pub const ESP0: u32 = 0x04;
    pub const SS0: u32 = 0x08;
    pub const CR3: u32 = 0x1c;
    pub const EIP: u32 = 0x20;
    pub const EFLAGS: u32 = 0x24;
    pub const EAX: u32 = 0x28;
    pub const ECX: u32 = 0x2c;
    pub const EDX: u32 = 0x30;
    pub const EBX: u32 = 0x34;
    pub const ESP: u32 = 0x38;
    pub const EBP: u32 = 0x3c;
    pub const ESI: u32 = 0x40;
    pub const EDI: u32 = 0x44;
    pub const ES: u32 = 0x48;
    pub const CS: u32 = 0x4c;
    pub const SS: u32 = 0x50;
    pub const DS: u32 = 0x54;
    pub const FS: u32 = 0x58;
    pub const GS: u32 = 0x5c;
    pub const LDT: u32 = 0x60;
    pub const IO_MAP_BASE: u32 = 0x66;

    /// Stride between the ESPn/SSn pairs.
    pub const STACK_STRIDE: u32 = 8;
}

/// Byte offsets inside a 16-bit TSS.
pub mod tss16 {
    pub const BACK_LINK: u32 = 0x00;
    pub const SP0: u32 = 0x02;
    pub const SS0: u32 = 0x04;
    pub const STACK_STRIDE: u32 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStateCache {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub is386: bool,
    pub valid: bool,
    /// Descriptor as last read; written back when the busy bit changes.
    pub desc: Descriptor,
}

impl Default for TaskStateCache {
    fn default() -> Self {
        Self {
            selector: 0,
            base: 0,
            limit: 0,
            is386: true,
            valid: false,
            desc: Descriptor::default(),
        }
    }
}

impl TaskStateCache {
    /// Point the cache at `sel`. A null selector empties the cache and succeeds.
    ///
    /// Returns `false` (leaving `valid == false`) when `sel` is in the LDT, outside
    /// the GDT, not a TSS, or not present.
    pub fn set_selector<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        state: &mut ProcessorState,
        sel: u16,
    ) -> Result<bool> {
        self.valid = false;
        if selector::is_null(sel) {
            self.selector = 0;
            self.base = 0;
            self.limit = 0;
            self.is386 = true;
            return Ok(true);
        }
        if selector::is_ldt(sel) {
            return Ok(false);
        }
        let Some(desc) = state.descriptor(bus, sel)? else {
            return Ok(false);
        };
        if !matches!(desc.kind(), DescriptorKind::Tss { .. }) || !desc.present() {
            return Ok(false);
        }
        self.desc = desc;
        self.selector = sel;
        self.valid = true;
        self.base = desc.base();
        self.limit = desc.limit();
        self.is386 = desc.is386();
        Ok(true)
    }

    /// Write the cached descriptor (busy bit included) back to the GDT.
    pub fn save_descriptor<B: CpuBus + ?Sized>(
        &self,
        bus: &mut B,
        state: &mut ProcessorState,
    ) -> Result<()> {
        state.store_descriptor(bus, self.selector, &self.desc)?;
        Ok(())
    }

    pub fn back_link<B: CpuBus + ?Sized>(
        &self,
        bus: &mut B,
        state: &mut ProcessorState,
    ) -> Result<u16> {
        let base = self.base;
        with_supervisor_access(bus, state, |bus, _| Ok(bus.read_u16(base)?))
    }

    /// `(ss, esp)` for privilege level `level`.
    pub fn stack_for_level<B: CpuBus + ?Sized>(
        &self,
        bus: &mut B,
        state: &mut ProcessorState,
        level: u8,
    ) -> Result<(u16, u32)> {
        let (base, is386) = (self.base, self.is386);
        let level = level as u32;
        with_supervisor_access(bus, state, |bus, _| {
            if is386 {
                let at = base + tss32::ESP0 + level * tss32::STACK_STRIDE;
                let esp = bus.read_u32(at)?;
                let ss = bus.read_u16(at + 4)?;
                Ok((ss, esp))
            } else {
                let at = base + tss16::SP0 + level * tss16::STACK_STRIDE;
                let sp = bus.read_u16(at)?;
                let ss = bus.read_u16(at + 2)?;
                Ok((ss, sp as u32))
            }
        })
    }
}
