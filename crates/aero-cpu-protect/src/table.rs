//! GDT/LDT/IDT lookups.

use tracing::debug;

use crate::descriptor::{selector, Descriptor, DescriptorKind};
use crate::error::{Fault, Result};
use crate::mem::CpuBus;
use crate::state::{with_supervisor_access, ProcessorState};

/// Base + limit table (IDT, and the GDT proper).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptDescriptorTable {
    pub base: u32,
    pub limit: u32,
}

impl InterruptDescriptorTable {
    /// Read the gate at byte offset `index & !7`. `None` when past the limit.
    pub fn get_descriptor<B: CpuBus + ?Sized>(
        &self,
        bus: &mut B,
        index: u32,
    ) -> Result<Option<Descriptor>> {
        let offset = index & !7;
        if offset > self.limit {
            return Ok(None);
        }
        read_entry(bus, self.base.wrapping_add(offset)).map(Some)
    }
}

/// The GDT together with the cached LDT it currently points at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalDescriptorTable {
    pub base: u32,
    pub limit: u32,
    pub ldt_base: u32,
    pub ldt_limit: u32,
    pub ldt_selector: u16,
}

impl GlobalDescriptorTable {
    fn locate(&self, sel: u16) -> Option<u32> {
        let offset = (sel & !7) as u32;
        let (base, limit) = if selector::is_ldt(sel) {
            (self.ldt_base, self.ldt_limit)
        } else {
            (self.base, self.limit)
        };
        if offset > limit {
            return None;
        }
        Some(base.wrapping_add(offset))
    }

    /// Read the descriptor `sel` names, from the LDT when TI is set. `None` when the
    /// selector lies past the table limit.
    pub fn get_descriptor<B: CpuBus + ?Sized>(
        &self,
        bus: &mut B,
        sel: u16,
    ) -> Result<Option<Descriptor>> {
        match self.locate(sel) {
            Some(addr) => read_entry(bus, addr).map(Some),
            None => Ok(None),
        }
    }

    /// Write `desc` back into the slot `sel` names. Returns `false` when out of bounds.
    pub fn set_descriptor<B: CpuBus + ?Sized>(
        &self,
        bus: &mut B,
        sel: u16,
        desc: &Descriptor,
    ) -> Result<bool> {
        let Some(addr) = self.locate(sel) else {
            return Ok(false);
        };
        bus.write_u32(addr, desc.raw[0])?;
        bus.write_u32(addr.wrapping_add(4), desc.raw[1])?;
        Ok(true)
    }

    pub fn clear_ldt(&mut self) {
        self.ldt_base = 0;
        self.ldt_limit = 0;
        self.ldt_selector = 0;
    }
}

fn read_entry<B: CpuBus + ?Sized>(bus: &mut B, addr: u32) -> Result<Descriptor> {
    let lo = bus.read_u32(addr)?;
    let hi = bus.read_u32(addr.wrapping_add(4))?;
    Ok(Descriptor::from_raw(lo, hi))
}

impl ProcessorState {
    /// GDT/LDT lookup performed as a supervisor access.
    pub fn descriptor<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        sel: u16,
    ) -> Result<Option<Descriptor>> {
        let gdt = self.gdt;
        with_supervisor_access(bus, self, |bus, _| gdt.get_descriptor(bus, sel))
    }

    /// GDT/LDT write-back performed as a supervisor access.
    pub fn store_descriptor<B: CpuBus + ?Sized>(
        &mut self,
        bus: &mut B,
        sel: u16,
        desc: &Descriptor,
    ) -> Result<bool> {
        let gdt = self.gdt;
        with_supervisor_access(bus, self, |bus, _| gdt.set_descriptor(bus, sel, desc))
    }

    /// IDT lookup for vector `num`, performed as a supervisor access.
    pub fn idt_gate<B: CpuBus + ?Sized>(&mut self, bus: &mut B, num: u8) -> Result<Option<Descriptor>> {
        let idt = self.idt;
        with_supervisor_access(bus, self, |bus, _| {
            idt.get_descriptor(bus, (num as u32) << 3)
        })
    }

    pub fn lgdt(&mut self, limit: u32, base: u32) {
        debug!(base = format_args!("{base:#x}"), limit = format_args!("{limit:#x}"), "GDT set");
        self.gdt.limit = limit;
        self.gdt.base = base;
    }

    pub fn lidt(&mut self, limit: u32, base: u32) {
        debug!(base = format_args!("{base:#x}"), limit = format_args!("{limit:#x}"), "IDT set");
        self.idt.limit = limit;
        self.idt.base = base;
    }

    /// `(limit, base)` of the GDT.
    pub fn sgdt(&self) -> (u32, u32) {
        (self.gdt.limit, self.gdt.base)
    }

    /// `(limit, base)` of the IDT.
    pub fn sidt(&self) -> (u32, u32) {
        (self.idt.limit, self.idt.base)
    }

    pub fn sldt(&self) -> u16 {
        self.gdt.ldt_selector
    }

    /// Load the LDT cache from the GDT entry `sel` names.
    pub fn lldt<B: CpuBus + ?Sized>(&mut self, bus: &mut B, sel: u16) -> Result<()> {
        if selector::is_null(sel) {
            self.gdt.clear_ldt();
            return Ok(());
        }
        let Some(desc) = self.descriptor(bus, sel)? else {
            tracing::warn!("LLDT failed, selector={sel:#x}");
            return Err(Fault::gp(sel as u32));
        };
        if desc.kind() != DescriptorKind::Ldt {
            tracing::warn!("LLDT failed, selector={sel:#x} (type={:#x})", desc.typ());
            return Err(Fault::gp(sel as u32));
        }
        if !desc.present() {
            return Err(Fault::np(sel as u32));
        }
        self.gdt.ldt_base = desc.base();
        self.gdt.ldt_limit = desc.limit();
        self.gdt.ldt_selector = sel;
        debug!("LDT set to {sel:#x}");
        Ok(())
    }
}
