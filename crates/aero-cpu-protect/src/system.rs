//! System instructions: task register, selector inspection, interrupt-flag and
//! I/O privilege checks, and the control/debug/test registers.

use tracing::{debug, warn};

use crate::cpu::ProtectCore;
use crate::descriptor::{selector, Descriptor, DescriptorKind};
use crate::error::{Fault, Result};
use crate::mem::Machine;
use crate::state::{
    with_supervisor_access, CR0_ET, CR0_PE, CR0_PG, FLAG_IF, FLAG_IOPL, FLAG_VM, FLAG_ZF,
    FMASK_ALL,
};
use crate::tss::tss32;

impl ProtectCore {
    /// STR.
    pub fn str(&self) -> u16 {
        self.tss.selector
    }

    /// LTR: load the task register and mark the TSS busy.
    pub fn ltr<M: Machine>(&mut self, m: &mut M, sel: u16) -> Result<()> {
        if selector::is_null(sel) {
            self.tss.set_selector(m, &mut self.state, sel)?;
            return Ok(());
        }
        let desc = if selector::is_ldt(sel) {
            None
        } else {
            self.state.descriptor(m, sel)?
        };
        let Some(desc) = desc else {
            warn!("LTR failed, selector={sel:#x}");
            return Err(Fault::gp(sel as u32));
        };
        if !matches!(desc.kind(), DescriptorKind::Tss { busy: false, .. }) {
            debug!("LTR failed, selector={sel:#x} (type={:#x})", desc.typ());
            return Err(Fault::gp(sel as u32));
        }
        if !desc.present() {
            warn!("LTR failed, selector={sel:#x} (not present)");
            return Err(Fault::np(sel as u32));
        }
        if !self.tss.set_selector(m, &mut self.state, sel)? {
            return Err(Fault::invariant(format!("LTR failed, selector={sel:#x}")));
        }
        self.tss.desc.set_busy(true);
        self.tss.save_descriptor(m, &mut self.state)?;
        debug!("TR set to {sel:#x}");
        Ok(())
    }

    /// Descriptor for LAR/LSL/VERR/VERW, or `None` for a null or out-of-range selector.
    fn inspect<M: Machine>(&mut self, m: &mut M, sel: u16) -> Result<Option<Descriptor>> {
        if selector::is_null(sel) {
            return Ok(None);
        }
        self.state.descriptor(m, sel)
    }

    /// `DPL >= CPL && DPL >= RPL`.
    fn visible(&self, desc: &Descriptor, sel: u16) -> bool {
        desc.dpl() >= self.state.cpl && desc.dpl() >= selector::rpl(sel)
    }

    fn report_zf<T>(&mut self, value: Option<T>) -> Option<T> {
        self.state.set_flag(FLAG_ZF, value.is_some());
        value
    }

    /// LAR: access rights (`raw[1] & 0x00ffff00`) when the descriptor is visible.
    pub fn lar<M: Machine>(&mut self, m: &mut M, sel: u16) -> Result<Option<u32>> {
        let rights = self.inspect(m, sel)?.and_then(|desc| {
            let ok = match desc.kind() {
                DescriptorKind::Code {
                    conforming: true, ..
                } => true,
                DescriptorKind::InterruptGate { .. }
                | DescriptorKind::TrapGate { .. }
                | DescriptorKind::Invalid => false,
                _ => self.visible(&desc, sel),
            };
            ok.then_some(desc.raw[1] & 0x00ff_ff00)
        });
        Ok(self.report_zf(rights))
    }

    /// LSL: byte-granular segment limit when the descriptor is visible.
    pub fn lsl<M: Machine>(&mut self, m: &mut M, sel: u16) -> Result<Option<u32>> {
        let limit = self.inspect(m, sel)?.and_then(|desc| {
            let ok = match desc.kind() {
                DescriptorKind::Code {
                    conforming: true, ..
                } => true,
                DescriptorKind::Code { .. }
                | DescriptorKind::Data { .. }
                | DescriptorKind::Ldt
                | DescriptorKind::Tss { .. } => self.visible(&desc, sel),
                _ => false,
            };
            ok.then_some(desc.limit())
        });
        Ok(self.report_zf(limit))
    }

    /// VERR: readable from the current privilege level.
    pub fn verr<M: Machine>(&mut self, m: &mut M, sel: u16) -> Result<bool> {
        let ok = self.inspect(m, sel)?.is_some_and(|desc| match desc.kind() {
            DescriptorKind::Code {
                readable: true,
                conforming: true,
            } => true,
            DescriptorKind::Code {
                readable: true,
                conforming: false,
            }
            | DescriptorKind::Data { .. } => self.visible(&desc, sel),
            _ => false,
        });
        self.state.set_flag(FLAG_ZF, ok);
        Ok(ok)
    }

    /// VERW: writable data visible from the current privilege level.
    pub fn verw<M: Machine>(&mut self, m: &mut M, sel: u16) -> Result<bool> {
        let ok = self
            .inspect(m, sel)?
            .is_some_and(|desc| desc.is_writable_data() && self.visible(&desc, sel));
        self.state.set_flag(FLAG_ZF, ok);
        Ok(ok)
    }

    /// ARPL: raise `dest`'s RPL to `src`'s. ZF reports whether it changed.
    pub fn arpl(&mut self, dest: u16, src: u16) -> u16 {
        if selector::rpl(dest) < selector::rpl(src) {
            self.state.set_flag(FLAG_ZF, true);
            (dest & 0xfffc) | (src & 3)
        } else {
            self.state.set_flag(FLAG_ZF, false);
            dest
        }
    }

    fn if_change_allowed(&self) -> bool {
        let s = &self.state;
        if !s.pmode {
            return true;
        }
        if s.v86() {
            s.iopl() >= 3
        } else {
            s.iopl() >= s.cpl
        }
    }

    pub fn cli(&mut self) -> Result<()> {
        if !self.if_change_allowed() {
            return Err(Fault::gp0());
        }
        self.state.set_flag(FLAG_IF, false);
        Ok(())
    }

    pub fn sti(&mut self) -> Result<()> {
        if !self.if_change_allowed() {
            return Err(Fault::gp0());
        }
        self.state.set_flag(FLAG_IF, true);
        Ok(())
    }

    fn v86_flags_trap(&self) -> bool {
        self.state.pmode && self.state.v86() && self.state.eflags & FLAG_IOPL != FLAG_IOPL
    }

    /// POPF: IOPL only changes at CPL 0, IF only when IOPL >= CPL.
    pub fn popf<M: Machine>(&mut self, m: &mut M, use32: bool) -> Result<()> {
        if self.v86_flags_trap() {
            return Err(Fault::gp0());
        }
        let mut mask = FMASK_ALL;
        if self.state.pmode && self.state.cpl > 0 {
            mask &= !FLAG_IOPL;
        }
        if self.state.pmode && !self.state.v86() && self.state.iopl() < self.state.cpl {
            mask &= !FLAG_IF;
        }
        if use32 {
            let word = self.state.pop32(m)?;
            self.state.set_flags(word, mask);
        } else {
            let word = self.state.pop16(m)?;
            self.state.set_flags(word as u32, mask & 0xffff);
        }
        Ok(())
    }

    pub fn pushf<M: Machine>(&mut self, m: &mut M, use32: bool) -> Result<()> {
        if self.v86_flags_trap() {
            return Err(Fault::gp0());
        }
        if use32 {
            self.state.push32(m, self.state.eflags & 0x00fc_ffff)
        } else {
            self.state.push16(m, self.state.eflags as u16)
        }
    }

    /// IN/OUT/INS/OUTS permission check against the TSS I/O bitmap.
    ///
    /// Only consulted in protected mode when IOPL < CPL or in virtual-8086 mode.
    pub fn io_permission<M: Machine>(&mut self, m: &mut M, port: u16, size: u8) -> Result<()> {
        let s = &self.state;
        if !(s.pmode && (s.iopl() < s.cpl || s.v86())) {
            return Ok(());
        }
        let (base, limit, is386) = (self.tss.base, self.tss.limit, self.tss.is386);
        let allowed = with_supervisor_access(m, &mut self.state, |bus, _| -> Result<bool> {
            if !is386 {
                return Ok(false);
            }
            let ofs = bus.read_u16(base.wrapping_add(tss32::IO_MAP_BASE))? as u32;
            if ofs > limit {
                return Ok(false);
            }
            let map = bus.read_u16(base.wrapping_add(ofs).wrapping_add(port as u32 / 8))?;
            let mask = (0xffffu32 >> (16 - size.min(16) as u32)) << (port & 7);
            Ok(map as u32 & mask == 0)
        })?;
        if !allowed {
            debug!("I/O exception port {port:#x}");
            return Err(Fault::gp0());
        }
        Ok(())
    }

    /// MOV CR0 without privilege checks.
    pub fn set_cr0<M: Machine>(&mut self, m: &mut M, value: u32) {
        let value = value | CR0_ET;
        if value == self.state.cr0 {
            return;
        }
        self.state.cr0 = value;
        if value & CR0_PE != 0 {
            self.state.pmode = true;
            debug!("protected mode");
            m.set_paging_enabled(value & CR0_PG != 0);
        } else {
            self.state.pmode = false;
            if value & CR0_PG != 0 {
                warn!("Paging requested without PE=1");
            }
            m.set_paging_enabled(false);
            debug!("real mode");
        }
    }

    pub fn set_cr2(&mut self, value: u32) {
        self.state.cr2 = value;
    }

    pub fn set_cr3<M: Machine>(&mut self, m: &mut M, value: u32) {
        self.state.cr3 = value;
        m.set_page_directory_base(value);
    }

    fn check_system_register_access(&self) -> Result<()> {
        if self.state.pmode && self.state.cpl > 0 {
            return Err(Fault::gp0());
        }
        Ok(())
    }

    /// MOV CRn, r32.
    pub fn write_crx<M: Machine>(&mut self, m: &mut M, n: u8, value: u32) -> Result<()> {
        self.check_system_register_access()?;
        match n {
            0 => self.set_cr0(m, value),
            2 => self.set_cr2(value),
            3 => self.set_cr3(m, value),
            4 => self.state.cr4 = value,
            _ => return Err(Fault::ud()),
        }
        Ok(())
    }

    /// MOV r32, CRn.
    pub fn read_crx(&self, n: u8) -> Result<u32> {
        self.check_system_register_access()?;
        match n {
            0 => Ok(self.state.cr0),
            2 => Ok(self.state.cr2),
            3 => Ok(self.state.cr3 & 0xffff_f000),
            4 => Ok(self.state.cr4),
            _ => Err(Fault::ud()),
        }
    }

    /// MOV DRn, r32. DR4 and DR5 alias DR6 and DR7.
    pub fn write_drx(&mut self, n: u8, value: u32) -> Result<()> {
        self.check_system_register_access()?;
        match n {
            0..=3 => self.state.drx[n as usize] = value,
            4 | 6 => self.state.drx[6] = (value | 0xffff_0ff0) & 0xffff_efff,
            5 | 7 => self.state.drx[7] = value | 0x400,
            _ => return Err(Fault::ud()),
        }
        Ok(())
    }

    pub fn read_drx(&self, n: u8) -> Result<u32> {
        self.check_system_register_access()?;
        match n {
            0..=3 | 6 | 7 => Ok(self.state.drx[n as usize]),
            4 => Ok(self.state.drx[6]),
            5 => Ok(self.state.drx[7]),
            _ => Err(Fault::ud()),
        }
    }

    /// MOV TRn, r32. Only TR6 and TR7 exist.
    pub fn write_trx(&mut self, n: u8, value: u32) -> Result<()> {
        self.check_system_register_access()?;
        match n {
            6 | 7 => {
                self.state.trx[n as usize] = value;
                Ok(())
            }
            _ => {
                warn!("unhandled MOV TR{n}, {value:#x}");
                Err(Fault::ud())
            }
        }
    }

    pub fn read_trx(&self, n: u8) -> Result<u32> {
        self.check_system_register_access()?;
        match n {
            6 | 7 => Ok(self.state.trx[n as usize]),
            _ => Err(Fault::ud()),
        }
    }

    pub fn smsw(&self) -> u32 {
        self.state.cr0
    }

    /// LMSW: loads MP/EM/TS and can set, but never clear, PE.
    pub fn lmsw<M: Machine>(&mut self, m: &mut M, word: u16) -> Result<()> {
        self.check_system_register_access()?;
        let mut value = word as u32 & 0xf;
        if self.state.cr0 & CR0_PE != 0 {
            value |= CR0_PE;
        }
        value |= self.state.cr0 & 0xffff_fff0;
        self.set_cr0(m, value);
        Ok(())
    }
}
