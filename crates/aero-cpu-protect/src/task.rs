//! Hardware task switching through a 32-bit TSS.

use tracing::debug;

use crate::cpu::ProtectCore;
use crate::descriptor::selector;
use crate::error::{Fault, Result};
use crate::mem::{CpuBus, Machine};
use crate::state::{
    with_supervisor_access, Gprs, ProcessorState, SegReg, FLAG_NT, FLAG_VM, FMASK_ALL,
};
use crate::tss::{tss32, TaskStateCache};

/// What caused a task switch. Decides the busy-bit and back-link bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSwitch {
    Jmp,
    CallInt,
    Iret,
}

/// Register image stored in a 32-bit TSS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TaskContext {
    cr3: u32,
    eip: u32,
    eflags: u32,
    regs: Gprs,
    /// ES, CS, SS, DS, FS, GS.
    segs: [u16; 6],
    ldt: u16,
}

const SEGMENT_SLOTS: [u32; 6] = [tss32::ES, tss32::CS, tss32::SS, tss32::DS, tss32::FS, tss32::GS];

impl TaskContext {
    fn read<B: CpuBus + ?Sized>(bus: &mut B, base: u32) -> Result<Self> {
        let mut ctx = TaskContext {
            cr3: bus.read_u32(base + tss32::CR3)?,
            eip: bus.read_u32(base + tss32::EIP)?,
            eflags: bus.read_u32(base + tss32::EFLAGS)?,
            regs: Gprs {
                eax: bus.read_u32(base + tss32::EAX)?,
                ecx: bus.read_u32(base + tss32::ECX)?,
                edx: bus.read_u32(base + tss32::EDX)?,
                ebx: bus.read_u32(base + tss32::EBX)?,
                esp: bus.read_u32(base + tss32::ESP)?,
                ebp: bus.read_u32(base + tss32::EBP)?,
                esi: bus.read_u32(base + tss32::ESI)?,
                edi: bus.read_u32(base + tss32::EDI)?,
            },
            segs: [0; 6],
            ldt: bus.read_u16(base + tss32::LDT)?,
        };
        for (slot, offset) in ctx.segs.iter_mut().zip(SEGMENT_SLOTS) {
            *slot = bus.read_u16(base + offset)?;
        }
        Ok(ctx)
    }

    /// Save the outgoing task. CR3 and the LDT selector are static fields and are
    /// not written.
    fn write<B: CpuBus + ?Sized>(&self, bus: &mut B, base: u32) -> Result<()> {
        bus.write_u32(base + tss32::EFLAGS, self.eflags)?;
        bus.write_u32(base + tss32::EIP, self.eip)?;
        bus.write_u32(base + tss32::EAX, self.regs.eax)?;
        bus.write_u32(base + tss32::ECX, self.regs.ecx)?;
        bus.write_u32(base + tss32::EDX, self.regs.edx)?;
        bus.write_u32(base + tss32::EBX, self.regs.ebx)?;
        bus.write_u32(base + tss32::ESP, self.regs.esp)?;
        bus.write_u32(base + tss32::EBP, self.regs.ebp)?;
        bus.write_u32(base + tss32::ESI, self.regs.esi)?;
        bus.write_u32(base + tss32::EDI, self.regs.edi)?;
        for (sel, offset) in self.segs.iter().zip(SEGMENT_SLOTS) {
            bus.write_u32(base + offset, *sel as u32)?;
        }
        Ok(())
    }

    fn capture(state: &ProcessorState, eip: u32, eflags: u32) -> Self {
        let mut segs = [0; 6];
        for seg in SegReg::ALL {
            segs[seg.index()] = state.selector(seg);
        }
        TaskContext {
            cr3: state.cr3,
            eip,
            eflags,
            regs: state.regs,
            segs,
            ldt: state.gdt.ldt_selector,
        }
    }
}

impl ProtectCore {
    /// Switch to the task whose TSS `new_sel` names.
    ///
    /// Reentrant page-fault recovery is suspended for the duration: a half-copied
    /// task context has no rollback point. Shapes the callers should have rejected
    /// (not a TSS, wrong busy state, 16-bit TSS, bad CS in the new task) are
    /// invariant violations.
    pub fn switch_task<M: Machine>(
        &mut self,
        m: &mut M,
        new_sel: u16,
        kind: TaskSwitch,
        old_eip: u32,
    ) -> Result<()> {
        let old_allow = self.state.reentrant_page_faults;
        self.state.reentrant_page_faults = false;
        let result = self.switch_task_unguarded(m, new_sel, kind, old_eip);
        self.state.reentrant_page_faults = old_allow;
        result
    }

    fn switch_task_unguarded<M: Machine>(
        &mut self,
        m: &mut M,
        new_sel: u16,
        kind: TaskSwitch,
        old_eip: u32,
    ) -> Result<()> {
        let mut new_tss = TaskStateCache::default();
        if !new_tss.set_selector(m, &mut self.state, new_sel)? || !new_tss.valid {
            return Err(Fault::invariant(format!(
                "illegal TSS for switch, selector={new_sel:#x}, switchtype={kind:?}"
            )));
        }
        match (kind, new_tss.desc.is_busy()) {
            (TaskSwitch::Iret, false) => {
                return Err(Fault::invariant("TSS not busy for IRET"));
            }
            (TaskSwitch::Jmp | TaskSwitch::CallInt, true) => {
                return Err(Fault::invariant("TSS busy for JMP/CALL/INT"));
            }
            _ => {}
        }
        if !new_tss.is386 {
            return Err(Fault::invariant("286 task switch"));
        }

        let new_base = new_tss.base;
        let mut incoming = with_supervisor_access(m, &mut self.state, |bus, _| {
            TaskContext::read(bus, new_base)
        })?;

        if self.tss.valid {
            if !self.tss.is386 {
                return Err(Fault::invariant("286 task switch"));
            }
            if matches!(kind, TaskSwitch::Jmp | TaskSwitch::Iret) {
                self.tss.desc.set_busy(false);
                self.tss.save_descriptor(m, &mut self.state)?;
            }
            let mut old_flags = self.state.eflags;
            if kind == TaskSwitch::Iret {
                old_flags &= !FLAG_NT;
            }
            let outgoing = TaskContext::capture(&self.state, old_eip, old_flags);
            let old_base = self.tss.base;
            with_supervisor_access(m, &mut self.state, |bus, _| outgoing.write(bus, old_base))?;
        }

        if kind == TaskSwitch::CallInt {
            let back_link = self.tss.selector as u32;
            with_supervisor_access(m, &mut self.state, |bus, _| -> Result<()> {
                bus.write_u32(new_base + tss32::BACK_LINK, back_link)?;
                Ok(())
            })?;
            incoming.eflags |= FLAG_NT;
        }
        if matches!(kind, TaskSwitch::Jmp | TaskSwitch::CallInt) {
            new_tss.desc.set_busy(true);
            new_tss.save_descriptor(m, &mut self.state)?;
        }

        if new_sel == self.tss.selector {
            // Same task: only the segment registers are reloaded.
            self.state.eip = old_eip;
            for seg in SegReg::ALL {
                incoming.segs[seg.index()] = self.state.selector(seg);
            }
        } else {
            if self.state.cr3 != incoming.cr3 {
                self.state.cr3 = incoming.cr3;
                m.set_page_directory_base(incoming.cr3);
            }
            self.state.eip = incoming.eip;
            self.state.set_flags(incoming.eflags, FMASK_ALL | FLAG_VM);
            self.state.regs = incoming.regs;
        }

        let new_cs = incoming.segs[SegReg::Cs.index()];
        if self.state.eflags & FLAG_VM != 0 {
            self.state.load_segment_real(SegReg::Cs, new_cs);
            self.state.code_big = false;
            self.set_cpl(m, 3);
        } else {
            if incoming.ldt != 0 {
                self.state.lldt(m, incoming.ldt)?;
            }
            self.set_cpl(m, selector::rpl(new_cs));
            self.load_task_code_segment(m, new_cs)?;
        }

        for seg in [SegReg::Es, SegReg::Ss, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            self.load_segment(m, seg, incoming.segs[seg.index()])?;
        }
        if !self.tss.set_selector(m, &mut self.state, new_sel)? {
            debug!("task switch: set TSS selector {new_sel:#x} failed");
        }
        debug!(
            "task switched to {new_sel:#x} ({kind:?}): CPL {} CS:{:#x} EIP {:#x}",
            self.state.cpl,
            self.state.selector(SegReg::Cs),
            self.state.eip
        );
        Ok(())
    }

    /// CS of the incoming task. CPL already equals the selector's RPL.
    fn load_task_code_segment<M: Machine>(&mut self, m: &mut M, new_cs: u16) -> Result<()> {
        let Some(desc) = self.state.descriptor(m, new_cs)? else {
            return Err(Fault::invariant("task switch with CS beyond limits"));
        };
        if !desc.present() {
            return Err(Fault::invariant("task switch with non present code segment"));
        }
        if !desc.is_code() {
            return Err(Fault::invariant(format!(
                "task switch CS type {:#x}",
                desc.typ()
            )));
        }
        let cpl = self.state.cpl;
        if desc.is_conforming_code() {
            if cpl < desc.dpl() {
                return Err(Fault::invariant("task CS RPL < DPL"));
            }
        } else if cpl != desc.dpl() {
            return Err(Fault::invariant("task CS RPL != DPL"));
        }
        self.state
            .commit_segment(SegReg::Cs, new_cs, &desc, self.config.enforce_segment_limits);
        Ok(())
    }
}
