//! IRET in real, virtual-8086 and protected mode.

use tracing::{trace, warn};

use crate::cpu::ProtectCore;
use crate::descriptor::selector;
use crate::error::{Fault, Result};
use crate::mem::Machine;
use crate::state::{
    SegReg, FLAG_IF, FLAG_IOPL, FLAG_NT, FLAG_VM, FMASK_ALL, FMASK_NORMAL,
};
use crate::task::TaskSwitch;

/// EIP, CS and EFLAGS as read from the stack, before any validation.
struct IretFrame {
    eip: u32,
    cs: u16,
    flags: u32,
    /// ESP just past the three slots.
    next_esp: u32,
}

impl ProtectCore {
    /// Return from an interrupt handler.
    ///
    /// IRET always ends an NMI and retires the innermost in-progress exception,
    /// whatever its outcome.
    pub fn iret<M: Machine>(&mut self, m: &mut M, use32: bool, old_eip: u32) -> Result<()> {
        self.nmi.active = false;
        self.escalator.leave_on_iret();

        if !self.state.pmode {
            return self.iret_real(m, use32);
        }
        if self.state.v86() {
            if self.state.eflags & FLAG_IOPL != FLAG_IOPL {
                return Err(Fault::gp0());
            }
            return self.iret_v86(m, use32);
        }
        if self.state.flag(FLAG_NT) {
            return self.iret_task(m, old_eip);
        }
        self.iret_protected(m, use32)
    }

    fn read_iret_frame<M: Machine>(&mut self, m: &mut M, use32: bool) -> Result<IretFrame> {
        let width = if use32 { 4 } else { 2 };
        let esp = self.state.regs.esp;
        let cs_at = self.state.stack_offset(esp, width);
        let flags_at = self.state.stack_offset(cs_at, width);
        let next_esp = self.state.stack_offset(flags_at, width);
        if use32 {
            Ok(IretFrame {
                eip: self.state.peek32(m, esp)?,
                cs: self.state.peek32(m, cs_at)? as u16,
                flags: self.state.peek32(m, flags_at)?,
                next_esp,
            })
        } else {
            Ok(IretFrame {
                eip: self.state.peek16(m, esp)? as u32,
                cs: self.state.peek16(m, cs_at)?,
                flags: self.state.peek16(m, flags_at)? as u32,
                next_esp,
            })
        }
    }

    fn iret_real<M: Machine>(&mut self, m: &mut M, use32: bool) -> Result<()> {
        let frame = self.read_iret_frame(m, use32)?;
        self.state.regs.esp = frame.next_esp;
        self.state.eip = frame.eip;
        self.state.load_segment_real(SegReg::Cs, frame.cs);
        let mask = if use32 { FMASK_ALL } else { FMASK_ALL & 0xffff };
        self.state.set_flags(frame.flags, mask);
        self.state.code_big = false;
        Ok(())
    }

    fn iret_v86<M: Machine>(&mut self, m: &mut M, use32: bool) -> Result<()> {
        let frame = self.read_iret_frame(m, use32)?;
        self.state.regs.esp = frame.next_esp;
        self.state.eip = frame.eip;
        self.state.load_segment_real(SegReg::Cs, frame.cs);
        // IOPL cannot be changed from virtual-8086 mode.
        self.state.set_flags(frame.flags, FMASK_NORMAL | FLAG_NT);
        self.state.code_big = false;
        Ok(())
    }

    fn iret_task<M: Machine>(&mut self, m: &mut M, old_eip: u32) -> Result<()> {
        if !self.tss.valid {
            return Err(Fault::ts(selector::error_code(self.tss.selector)));
        }
        if !self.tss.desc.is_busy() {
            warn!("task IRET: TSS not busy");
        }
        let back_link = self.tss.back_link(m, &mut self.state)?;
        self.switch_task(m, back_link, TaskSwitch::Iret, old_eip)
    }

    fn iret_protected<M: Machine>(&mut self, m: &mut M, use32: bool) -> Result<()> {
        let mut frame = self.read_iret_frame(m, use32)?;
        if use32 {
            if frame.flags & FLAG_VM != 0 {
                if self.state.cpl == 0 {
                    return self.iret_to_v86(m, frame);
                }
                return Err(Fault::invariant("IRET from pmode to v86 with CPL!=0"));
            }
        } else {
            frame.flags |= self.state.eflags & 0xffff_0000;
            if frame.flags & FLAG_VM != 0 {
                return Err(Fault::invariant("VM flag in 16-bit IRET"));
            }
        }

        let n_cs = frame.cs;
        let cs_err = selector::error_code(n_cs);
        if selector::is_null(n_cs) {
            return Err(Fault::gp0());
        }
        let cs_desc = self.state.descriptor(m, n_cs)?.ok_or(Fault::gp(cs_err))?;
        let rpl = selector::rpl(n_cs);
        let cpl = self.state.cpl;
        if rpl < cpl {
            return Err(Fault::gp(cs_err));
        }
        if !cs_desc.is_code() {
            return Err(Fault::invariant(format!(
                "IRET: illegal descriptor type {:#x}",
                cs_desc.typ()
            )));
        }
        if cs_desc.is_conforming_code() {
            if cs_desc.dpl() > rpl {
                return Err(Fault::gp(cs_err));
            }
        } else if cs_desc.dpl() != rpl {
            return Err(Fault::gp(cs_err));
        }
        if !cs_desc.present() {
            return Err(Fault::np(cs_err));
        }

        let mut mask = if cpl != 0 { FMASK_NORMAL | FLAG_NT } else { FMASK_ALL };
        if self.state.iopl() < cpl {
            mask &= !FLAG_IF;
        }
        let enforce = self.config.enforce_segment_limits;

        if rpl == cpl {
            // Commit point.
            self.state.regs.esp = frame.next_esp;
            self.state.commit_segment(SegReg::Cs, n_cs, &cs_desc, enforce);
            self.state.eip = frame.eip;
            self.state.set_flags(frame.flags, mask);
            trace!("IRET: same level {n_cs:#x}:{:#x} big {}", frame.eip, self.state.code_big);
            return Ok(());
        }

        let (n_esp, n_ss) = if use32 {
            let ss_at = self.state.stack_offset(frame.next_esp, 4);
            (
                self.state.peek32(m, frame.next_esp)?,
                self.state.peek32(m, ss_at)? as u16,
            )
        } else {
            let ss_at = self.state.stack_offset(frame.next_esp, 2);
            (
                self.state.peek16(m, frame.next_esp)? as u32,
                self.state.peek16(m, ss_at)?,
            )
        };
        let ss_err = selector::error_code(n_ss);
        if selector::is_null(n_ss) {
            return Err(Fault::gp0());
        }
        if selector::rpl(n_ss) != rpl {
            return Err(Fault::gp(ss_err));
        }
        let ss_desc = self.state.descriptor(m, n_ss)?.ok_or(Fault::gp(ss_err))?;
        if ss_desc.dpl() != rpl {
            return Err(Fault::gp(ss_err));
        }
        if !ss_desc.is_writable_data() {
            return Err(Fault::invariant("IRET: outer level stack segment not writable"));
        }
        if !ss_desc.present() {
            return Err(Fault::np(ss_err));
        }

        // Commit point.
        self.state.commit_segment(SegReg::Cs, n_cs, &cs_desc, enforce);
        self.state.set_flags(frame.flags, mask);
        self.set_cpl(m, rpl);
        self.state.eip = frame.eip;
        self.state.commit_stack(n_ss, &ss_desc, n_esp, enforce);
        self.check_segments(m)?;
        trace!("IRET: outer level {n_cs:#x}:{:#x} big {}", frame.eip, self.state.code_big);
        Ok(())
    }

    /// 32-bit IRET at CPL 0 with VM set in the popped flags: the frame continues
    /// with ESP, SS, ES, DS, FS and GS.
    fn iret_to_v86<M: Machine>(&mut self, m: &mut M, frame: IretFrame) -> Result<()> {
        let orig_esp = self.state.regs.esp;
        self.state.regs.esp = frame.next_esp;
        let mut words = [0u32; 6];
        for word in words.iter_mut() {
            match self.state.pop32(m) {
                Ok(v) => *word = v,
                Err(fault) => {
                    self.state.regs.esp = orig_esp;
                    return Err(fault);
                }
            }
        }
        let [n_esp, n_ss, n_es, n_ds, n_fs, n_gs] = words;

        self.state.eip = frame.eip & 0xffff;
        self.state.set_flags(frame.flags, FMASK_ALL | FLAG_VM);
        self.set_cpl(m, 3);
        for (seg, sel) in [
            (SegReg::Ss, n_ss),
            (SegReg::Es, n_es),
            (SegReg::Ds, n_ds),
            (SegReg::Fs, n_fs),
            (SegReg::Gs, n_gs),
        ] {
            self.load_segment(m, seg, sel as u16)?;
        }
        self.state.regs.esp = n_esp;
        self.state.code_big = false;
        self.state.load_segment_real(SegReg::Cs, frame.cs);
        trace!(
            "IRET: back to V86 CS:{:#x} IP {:#x} SS:{:#x} SP {:#x}",
            frame.cs,
            self.state.eip,
            n_ss as u16,
            n_esp
        );
        Ok(())
    }
}
