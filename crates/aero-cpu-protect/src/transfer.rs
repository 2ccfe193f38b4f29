//! Far JMP, CALL and RET.

use tracing::trace;

use crate::cpu::ProtectCore;
use crate::descriptor::{selector, types, Descriptor, DescriptorKind};
use crate::error::{Fault, Result};
use crate::frame::{push_transfer_frame, TransferFrame};
use crate::mem::Machine;
use crate::state::SegReg;
use crate::task::TaskSwitch;

impl ProtectCore {
    /// Far JMP to `sel:offset`.
    pub fn jmp<M: Machine>(
        &mut self,
        m: &mut M,
        use32: bool,
        sel: u16,
        offset: u32,
        old_eip: u32,
    ) -> Result<()> {
        if self.state.real_style_segments() {
            self.state.eip = if use32 { offset } else { offset & 0xffff };
            self.state.load_segment_real(SegReg::Cs, sel);
            self.state.code_big = false;
            return Ok(());
        }

        let err = selector::error_code(sel);
        if selector::is_null(sel) {
            return Err(Fault::gp0());
        }
        let desc = self.state.descriptor(m, sel)?.ok_or(Fault::gp(err))?;
        let rpl = selector::rpl(sel);
        let cpl = self.state.cpl;

        match desc.kind() {
            DescriptorKind::Code { conforming, .. } => {
                if conforming {
                    if cpl < desc.dpl() {
                        return Err(Fault::gp(err));
                    }
                } else if rpl > cpl || cpl != desc.dpl() {
                    return Err(Fault::gp(err));
                }
                if !desc.present() {
                    return Err(Fault::np(err));
                }
                self.state.commit_segment(
                    SegReg::Cs,
                    (sel & 0xfffc) | cpl as u16,
                    &desc,
                    self.config.enforce_segment_limits,
                );
                self.state.eip = offset;
                trace!("JMP: code to {sel:#x}:{offset:#x} big {}", desc.big());
                Ok(())
            }
            DescriptorKind::Tss {
                is386: true,
                busy: false,
            } => {
                self.check_task_target(&desc, err, rpl)?;
                trace!("JMP: TSS to {sel:#x}");
                self.switch_task(m, sel, TaskSwitch::Jmp, old_eip)
            }
            DescriptorKind::TaskGate => {
                self.check_task_target(&desc, err, rpl)?;
                let target = self.task_gate_target(m, &desc)?;
                trace!("JMP: task gate {sel:#x} to TSS {target:#x}");
                self.switch_task(m, target, TaskSwitch::Jmp, old_eip)
            }
            _ => Err(Fault::invariant(format!(
                "JMP illegal descriptor type {:#x}",
                desc.typ()
            ))),
        }
    }

    /// Far CALL to `sel:offset`, through a call gate, TSS or task gate when `sel`
    /// names one.
    pub fn call<M: Machine>(
        &mut self,
        m: &mut M,
        use32: bool,
        sel: u16,
        offset: u32,
        old_eip: u32,
    ) -> Result<()> {
        if self.state.real_style_segments() {
            self.push_call_frame(m, use32, old_eip)?;
            self.state.eip = if use32 { offset } else { offset & 0xffff };
            self.state.code_big = false;
            self.state.load_segment_real(SegReg::Cs, sel);
            return Ok(());
        }

        let err = selector::error_code(sel);
        if selector::is_null(sel) {
            return Err(Fault::gp0());
        }
        let desc = self.state.descriptor(m, sel)?.ok_or(Fault::gp(err))?;
        let rpl = selector::rpl(sel);
        let cpl = self.state.cpl;

        match desc.kind() {
            DescriptorKind::Code { conforming, .. } => {
                if conforming {
                    if desc.dpl() > cpl {
                        return Err(Fault::gp(err));
                    }
                } else if rpl > cpl || desc.dpl() != cpl {
                    return Err(Fault::gp(err));
                }
                if !desc.present() {
                    return Err(Fault::np(err));
                }
                // Commit point.
                self.push_call_frame(m, use32, old_eip)?;
                self.state.eip = if use32 { offset } else { offset & 0xffff };
                self.state.commit_segment(
                    SegReg::Cs,
                    (sel & 0xfffc) | cpl as u16,
                    &desc,
                    self.config.enforce_segment_limits,
                );
                trace!("CALL: code to {sel:#x}:{offset:#x}");
                Ok(())
            }
            DescriptorKind::CallGate { is386 } => {
                if desc.dpl() < cpl || desc.dpl() < rpl {
                    return Err(Fault::gp(err));
                }
                if !desc.present() {
                    return Err(Fault::np(err));
                }
                self.call_through_gate(m, use32, &desc, is386, old_eip)
            }
            DescriptorKind::Tss {
                is386: true,
                busy: false,
            } => {
                self.check_task_target(&desc, err, rpl)?;
                trace!("CALL: TSS to {sel:#x}");
                self.switch_task(m, sel, TaskSwitch::CallInt, old_eip)
            }
            DescriptorKind::TaskGate => {
                self.check_task_target(&desc, err, rpl)?;
                let target = self.task_gate_target(m, &desc)?;
                trace!("CALL: task gate {sel:#x} to TSS {target:#x}");
                self.switch_task(m, target, TaskSwitch::CallInt, old_eip)
            }
            // Seen from installers and VBDOS.
            _ if matches!(desc.typ(), types::DATA_EU_RW_NA | types::INVALID) => {
                Err(Fault::gp(err))
            }
            _ => Err(Fault::invariant(format!(
                "CALL: descriptor type {:#x} unsupported",
                desc.typ()
            ))),
        }
    }

    /// Far RET, releasing `bytes` of caller parameters.
    pub fn ret<M: Machine>(
        &mut self,
        m: &mut M,
        use32: bool,
        bytes: u16,
        _old_eip: u32,
    ) -> Result<()> {
        let orig_esp = self.state.regs.esp;
        if self.state.real_style_segments() {
            let (new_ip, new_cs) = match self.pop_far_pointer(m, use32) {
                Ok(ptr) => ptr,
                Err(fault) => {
                    self.state.regs.esp = orig_esp;
                    return Err(fault);
                }
            };
            self.state.regs.esp = self.state.stack_offset(self.state.regs.esp, bytes as i32);
            self.state.load_segment_real(SegReg::Cs, new_cs);
            self.state.eip = new_ip;
            self.state.code_big = false;
            return Ok(());
        }

        let sel = if use32 {
            let at = self.state.stack_offset(orig_esp, 4);
            self.state.peek32(m, at)? as u16
        } else {
            let at = self.state.stack_offset(orig_esp, 2);
            self.state.peek16(m, at)?
        };
        let err = selector::error_code(sel);
        let rpl = selector::rpl(sel);
        let cpl = self.state.cpl;
        if rpl < cpl {
            return Err(Fault::gp(err));
        }
        if selector::is_null(sel) {
            return Err(Fault::gp0());
        }
        let desc = self.state.descriptor(m, sel)?.ok_or(Fault::gp(err))?;
        if !desc.is_code() {
            return Err(Fault::invariant(format!(
                "RET from illegal descriptor type {:#x}",
                desc.typ()
            )));
        }

        if rpl == cpl {
            if desc.is_conforming_code() {
                if desc.dpl() > cpl {
                    return Err(Fault::gp(err));
                }
            } else if desc.dpl() != cpl {
                return Err(Fault::gp(err));
            }
            if !desc.present() {
                return Err(Fault::np(err));
            }

            // Commit point.
            let (offset, sel) = match self.pop_far_pointer(m, use32) {
                Ok(ptr) => ptr,
                Err(fault) => {
                    self.state.regs.esp = orig_esp;
                    return Err(fault);
                }
            };
            self.state
                .commit_segment(SegReg::Cs, sel, &desc, self.config.enforce_segment_limits);
            self.state.eip = offset;
            self.state.regs.esp = self.state.stack_offset(self.state.regs.esp, bytes as i32);
            trace!("RET: same level to {sel:#x}:{offset:#x}");
            return Ok(());
        }

        if desc.is_conforming_code() {
            if desc.dpl() > rpl {
                return Err(Fault::gp(err));
            }
        } else if desc.dpl() != rpl {
            return Err(Fault::gp(err));
        }
        if !desc.present() {
            return Err(Fault::np(err));
        }

        // Faults up to the SS commit undo the pops.
        if let Err(fault) = self.ret_outer(m, use32, bytes, &desc, rpl) {
            self.state.regs.esp = orig_esp;
            return Err(fault);
        }
        // The outer frame is installed; a fault here is taken at the new level.
        self.check_segments(m)
    }

    fn ret_outer<M: Machine>(
        &mut self,
        m: &mut M,
        use32: bool,
        bytes: u16,
        cs_desc: &Descriptor,
        rpl: u8,
    ) -> Result<()> {
        let (offset, sel) = self.pop_far_pointer(m, use32)?;
        self.state.regs.esp = self.state.stack_offset(self.state.regs.esp, bytes as i32);
        let (n_esp, n_ss) = self.pop_far_pointer(m, use32)?;

        let ss_err = selector::error_code(n_ss);
        if selector::is_null(n_ss) {
            return Err(Fault::gp0());
        }
        let ss_desc = self.state.descriptor(m, n_ss)?.ok_or(Fault::gp(ss_err))?;
        if selector::rpl(n_ss) != rpl || ss_desc.dpl() != rpl {
            return Err(Fault::gp(ss_err));
        }
        if !ss_desc.is_writable_data() {
            return Err(Fault::invariant("RET: SS selector type no writable data segment"));
        }
        if !ss_desc.present() {
            return Err(Fault::ss(ss_err));
        }

        let enforce = self.config.enforce_segment_limits;
        self.set_cpl(m, rpl);
        self.state
            .commit_segment(SegReg::Cs, (sel & 0xfffc) | rpl as u16, cs_desc, enforce);
        self.state.eip = offset;
        self.state
            .commit_stack(n_ss, &ss_desc, n_esp.wrapping_add(bytes as u32), enforce);
        trace!("RET: outer level to {sel:#x}:{offset:#x} SS:{n_ss:#x}");
        Ok(())
    }

    fn call_through_gate<M: Machine>(
        &mut self,
        m: &mut M,
        use32: bool,
        gate: &Descriptor,
        gate32: bool,
        old_eip: u32,
    ) -> Result<()> {
        let cpl = self.state.cpl;
        let n_cs_sel = gate.gate_selector();
        let cs_err = selector::error_code(n_cs_sel);
        if selector::is_null(n_cs_sel) {
            return Err(Fault::gp0());
        }
        let cs_desc = self.state.descriptor(m, n_cs_sel)?.ok_or(Fault::gp(cs_err))?;
        let cs_dpl = cs_desc.dpl();
        if cs_dpl > cpl {
            return Err(Fault::gp(cs_err));
        }
        if !cs_desc.present() {
            return Err(Fault::np(cs_err));
        }
        if !cs_desc.is_code() {
            return Err(Fault::invariant("CALL: gate CS is not an executable segment"));
        }
        let n_eip = if use32 {
            gate.gate_offset()
        } else {
            gate.gate_offset() & 0xffff
        };
        let enforce = self.config.enforce_segment_limits;

        if cs_desc.is_conforming_code() || cs_dpl == cpl {
            // Commit point.
            let frame = TransferFrame::call(self.state.selector(SegReg::Cs), old_eip);
            let old_esp = self.state.regs.esp;
            if let Err(fault) = push_transfer_frame(&mut self.state, m, gate32, &frame) {
                self.state.regs.esp = old_esp;
                return Err(fault);
            }
            self.state
                .commit_segment(SegReg::Cs, (n_cs_sel & 0xfffc) | cpl as u16, &cs_desc, enforce);
            self.state.eip = n_eip;
            trace!("CALL: gate to {n_cs_sel:#x}:{n_eip:#x} at same level");
            return Ok(());
        }

        let (n_ss, n_esp) = self.tss.stack_for_level(m, &mut self.state, cs_dpl)?;
        let ss_err = selector::error_code(n_ss);
        if selector::is_null(n_ss) {
            return Err(Fault::ts(0));
        }
        let ss_desc = self.state.descriptor(m, n_ss)?.ok_or(Fault::ts(ss_err))?;
        if selector::rpl(n_ss) != cs_dpl || ss_desc.dpl() != cs_dpl {
            return Err(Fault::ts(ss_err));
        }
        if !ss_desc.is_writable_data() {
            return Err(Fault::invariant("CALL: gate SS is not a writable data segment"));
        }
        if !ss_desc.present() {
            return Err(Fault::ss(ss_err));
        }

        // Read the parameters before anything changes so that a page fault on the
        // caller's stack leaves no trace.
        let o_ss = self.state.selector(SegReg::Ss);
        let o_esp = self.state.regs.esp;
        let o_stack = self.state.seg(SegReg::Ss).base.wrapping_add(o_esp & self.state.stack.mask);
        let width = if gate32 { 4 } else { 2 };
        let mut params = Vec::with_capacity(gate.param_count() as usize);
        for i in (0..gate.param_count() as u32).rev() {
            let at = o_stack.wrapping_add(i * width);
            let word = if gate32 {
                m.read_u32(at)?
            } else {
                m.read_u16(at)? as u32
            };
            params.push(word);
        }

        let old_allow = self.state.reentrant_page_faults;
        self.state.reentrant_page_faults = false;

        // Commit point.
        self.state.commit_stack(n_ss, &ss_desc, n_esp, enforce);
        self.set_cpl(m, cs_dpl);
        let old_cs = self.state.selector(SegReg::Cs);
        self.state.commit_segment(
            SegReg::Cs,
            (n_cs_sel & 0xfffc) | cs_dpl as u16,
            &cs_desc,
            enforce,
        );
        self.state.eip = n_eip;

        let pushed = self.push_inner_call_frame(m, gate32, o_ss, o_esp, &params, old_cs, old_eip);
        self.state.reentrant_page_faults = old_allow;
        pushed?;
        trace!(
            "CALL: gate to inner level {n_cs_sel:#x}:{n_eip:#x} SS:{n_ss:#x} ESP {n_esp:#x}, {} params",
            params.len()
        );
        Ok(())
    }

    /// Caller SS:ESP, the copied parameters, then CS:EIP, on the new stack.
    #[allow(clippy::too_many_arguments)]
    fn push_inner_call_frame<M: Machine>(
        &mut self,
        m: &mut M,
        gate32: bool,
        old_ss: u16,
        old_esp: u32,
        params: &[u32],
        old_cs: u16,
        old_eip: u32,
    ) -> Result<()> {
        self.state.push(m, gate32, old_ss as u32)?;
        self.state.push(m, gate32, old_esp)?;
        for word in params {
            self.state.push(m, gate32, *word)?;
        }
        push_transfer_frame(&mut self.state, m, gate32, &TransferFrame::call(old_cs, old_eip))
    }

    /// Push CS and the return EIP, restoring ESP if a write faults.
    fn push_call_frame<M: Machine>(&mut self, m: &mut M, use32: bool, old_eip: u32) -> Result<()> {
        let frame = TransferFrame::call(self.state.selector(SegReg::Cs), old_eip);
        let old_esp = self.state.regs.esp;
        let pushed = push_transfer_frame(&mut self.state, m, use32, &frame);
        if pushed.is_err() {
            self.state.regs.esp = old_esp;
        }
        pushed
    }

    /// Pop `offset` then `selector` slots.
    fn pop_far_pointer<M: Machine>(&mut self, m: &mut M, use32: bool) -> Result<(u32, u16)> {
        let offset = self.state.pop(m, use32)?;
        let sel = self.state.pop(m, use32)? as u16;
        Ok((offset, sel))
    }

    /// Privilege and presence checks shared by TSS and task-gate targets.
    fn check_task_target(&self, desc: &Descriptor, err: u32, rpl: u8) -> Result<()> {
        if desc.dpl() < self.state.cpl || desc.dpl() < rpl {
            return Err(Fault::gp(err));
        }
        if !desc.present() {
            return Err(Fault::np(err));
        }
        Ok(())
    }

    /// The TSS a task gate names. It must be an available TSS in the GDT.
    fn task_gate_target<M: Machine>(&mut self, m: &mut M, gate: &Descriptor) -> Result<u16> {
        let target = gate.gate_selector();
        let err = selector::error_code(target);
        if selector::is_ldt(target) || selector::is_null(target) {
            return Err(Fault::gp(err));
        }
        let tss = self.state.descriptor(m, target)?.ok_or(Fault::gp(err))?;
        match tss.kind() {
            DescriptorKind::Tss { busy: false, .. } => {
                if !tss.present() {
                    return Err(Fault::np(err));
                }
                Ok(target)
            }
            _ => Err(Fault::gp(err)),
        }
    }
}
