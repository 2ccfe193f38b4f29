//! INT n, hardware interrupts and exception delivery.

use bitflags::bitflags;
use tracing::{trace, warn};

use crate::cpu::ProtectCore;
use crate::descriptor::{selector, Descriptor, DescriptorKind};
use crate::error::{Fault, Result};
use crate::frame::{push_transfer_frame, TransferFrame};
use crate::mem::{CpuBus, Machine};
use crate::state::{SegReg, FLAG_IF, FLAG_IOPL, FLAG_NT, FLAG_TF, FLAG_VM};
use crate::task::TaskSwitch;

bitflags! {
    /// How an interrupt was raised.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct InterruptKind: u8 {
        /// INT n / INT3 / INTO.
        const SOFTWARE = 1 << 0;
        /// Raised by [`ProtectCore::exception`].
        const EXCEPTION = 1 << 1;
        /// Push `state.exception.error` after the return frame.
        const HAS_ERROR = 1 << 2;
        /// Skip the V86 IOPL check for software interrupts (used by the BIOS/DOS glue).
        const NO_IOPL_CHECK = 1 << 3;
    }
}

impl InterruptKind {
    /// EXT bit of error codes: set unless the program itself asked for the interrupt.
    #[inline]
    pub fn ext(self) -> u32 {
        if self.contains(InterruptKind::SOFTWARE) {
            0
        } else {
            1
        }
    }
}

/// Validated inner-level stack for a privilege-raising gate.
struct InnerStack {
    ss: u16,
    desc: Descriptor,
    esp: u32,
}

impl ProtectCore {
    /// Deliver interrupt `num`. `old_eip` is the return address pushed in the frame.
    ///
    /// Every privilege, type and presence check happens before the first stack
    /// write. A fault during the frame pushes restores SS, ESP and CPL before it
    /// is returned (unless reentrant page faults are suspended).
    pub fn interrupt<M: Machine>(
        &mut self,
        m: &mut M,
        num: u8,
        kind: InterruptKind,
        old_eip: u32,
    ) -> Result<()> {
        if kind.intersects(InterruptKind::SOFTWARE | InterruptKind::EXCEPTION) {
            m.before_interrupt(num, kind);
        }
        if !self.state.pmode {
            return self.interrupt_real(m, num, old_eip);
        }

        let ext = kind.ext();
        let vector_error = (num as u32) * 8 + 2;
        if self.state.v86()
            && kind.contains(InterruptKind::SOFTWARE)
            && !kind.contains(InterruptKind::NO_IOPL_CHECK)
            && self.state.eflags & FLAG_IOPL != FLAG_IOPL
        {
            return Err(Fault::gp0());
        }

        let gate = self
            .state
            .idt_gate(m, num)?
            .ok_or(Fault::gp(vector_error + ext))?;
        if kind.contains(InterruptKind::SOFTWARE) && gate.dpl() < self.state.cpl {
            return Err(Fault::gp(vector_error));
        }

        match gate.kind() {
            DescriptorKind::InterruptGate { is386 } | DescriptorKind::TrapGate { is386 } => {
                if !gate.present() {
                    return Err(Fault::np(vector_error + ext));
                }
                self.interrupt_through_gate(m, &gate, is386, kind, old_eip)
            }
            DescriptorKind::TaskGate => {
                if !gate.present() {
                    return Err(Fault::np(vector_error + ext));
                }
                self.switch_task(m, gate.gate_selector(), TaskSwitch::CallInt, old_eip)?;
                if kind.contains(InterruptKind::HAS_ERROR) {
                    let error = self.state.exception.error;
                    self.state.push(m, self.tss.is386, error)?;
                }
                Ok(())
            }
            _ => Err(Fault::invariant(format!(
                "illegal descriptor type {:#x} for int {num:#x}",
                gate.typ()
            ))),
        }
    }

    fn interrupt_real<B: CpuBus + ?Sized>(&mut self, bus: &mut B, num: u8, old_eip: u32) -> Result<()> {
        let entry = self.state.idt.base.wrapping_add((num as u32) << 2);
        let new_ip = bus.read_u16(entry)?;
        let new_cs = bus.read_u16(entry.wrapping_add(2))?;

        let old_esp = self.state.regs.esp;
        let frame = TransferFrame::interrupt(
            self.state.eflags,
            self.state.selector(SegReg::Cs),
            old_eip,
            None,
        );
        if let Err(fault) = push_transfer_frame(&mut self.state, bus, false, &frame) {
            self.state.regs.esp = old_esp;
            return Err(fault);
        }
        self.state.set_flag(FLAG_IF, false);
        self.state.set_flag(FLAG_TF, false);
        self.state.eip = new_ip as u32;
        self.state.load_segment_real(SegReg::Cs, new_cs);
        self.state.code_big = false;
        Ok(())
    }

    fn interrupt_through_gate<M: Machine>(
        &mut self,
        m: &mut M,
        gate: &Descriptor,
        gate32: bool,
        kind: InterruptKind,
        old_eip: u32,
    ) -> Result<()> {
        let ext = kind.ext();
        let cpl = self.state.cpl;
        let v86 = self.state.v86();
        let gate_sel = gate.gate_selector();
        let cs_err = selector::error_code(gate_sel);
        if selector::is_null(gate_sel) {
            return Err(Fault::gp(ext));
        }
        let cs_desc = self
            .state
            .descriptor(m, gate_sel)?
            .ok_or(Fault::gp(cs_err + ext))?;
        let cs_dpl = cs_desc.dpl();
        if cs_dpl > cpl {
            return Err(Fault::gp(cs_err + ext));
        }
        if !cs_desc.is_code() {
            return Err(Fault::invariant(format!(
                "INT: gate selector {gate_sel:#x} points to illegal descriptor type {:#x}",
                cs_desc.typ()
            )));
        }
        if !cs_desc.present() {
            return Err(Fault::np(cs_err + ext));
        }

        let inner = !cs_desc.is_conforming_code() && cs_dpl < cpl;
        let new_stack = if inner {
            if v86 && cs_dpl != 0 {
                return Err(Fault::gp(cs_err));
            }
            Some(self.inner_interrupt_stack(m, cs_dpl, ext)?)
        } else {
            if v86 && cs_dpl < cpl {
                return Err(Fault::invariant("V86 interrupt doesn't change to pl0"));
            }
            None
        };
        if inner && v86 && !gate32 {
            return Err(Fault::invariant("V86 to 16-bit gate"));
        }

        // Commit point.
        let saved_segs = self.state.segs;
        let saved_stack = self.state.stack;
        let saved_esp = self.state.regs.esp;
        let saved_cpl = self.state.cpl;
        if let Err(fault) = self.push_interrupt_frames(m, new_stack, cs_dpl, gate32, kind, old_eip) {
            if self.state.reentrant_page_faults {
                warn!("interrupt delivery interrupted by {fault}");
                self.state.segs = saved_segs;
                self.state.stack = saved_stack;
                self.state.regs.esp = saved_esp;
                self.set_cpl(m, saved_cpl);
            }
            return Err(fault);
        }

        let cpl = self.state.cpl;
        self.state.commit_segment(
            SegReg::Cs,
            (gate_sel & 0xfffc) | cpl as u16,
            &cs_desc,
            self.config.enforce_segment_limits,
        );
        self.state.eip = gate.gate_offset();
        if !matches!(gate.kind(), DescriptorKind::TrapGate { .. }) {
            self.state.set_flag(FLAG_IF, false);
        }
        self.state.set_flag(FLAG_TF, false);
        self.state.set_flag(FLAG_NT, false);
        self.state.set_flag(FLAG_VM, false);
        trace!(
            "INT: gate to {gate_sel:#x}:{:#x} big {} {}",
            gate.gate_offset(),
            cs_desc.big(),
            if gate32 { "386" } else { "286" }
        );
        Ok(())
    }

    fn inner_interrupt_stack<M: Machine>(&mut self, m: &mut M, level: u8, ext: u32) -> Result<InnerStack> {
        let (ss, esp) = self.tss.stack_for_level(m, &mut self.state, level)?;
        if selector::is_null(ss) {
            return Err(Fault::ts(ext));
        }
        let ss_err = selector::error_code(ss);
        let desc = self.state.descriptor(m, ss)?.ok_or(Fault::ts(ss_err + ext))?;
        if selector::rpl(ss) != level || desc.dpl() != level {
            return Err(Fault::ts(ss_err + ext));
        }
        if !desc.is_writable_data() {
            return Err(Fault::invariant("INT: inner level stack segment not writable"));
        }
        if !desc.present() {
            return Err(Fault::ss(ss_err + ext));
        }
        Ok(InnerStack { ss, desc, esp })
    }

    fn push_interrupt_frames<M: Machine>(
        &mut self,
        m: &mut M,
        new_stack: Option<InnerStack>,
        cs_dpl: u8,
        gate32: bool,
        kind: InterruptKind,
        old_eip: u32,
    ) -> Result<()> {
        if let Some(stack) = new_stack {
            let old_ss = self.state.selector(SegReg::Ss);
            let old_esp = self.state.regs.esp;
            self.state
                .commit_stack(stack.ss, &stack.desc, stack.esp, self.config.enforce_segment_limits);
            self.set_cpl(m, cs_dpl);
            if gate32 {
                if self.state.v86() {
                    for seg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
                        let sel = self.state.selector(seg);
                        self.state.push32(m, sel as u32)?;
                        self.state.load_segment_real(seg, 0);
                    }
                }
                self.state.push32(m, old_ss as u32)?;
                self.state.push32(m, old_esp)?;
            } else {
                self.state.push16(m, old_ss)?;
                self.state.push16(m, old_esp as u16)?;
            }
        }

        let error = kind
            .contains(InterruptKind::HAS_ERROR)
            .then_some(self.state.exception.error);
        let frame = TransferFrame::interrupt(
            self.state.eflags,
            self.state.selector(SegReg::Cs),
            old_eip,
            error,
        );
        push_transfer_frame(&mut self.state, m, gate32, &frame)
    }
}
