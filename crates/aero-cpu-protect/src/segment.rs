//! Segment register loads (MOV/POP Sreg, LDS & co) and lazy invalidation after a
//! privilege drop.

use crate::cpu::ProtectCore;
use crate::descriptor::{selector, Descriptor};
use crate::error::{Fault, Result};
use crate::mem::Machine;
use crate::state::{SegReg, FLAG_VM};

impl ProtectCore {
    /// Validate and load `sel` into `seg`. No state changes on failure.
    pub fn load_segment<M: Machine>(&mut self, m: &mut M, seg: SegReg, sel: u16) -> Result<()> {
        if self.state.real_style_segments() {
            self.state.load_segment_real(seg, sel);
            if seg == SegReg::Ss {
                self.state.stack = crate::state::StackState::SMALL;
            }
            if self.state.eflags & FLAG_VM != 0 {
                self.state.seg_mut(seg).limit = 0xffff;
            }
            return Ok(());
        }

        if seg == SegReg::Ss {
            let desc = self.validate_stack_segment(m, sel)?;
            self.state
                .commit_segment(SegReg::Ss, sel, &desc, self.config.enforce_segment_limits);
            return Ok(());
        }

        if selector::is_null(sel) {
            // Loading a null selector is legal; the first access through it faults.
            let cache = self.state.seg_mut(seg);
            cache.val = sel;
            cache.base = 0;
            return Ok(());
        }

        let desc = self
            .state
            .descriptor(m, sel)?
            .ok_or(Fault::gp(selector::error_code(sel)))?;
        let rpl = selector::rpl(sel);
        let readable_code = desc.is_code() && desc.typ() & 2 != 0;
        if desc.is_data() || (readable_code && !desc.is_conforming_code()) {
            if rpl > desc.dpl() || self.state.cpl > desc.dpl() {
                return Err(Fault::gp(selector::error_code(sel)));
            }
        } else if !readable_code {
            return Err(Fault::gp(selector::error_code(sel)));
        }
        if !desc.present() {
            return Err(Fault::np(selector::error_code(sel)));
        }
        self.state
            .commit_segment(seg, sel, &desc, self.config.enforce_segment_limits);
        Ok(())
    }

    /// Checks for a protected-mode SS load at the current CPL.
    fn validate_stack_segment<M: Machine>(&mut self, m: &mut M, sel: u16) -> Result<Descriptor> {
        if selector::is_null(sel) {
            return Err(Fault::gp0());
        }
        let err = selector::error_code(sel);
        let desc = self.state.descriptor(m, sel)?.ok_or(Fault::gp(err))?;
        let cpl = self.state.cpl;
        if selector::rpl(sel) != cpl || desc.dpl() != cpl {
            return Err(Fault::gp(err));
        }
        if !desc.is_writable_data() {
            return Err(Fault::gp(err));
        }
        if !desc.present() {
            return Err(Fault::ss(err));
        }
        Ok(desc)
    }

    /// POP Sreg: load from the stack top, then release the slot.
    pub fn pop_segment<M: Machine>(&mut self, m: &mut M, seg: SegReg, use32: bool) -> Result<()> {
        let sel = self.state.peek16(m, self.state.regs.esp)?;
        self.load_segment(m, seg, sel)?;
        let delta = if use32 { 4 } else { 2 };
        self.state.regs.esp = self.state.stack_offset(self.state.regs.esp, delta);
        Ok(())
    }

    /// After CPL rises, null out any of ES/DS/FS/GS this privilege level may no
    /// longer use: data or non-conforming code with DPL < CPL, or selectors that no
    /// longer resolve.
    pub fn check_segments<M: Machine>(&mut self, m: &mut M) -> Result<()> {
        for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            let sel = self.state.selector(seg);
            let invalidate = match self.state.descriptor(m, sel)? {
                None => true,
                Some(desc) => desc.is_privilege_checked() && self.state.cpl > desc.dpl(),
            };
            if invalidate {
                self.load_segment(m, seg, 0)?;
            }
        }
        Ok(())
    }
}
