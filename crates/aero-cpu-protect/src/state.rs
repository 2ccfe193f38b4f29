//! Architecturally visible processor state touched by the protection engine.

use crate::descriptor::Descriptor;
use crate::error::Result;
use crate::mem::{CpuBus, PagingControl};
use crate::table::{GlobalDescriptorTable, InterruptDescriptorTable};

pub const FLAG_CF: u32 = 1 << 0;
pub const FLAG_RESERVED1: u32 = 1 << 1;
pub const FLAG_PF: u32 = 1 << 2;
pub const FLAG_AF: u32 = 1 << 4;
pub const FLAG_ZF: u32 = 1 << 6;
pub const FLAG_SF: u32 = 1 << 7;
pub const FLAG_TF: u32 = 1 << 8;
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_DF: u32 = 1 << 10;
pub const FLAG_OF: u32 = 1 << 11;
pub const FLAG_IOPL: u32 = 3 << 12;
pub const FLAG_NT: u32 = 1 << 14;
pub const FLAG_VM: u32 = 1 << 17;
pub const FLAG_AC: u32 = 1 << 18;
pub const FLAG_ID: u32 = 1 << 21;

/// Arithmetic status flags.
pub const FMASK_TEST: u32 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;
/// Flags any privilege level may change.
pub const FMASK_NORMAL: u32 = FMASK_TEST | FLAG_DF | FLAG_TF | FLAG_IF;
/// Everything except VM. AC and ID are writable on the 486/Pentium class modelled here.
pub const FMASK_ALL: u32 = FMASK_NORMAL | FLAG_IOPL | FLAG_NT | FLAG_AC | FLAG_ID;

pub const CR0_PE: u32 = 1 << 0;
pub const CR0_MP: u32 = 1 << 1;
pub const CR0_EM: u32 = 1 << 2;
pub const CR0_TS: u32 = 1 << 3;
pub const CR0_ET: u32 = 1 << 4;
pub const CR0_PG: u32 = 1 << 31;

/// Segment register names, in TSS/encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Hidden part of a segment register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentCache {
    pub val: u16,
    pub base: u32,
    pub limit: u32,
    pub expand_down: bool,
}

impl Default for SegmentCache {
    fn default() -> Self {
        Self {
            val: 0,
            base: 0,
            limit: 0xffff,
            expand_down: false,
        }
    }
}

/// Stack addressing width derived from SS.B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackState {
    pub mask: u32,
    pub notmask: u32,
    pub big: bool,
}

impl StackState {
    pub const SMALL: Self = Self {
        mask: 0xffff,
        notmask: 0xffff_0000,
        big: false,
    };
    pub const BIG: Self = Self {
        mask: 0xffff_ffff,
        notmask: 0,
        big: true,
    };

    #[inline]
    pub const fn for_big(big: bool) -> Self {
        if big {
            Self::BIG
        } else {
            Self::SMALL
        }
    }
}

impl Default for StackState {
    fn default() -> Self {
        Self::SMALL
    }
}

/// Exception currently being raised: vector and error code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingException {
    pub which: u8,
    pub error: u32,
}

/// General-purpose registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gprs {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorState {
    pub regs: Gprs,
    pub eip: u32,
    pub eflags: u32,
    pub segs: [SegmentCache; 6],

    pub cpl: u8,
    /// Memory privilege level: `0` while the engine itself reads system structures.
    pub mpl: u8,
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub pmode: bool,

    pub gdt: GlobalDescriptorTable,
    pub idt: InterruptDescriptorTable,

    pub stack: StackState,
    /// CS.D: default operand size of the running code segment.
    pub code_big: bool,

    pub exception: PendingException,
    /// String-op direction: `1` or `-1`, kept in sync with EFLAGS.DF.
    pub direction: i32,

    pub drx: [u32; 8],
    pub trx: [u32; 8],

    /// Whether page faults may surface as [`crate::Fault::PageFault`] with rollback.
    /// Cleared for the duration of task switches and call-gate frame copies.
    pub reentrant_page_faults: bool,
}

impl Default for ProcessorState {
    fn default() -> Self {
        let mut state = Self {
            regs: Gprs::default(),
            eip: 0,
            eflags: FLAG_RESERVED1,
            segs: [SegmentCache::default(); 6],
            cpl: 0,
            mpl: 3,
            cr0: CR0_ET,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            pmode: false,
            gdt: GlobalDescriptorTable::default(),
            idt: InterruptDescriptorTable::default(),
            stack: StackState::SMALL,
            code_big: false,
            exception: PendingException::default(),
            direction: 1,
            drx: [0; 8],
            trx: [0; 8],
            reentrant_page_faults: true,
        };
        state.reset();
        state
    }
}

impl ProcessorState {
    /// Power-on / RESET# state.
    pub fn reset(&mut self) {
        self.regs = Gprs::default();
        self.eflags = FLAG_RESERVED1;
        self.direction = 1;
        self.segs = [SegmentCache::default(); 6];
        self.segs[SegReg::Cs.index()] = SegmentCache {
            val: 0xf000,
            base: 0xf_0000,
            limit: 0xffff,
            expand_down: false,
        };
        self.eip = 0xfff0;
        self.cpl = 0;
        self.mpl = 3;
        self.cr0 = CR0_ET;
        self.cr2 = 0;
        self.cr3 = 0;
        self.cr4 = 0;
        self.pmode = false;
        self.gdt = GlobalDescriptorTable::default();
        self.idt = InterruptDescriptorTable {
            base: 0,
            limit: 0x3ff,
        };
        self.stack = StackState::SMALL;
        self.code_big = false;
        self.exception = PendingException::default();
        self.drx = [0; 8];
        self.drx[6] = 0xffff_0ff0;
        self.drx[7] = 0x400;
        self.trx = [0; 8];
        self.reentrant_page_faults = true;
    }

    #[inline]
    pub fn seg(&self, seg: SegReg) -> &SegmentCache {
        &self.segs[seg.index()]
    }

    #[inline]
    pub fn seg_mut(&mut self, seg: SegReg) -> &mut SegmentCache {
        &mut self.segs[seg.index()]
    }

    #[inline]
    pub fn selector(&self, seg: SegReg) -> u16 {
        self.segs[seg.index()].val
    }

    #[inline]
    pub fn flag(&self, flag: u32) -> bool {
        self.eflags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u32, on: bool) {
        if on {
            self.eflags |= flag;
        } else {
            self.eflags &= !flag;
        }
        if flag & FLAG_DF != 0 {
            self.direction = if on { -1 } else { 1 };
        }
    }

    #[inline]
    pub fn iopl(&self) -> u8 {
        ((self.eflags & FLAG_IOPL) >> 12) as u8
    }

    #[inline]
    pub fn v86(&self) -> bool {
        self.eflags & FLAG_VM != 0
    }

    /// Real mode or virtual-8086: segment loads use `selector << 4` bases.
    #[inline]
    pub fn real_style_segments(&self) -> bool {
        !self.pmode || self.v86()
    }

    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.pmode && self.cr0 & CR0_PG != 0
    }

    /// `flags = (flags & !mask) | (word & mask) | 2`, keeping `direction` in sync.
    pub fn set_flags(&mut self, word: u32, mask: u32) {
        self.eflags = (self.eflags & !mask) | (word & mask) | FLAG_RESERVED1;
        self.direction = if self.eflags & FLAG_DF != 0 { -1 } else { 1 };
    }

    /// Change CPL, notifying paging on a ring-3 boundary crossing.
    pub fn set_cpl<P: PagingControl + ?Sized>(&mut self, paging: &mut P, new_cpl: u8) {
        if new_cpl == self.cpl {
            return;
        }
        if self.paging_enabled() && ((self.cpl < 3 && new_cpl == 3) || (self.cpl == 3 && new_cpl < 3)) {
            paging.switch_privilege(new_cpl == 3);
        }
        self.cpl = new_cpl;
    }

    /// SegSet16: real-mode style load. The limit is left alone (flat real mode).
    pub fn load_segment_real(&mut self, seg: SegReg, sel: u16) {
        let cache = self.seg_mut(seg);
        cache.val = sel;
        cache.base = (sel as u32) << 4;
    }

    /// Install a validated descriptor into a segment cache.
    pub fn commit_segment(&mut self, seg: SegReg, sel: u16, desc: &Descriptor, enforce_limits: bool) {
        let cache = self.seg_mut(seg);
        cache.val = sel;
        cache.base = desc.base();
        cache.limit = if enforce_limits { desc.limit() } else { u32::MAX };
        cache.expand_down = desc.expand_down();
        match seg {
            SegReg::Ss => self.stack = StackState::for_big(desc.big()),
            SegReg::Cs => self.code_big = desc.big(),
            _ => {}
        }
    }

    /// Switch to a new stack: SS cache, stack width and ESP (SP only for 16-bit stacks).
    pub fn commit_stack(&mut self, ss: u16, desc: &Descriptor, esp: u32, enforce_limits: bool) {
        self.commit_segment(SegReg::Ss, ss, desc, enforce_limits);
        if self.stack.big {
            self.regs.esp = esp;
        } else {
            self.regs.esp = (self.regs.esp & 0xffff_0000) | (esp & 0xffff);
        }
    }

    /// ESP after moving the stack pointer by `delta` bytes within the current width.
    #[inline]
    pub fn stack_offset(&self, esp: u32, delta: i32) -> u32 {
        (esp & self.stack.notmask) | (esp.wrapping_add(delta as u32) & self.stack.mask)
    }

    #[inline]
    fn stack_linear(&self, esp: u32) -> u32 {
        self.seg(SegReg::Ss).base.wrapping_add(esp & self.stack.mask)
    }

    pub fn push16<B: CpuBus + ?Sized>(&mut self, bus: &mut B, val: u16) -> Result<()> {
        let new_esp = self.stack_offset(self.regs.esp, -2);
        bus.write_u16(self.stack_linear(new_esp), val)?;
        self.regs.esp = new_esp;
        Ok(())
    }

    pub fn push32<B: CpuBus + ?Sized>(&mut self, bus: &mut B, val: u32) -> Result<()> {
        let new_esp = self.stack_offset(self.regs.esp, -4);
        bus.write_u32(self.stack_linear(new_esp), val)?;
        self.regs.esp = new_esp;
        Ok(())
    }

    pub fn pop16<B: CpuBus + ?Sized>(&mut self, bus: &mut B) -> Result<u16> {
        let val = bus.read_u16(self.stack_linear(self.regs.esp))?;
        self.regs.esp = self.stack_offset(self.regs.esp, 2);
        Ok(val)
    }

    pub fn pop32<B: CpuBus + ?Sized>(&mut self, bus: &mut B) -> Result<u32> {
        let val = bus.read_u32(self.stack_linear(self.regs.esp))?;
        self.regs.esp = self.stack_offset(self.regs.esp, 4);
        Ok(val)
    }

    /// Read a stack slot without moving ESP.
    pub fn peek16<B: CpuBus + ?Sized>(&self, bus: &mut B, esp: u32) -> Result<u16> {
        Ok(bus.read_u16(self.stack_linear(esp))?)
    }

    pub fn peek32<B: CpuBus + ?Sized>(&self, bus: &mut B, esp: u32) -> Result<u32> {
        Ok(bus.read_u32(self.stack_linear(esp))?)
    }

    /// Push in the width selected by `use32`.
    pub fn push<B: CpuBus + ?Sized>(&mut self, bus: &mut B, use32: bool, val: u32) -> Result<()> {
        if use32 {
            self.push32(bus, val)
        } else {
            self.push16(bus, val as u16)
        }
    }

    pub fn pop<B: CpuBus + ?Sized>(&mut self, bus: &mut B, use32: bool) -> Result<u32> {
        if use32 {
            self.pop32(bus)
        } else {
            Ok(self.pop16(bus)? as u32)
        }
    }
}

/// Run `f` with the memory privilege level forced to supervisor.
///
/// Descriptor table, IDT and TSS reads are system accesses and must not be subject
/// to user/supervisor page checks even when CPL is 3.
pub(crate) fn with_supervisor_access<B: CpuBus + ?Sized, R>(
    bus: &mut B,
    state: &mut ProcessorState,
    f: impl FnOnce(&mut B, &mut ProcessorState) -> R,
) -> R {
    let old = state.mpl;
    state.mpl = 0;
    bus.sync_access_level(0);
    let res = f(bus, state);
    state.mpl = old;
    bus.sync_access_level(old);
    res
}
