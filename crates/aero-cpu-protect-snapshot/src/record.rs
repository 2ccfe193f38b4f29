use std::io::{Read, Write};

use aero_cpu_protect::{
    Descriptor, Gprs, NmiLatch, PendingException, ProcessorState, ProtectCore, SegReg,
    SegmentCache, StackState, TaskStateCache, VECTOR_COUNT,
};

use crate::decoder::DecoderKind;
use crate::error::{Result, SnapshotError};
use crate::io::{ReadLeExt, WriteLeExt};

pub const RECORD_MAGIC: &[u8; 4] = b"APRT";
pub const RECORD_VERSION: u16 = 1;

/// Everything of a [`ProtectCore`] that survives a save/restore, plus the decoder the
/// dispatcher was using. Configuration is host policy and is not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuRecord {
    pub state: ProcessorState,
    pub tss: TaskStateCache,
    pub exception_levels: [u32; VECTOR_COUNT],
    pub exceptions_in_progress: Vec<u8>,
    pub nmi: NmiLatch,
    pub decoder: DecoderKind,
}

impl CpuRecord {
    pub fn capture(core: &ProtectCore, decoder: DecoderKind) -> Self {
        Self {
            state: core.state.clone(),
            tss: core.tss,
            exception_levels: *core.escalator.levels(),
            exceptions_in_progress: core.escalator.in_progress().to_vec(),
            nmi: core.nmi,
            decoder,
        }
    }

    pub fn apply(&self, core: &mut ProtectCore) {
        core.state = self.state.clone();
        core.tss = self.tss;
        core.escalator
            .restore(self.exception_levels, self.exceptions_in_progress.clone());
        core.nmi = self.nmi;
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        let s = &self.state;
        w.write_all(RECORD_MAGIC)?;
        w.write_u16_le(RECORD_VERSION)?;

        for reg in [
            s.regs.eax, s.regs.ecx, s.regs.edx, s.regs.ebx, s.regs.esp, s.regs.ebp, s.regs.esi,
            s.regs.edi,
        ] {
            w.write_u32_le(reg)?;
        }
        w.write_u32_le(s.eip)?;
        w.write_u32_le(s.eflags)?;

        for seg in SegReg::ALL {
            let cache = s.seg(seg);
            w.write_u16_le(cache.val)?;
            w.write_u32_le(cache.base)?;
            w.write_u32_le(cache.limit)?;
            w.write_bool(cache.expand_down)?;
        }

        w.write_u8(s.cpl)?;
        w.write_u8(s.mpl)?;
        w.write_u32_le(s.cr0)?;
        w.write_u32_le(s.cr2)?;
        w.write_u32_le(s.cr3)?;
        w.write_u32_le(s.cr4)?;
        w.write_bool(s.pmode)?;

        w.write_u32_le(s.gdt.base)?;
        w.write_u32_le(s.gdt.limit)?;
        w.write_u16_le(s.gdt.ldt_selector)?;
        w.write_u32_le(s.gdt.ldt_base)?;
        w.write_u32_le(s.gdt.ldt_limit)?;
        w.write_u32_le(s.idt.base)?;
        w.write_u32_le(s.idt.limit)?;

        w.write_u32_le(s.stack.mask)?;
        w.write_u32_le(s.stack.notmask)?;
        w.write_bool(s.stack.big)?;
        w.write_bool(s.code_big)?;

        w.write_u8(s.exception.which)?;
        w.write_u32_le(s.exception.error)?;
        w.write_i32_le(s.direction)?;
        w.write_bool(s.reentrant_page_faults)?;

        w.write_u16_le(self.tss.selector)?;
        w.write_u32_le(self.tss.base)?;
        w.write_u32_le(self.tss.limit)?;
        w.write_bool(self.tss.is386)?;
        w.write_bool(self.tss.valid)?;
        w.write_u64_le(self.tss.desc.to_u64())?;

        for v in s.drx.iter().chain(s.trx.iter()) {
            w.write_u32_le(*v)?;
        }

        for level in self.exception_levels {
            w.write_u32_le(level)?;
        }
        let depth: u8 = self
            .exceptions_in_progress
            .len()
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("exception stack too deep"))?;
        w.write_u8(depth)?;
        for &vector in &self.exceptions_in_progress {
            w.write_u8(vector)?;
        }

        w.write_bool(self.nmi.gate)?;
        w.write_bool(self.nmi.active)?;
        w.write_bool(self.nmi.pending)?;

        w.write_u16_le(self.decoder.index())?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != RECORD_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let version = r.read_u16_le()?;
        if version != RECORD_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        let mut s = ProcessorState::default();
        let mut regs = [0u32; 8];
        for reg in regs.iter_mut() {
            *reg = r.read_u32_le()?;
        }
        let [eax, ecx, edx, ebx, esp, ebp, esi, edi] = regs;
        s.regs = Gprs {
            eax,
            ecx,
            edx,
            ebx,
            esp,
            ebp,
            esi,
            edi,
        };
        s.eip = r.read_u32_le()?;
        s.eflags = r.read_u32_le()?;

        for seg in SegReg::ALL {
            *s.seg_mut(seg) = SegmentCache {
                val: r.read_u16_le()?,
                base: r.read_u32_le()?,
                limit: r.read_u32_le()?,
                expand_down: r.read_bool()?,
            };
        }

        s.cpl = read_privilege_level(r)?;
        s.mpl = read_privilege_level(r)?;
        s.cr0 = r.read_u32_le()?;
        s.cr2 = r.read_u32_le()?;
        s.cr3 = r.read_u32_le()?;
        s.cr4 = r.read_u32_le()?;
        s.pmode = r.read_bool()?;

        s.gdt.base = r.read_u32_le()?;
        s.gdt.limit = r.read_u32_le()?;
        s.gdt.ldt_selector = r.read_u16_le()?;
        s.gdt.ldt_base = r.read_u32_le()?;
        s.gdt.ldt_limit = r.read_u32_le()?;
        s.idt.base = r.read_u32_le()?;
        s.idt.limit = r.read_u32_le()?;

        let mask = r.read_u32_le()?;
        let notmask = r.read_u32_le()?;
        let big = r.read_bool()?;
        s.stack = StackState::for_big(big);
        if (mask, notmask) != (s.stack.mask, s.stack.notmask) {
            return Err(SnapshotError::Corrupt("stack mask does not match stack width"));
        }
        s.code_big = r.read_bool()?;

        s.exception = PendingException {
            which: r.read_u8()?,
            error: r.read_u32_le()?,
        };
        s.direction = r.read_i32_le()?;
        if s.direction != 1 && s.direction != -1 {
            return Err(SnapshotError::Corrupt("direction must be 1 or -1"));
        }
        s.reentrant_page_faults = r.read_bool()?;

        let tss = TaskStateCache {
            selector: r.read_u16_le()?,
            base: r.read_u32_le()?,
            limit: r.read_u32_le()?,
            is386: r.read_bool()?,
            valid: r.read_bool()?,
            desc: Descriptor::from_u64(r.read_u64_le()?),
        };

        for v in s.drx.iter_mut().chain(s.trx.iter_mut()) {
            *v = r.read_u32_le()?;
        }

        let mut exception_levels = [0u32; VECTOR_COUNT];
        for level in exception_levels.iter_mut() {
            *level = r.read_u32_le()?;
        }
        let depth = r.read_u8()? as usize;
        let mut exceptions_in_progress = Vec::with_capacity(depth);
        for _ in 0..depth {
            let vector = r.read_u8()?;
            if vector as usize >= VECTOR_COUNT {
                return Err(SnapshotError::Corrupt("exception vector out of range"));
            }
            exceptions_in_progress.push(vector);
        }

        let nmi = NmiLatch {
            gate: r.read_bool()?,
            active: r.read_bool()?,
            pending: r.read_bool()?,
        };

        let decoder = DecoderKind::from_index(r.read_u16_le()?)?;

        Ok(Self {
            state: s,
            tss,
            exception_levels,
            exceptions_in_progress,
            nmi,
            decoder,
        })
    }
}

fn read_privilege_level<R: Read>(r: &mut R) -> Result<u8> {
    let level = r.read_u8()?;
    if level > 3 {
        return Err(SnapshotError::Corrupt("privilege level out of range"));
    }
    Ok(level)
}
