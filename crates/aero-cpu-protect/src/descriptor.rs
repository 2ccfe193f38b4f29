//! Segment and gate descriptors.
//!
//! A [`Descriptor`] is a view over the raw 8 bytes of a GDT/LDT/IDT entry. Every
//! field is derived from the two raw dwords on demand; nothing is cached.

/// Descriptor type values (the 5-bit field that includes the S bit).
pub mod types {
    pub const INVALID: u8 = 0x00;
    pub const TSS_286_AVAILABLE: u8 = 0x01;
    pub const LDT: u8 = 0x02;
    pub const TSS_286_BUSY: u8 = 0x03;
    pub const CALL_GATE_286: u8 = 0x04;
    pub const TASK_GATE: u8 = 0x05;
    pub const INT_GATE_286: u8 = 0x06;
    pub const TRAP_GATE_286: u8 = 0x07;
    pub const TSS_386_AVAILABLE: u8 = 0x09;
    pub const TSS_386_BUSY: u8 = 0x0b;
    pub const CALL_GATE_386: u8 = 0x0c;
    pub const INT_GATE_386: u8 = 0x0e;
    pub const TRAP_GATE_386: u8 = 0x0f;

    pub const DATA_EU_RO_NA: u8 = 0x10;
    pub const DATA_EU_RO_A: u8 = 0x11;
    pub const DATA_EU_RW_NA: u8 = 0x12;
    pub const DATA_EU_RW_A: u8 = 0x13;
    pub const DATA_ED_RO_NA: u8 = 0x14;
    pub const DATA_ED_RO_A: u8 = 0x15;
    pub const DATA_ED_RW_NA: u8 = 0x16;
    pub const DATA_ED_RW_A: u8 = 0x17;

    pub const CODE_N_NC_NA: u8 = 0x18;
    pub const CODE_N_NC_A: u8 = 0x19;
    pub const CODE_R_NC_NA: u8 = 0x1a;
    pub const CODE_R_NC_A: u8 = 0x1b;
    pub const CODE_N_C_NA: u8 = 0x1c;
    pub const CODE_N_C_A: u8 = 0x1d;
    pub const CODE_R_C_NA: u8 = 0x1e;
    pub const CODE_R_C_A: u8 = 0x1f;
}

/// Selector helpers. A selector is a plain `u16`.
pub mod selector {
    /// Low two bits.
    #[inline]
    pub const fn rpl(sel: u16) -> u8 {
        (sel & 3) as u8
    }

    /// Table indicator: set for LDT selectors.
    #[inline]
    pub const fn is_ldt(sel: u16) -> bool {
        sel & 4 != 0
    }

    /// Null selectors (index 0 in the GDT, any RPL) are reserved.
    #[inline]
    pub const fn is_null(sel: u16) -> bool {
        sel & 0xfffc == 0
    }

    /// Selector with its RPL bits cleared, as used for error codes.
    #[inline]
    pub const fn error_code(sel: u16) -> u32 {
        (sel & 0xfffc) as u32
    }
}

/// Coarse classification of a descriptor's type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Data {
        writable: bool,
        expand_down: bool,
    },
    Code {
        readable: bool,
        conforming: bool,
    },
    Ldt,
    Tss {
        is386: bool,
        busy: bool,
    },
    CallGate {
        is386: bool,
    },
    TaskGate,
    InterruptGate {
        is386: bool,
    },
    TrapGate {
        is386: bool,
    },
    Invalid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub raw: [u32; 2],
}

impl Descriptor {
    #[inline]
    pub const fn from_raw(lo: u32, hi: u32) -> Self {
        Self { raw: [lo, hi] }
    }

    pub const fn from_u64(v: u64) -> Self {
        Self::from_raw(v as u32, (v >> 32) as u32)
    }

    pub const fn to_u64(self) -> u64 {
        (self.raw[0] as u64) | ((self.raw[1] as u64) << 32)
    }

    /// Build a code/data/system segment descriptor. `limit` is the raw 20-bit field.
    pub const fn segment(base: u32, limit: u32, typ: u8, dpl: u8, present: bool) -> Self {
        let lo = ((base & 0xffff) << 16) | (limit & 0xffff);
        let hi = (base & 0xff00_0000)
            | ((base >> 16) & 0xff)
            | (limit & 0x000f_0000)
            | (((typ & 0x1f) as u32) << 8)
            | (((dpl & 3) as u32) << 13)
            | ((present as u32) << 15);
        Self::from_raw(lo, hi)
    }

    /// Build a gate descriptor (call, interrupt, trap or task gate).
    pub const fn gate(
        selector: u16,
        offset: u32,
        typ: u8,
        dpl: u8,
        present: bool,
        paramcount: u8,
    ) -> Self {
        let lo = ((selector as u32) << 16) | (offset & 0xffff);
        let hi = (offset & 0xffff_0000)
            | ((paramcount & 0x1f) as u32)
            | (((typ & 0x1f) as u32) << 8)
            | (((dpl & 3) as u32) << 13)
            | ((present as u32) << 15);
        Self::from_raw(lo, hi)
    }

    /// Set the D/B ("big") bit.
    pub fn with_big(mut self, big: bool) -> Self {
        if big {
            self.raw[1] |= 1 << 22;
        } else {
            self.raw[1] &= !(1 << 22);
        }
        self
    }

    /// Set the granularity bit.
    pub fn with_granularity(mut self, g: bool) -> Self {
        if g {
            self.raw[1] |= 1 << 23;
        } else {
            self.raw[1] &= !(1 << 23);
        }
        self
    }

    #[inline]
    pub const fn typ(&self) -> u8 {
        ((self.raw[1] >> 8) & 0x1f) as u8
    }

    #[inline]
    pub const fn dpl(&self) -> u8 {
        ((self.raw[1] >> 13) & 3) as u8
    }

    #[inline]
    pub const fn present(&self) -> bool {
        self.raw[1] & (1 << 15) != 0
    }

    #[inline]
    pub const fn big(&self) -> bool {
        self.raw[1] & (1 << 22) != 0
    }

    #[inline]
    pub const fn granularity(&self) -> bool {
        self.raw[1] & (1 << 23) != 0
    }

    pub const fn base(&self) -> u32 {
        (self.raw[1] & 0xff00_0000) | ((self.raw[1] & 0xff) << 16) | (self.raw[0] >> 16)
    }

    /// Byte-granular limit (4 KiB granularity already expanded).
    pub const fn limit(&self) -> u32 {
        let limit = (self.raw[1] & 0x000f_0000) | (self.raw[0] & 0xffff);
        if self.granularity() {
            (limit << 12) | 0xfff
        } else {
            limit
        }
    }

    /// Expand-down data segment.
    #[inline]
    pub const fn expand_down(&self) -> bool {
        let t = self.typ();
        t & 0x18 == 0x10 && t & 4 != 0
    }

    // Gate view.

    #[inline]
    pub const fn gate_selector(&self) -> u16 {
        (self.raw[0] >> 16) as u16
    }

    #[inline]
    pub const fn gate_offset(&self) -> u32 {
        (self.raw[1] & 0xffff_0000) | (self.raw[0] & 0xffff)
    }

    #[inline]
    pub const fn param_count(&self) -> u8 {
        (self.raw[1] & 0x1f) as u8
    }

    // TSS view.

    #[inline]
    pub const fn is_busy(&self) -> bool {
        self.typ() & 2 != 0
    }

    #[inline]
    pub const fn is386(&self) -> bool {
        self.typ() & 8 != 0
    }

    pub fn set_busy(&mut self, busy: bool) {
        if busy {
            self.raw[1] |= 2 << 8;
        } else {
            self.raw[1] &= !(2 << 8);
        }
    }

    pub const fn kind(&self) -> DescriptorKind {
        let t = self.typ();
        if t & 0x10 != 0 {
            if t & 8 != 0 {
                DescriptorKind::Code {
                    readable: t & 2 != 0,
                    conforming: t & 4 != 0,
                }
            } else {
                DescriptorKind::Data {
                    writable: t & 2 != 0,
                    expand_down: t & 4 != 0,
                }
            }
        } else {
            match t {
                types::TSS_286_AVAILABLE => DescriptorKind::Tss {
                    is386: false,
                    busy: false,
                },
                types::TSS_286_BUSY => DescriptorKind::Tss {
                    is386: false,
                    busy: true,
                },
                types::TSS_386_AVAILABLE => DescriptorKind::Tss {
                    is386: true,
                    busy: false,
                },
                types::TSS_386_BUSY => DescriptorKind::Tss {
                    is386: true,
                    busy: true,
                },
                types::LDT => DescriptorKind::Ldt,
                types::CALL_GATE_286 => DescriptorKind::CallGate { is386: false },
                types::CALL_GATE_386 => DescriptorKind::CallGate { is386: true },
                types::TASK_GATE => DescriptorKind::TaskGate,
                types::INT_GATE_286 => DescriptorKind::InterruptGate { is386: false },
                types::INT_GATE_386 => DescriptorKind::InterruptGate { is386: true },
                types::TRAP_GATE_286 => DescriptorKind::TrapGate { is386: false },
                types::TRAP_GATE_386 => DescriptorKind::TrapGate { is386: true },
                _ => DescriptorKind::Invalid,
            }
        }
    }

    #[inline]
    pub const fn is_code(&self) -> bool {
        self.typ() & 0x18 == 0x18
    }

    #[inline]
    pub const fn is_data(&self) -> bool {
        self.typ() & 0x18 == 0x10
    }

    #[inline]
    pub const fn is_conforming_code(&self) -> bool {
        self.is_code() && self.typ() & 4 != 0
    }

    /// Writable data segment, the only kind SS accepts.
    #[inline]
    pub const fn is_writable_data(&self) -> bool {
        self.is_data() && self.typ() & 2 != 0
    }

    /// Types whose DPL is checked against CPL when privilege drops: any data segment
    /// or non-conforming code.
    #[inline]
    pub const fn is_privilege_checked(&self) -> bool {
        self.is_data() || (self.is_code() && self.typ() & 4 == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_fields_decode() {
        let d = Descriptor::segment(0x1234_5678, 0xa_bcde, types::DATA_EU_RW_A, 2, true)
            .with_big(true);
        assert_eq!(d.base(), 0x1234_5678);
        assert_eq!(d.limit(), 0xa_bcde);
        assert_eq!(d.typ(), types::DATA_EU_RW_A);
        assert_eq!(d.dpl(), 2);
        assert!(d.present());
        assert!(d.big());
        assert!(!d.expand_down());
        assert_eq!(
            d.kind(),
            DescriptorKind::Data {
                writable: true,
                expand_down: false
            }
        );
    }

    #[test]
    fn granularity_expands_limit() {
        let d = Descriptor::segment(0, 0xf_ffff, types::CODE_R_NC_A, 0, true)
            .with_granularity(true);
        assert_eq!(d.limit(), 0xffff_ffff);
        let d = Descriptor::segment(0, 0x1, types::CODE_R_NC_A, 0, true).with_granularity(true);
        assert_eq!(d.limit(), 0x1fff);
    }

    #[test]
    fn flat_kernel_code_descriptor_matches_hardware_encoding() {
        // Canonical flat ring-0 code: 0x00cf9a000000ffff.
        let d = Descriptor::from_u64(0x00cf_9a00_0000_ffff);
        assert_eq!(d.base(), 0);
        assert_eq!(d.limit(), 0xffff_ffff);
        assert_eq!(d.typ(), types::CODE_R_NC_NA);
        assert!(d.big());
        assert_eq!(d.dpl(), 0);
    }

    #[test]
    fn gate_fields_decode() {
        let g = Descriptor::gate(0x0028, 0xdead_beef, types::CALL_GATE_386, 3, true, 5);
        assert_eq!(g.gate_selector(), 0x28);
        assert_eq!(g.gate_offset(), 0xdead_beef);
        assert_eq!(g.param_count(), 5);
        assert_eq!(g.dpl(), 3);
        assert_eq!(g.kind(), DescriptorKind::CallGate { is386: true });
    }

    #[test]
    fn tss_busy_bit_toggles() {
        let mut d = Descriptor::segment(0x1000, 0x67, types::TSS_386_AVAILABLE, 0, true);
        assert!(!d.is_busy());
        d.set_busy(true);
        assert_eq!(d.typ(), types::TSS_386_BUSY);
        assert!(d.is386());
        d.set_busy(false);
        assert_eq!(d.typ(), types::TSS_386_AVAILABLE);
    }

    #[test]
    fn expand_down_is_data_only() {
        let ed = Descriptor::segment(0, 0xfff, types::DATA_ED_RW_A, 0, true);
        assert!(ed.expand_down());
        let conforming = Descriptor::segment(0, 0xfff, types::CODE_R_C_A, 0, true);
        assert!(!conforming.expand_down());
        assert!(conforming.is_conforming_code());
        assert!(!conforming.is_privilege_checked());
    }

    #[test]
    fn selector_helpers() {
        assert!(selector::is_null(0));
        assert!(selector::is_null(3));
        assert!(!selector::is_null(4));
        assert!(selector::is_ldt(0x0f));
        assert_eq!(selector::rpl(0x2b), 3);
        assert_eq!(selector::error_code(0x2b), 0x28);
    }
}
