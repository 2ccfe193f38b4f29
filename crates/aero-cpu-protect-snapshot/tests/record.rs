use std::io::Cursor;

use aero_cpu_protect::{
    tss32, types, CpuBus, Descriptor, FlatTestBus, ProtectCore, SegReg, CR0_PE, FLAG_NT,
};
use aero_cpu_protect_snapshot::{CpuRecord, DecoderKind, SnapshotError};
use proptest::prelude::*;

const GDT_BASE: u32 = 0x1000;
const IDT_BASE: u32 = 0x2000;
const TSS_A: u32 = 0x3000;
const TSS_B: u32 = 0x3200;

const KERNEL_CS: u16 = 0x08;
const KERNEL_DS: u16 = 0x10;
const TSS_A_SEL: u16 = 0x18;
const TSS_B_SEL: u16 = 0x20;

const NP_HANDLER: u32 = 0x6300;
const DF_HANDLER: u32 = 0x6400;

fn put(bus: &mut FlatTestBus, at: u32, desc: Descriptor) {
    bus.write_u32(at, desc.raw[0]).unwrap();
    bus.write_u32(at + 4, desc.raw[1]).unwrap();
}

fn flat(typ: u8) -> Descriptor {
    Descriptor::segment(0, 0xf_ffff, typ, 0, true)
        .with_granularity(true)
        .with_big(true)
}

/// Two kernel tasks with #NP and #DF handlers; the core runs task B after a CALL from A.
fn nested_task() -> (FlatTestBus, ProtectCore) {
    let mut bus = FlatTestBus::new(0x2_0000);
    put(&mut bus, GDT_BASE + KERNEL_CS as u32, flat(types::CODE_R_NC_A));
    put(&mut bus, GDT_BASE + KERNEL_DS as u32, flat(types::DATA_EU_RW_A));
    for (sel, base) in [(TSS_A_SEL, TSS_A), (TSS_B_SEL, TSS_B)] {
        put(
            &mut bus,
            GDT_BASE + sel as u32,
            Descriptor::segment(base, 0x67, types::TSS_386_AVAILABLE, 0, true),
        );
    }
    for (vector, offset) in [(11u32, NP_HANDLER), (8, DF_HANDLER)] {
        put(
            &mut bus,
            IDT_BASE + vector * 8,
            Descriptor::gate(KERNEL_CS, offset, types::INT_GATE_386, 0, true, 0),
        );
    }

    bus.write_u32(TSS_B + tss32::EIP, 0x7000).unwrap();
    bus.write_u32(TSS_B + tss32::EFLAGS, 0x2).unwrap();
    bus.write_u32(TSS_B + tss32::ESP, 0xa000).unwrap();
    bus.write_u16(TSS_B + tss32::CS, KERNEL_CS).unwrap();
    for slot in [tss32::ES, tss32::SS, tss32::DS, tss32::FS, tss32::GS] {
        bus.write_u16(TSS_B + slot, KERNEL_DS).unwrap();
    }

    let mut core = ProtectCore::default();
    core.state.lgdt(0x27, GDT_BASE);
    core.state.lidt(0x7ff, IDT_BASE);
    core.state.pmode = true;
    core.state.cr0 |= CR0_PE;
    core.state.cr3 = 0x0001_0000;
    core.ltr(&mut bus, TSS_A_SEL).unwrap();
    let cs = core.state.descriptor(&mut bus, KERNEL_CS).unwrap().unwrap();
    core.state.commit_segment(SegReg::Cs, KERNEL_CS, &cs, true);
    for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es] {
        core.load_segment(&mut bus, seg, KERNEL_DS).unwrap();
    }
    core.state.regs.esp = 0x9000;

    core.call(&mut bus, true, TSS_B_SEL, 0, 0x1234).unwrap();
    core.exception(&mut bus, 11, 0x28).unwrap();
    assert!(core.raise_nmi());
    (bus, core)
}

fn round_trip(record: &CpuRecord) -> CpuRecord {
    let mut bytes = Vec::new();
    record.encode(&mut bytes).unwrap();
    CpuRecord::decode(&mut Cursor::new(bytes)).unwrap()
}

#[test]
fn nested_task_restores_into_fresh_core() {
    let (_, core) = nested_task();
    assert_eq!(core.str(), TSS_B_SEL);
    assert!(core.state.flag(FLAG_NT));

    let record = round_trip(&CpuRecord::capture(&core, DecoderKind::NormalTrap));
    assert_eq!(record.decoder, DecoderKind::NormalTrap);

    let mut restored = ProtectCore::default();
    record.apply(&mut restored);
    assert_eq!(restored.state, core.state);
    assert_eq!(restored.tss, core.tss);
    assert_eq!(restored.escalator.levels(), core.escalator.levels());
    assert_eq!(restored.escalator.in_progress(), &[11]);
    assert_eq!(restored.nmi, core.nmi);
    assert!(restored.nmi.pending);
}

#[test]
fn restored_core_escalates_like_the_captured_one() {
    let (bus, mut core) = nested_task();
    let record = round_trip(&CpuRecord::capture(&core, DecoderKind::Normal));
    let mut restored = ProtectCore::default();
    record.apply(&mut restored);

    // A second #NP while the first is in progress escalates identically on both.
    let mut captured_bus = bus.clone();
    let mut restored_bus = bus;
    core.exception(&mut captured_bus, 11, 0x30).unwrap();
    restored.exception(&mut restored_bus, 11, 0x30).unwrap();

    assert_eq!(restored.state.eip, DF_HANDLER);
    assert_eq!(restored.state, core.state);
    assert_eq!(restored.escalator.in_progress(), &[11, 8]);
    assert_eq!(
        restored_bus.read_u32(restored.state.regs.esp).unwrap(),
        captured_bus.read_u32(core.state.regs.esp).unwrap()
    );
}

#[test]
fn corrupt_fields_are_rejected() {
    let (_, core) = nested_task();
    let mut bytes = Vec::new();
    CpuRecord::capture(&core, DecoderKind::Normal)
        .encode(&mut bytes)
        .unwrap();

    // magic, version, 8 gprs, eip, eflags, 6 segments: the next byte is CPL.
    let cpl_at = 4 + 2 + 8 * 4 + 4 + 4 + 6 * (2 + 4 + 4 + 1);
    assert_eq!(bytes[cpl_at], 0);
    let mut bad = bytes.clone();
    bad[cpl_at] = 4;
    assert!(matches!(
        CpuRecord::decode(&mut Cursor::new(bad)),
        Err(SnapshotError::Corrupt(_))
    ));

    // The in-progress stack is followed by the three NMI flags and the decoder index.
    let vector_at = bytes.len() - 2 - 3 - 1;
    assert_eq!(bytes[vector_at], 11);
    let mut bad = bytes.clone();
    bad[vector_at] = 32;
    assert!(matches!(
        CpuRecord::decode(&mut Cursor::new(bad)),
        Err(SnapshotError::Corrupt(_))
    ));

    let mut bad = bytes.clone();
    bad[bytes.len() - 3] = 2;
    assert!(matches!(
        CpuRecord::decode(&mut Cursor::new(bad)),
        Err(SnapshotError::Corrupt(_))
    ));
}

#[test]
fn truncated_record_is_an_io_error() {
    let (_, core) = nested_task();
    let mut bytes = Vec::new();
    CpuRecord::capture(&core, DecoderKind::Normal)
        .encode(&mut bytes)
        .unwrap();
    bytes.truncate(bytes.len() - 1);
    assert!(matches!(
        CpuRecord::decode(&mut Cursor::new(bytes)),
        Err(SnapshotError::Io(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn decoder_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = CpuRecord::decode(&mut Cursor::new(bytes));
    }

    #[test]
    fn decoder_never_panics_after_valid_header(tail in proptest::collection::vec(any::<u8>(), 0..512)) {
        let mut bytes = b"APRT".to_vec();
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&tail);
        let _ = CpuRecord::decode(&mut Cursor::new(bytes));
    }
}
