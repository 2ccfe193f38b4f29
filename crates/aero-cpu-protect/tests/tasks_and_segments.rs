mod common;

use aero_cpu_protect::{tss32, types, CpuBus, Fault, FlatTestBus, ProtectCore, SegReg, FLAG_NT};
use common::*;
use proptest::prelude::*;

fn tss_type(core: &mut ProtectCore, bus: &mut FlatTestBus, sel: u16) -> u8 {
    core.state.descriptor(bus, sel).unwrap().unwrap().typ()
}

#[test]
fn call_to_tss_nests_and_iret_returns() {
    let mut bus = machine();
    let mut core = protected_core(&mut bus, 0);
    core.state.regs.eax = 0x1111_1111;

    core.call(&mut bus, true, TSS_B_SEL, 0, 0x1234).unwrap();
    assert_eq!(core.str(), TSS_B_SEL);
    assert_eq!(core.state.eip, TASK_B_EIP);
    assert_eq!(core.state.regs.eax, 0xb0b0_b0b0);
    assert_eq!(core.state.regs.esp, TASK_B_ESP);
    assert!(core.state.flag(FLAG_NT));
    assert_eq!(bus.read_u16(TSS_B + tss32::BACK_LINK).unwrap(), TSS_A_SEL);
    assert_eq!(bus.read_u32(TSS_A + tss32::EIP).unwrap(), 0x1234);
    assert_eq!(bus.read_u32(TSS_A + tss32::EAX).unwrap(), 0x1111_1111);
    assert_eq!(tss_type(&mut core, &mut bus, TSS_A_SEL), types::TSS_386_BUSY);
    assert_eq!(tss_type(&mut core, &mut bus, TSS_B_SEL), types::TSS_386_BUSY);

    core.iret(&mut bus, true, 0x7010).unwrap();
    assert_eq!(core.str(), TSS_A_SEL);
    assert_eq!(core.state.eip, 0x1234);
    assert_eq!(core.state.regs.eax, 0x1111_1111);
    assert_eq!(core.state.regs.esp, KERNEL_STACK_TOP);
    assert!(!core.state.flag(FLAG_NT));
    assert_eq!(tss_type(&mut core, &mut bus, TSS_B_SEL), types::TSS_386_AVAILABLE);
    assert_eq!(tss_type(&mut core, &mut bus, TSS_A_SEL), types::TSS_386_BUSY);
    // The outgoing image of task B has NT cleared.
    assert_eq!(bus.read_u32(TSS_B + tss32::EFLAGS).unwrap() & FLAG_NT, 0);
    assert_eq!(bus.read_u32(TSS_B + tss32::EIP).unwrap(), 0x7010);
}

#[test]
fn jmp_through_task_gate_moves_busy_bit() {
    let mut bus = machine();
    let mut core = protected_core(&mut bus, 0);

    core.jmp(&mut bus, true, TASK_GATE, 0, 0x2222).unwrap();
    assert_eq!(core.str(), TSS_B_SEL);
    assert!(!core.state.flag(FLAG_NT));
    assert_eq!(bus.read_u16(TSS_B + tss32::BACK_LINK).unwrap(), 0);
    assert_eq!(tss_type(&mut core, &mut bus, TSS_A_SEL), types::TSS_386_AVAILABLE);
    assert_eq!(tss_type(&mut core, &mut bus, TSS_B_SEL), types::TSS_386_BUSY);
}

#[test]
fn jmp_to_busy_tss_is_rejected() {
    let mut bus = machine();
    let mut core = protected_core(&mut bus, 0);
    // TSS A is busy: it is the current task.
    assert_eq!(
        core.jmp(&mut bus, true, TSS_A_SEL, 0, 0),
        Err(Fault::invariant(format!(
            "JMP illegal descriptor type {:#x}",
            types::TSS_386_BUSY
        )))
    );
}

#[test]
fn task_gate_needs_privilege() {
    let mut bus = machine();
    put_gdt(
        &mut bus,
        SCRATCH,
        aero_cpu_protect::Descriptor::gate(TSS_B_SEL, 0, types::TASK_GATE, 0, true, 0),
    );
    let mut core = protected_core(&mut bus, 3);
    assert_eq!(
        core.call(&mut bus, true, SCRATCH | 3, 0, 0),
        Err(Fault::gp(SCRATCH as u32))
    );
}

#[test]
fn check_segments_is_idempotent() {
    let mut bus = machine();
    let mut core = protected_core(&mut bus, 0);
    core.load_segment(&mut bus, SegReg::Ds, KERNEL_DS).unwrap();
    core.load_segment(&mut bus, SegReg::Es, USER_DS).unwrap();
    core.load_segment(&mut bus, SegReg::Fs, CONFORMING_CS).unwrap();
    core.load_segment(&mut bus, SegReg::Gs, KERNEL_CS).unwrap();
    core.state.cpl = 3;

    core.check_segments(&mut bus).unwrap();
    let once = core.state.segs;
    core.check_segments(&mut bus).unwrap();
    assert_eq!(core.state.segs, once);

    assert_eq!(core.state.selector(SegReg::Ds), 0);
    assert_eq!(core.state.selector(SegReg::Es), USER_DS);
    assert_eq!(core.state.selector(SegReg::Fs), CONFORMING_CS);
    assert_eq!(core.state.selector(SegReg::Gs), 0);
}

#[test]
fn selector_inspection_from_user_mode() {
    let mut bus = machine();
    let mut core = protected_core(&mut bus, 3);
    assert_eq!(core.lar(&mut bus, KERNEL_DS).unwrap(), None);
    assert!(core.lar(&mut bus, USER_DS).unwrap().is_some());
    assert!(core.verw(&mut bus, USER_DS).unwrap());
    assert!(!core.verw(&mut bus, USER_CS).unwrap());
    assert_eq!(core.lsl(&mut bus, USER_DS).unwrap(), Some(0xffff_ffff));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn null_selector_loads(
        rpl in 0u16..4,
        seg in prop::sample::select(vec![SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs]),
        cpl in prop::sample::select(vec![0u8, 3]),
    ) {
        let mut bus = machine();
        let mut core = protected_core(&mut bus, cpl);

        prop_assert_eq!(core.load_segment(&mut bus, seg, rpl), Ok(()));
        prop_assert_eq!(core.state.selector(seg), rpl);
        prop_assert_eq!(core.state.seg(seg).base, 0);

        let ss = *core.state.seg(SegReg::Ss);
        prop_assert_eq!(core.load_segment(&mut bus, SegReg::Ss, rpl), Err(Fault::gp0()));
        prop_assert_eq!(core.state.seg(SegReg::Ss), &ss);
    }
}
