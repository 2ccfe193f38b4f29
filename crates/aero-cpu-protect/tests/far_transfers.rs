mod common;

use aero_cpu_protect::{types, CpuBus, Fault, SegReg};
use common::*;
use proptest::prelude::*;

#[test]
fn call_gate_to_inner_level_copies_parameters() {
    let mut bus = machine();
    let mut core = protected_core(&mut bus, 3);
    core.state.regs.esp = 0x7ff8;
    bus.write_u32(0x7ff8, 0xaaaa).unwrap();
    bus.write_u32(0x7ffc, 0xbbbb).unwrap();

    core.call(&mut bus, true, CALL_GATE, 0xdead, 0x0040_1000).unwrap();

    assert_eq!(core.cpl(), 0);
    assert_eq!(core.state.selector(SegReg::Cs), KERNEL_CS);
    assert_eq!(core.state.eip, CALL_GATE_TARGET);
    assert_eq!(core.state.selector(SegReg::Ss), KERNEL_DS);
    assert_eq!(core.state.regs.esp, KERNEL_STACK_TOP - 24);

    let frame: Vec<u32> = (0..6)
        .map(|i| bus.read_u32(KERNEL_STACK_TOP - 24 + i * 4).unwrap())
        .collect();
    assert_eq!(
        frame,
        vec![0x0040_1000, USER_CS as u32, 0xaaaa, 0xbbbb, 0x7ff8, USER_DS as u32]
    );
}

#[test]
fn ret_to_outer_level_releases_parameters_on_both_stacks() {
    let mut bus = machine();
    let mut core = protected_core(&mut bus, 3);
    core.state.regs.esp = 0x7ff8;
    core.call(&mut bus, true, CALL_GATE, 0, 0x0040_1000).unwrap();
    core.load_segment(&mut bus, SegReg::Ds, KERNEL_DS).unwrap();

    core.ret(&mut bus, true, 8, core.state.eip).unwrap();

    assert_eq!(core.cpl(), 3);
    assert_eq!(core.state.selector(SegReg::Cs), USER_CS);
    assert_eq!(core.state.eip, 0x0040_1000);
    assert_eq!(core.state.selector(SegReg::Ss), USER_DS);
    assert_eq!(core.state.regs.esp, USER_STACK_TOP);
    // The kernel data segment is no longer usable at CPL 3.
    assert_eq!(core.state.selector(SegReg::Ds), 0);
    assert_eq!(core.state.selector(SegReg::Es), USER_DS);
}

#[test]
fn ret_fault_while_revalidating_data_segments_keeps_outer_stack() {
    let mut bus = machine();
    put_gdt(&mut bus, SCRATCH, flat(types::DATA_EU_RW_A, 0));
    let mut core = protected_core(&mut bus, 3);
    core.state.regs.esp = 0x7ff8;
    core.call(&mut bus, true, CALL_GATE, 0, 0x0040_1000).unwrap();
    core.load_segment(&mut bus, SegReg::Ds, SCRATCH).unwrap();
    let entry = GDT_BASE + SCRATCH as u32;
    bus.inject_page_fault(entry..entry + 8, 0);

    let err = core.ret(&mut bus, true, 8, core.state.eip).unwrap_err();
    assert_eq!(
        err,
        Fault::PageFault {
            linear: entry,
            error_code: 0
        }
    );
    // The return already happened: SS:ESP and CS:EIP all belong to the outer level.
    assert_eq!(core.cpl(), 3);
    assert_eq!(core.state.selector(SegReg::Cs), USER_CS);
    assert_eq!(core.state.eip, 0x0040_1000);
    assert_eq!(core.state.selector(SegReg::Ss), USER_DS);
    assert_eq!(core.state.regs.esp, USER_STACK_TOP);

    bus.clear_injected_faults();
    core.check_segments(&mut bus).unwrap();
    assert_eq!(core.state.selector(SegReg::Ds), 0);
}

#[test]
fn call_gate_stack_fault_leaves_caller_untouched() {
    let mut bus = machine();
    let mut core = protected_core(&mut bus, 3);
    // Ring 0 stack selector that points at a ring 3 segment.
    bus.write_u16(TSS_A + aero_cpu_protect::tss32::SS0, USER_DS).unwrap();
    let before = core.state.clone();

    let err = core.call(&mut bus, true, CALL_GATE, 0, 0x1000).unwrap_err();
    assert_eq!(err, Fault::ts(USER_DS as u32 & 0xfffc));
    assert_eq!(core.state, before);
}

#[test]
fn near_level_call_and_ret_round_trip() {
    let mut bus = machine();
    let mut core = protected_core(&mut bus, 0);
    core.state.eip = 0x1000;

    core.call(&mut bus, true, KERNEL_CS, 0x2000, 0x1005).unwrap();
    assert_eq!(core.state.eip, 0x2000);
    assert_eq!(core.state.regs.esp, KERNEL_STACK_TOP - 8);
    assert_eq!(bus.read_u32(KERNEL_STACK_TOP - 8).unwrap(), 0x1005);
    assert_eq!(bus.read_u32(KERNEL_STACK_TOP - 4).unwrap(), KERNEL_CS as u32);

    core.ret(&mut bus, true, 0, core.state.eip).unwrap();
    assert_eq!(core.state.eip, 0x1005);
    assert_eq!(core.state.selector(SegReg::Cs), KERNEL_CS);
    assert_eq!(core.state.regs.esp, KERNEL_STACK_TOP);
}

#[test]
fn conforming_code_keeps_cpl() {
    let mut bus = machine();
    let mut core = protected_core(&mut bus, 3);
    core.jmp(&mut bus, true, CONFORMING_CS, 0x4000, 0).unwrap();
    assert_eq!(core.cpl(), 3);
    assert_eq!(core.state.selector(SegReg::Cs), (CONFORMING_CS & 0xfffc) | 3);
    assert_eq!(core.state.eip, 0x4000);
}

#[test]
fn jmp_to_lower_privilege_code_faults() {
    let mut bus = machine();
    let mut core = protected_core(&mut bus, 3);
    assert_eq!(
        core.jmp(&mut bus, true, KERNEL_CS, 0, 0),
        Err(Fault::gp(KERNEL_CS as u32))
    );
    assert_eq!(core.jmp(&mut bus, true, 0, 0, 0), Err(Fault::gp0()));
}

#[test]
fn real_mode_far_call_pushes_16bit_frame() {
    let mut bus = machine();
    let mut core = aero_cpu_protect::ProtectCore::default();
    core.state.load_segment_real(SegReg::Cs, 0x1000);
    core.state.load_segment_real(SegReg::Ss, 0x0000);
    core.state.regs.esp = 0x0800;

    core.call(&mut bus, false, 0x2000, 0x1_0123, 0x0456).unwrap();
    assert_eq!(core.state.eip, 0x0123);
    assert_eq!(core.state.seg(SegReg::Cs).base, 0x2_0000);
    assert_eq!(bus.read_u16(0x07fc).unwrap(), 0x0456);
    assert_eq!(bus.read_u16(0x07fe).unwrap(), 0x1000);

    core.ret(&mut bus, false, 4, 0).unwrap();
    assert_eq!(core.state.eip, 0x0456);
    assert_eq!(core.state.selector(SegReg::Cs), 0x1000);
    assert_eq!(core.state.regs.esp, 0x0804);
}

#[test]
fn call_to_data_segment_is_gp() {
    let mut bus = machine();
    let mut core = protected_core(&mut bus, 0);
    put_gdt(
        &mut bus,
        SCRATCH,
        aero_cpu_protect::Descriptor::segment(0, 0xffff, types::DATA_EU_RW_NA, 0, true),
    );
    assert_eq!(
        core.call(&mut bus, true, SCRATCH, 0, 0),
        Err(Fault::gp(SCRATCH as u32))
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn rpl_above_cpl_never_reaches_nonconforming_code(cpl in 0u8..3, bump in 1u8..=3) {
        let rpl = (cpl + bump).min(3);

        let mut bus = machine();
        put_gdt(&mut bus, SCRATCH, flat(types::CODE_R_NC_A, cpl));
        let mut core = protected_core(&mut bus, 0);
        core.state.cpl = cpl;
        let before = core.state.clone();

        let sel = SCRATCH | rpl as u16;
        prop_assert_eq!(
            core.jmp(&mut bus, true, sel, 0x1234, 0),
            Err(Fault::gp(SCRATCH as u32))
        );
        prop_assert_eq!(
            core.call(&mut bus, true, sel, 0x1234, 0),
            Err(Fault::gp(SCRATCH as u32))
        );
        prop_assert_eq!(core.state, before);
    }
}
