#![allow(dead_code)]

use aero_cpu_protect::{
    tss32, types, CpuBus, Descriptor, FlatTestBus, ProtectCore, SegReg, CR0_PE,
};

pub const MEM_SIZE: usize = 0x2_0000;

pub const GDT_BASE: u32 = 0x1000;
pub const IDT_BASE: u32 = 0x2000;
pub const TSS_A: u32 = 0x3000;
pub const TSS_B: u32 = 0x3200;

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_CS: u16 = 0x1b;
pub const USER_DS: u16 = 0x23;
pub const TSS_A_SEL: u16 = 0x28;
pub const TSS_B_SEL: u16 = 0x30;
pub const CALL_GATE: u16 = 0x3b;
pub const CONFORMING_CS: u16 = 0x40;
pub const TASK_GATE: u16 = 0x4b;
/// Free GDT slot for tests that build their own descriptor.
pub const SCRATCH: u16 = 0x58;

pub const KERNEL_STACK_TOP: u32 = 0x9000;
pub const USER_STACK_TOP: u32 = 0x8000;

pub const SYSCALL_VECTOR: u8 = 0x80;
pub const SYSCALL_HANDLER: u32 = 0x6000;
pub const CALL_GATE_TARGET: u32 = 0x5000;
pub const TASK_B_EIP: u32 = 0x7000;
pub const TASK_B_ESP: u32 = 0xa000;

/// 4 GiB flat segment.
pub fn flat(typ: u8, dpl: u8) -> Descriptor {
    Descriptor::segment(0, 0xf_ffff, typ, dpl, true)
        .with_granularity(true)
        .with_big(true)
}

pub fn put_gdt(bus: &mut FlatTestBus, sel: u16, desc: Descriptor) {
    let at = GDT_BASE + (sel as u32 & !7);
    bus.write_u32(at, desc.raw[0]).unwrap();
    bus.write_u32(at + 4, desc.raw[1]).unwrap();
}

pub fn put_idt(bus: &mut FlatTestBus, vector: u8, gate: Descriptor) {
    let at = IDT_BASE + vector as u32 * 8;
    bus.write_u32(at, gate.raw[0]).unwrap();
    bus.write_u32(at + 4, gate.raw[1]).unwrap();
}

/// Ring-0 interrupt gate into the kernel code segment.
pub fn kernel_gate(vector: u8, offset: u32) -> (u8, Descriptor) {
    (
        vector,
        Descriptor::gate(KERNEL_CS, offset, types::INT_GATE_386, 0, true, 0),
    )
}

/// Memory with a flat GDT, a syscall gate and two 32-bit tasks.
pub fn machine() -> FlatTestBus {
    let mut bus = FlatTestBus::new(MEM_SIZE);
    put_gdt(&mut bus, KERNEL_CS, flat(types::CODE_R_NC_A, 0));
    put_gdt(&mut bus, KERNEL_DS, flat(types::DATA_EU_RW_A, 0));
    put_gdt(&mut bus, USER_CS, flat(types::CODE_R_NC_A, 3));
    put_gdt(&mut bus, USER_DS, flat(types::DATA_EU_RW_A, 3));
    put_gdt(
        &mut bus,
        TSS_A_SEL,
        Descriptor::segment(TSS_A, 0x67, types::TSS_386_AVAILABLE, 0, true),
    );
    put_gdt(
        &mut bus,
        TSS_B_SEL,
        Descriptor::segment(TSS_B, 0x67, types::TSS_386_AVAILABLE, 0, true),
    );
    put_gdt(
        &mut bus,
        CALL_GATE,
        Descriptor::gate(KERNEL_CS, CALL_GATE_TARGET, types::CALL_GATE_386, 3, true, 2),
    );
    put_gdt(&mut bus, CONFORMING_CS, flat(types::CODE_R_C_A, 0));
    put_gdt(
        &mut bus,
        TASK_GATE,
        Descriptor::gate(TSS_B_SEL, 0, types::TASK_GATE, 3, true, 0),
    );

    put_idt(
        &mut bus,
        SYSCALL_VECTOR,
        Descriptor::gate(KERNEL_CS, SYSCALL_HANDLER, types::INT_GATE_386, 3, true, 0),
    );

    bus.write_u32(TSS_A + tss32::ESP0, KERNEL_STACK_TOP).unwrap();
    bus.write_u16(TSS_A + tss32::SS0, KERNEL_DS).unwrap();

    bus.write_u32(TSS_B + tss32::EIP, TASK_B_EIP).unwrap();
    bus.write_u32(TSS_B + tss32::EFLAGS, 0x2).unwrap();
    bus.write_u32(TSS_B + tss32::EAX, 0xb0b0_b0b0).unwrap();
    bus.write_u32(TSS_B + tss32::ESP, TASK_B_ESP).unwrap();
    bus.write_u16(TSS_B + tss32::CS, KERNEL_CS).unwrap();
    for slot in [tss32::ES, tss32::SS, tss32::DS, tss32::FS, tss32::GS] {
        bus.write_u16(TSS_B + slot, KERNEL_DS).unwrap();
    }
    bus
}

/// Protected mode with TSS A loaded, running at `cpl` on that ring's flat segments.
pub fn protected_core(bus: &mut FlatTestBus, cpl: u8) -> ProtectCore {
    let mut core = ProtectCore::default();
    core.state.lgdt(0xff, GDT_BASE);
    core.state.lidt(0x7ff, IDT_BASE);
    core.state.pmode = true;
    core.state.cr0 |= CR0_PE;
    core.ltr(bus, TSS_A_SEL).unwrap();
    enter_ring(&mut core, bus, cpl);
    core
}

pub fn enter_ring(core: &mut ProtectCore, bus: &mut FlatTestBus, cpl: u8) {
    let (cs, ds, esp) = if cpl == 0 {
        (KERNEL_CS, KERNEL_DS, KERNEL_STACK_TOP)
    } else {
        (USER_CS, USER_DS, USER_STACK_TOP)
    };
    let cs_desc = core.state.descriptor(bus, cs).unwrap().unwrap();
    core.state.commit_segment(SegReg::Cs, cs, &cs_desc, true);
    core.state.cpl = cpl;
    for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es] {
        core.load_segment(bus, seg, ds).unwrap();
    }
    core.state.regs.esp = esp;
}
