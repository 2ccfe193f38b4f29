use crate::error::BusFault;
use crate::interrupt::InterruptKind;

/// Linear-address memory interface. Every access may fault.
pub trait CpuBus {
    fn read_u8(&mut self, linear: u32) -> Result<u8, BusFault>;
    fn read_u16(&mut self, linear: u32) -> Result<u16, BusFault>;
    fn read_u32(&mut self, linear: u32) -> Result<u32, BusFault>;

    fn write_u8(&mut self, linear: u32, val: u8) -> Result<(), BusFault>;
    fn write_u16(&mut self, linear: u32, val: u16) -> Result<(), BusFault>;
    fn write_u32(&mut self, linear: u32, val: u32) -> Result<(), BusFault>;

    /// Called whenever the engine changes the memory privilege level (MPL) used for
    /// user/supervisor page checks. `0` marks the engine's own system-structure
    /// accesses (descriptor tables, TSS); `3` restores normal CPL-based checks.
    #[inline]
    fn sync_access_level(&mut self, _mpl: u8) {}
}

/// Paging collaborator. Translation itself lives outside the engine.
pub trait PagingControl {
    /// Ring 3 <-> ring 0..2 transition while paging is enabled.
    fn switch_privilege(&mut self, is_ring3: bool);
    fn set_page_directory_base(&mut self, cr3: u32);
    fn set_paging_enabled(&mut self, enabled: bool);
}

/// Machine-level collaborators: reset wiring and the debugger hook.
pub trait SystemControl {
    /// Triple fault: the shutdown cycle resets the processor.
    fn reset_processor(&mut self);

    /// Invoked before a software interrupt or exception is dispatched.
    #[inline]
    fn before_interrupt(&mut self, _vector: u8, _kind: InterruptKind) {}
}

/// Everything the engine needs from the surrounding machine.
pub trait Machine: CpuBus + PagingControl + SystemControl {}

impl<T: CpuBus + PagingControl + SystemControl + ?Sized> Machine for T {}

impl<T: CpuBus + ?Sized> CpuBus for &mut T {
    #[inline]
    fn read_u8(&mut self, linear: u32) -> Result<u8, BusFault> {
        <T as CpuBus>::read_u8(&mut **self, linear)
    }

    #[inline]
    fn read_u16(&mut self, linear: u32) -> Result<u16, BusFault> {
        <T as CpuBus>::read_u16(&mut **self, linear)
    }

    #[inline]
    fn read_u32(&mut self, linear: u32) -> Result<u32, BusFault> {
        <T as CpuBus>::read_u32(&mut **self, linear)
    }

    #[inline]
    fn write_u8(&mut self, linear: u32, val: u8) -> Result<(), BusFault> {
        <T as CpuBus>::write_u8(&mut **self, linear, val)
    }

    #[inline]
    fn write_u16(&mut self, linear: u32, val: u16) -> Result<(), BusFault> {
        <T as CpuBus>::write_u16(&mut **self, linear, val)
    }

    #[inline]
    fn write_u32(&mut self, linear: u32, val: u32) -> Result<(), BusFault> {
        <T as CpuBus>::write_u32(&mut **self, linear, val)
    }

    #[inline]
    fn sync_access_level(&mut self, mpl: u8) {
        <T as CpuBus>::sync_access_level(&mut **self, mpl)
    }
}

impl<T: PagingControl + ?Sized> PagingControl for &mut T {
    #[inline]
    fn switch_privilege(&mut self, is_ring3: bool) {
        <T as PagingControl>::switch_privilege(&mut **self, is_ring3)
    }

    #[inline]
    fn set_page_directory_base(&mut self, cr3: u32) {
        <T as PagingControl>::set_page_directory_base(&mut **self, cr3)
    }

    #[inline]
    fn set_paging_enabled(&mut self, enabled: bool) {
        <T as PagingControl>::set_paging_enabled(&mut **self, enabled)
    }
}

impl<T: SystemControl + ?Sized> SystemControl for &mut T {
    #[inline]
    fn reset_processor(&mut self) {
        <T as SystemControl>::reset_processor(&mut **self)
    }

    #[inline]
    fn before_interrupt(&mut self, vector: u8, kind: InterruptKind) {
        <T as SystemControl>::before_interrupt(&mut **self, vector, kind)
    }
}
