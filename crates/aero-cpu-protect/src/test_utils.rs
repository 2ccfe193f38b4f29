use core::ops::Range;

use crate::error::BusFault;
use crate::interrupt::InterruptKind;
use crate::mem::{CpuBus, PagingControl, SystemControl};

/// Paging notifications recorded by [`FlatTestBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingEvent {
    SwitchPrivilege { is_ring3: bool },
    SetDirectoryBase(u32),
    SetEnabled(bool),
}

#[derive(Debug, Clone)]
struct InjectedFault {
    range: Range<u32>,
    error_code: u32,
    writes_only: bool,
}

/// Identity-mapped memory bus used by unit tests.
///
/// Doubles as the paging and system collaborator: every notification is recorded so
/// tests can assert on them. Page faults can be injected over linear ranges.
#[derive(Debug, Clone)]
pub struct FlatTestBus {
    mem: Vec<u8>,
    faults: Vec<InjectedFault>,
    pub paging_events: Vec<PagingEvent>,
    pub resets: u32,
    pub dispatched: Vec<(u8, InterruptKind)>,
    pub access_level: u8,
}

impl FlatTestBus {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            faults: Vec::new(),
            paging_events: Vec::new(),
            resets: 0,
            dispatched: Vec::new(),
            access_level: 3,
        }
    }

    pub fn load(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        self.mem[start..end].copy_from_slice(data);
    }

    pub fn slice(&self, addr: u32, len: usize) -> &[u8] {
        let start = addr as usize;
        let end = start + len;
        &self.mem[start..end]
    }

    /// Make every access (read or write) inside `range` raise #PF.
    pub fn inject_page_fault(&mut self, range: Range<u32>, error_code: u32) {
        self.faults.push(InjectedFault {
            range,
            error_code,
            writes_only: false,
        });
    }

    /// Make writes inside `range` raise #PF while reads still succeed.
    pub fn inject_write_fault(&mut self, range: Range<u32>, error_code: u32) {
        self.faults.push(InjectedFault {
            range,
            error_code,
            writes_only: true,
        });
    }

    pub fn clear_injected_faults(&mut self) {
        self.faults.clear();
    }

    fn check(&self, linear: u32, len: u32, write: bool) -> Result<usize, BusFault> {
        for f in &self.faults {
            if f.writes_only && !write {
                continue;
            }
            let last = linear.wrapping_add(len - 1);
            if f.range.contains(&linear) || f.range.contains(&last) {
                return Err(BusFault::PageFault {
                    linear,
                    error_code: f.error_code,
                });
            }
        }
        let end = linear as usize + len as usize;
        if end > self.mem.len() {
            return Err(BusFault::Unmapped { linear });
        }
        Ok(linear as usize)
    }

    fn read_le<const N: usize>(&self, linear: u32) -> Result<[u8; N], BusFault> {
        let start = self.check(linear, N as u32, false)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(&self.mem[start..start + N]);
        Ok(buf)
    }

    fn write_le<const N: usize>(&mut self, linear: u32, bytes: [u8; N]) -> Result<(), BusFault> {
        let start = self.check(linear, N as u32, true)?;
        self.mem[start..start + N].copy_from_slice(&bytes);
        Ok(())
    }
}

impl CpuBus for FlatTestBus {
    fn read_u8(&mut self, linear: u32) -> Result<u8, BusFault> {
        Ok(self.read_le::<1>(linear)?[0])
    }

    fn read_u16(&mut self, linear: u32) -> Result<u16, BusFault> {
        Ok(u16::from_le_bytes(self.read_le(linear)?))
    }

    fn read_u32(&mut self, linear: u32) -> Result<u32, BusFault> {
        Ok(u32::from_le_bytes(self.read_le(linear)?))
    }

    fn write_u8(&mut self, linear: u32, val: u8) -> Result<(), BusFault> {
        self.write_le(linear, [val])
    }

    fn write_u16(&mut self, linear: u32, val: u16) -> Result<(), BusFault> {
        self.write_le(linear, val.to_le_bytes())
    }

    fn write_u32(&mut self, linear: u32, val: u32) -> Result<(), BusFault> {
        self.write_le(linear, val.to_le_bytes())
    }

    fn sync_access_level(&mut self, mpl: u8) {
        self.access_level = mpl;
    }
}

impl PagingControl for FlatTestBus {
    fn switch_privilege(&mut self, is_ring3: bool) {
        self.paging_events
            .push(PagingEvent::SwitchPrivilege { is_ring3 });
    }

    fn set_page_directory_base(&mut self, cr3: u32) {
        self.paging_events.push(PagingEvent::SetDirectoryBase(cr3));
    }

    fn set_paging_enabled(&mut self, enabled: bool) {
        self.paging_events.push(PagingEvent::SetEnabled(enabled));
    }
}

impl SystemControl for FlatTestBus {
    fn reset_processor(&mut self) {
        self.resets += 1;
    }

    fn before_interrupt(&mut self, vector: u8, kind: InterruptKind) {
        self.dispatched.push((vector, kind));
    }
}
