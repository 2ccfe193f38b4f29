use thiserror::Error;

use crate::exceptions::Vector;

pub type Result<T> = core::result::Result<T, Fault>;

/// Failure reported by the linear memory interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusFault {
    /// The paging unit refused the access; the guest must see #PF.
    #[error("page fault at {linear:#010x} (error code {error_code:#x})")]
    PageFault { linear: u32, error_code: u32 },

    /// Access outside of anything the host backs.
    #[error("unmapped linear address {linear:#010x}")]
    Unmapped { linear: u32 },
}

/// Outcome of a control transfer that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    /// Guest-visible exception. The transfer left no partial state behind.
    #[error("guest exception {vector:?} (error code {error_code:#x})")]
    Exception { vector: Vector, error_code: u32 },

    /// A memory access raised #PF. When this surfaces from past a commit point the
    /// documented rollback registers (ESP, SS, CPL) have already been restored.
    #[error("page fault at {linear:#010x} (error code {error_code:#x})")]
    PageFault { linear: u32, error_code: u32 },

    /// Exception delivery failed while a double fault was already being delivered.
    #[error("triple fault")]
    TripleFault,

    /// A descriptor shape that earlier validation should have excluded. Emulation
    /// cannot continue with well-defined state.
    #[error("emulator invariant violated: {0}")]
    InvariantViolation(String),
}

impl Fault {
    #[inline]
    pub const fn gp(error_code: u32) -> Self {
        Fault::Exception {
            vector: Vector::GeneralProtection,
            error_code,
        }
    }

    #[inline]
    pub const fn gp0() -> Self {
        Self::gp(0)
    }

    #[inline]
    pub const fn np(error_code: u32) -> Self {
        Fault::Exception {
            vector: Vector::SegmentNotPresent,
            error_code,
        }
    }

    #[inline]
    pub const fn ss(error_code: u32) -> Self {
        Fault::Exception {
            vector: Vector::StackFault,
            error_code,
        }
    }

    #[inline]
    pub const fn ts(error_code: u32) -> Self {
        Fault::Exception {
            vector: Vector::InvalidTss,
            error_code,
        }
    }

    #[inline]
    pub const fn ud() -> Self {
        Fault::Exception {
            vector: Vector::InvalidOpcode,
            error_code: 0,
        }
    }

    /// Logs the message at error level and wraps it.
    pub fn invariant(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!("{msg}");
        Fault::InvariantViolation(msg)
    }

    /// Whether the guest OS can in principle handle this fault.
    pub fn is_guest_fault(&self) -> bool {
        matches!(self, Fault::Exception { .. } | Fault::PageFault { .. })
    }
}

impl From<BusFault> for Fault {
    fn from(value: BusFault) -> Self {
        match value {
            BusFault::PageFault { linear, error_code } => Fault::PageFault { linear, error_code },
            BusFault::Unmapped { linear } => {
                Fault::invariant(format!("access to unmapped linear address {linear:#010x}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_page_fault_keeps_address_and_code() {
        let fault: Fault = BusFault::PageFault {
            linear: 0x1234_5000,
            error_code: 6,
        }
        .into();
        assert_eq!(
            fault,
            Fault::PageFault {
                linear: 0x1234_5000,
                error_code: 6
            }
        );
        assert!(fault.is_guest_fault());
    }

    #[test]
    fn unmapped_access_is_not_guest_visible() {
        let fault: Fault = BusFault::Unmapped { linear: 0xdead_0000 }.into();
        assert!(matches!(fault, Fault::InvariantViolation(_)));
        assert!(!fault.is_guest_fault());
    }
}
