//! Architectural exception vectors.

/// Architecturally defined x86 exception vectors used by the protection engine.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vector {
    DivideError = 0,          // #DE
    Debug = 1,                // #DB
    NonMaskableInterrupt = 2, // NMI
    Breakpoint = 3,           // #BP
    Overflow = 4,             // #OF
    BoundRangeExceeded = 5,   // #BR
    InvalidOpcode = 6,        // #UD
    DeviceNotAvailable = 7,   // #NM
    DoubleFault = 8,          // #DF
    InvalidTss = 10,          // #TS
    SegmentNotPresent = 11,   // #NP
    StackFault = 12,          // #SS
    GeneralProtection = 13,   // #GP
    PageFault = 14,           // #PF
    X87Fpu = 16,              // #MF
    AlignmentCheck = 17,      // #AC
    MachineCheck = 18,        // #MC
    SimdFloatingPoint = 19,   // #XM
}

impl Vector {
    #[inline]
    pub const fn number(self) -> u8 {
        self as u8
    }

    pub const fn from_number(n: u8) -> Option<Self> {
        Some(match n {
            0 => Vector::DivideError,
            1 => Vector::Debug,
            2 => Vector::NonMaskableInterrupt,
            3 => Vector::Breakpoint,
            4 => Vector::Overflow,
            5 => Vector::BoundRangeExceeded,
            6 => Vector::InvalidOpcode,
            7 => Vector::DeviceNotAvailable,
            8 => Vector::DoubleFault,
            10 => Vector::InvalidTss,
            11 => Vector::SegmentNotPresent,
            12 => Vector::StackFault,
            13 => Vector::GeneralProtection,
            14 => Vector::PageFault,
            16 => Vector::X87Fpu,
            17 => Vector::AlignmentCheck,
            18 => Vector::MachineCheck,
            19 => Vector::SimdFloatingPoint,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Vector;

    #[test]
    fn numbers_round_trip_for_defined_vectors() {
        for n in 0u8..32 {
            if let Some(v) = Vector::from_number(n) {
                assert_eq!(v.number(), n);
            }
        }
        assert_eq!(Vector::from_number(9), None);
        assert_eq!(Vector::from_number(15), None);
    }
}
