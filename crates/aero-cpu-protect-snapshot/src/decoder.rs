use crate::error::{Result, SnapshotError};

/// Which instruction decoder the dispatcher was running when the record was taken.
///
/// The engine itself never looks at this; it is persisted so a restored machine resumes
/// with the same core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DecoderKind {
    #[default]
    Normal,
    Prefetch,
    Simple,
    Full,
    DynX86,
    NormalTrap,
    DynTrap,
    Hlt,
}

impl DecoderKind {
    pub const ALL: [DecoderKind; 8] = [
        DecoderKind::Normal,
        DecoderKind::Prefetch,
        DecoderKind::Simple,
        DecoderKind::Full,
        DecoderKind::DynX86,
        DecoderKind::NormalTrap,
        DecoderKind::DynTrap,
        DecoderKind::Hlt,
    ];

    /// Persisted index. The gaps leave room for more decoders of each family.
    pub const fn index(self) -> u16 {
        match self {
            DecoderKind::Normal => 0,
            DecoderKind::Prefetch => 1,
            DecoderKind::Simple => 2,
            DecoderKind::Full => 3,
            DecoderKind::DynX86 => 4,
            DecoderKind::NormalTrap => 100,
            DecoderKind::DynTrap => 101,
            DecoderKind::Hlt => 200,
        }
    }

    pub fn from_index(index: u16) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.index() == index)
            .ok_or(SnapshotError::UnknownDecoderKind(index))
    }

    pub fn name(self) -> &'static str {
        match self {
            DecoderKind::Normal => "normal",
            DecoderKind::Prefetch => "prefetch",
            DecoderKind::Simple => "simple",
            DecoderKind::Full => "full",
            DecoderKind::DynX86 => "dynamic_x86",
            DecoderKind::NormalTrap => "normal_trap",
            DecoderKind::DynTrap => "dyn_trap",
            DecoderKind::Hlt => "hlt",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_stable() {
        assert_eq!(DecoderKind::Hlt.index(), 200);
        assert_eq!(DecoderKind::from_index(101).unwrap(), DecoderKind::DynTrap);
        for kind in DecoderKind::ALL {
            assert_eq!(DecoderKind::from_index(kind.index()).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_index_is_rejected() {
        assert!(matches!(
            DecoderKind::from_index(5),
            Err(SnapshotError::UnknownDecoderKind(5))
        ));
    }
}
