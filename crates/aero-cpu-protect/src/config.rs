/// Host-selectable behaviour of the protection engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectConfig {
    /// Track per-vector nesting so a fault raised while the same vector is still
    /// being delivered escalates to #DF.
    pub double_fault_enable: bool,
    /// A fault while #DF is in progress resets the processor through
    /// [`crate::SystemControl::reset_processor`].
    pub triple_fault_reset: bool,
    /// Log every double fault rather than only the first.
    pub always_report_double_fault: bool,
    /// Log every triple fault rather than only the first.
    pub always_report_triple_fault: bool,
    /// When `false`, protected-mode segment loads set the cached limit to `u32::MAX`.
    pub enforce_segment_limits: bool,
    /// Initial state of the NMI gate.
    pub nmi_gate: bool,
    /// Upper bound on nested exception redispatch before giving up with a triple fault.
    pub max_exception_depth: u32,
}

impl Default for ProtectConfig {
    fn default() -> Self {
        Self {
            double_fault_enable: true,
            triple_fault_reset: true,
            always_report_double_fault: false,
            always_report_triple_fault: false,
            enforce_segment_limits: true,
            nmi_gate: true,
            max_exception_depth: 32,
        }
    }
}
