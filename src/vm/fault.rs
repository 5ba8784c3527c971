/// Every way a program can stop abnormally.
///
/// A fault ends the current run; the program cannot catch it. `Breakpoint`
/// and `DebugStep` are cooperative pauses and may be resumed; everything
/// else requires a `reset`. The loader and validator report through the
/// same taxonomy, so a rejected program and a trapped program speak the
/// same language to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    // Structural
    BadEncoding,
    UnknownOp,
    PcOob,
    // Stack
    StackOverflow,
    StackUnderflow,
    RetStackOverflow,
    RetStackUnderflow,
    // Index
    LocalsOob,
    GlobalsOob,
    IndexOob,
    // Arithmetic
    DivByZero,
    ModByZero,
    // Types
    TypeMismatch,
    // Arguments
    BadArg,
    // Resources
    StepLimit,
    GasExhausted,
    CallDepthLimit,
    OutOfMemory,
    // Policy
    Unauthorized,
    // Diagnostic
    AssertFailed,
    // Debug pauses, not true errors
    Breakpoint,
    DebugStep,
}

impl Fault {
    /// Stable display name. Part of the ABI; fault payloads are not.
    pub fn name(&self) -> &'static str {
        match self {
            Fault::BadEncoding => "BadEncoding",
            Fault::UnknownOp => "UnknownOp",
            Fault::PcOob => "PcOob",
            Fault::StackOverflow => "StackOverflow",
            Fault::StackUnderflow => "StackUnderflow",
            Fault::RetStackOverflow => "RetStackOverflow",
            Fault::RetStackUnderflow => "RetStackUnderflow",
            Fault::LocalsOob => "LocalsOob",
            Fault::GlobalsOob => "GlobalsOob",
            Fault::IndexOob => "IndexOob",
            Fault::DivByZero => "DivByZero",
            Fault::ModByZero => "ModByZero",
            Fault::TypeMismatch => "TypeMismatch",
            Fault::BadArg => "BadArg",
            Fault::StepLimit => "StepLimit",
            Fault::GasExhausted => "GasExhausted",
            Fault::CallDepthLimit => "CallDepthLimit",
            Fault::OutOfMemory => "OutOfMemory",
            Fault::Unauthorized => "Unauthorized",
            Fault::AssertFailed => "AssertFailed",
            Fault::Breakpoint => "Breakpoint",
            Fault::DebugStep => "DebugStep",
        }
    }

    /// Whether a run stopped on this fault may be resumed with `run`.
    pub fn is_debug_pause(&self) -> bool {
        matches!(self, Fault::Breakpoint | Fault::DebugStep)
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::error::Error for Fault {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_stable() {
        assert_eq!(Fault::Unauthorized.name(), "Unauthorized");
        assert_eq!(Fault::DivByZero.to_string(), "DivByZero");
    }

    #[test]
    fn test_debug_pauses() {
        assert!(Fault::Breakpoint.is_debug_pause());
        assert!(Fault::DebugStep.is_debug_pause());
        assert!(!Fault::StepLimit.is_debug_pause());
    }
}
