//! Runtime configuration types.

use std::path::Path;

use serde::Deserialize;

use crate::vm::interp::{CALL_DEPTH_DEFAULT, STACK_DEFAULT, STACK_MAX};

/// Resource budgets and runtime knobs for a VM instance.
///
/// Every field has a conservative default; hosts tighten or relax them per
/// session. A `gas_limit` of 0 disables gas metering entirely.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Maximum opcodes executed per run
    pub step_limit: u64,
    /// Gas budget per run (0 = metering off)
    pub gas_limit: u64,
    /// Maximum nested `CL` depth
    pub call_depth_limit: usize,
    /// Data stack bound (clamped to `STACK_MAX`)
    pub stack_limit: usize,
    /// Whether the collector runs automatically at the allocation threshold
    pub auto_gc: bool,
    /// Allocation-count threshold for automatic collection
    pub gc_threshold: usize,
    /// Hard limit on heap size in bytes (None = unlimited)
    pub heap_limit: Option<usize>,
    /// Maximum rows retained by the simulation trace
    pub trace_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            step_limit: 1_000_000,
            gas_limit: 0,
            call_depth_limit: CALL_DEPTH_DEFAULT,
            stack_limit: STACK_DEFAULT,
            auto_gc: true,
            gc_threshold: 4096,
            heap_limit: None,
            trace_limit: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let mut config: RuntimeConfig =
            toml::from_str(&text).map_err(|e| format!("invalid config: {}", e))?;
        config.stack_limit = config.stack_limit.min(STACK_MAX);
        Ok(config)
    }
}
