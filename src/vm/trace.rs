//! Simulation harness: run a program while recording one trace row per
//! executed opcode.
//!
//! The trace is capped (default 1024 rows); when a run is longer, the
//! earliest rows are the ones retained. Rows flatten values to `i64` so the
//! record serializes cleanly for hosts that want JSON.

use serde::Serialize;

use super::host::HostHooks;
use super::interp::Vm;
use super::ops;

/// One executed step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRow {
    /// 1-based step number
    pub step: u64,
    /// Byte offset of the opcode before it ran
    pub pc: usize,
    /// Decoded opcode name
    pub op: &'static str,
    /// Stack pointer after the step; -1 when empty
    pub sp: i64,
    /// Top of stack after the step, flattened to i64
    pub top: Option<i64>,
}

/// The full result of a simulated run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub completed: bool,
    pub halted: bool,
    pub fault: Option<&'static str>,
    pub steps: u64,
    pub sp: i64,
    pub result: Option<i64>,
    /// Byte offset of the faulting token, when faulted
    pub pc: usize,
    pub trace: Vec<TraceRow>,
}

impl<H: HostHooks> Vm<H> {
    /// Run to completion, recording up to `trace_limit` rows (earliest
    /// retained). Resumes from a debug pause exactly like [`Vm::run`].
    pub fn simulate(&mut self, trace_limit: usize) -> RunResult {
        let mut trace: Vec<TraceRow> = Vec::new();

        if self.begin() {
            while self.is_running() {
                let pc_before = self.pc();
                let steps_before = self.steps();
                self.dispatch();

                // A dispatch that paused or trapped before decoding an
                // opcode did not execute a step and gets no row
                if self.steps() == steps_before {
                    continue;
                }
                if trace.len() < trace_limit {
                    let stack = self.stack_snapshot();
                    trace.push(TraceRow {
                        step: self.steps(),
                        pc: pc_before,
                        op: self.last_op_name(),
                        sp: stack.len() as i64 - 1,
                        top: stack.last().map(|v| v.as_i64_repr()),
                    });
                }
            }
        }

        let outcome = self.outcome();
        RunResult {
            completed: outcome.completed,
            halted: outcome.halted,
            fault: outcome.fault.map(|f| f.name()),
            steps: outcome.steps,
            sp: outcome.sp,
            result: outcome.result.map(|v| v.as_i64_repr()),
            pc: outcome.pc,
            trace,
        }
    }

    fn last_op_name(&self) -> &'static str {
        ops::opcode_name(self.last_opcode()).unwrap_or("?")
    }
}
