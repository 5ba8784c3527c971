//! The interpreter: fetch/decode/dispatch over the loaded byte buffer.
//!
//! One opcode per step until `HALT`, a trap, or a budget runs out. Handlers
//! check their own stack preconditions and read their operand varints from
//! `pc`, always leaving `pc` token-aligned. Every trap sets the fault slot
//! and clears `running`; nothing is ever retried.

use super::fault::Fault;
use super::heap::{GcRef, Heap, HeapObject};
use super::host::HostHooks;
use super::loader::{self, LoadError};
use super::ops::{self, Operand};
use super::varint;
use super::{CapSet, Program, Value};
use crate::config::RuntimeConfig;

/// Hard ceiling on the data stack; `stack_limit` may not exceed it.
pub const STACK_MAX: usize = 1024;
/// Default data stack bound.
pub const STACK_DEFAULT: usize = 256;
/// Return/frame stack bound.
pub const RET_STACK_MAX: usize = 32;
/// Default call depth limit.
pub const CALL_DEPTH_DEFAULT: usize = 32;
/// Locals array size.
pub const LOCALS_SIZE: usize = 64;
/// Globals array size.
pub const GLOBALS_SIZE: usize = 128;

/// VM execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Stopped,
    Running,
    Faulted,
}

/// What a finished `run` looks like to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// True when the run ended without a fault
    pub completed: bool,
    /// True once the VM is no longer running
    pub halted: bool,
    pub fault: Option<Fault>,
    pub steps: u64,
    /// Stack pointer after the run; -1 for an empty stack
    pub sp: i64,
    /// Top of stack, the conventional result slot
    pub result: Option<Value>,
    /// Byte offset of the faulting token, when faulted
    pub pc: usize,
}

/// A call frame: the caller's locals and where to resume.
#[derive(Debug)]
struct Frame {
    saved_locals: Vec<Value>,
    return_pc: usize,
}

/// Armed by a truthy `IF`: when the then-arm's closing `E` executes at this
/// frame depth, control moves to the merge token past the else block.
#[derive(Debug, Clone, Copy)]
struct ElseSkip {
    e_token: usize,
    merge_token: usize,
    depth: usize,
}

#[derive(Debug, Clone, Copy)]
struct Breakpoint {
    pc: usize,
    id: u32,
}

/// A virtual machine session around one loaded program.
pub struct Vm<H: HostHooks> {
    program: Program,
    hooks: H,

    stack: Vec<Value>,
    frames: Vec<Frame>,
    locals: Vec<Value>,
    globals: Vec<Value>,
    caps: CapSet,
    heap: Heap,

    pc: usize,
    running: bool,
    fault: Option<Fault>,
    steps: u64,
    gas: u64,

    last_pc: usize,
    last_op_index: usize,
    last_opcode: u32,

    step_limit: u64,
    gas_limit: u64,
    call_depth_limit: usize,
    stack_limit: usize,

    breakpoints: Vec<Breakpoint>,
    pending_skips: Vec<ElseSkip>,
    step_latch: u8,
    bp_resume: bool,
}

impl<H: HostHooks> Vm<H> {
    /// Load (and lower) a raw program and wrap it in a fresh VM session.
    pub fn init(bytes: &[u8], hooks: H) -> Result<Self, LoadError> {
        Self::with_config(bytes, hooks, &RuntimeConfig::default())
    }

    pub fn with_config(
        bytes: &[u8],
        hooks: H,
        config: &RuntimeConfig,
    ) -> Result<Self, LoadError> {
        let program = loader::load(bytes)?;
        Ok(Self {
            program,
            hooks,
            stack: Vec::new(),
            frames: Vec::new(),
            locals: vec![Value::Int(0); LOCALS_SIZE],
            globals: vec![Value::Int(0); GLOBALS_SIZE],
            caps: CapSet::new(),
            heap: Heap::with_config(config.heap_limit, config.auto_gc, config.gc_threshold),
            pc: 0,
            running: false,
            fault: None,
            steps: 0,
            gas: 0,
            last_pc: 0,
            last_op_index: 0,
            last_opcode: u32::MAX,
            step_limit: config.step_limit,
            gas_limit: config.gas_limit,
            call_depth_limit: config.call_depth_limit.min(RET_STACK_MAX),
            stack_limit: config.stack_limit.min(STACK_MAX),
            breakpoints: Vec::new(),
            pending_skips: Vec::new(),
            step_latch: 0,
            bp_resume: false,
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn host(&self) -> &H {
        &self.hooks
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn set_step_limit(&mut self, limit: u64) {
        self.step_limit = limit;
    }

    pub fn set_gas_limit(&mut self, limit: u64) {
        self.gas_limit = limit;
    }

    pub fn set_call_depth_limit(&mut self, limit: usize) {
        self.call_depth_limit = limit.min(RET_STACK_MAX);
    }

    pub fn set_stack_limit(&mut self, limit: usize) {
        self.stack_limit = limit.min(STACK_MAX);
    }

    pub fn mode(&self) -> Mode {
        if self.running {
            Mode::Running
        } else {
            match self.fault {
                Some(f) if !f.is_debug_pause() => Mode::Faulted,
                _ => Mode::Stopped,
            }
        }
    }

    pub fn fault(&self) -> Option<Fault> {
        self.fault
    }

    /// Stable name of the current fault, or "ok".
    pub fn fault_string(&self) -> &'static str {
        self.fault.map(|f| f.name()).unwrap_or("ok")
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn gas(&self) -> u64 {
        self.gas
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn last_pc(&self) -> usize {
        self.last_pc
    }

    pub fn last_opcode(&self) -> u32 {
        self.last_opcode
    }

    /// Copy of the data stack, bottom first.
    pub fn stack_snapshot(&self) -> Vec<Value> {
        self.stack.clone()
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Installed breakpoints as (byte offset, id) pairs.
    pub fn breakpoints(&self) -> Vec<(usize, u32)> {
        self.breakpoints.iter().map(|b| (b.pc, b.id)).collect()
    }

    /// Allocate a string on this VM's heap and hand back the reference
    /// value. Hosts use this to feed string data through `io_read`; the
    /// program sees it as an ordinary `StringRef`. The collector cannot see
    /// host-held values, so hand the reference to the program before any
    /// collection can run.
    pub fn intern_string(&mut self, text: &str) -> Result<Value, Fault> {
        let r = self.heap.alloc_string(text.to_string())?;
        Ok(Value::StringRef(r))
    }

    /// Back to Stopped with clean stacks, counters, fault, and capabilities.
    /// The loaded program, limits, host, heap allocation list, and
    /// breakpoints survive.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.locals.fill(Value::Int(0));
        self.globals.fill(Value::Int(0));
        self.caps.clear();
        self.pc = 0;
        self.running = false;
        self.fault = None;
        self.steps = 0;
        self.gas = 0;
        self.last_pc = 0;
        self.last_op_index = 0;
        self.last_opcode = u32::MAX;
        self.pending_skips.clear();
        self.step_latch = 0;
        self.bp_resume = false;
    }

    /// Run until `HALT`, a trap, or a budget limit.
    ///
    /// A VM paused on `Breakpoint`/`DebugStep` resumes; any other fault
    /// keeps the VM stopped until `reset`.
    pub fn run(&mut self) -> RunOutcome {
        if !self.begin() {
            return self.outcome();
        }
        while self.running {
            self.dispatch();
        }
        self.outcome()
    }

    /// Execute at most one opcode. Used by hosts driving their own
    /// wall-clock budgets.
    pub fn step(&mut self) -> RunOutcome {
        if self.begin() {
            self.dispatch();
            self.running = false;
        }
        self.outcome()
    }

    /// Shared entry: resume from a debug pause, refuse to run a faulted VM.
    pub(crate) fn begin(&mut self) -> bool {
        match self.fault {
            Some(Fault::Breakpoint) => {
                self.fault = None;
                self.bp_resume = true;
            }
            Some(Fault::DebugStep) => {
                self.fault = None;
            }
            Some(_) => return false,
            None => {}
        }
        self.running = true;
        true
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    pub(crate) fn outcome(&self) -> RunOutcome {
        RunOutcome {
            completed: self.fault.is_none(),
            halted: !self.running,
            fault: self.fault,
            steps: self.steps,
            sp: self.stack.len() as i64 - 1,
            result: self.stack.last().copied(),
            pc: self.last_pc,
        }
    }

    /// One iteration of the fetch/decode/dispatch loop.
    pub(crate) fn dispatch(&mut self) {
        if !self.running {
            return;
        }
        if self.pc >= self.program.bytes().len() {
            return self.trap(Fault::PcOob);
        }

        // Breakpoints pause before the opcode runs and before it costs a
        // step; resuming skips the check once so execution can proceed.
        if !self.bp_resume && self.breakpoints.iter().any(|b| b.pc == self.pc) {
            self.fault = Some(Fault::Breakpoint);
            self.running = false;
            return;
        }
        self.bp_resume = false;

        self.steps += 1;
        if self.steps > self.step_limit {
            return self.trap(Fault::StepLimit);
        }

        self.last_pc = self.pc;
        self.last_op_index = match self.program.token_at_byte(self.pc) {
            Some(idx) => idx,
            None => return self.trap(Fault::AssertFailed),
        };

        let (opcode, n) = match varint::decode_u32(&self.program.bytes()[self.pc..]) {
            Ok(v) => v,
            Err(_) => return self.trap(Fault::BadEncoding),
        };
        self.pc += n;
        self.last_opcode = opcode;

        if self.gas_limit > 0 {
            self.gas += ops::gas_cost(opcode);
            if self.gas > self.gas_limit {
                return self.trap(Fault::GasExhausted);
            }
        }

        if let Err(f) = self.exec(opcode) {
            return self.trap(f);
        }

        if self.step_latch > 0 && self.running {
            self.step_latch -= 1;
            if self.step_latch == 0 {
                self.fault = Some(Fault::DebugStep);
                self.running = false;
            }
        }
    }

    fn trap(&mut self, fault: Fault) {
        self.fault = Some(fault);
        self.running = false;
    }

    // ----- stack and operand helpers ------------------------------------

    fn push(&mut self, v: Value) -> Result<(), Fault> {
        if self.stack.len() >= self.stack_limit {
            return Err(Fault::StackOverflow);
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, Fault> {
        self.stack.pop().ok_or(Fault::StackUnderflow)
    }

    fn pop_int(&mut self) -> Result<i64, Fault> {
        self.pop()?.as_int().ok_or(Fault::TypeMismatch)
    }

    fn read_u32(&mut self) -> Result<u32, Fault> {
        let (v, n) =
            varint::decode_u32(&self.program.bytes()[self.pc..]).map_err(|_| Fault::BadEncoding)?;
        self.pc += n;
        Ok(v)
    }

    fn read_i64(&mut self) -> Result<i64, Fault> {
        let (v, n) =
            varint::decode_i64(&self.program.bytes()[self.pc..]).map_err(|_| Fault::BadEncoding)?;
        self.pc += n;
        Ok(v)
    }

    /// Set `pc` to the start of a token. An index one past the end parks
    /// `pc` at the buffer end, which the next dispatch reports as `PcOob`.
    fn goto_token(&mut self, index: usize) -> Result<(), Fault> {
        match self.program.token_offset(index) {
            Some(off) => {
                self.pc = off;
                Ok(())
            }
            None if index == self.program.token_count() => {
                self.pc = self.program.bytes().len();
                Ok(())
            }
            None => Err(Fault::PcOob),
        }
    }

    /// Matching `E` for the `B` at `open`, by depth count. The only way the
    /// interpreter understands structured blocks.
    fn matching_end(&self, open: usize) -> Result<usize, Fault> {
        let tokens = self.program.tokens();
        let mut depth = 0usize;
        for (i, t) in tokens.iter().enumerate().skip(open) {
            match t.opcode {
                ops::OP_B => depth += 1,
                ops::OP_E => {
                    depth = depth.checked_sub(1).ok_or(Fault::BadArg)?;
                    if depth == 0 {
                        return Ok(i);
                    }
                }
                _ => {}
            }
        }
        Err(Fault::BadArg)
    }

    fn expect_block(&self, at: usize) -> Result<(usize, usize), Fault> {
        match self.program.tokens().get(at).map(|t| t.opcode) {
            Some(ops::OP_B) => Ok((at, self.matching_end(at)?)),
            _ => Err(Fault::BadArg),
        }
    }

    /// GC roots: everything on the data stack, locals, globals, and every
    /// saved frame.
    fn gc_roots(&self) -> Vec<GcRef> {
        self.stack
            .iter()
            .chain(self.locals.iter())
            .chain(self.globals.iter())
            .chain(self.frames.iter().flat_map(|f| f.saved_locals.iter()))
            .filter_map(|v| v.as_ref())
            .collect()
    }

    fn collect_garbage(&mut self) -> usize {
        let roots = self.gc_roots();
        let before = self.heap.object_count();
        let freed = self.heap.collect(&roots);
        self.hooks
            .trace(0, &format!("gc: freed {} of {} objects", freed, before));
        freed
    }

    fn maybe_auto_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    // ----- handlers -----------------------------------------------------

    fn exec(&mut self, opcode: u32) -> Result<(), Fault> {
        match opcode {
            ops::OP_HALT => {
                self.running = false;
            }
            ops::OP_LIT => {
                let v = self.read_i64()?;
                self.push(Value::Int(v))?;
            }
            ops::OP_V => {
                let i = self.read_u32()? as usize;
                if i >= LOCALS_SIZE {
                    return Err(Fault::LocalsOob);
                }
                self.push(self.locals[i])?;
            }
            ops::OP_LET => {
                let i = self.read_u32()? as usize;
                if i >= LOCALS_SIZE {
                    return Err(Fault::LocalsOob);
                }
                self.locals[i] = self.pop()?;
            }
            ops::OP_SET => {
                let i = self.read_u32()? as usize;
                if i >= GLOBALS_SIZE {
                    return Err(Fault::GlobalsOob);
                }
                self.globals[i] = self.pop()?;
            }

            ops::OP_ADD => self.binary_int(|a, b| Ok(a.wrapping_add(b)))?,
            ops::OP_SUB => self.binary_int(|a, b| Ok(a.wrapping_sub(b)))?,
            ops::OP_MUL => self.binary_int(|a, b| Ok(a.wrapping_mul(b)))?,
            ops::OP_DIV => {
                let b = self.pop_int()?;
                if b == 0 {
                    return Err(Fault::DivByZero);
                }
                let a = self.pop_int()?;
                self.push(Value::Int(a.wrapping_div(b)))?;
            }
            ops::OP_MOD => {
                let b = self.pop_int()?;
                if b == 0 {
                    return Err(Fault::ModByZero);
                }
                let a = self.pop_int()?;
                // C-style remainder: sign follows the dividend
                self.push(Value::Int(a.wrapping_rem(b)))?;
            }
            ops::OP_NEG => {
                let a = self.pop_int()?;
                self.push(Value::Int(a.wrapping_neg()))?;
            }
            ops::OP_AND => self.binary_int(|a, b| Ok(a & b))?,
            ops::OP_OR => self.binary_int(|a, b| Ok(a | b))?,
            ops::OP_XOR => self.binary_int(|a, b| Ok(a ^ b))?,
            ops::OP_SHL => self.binary_int(|a, b| Ok(a << (b & 63)))?,
            ops::OP_SHR => self.binary_int(|a, b| Ok(a >> (b & 63)))?,
            ops::OP_NOT => {
                let a = self.pop_int()?;
                self.push(Value::Int(!a))?;
            }

            ops::OP_LT => self.compare_int(|a, b| a < b)?,
            ops::OP_GT => self.compare_int(|a, b| a > b)?,
            ops::OP_LE => self.compare_int(|a, b| a <= b)?,
            ops::OP_GE => self.compare_int(|a, b| a >= b)?,
            ops::OP_EQ => {
                let b = self.pop()?;
                let a = self.pop()?;
                let r = a.same_kind_eq(&b).unwrap_or(false);
                self.push(Value::Int(r as i64))?;
            }
            ops::OP_NEQ => {
                let b = self.pop()?;
                let a = self.pop()?;
                // Mixed kinds compare as 0, same as EQ
                let r = a.same_kind_eq(&b).map(|eq| !eq).unwrap_or(false);
                self.push(Value::Int(r as i64))?;
            }

            ops::OP_DUP => {
                let top = *self.stack.last().ok_or(Fault::StackUnderflow)?;
                self.push(top)?;
            }
            ops::OP_DRP => {
                self.pop()?;
            }
            ops::OP_ROT => {
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(c)?;
                self.push(a)?;
            }
            ops::OP_SWP => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)?;
            }

            ops::OP_B | ops::OP_PH => {}
            ops::OP_E => {
                if let Some(skip) = self.pending_skips.last().copied()
                    && skip.e_token == self.last_op_index
                    && skip.depth == self.frames.len()
                {
                    self.pending_skips.pop();
                    self.goto_token(skip.merge_token)?;
                }
            }
            ops::OP_IF => self.exec_if()?,
            ops::OP_WH | ops::OP_FR => {
                // Structured loops never survive loading
                return Err(Fault::UnknownOp);
            }

            ops::OP_NEWARR => {
                let size = self.pop_int()?;
                if size < 0 {
                    return Err(Fault::BadArg);
                }
                self.maybe_auto_collect();
                let r = self.heap.alloc_array(size as usize)?;
                self.push(Value::ArrayRef(r))?;
            }
            ops::OP_IDX => {
                let idx = self.pop_int()?;
                let r = match self.pop()? {
                    Value::ArrayRef(r) => r,
                    _ => return Err(Fault::TypeMismatch),
                };
                let elems = self
                    .heap
                    .get(r)
                    .and_then(HeapObject::as_array)
                    .ok_or(Fault::TypeMismatch)?;
                if idx < 0 || idx as usize >= elems.len() {
                    return Err(Fault::IndexOob);
                }
                let v = elems[idx as usize];
                self.push(v)?;
            }
            ops::OP_STO => {
                let val = self.pop()?;
                let idx = self.pop_int()?;
                let r = match self.pop()? {
                    Value::ArrayRef(r) => r,
                    _ => return Err(Fault::TypeMismatch),
                };
                let elems = self
                    .heap
                    .get_mut(r)
                    .and_then(HeapObject::as_array_mut)
                    .ok_or(Fault::TypeMismatch)?;
                if idx < 0 || idx as usize >= elems.len() {
                    return Err(Fault::IndexOob);
                }
                elems[idx as usize] = val;
                self.push(Value::ArrayRef(r))?;
            }
            ops::OP_LEN => {
                let r = self.pop()?.as_ref().ok_or(Fault::TypeMismatch)?;
                let len = self.heap.get(r).ok_or(Fault::TypeMismatch)?.len();
                self.push(Value::Int(len as i64))?;
            }

            ops::OP_FN => {
                let _arity = self.read_u32()?;
                let (_, e) = self.expect_block(self.last_op_index + 1)?;
                self.goto_token(e + 1)?;
            }
            ops::OP_CL => self.exec_call()?,
            ops::OP_RT => self.exec_return()?,

            ops::OP_JMP => {
                let off = self.read_i64()?;
                self.jump_relative(off)?;
            }
            ops::OP_JZ => {
                let off = self.read_i64()?;
                let cond = self.pop()?;
                if !cond.is_truthy() {
                    self.jump_relative(off)?;
                }
            }
            ops::OP_JNZ => {
                let off = self.read_i64()?;
                let cond = self.pop()?;
                if cond.is_truthy() {
                    self.jump_relative(off)?;
                }
            }

            ops::OP_IOW => {
                let device = self.read_u32()?;
                if device > 255 {
                    return Err(Fault::BadArg);
                }
                if !self.caps.test(device) {
                    return Err(Fault::Unauthorized);
                }
                let value = self.pop()?;
                self.hooks.io_write(device as u8, value);
            }
            ops::OP_IOR => {
                let device = self.read_u32()?;
                if device > 255 {
                    return Err(Fault::BadArg);
                }
                if !self.caps.test(device) {
                    return Err(Fault::Unauthorized);
                }
                let value = self.hooks.io_read(device as u8);
                self.push(value)?;
            }
            ops::OP_GTWAY => {
                let cap = self.read_u32()?;
                if cap > 255 {
                    return Err(Fault::BadArg);
                }
                self.caps.set(cap);
            }
            ops::OP_WAIT => {
                let ms = self.read_u32()?;
                self.hooks.sleep(ms);
            }
            ops::OP_TRACE => {
                let level = self.read_u32()?;
                let msg = format!(
                    "pc={} op={} sp={}",
                    self.last_pc,
                    ops::opcode_name(self.last_opcode).unwrap_or("?"),
                    self.stack.len() as i64 - 1
                );
                self.hooks.trace(level, &msg);
            }
            ops::OP_GC => {
                self.collect_garbage();
            }
            ops::OP_BP => {
                let id = self.read_u32()?;
                let pc = self.last_pc;
                if !self.breakpoints.iter().any(|b| b.pc == pc) {
                    self.breakpoints.push(Breakpoint { pc, id });
                }
            }
            ops::OP_STEP => {
                // Latch counts down at the end of each dispatch: one tick
                // for STEP itself, then the next opcode runs and pauses
                self.step_latch = 2;
            }

            ops::OP_ALLOC => {
                let size = self.pop_int()?;
                self.maybe_auto_collect();
                let r = self.heap.alloc_opaque(size)?;
                self.push(Value::OpaqueRef(r))?;
            }
            ops::OP_FREE => {
                let r = match self.pop()? {
                    Value::OpaqueRef(r) => r,
                    _ => return Err(Fault::TypeMismatch),
                };
                // A stale reference may point at a recycled slot; only a
                // live opaque buffer can be released
                match self.heap.get(r) {
                    Some(HeapObject::Opaque { .. }) => {
                        self.heap.release(r);
                    }
                    _ => return Err(Fault::TypeMismatch),
                }
            }

            _ => return Err(Fault::UnknownOp),
        }
        Ok(())
    }

    fn binary_int(&mut self, f: impl Fn(i64, i64) -> Result<i64, Fault>) -> Result<(), Fault> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.push(Value::Int(f(a, b)?))
    }

    fn compare_int(&mut self, f: impl Fn(i64, i64) -> bool) -> Result<(), Fault> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.push(Value::Int(f(a, b) as i64))
    }

    fn jump_relative(&mut self, off: i64) -> Result<(), Fault> {
        let target = self.last_op_index as i64 + 1 + off;
        if target < 0 || target >= self.program.token_count() as i64 {
            return Err(Fault::PcOob);
        }
        self.goto_token(target as usize)
    }

    /// `IF`: truthy falls into the then-block and arms a skip over the else
    /// block; falsy scans past the then-block and the else-block's opening
    /// `B`, resuming inside the else arm.
    fn exec_if(&mut self) -> Result<(), Fault> {
        let cond = self.pop()?;
        let (then_b, then_e) = self.expect_block(self.last_op_index + 1)?;
        let (else_b, else_e) = self.expect_block(then_e + 1)?;
        if cond.is_truthy() {
            // Re-entering the same IF (a jump abandoned the arm without
            // executing its E) reuses the armed entry instead of stacking
            let armed = self
                .pending_skips
                .last()
                .is_some_and(|s| s.e_token == then_e && s.depth == self.frames.len());
            if !armed {
                self.pending_skips.push(ElseSkip {
                    e_token: then_e,
                    merge_token: else_e + 1,
                    depth: self.frames.len(),
                });
            }
            debug_assert_eq!(self.program.token_offset(then_b), Some(self.pc));
        } else {
            self.goto_token(else_b + 1)?;
        }
        Ok(())
    }

    fn exec_call(&mut self) -> Result<(), Fault> {
        let entry = self.read_u32()? as usize;
        let argc = self.read_u32()? as usize;

        if self.frames.len() >= self.call_depth_limit {
            return Err(Fault::CallDepthLimit);
        }
        if self.frames.len() >= RET_STACK_MAX {
            return Err(Fault::RetStackOverflow);
        }
        if self.stack.len() < argc {
            return Err(Fault::StackUnderflow);
        }

        let target = self.program.token_at_byte(entry).ok_or(Fault::BadArg)?;
        let arity = match self.program.tokens()[target] {
            ops::Token {
                opcode: ops::OP_FN,
                operand: Operand::Arity(a),
            } => a as usize,
            _ => return Err(Fault::BadArg),
        };
        if argc != arity {
            return Err(Fault::BadArg);
        }
        // Body entry sits past FN, its arity operand, and the opening B
        let (_, _e) = self.expect_block(target + 1)?;

        let saved = std::mem::replace(&mut self.locals, vec![Value::Int(0); LOCALS_SIZE]);
        self.frames.push(Frame {
            saved_locals: saved,
            return_pc: self.pc,
        });
        for i in (0..argc).rev() {
            // Last pop fills locals[0], so the leftmost argument lands there
            self.locals[i] = self.stack.pop().ok_or(Fault::StackUnderflow)?;
        }
        self.goto_token(target + 2)
    }

    fn exec_return(&mut self) -> Result<(), Fault> {
        let result = self.pop()?;
        let frame = self.frames.pop().ok_or(Fault::RetStackUnderflow)?;
        self.locals = frame.saved_locals;
        self.pc = frame.return_pc;
        // Skips armed inside the finished frame can never fire again
        let depth = self.frames.len();
        self.pending_skips.retain(|s| s.depth <= depth);
        self.push(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::asm::ProgramBuilder;
    use crate::vm::host::{HostEvent, NullHost, RecordingHost};

    fn run_program(build: impl FnOnce(&mut ProgramBuilder)) -> (RunOutcome, Vm<NullHost>) {
        let mut b = ProgramBuilder::new();
        build(&mut b);
        let mut vm = Vm::init(&b.finish().unwrap(), NullHost).expect("load");
        let outcome = vm.run();
        (outcome, vm)
    }

    fn result_int(outcome: &RunOutcome) -> i64 {
        match outcome.result {
            Some(Value::Int(n)) => n,
            other => panic!("expected Int result, got {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic() {
        let (outcome, _) = run_program(|b| {
            b.lit(5).lit(3).lit(2).mul().add().halt();
        });
        assert!(outcome.completed);
        assert_eq!(result_int(&outcome), 11);
        assert_eq!(outcome.steps, 6);
    }

    #[test]
    fn test_division_semantics() {
        let (outcome, _) = run_program(|b| {
            b.lit(-7).lit(2).div().halt();
        });
        assert_eq!(result_int(&outcome), -3);

        let (outcome, _) = run_program(|b| {
            b.lit(-7).lit(2).mod_().halt();
        });
        // Sign follows the dividend
        assert_eq!(result_int(&outcome), -1);
    }

    #[test]
    fn test_div_by_zero() {
        let (outcome, vm) = run_program(|b| {
            b.lit(10).lit(0).div().halt();
        });
        assert!(!outcome.completed);
        assert_eq!(outcome.fault, Some(Fault::DivByZero));
        assert_eq!(vm.mode(), Mode::Faulted);
    }

    #[test]
    fn test_mod_by_zero() {
        let (outcome, _) = run_program(|b| {
            b.lit(10).lit(0).mod_().halt();
        });
        assert_eq!(outcome.fault, Some(Fault::ModByZero));
    }

    #[test]
    fn test_zero_divisor_checked_before_dividend() {
        // Even a non-integer dividend reports the zero divisor first
        let (outcome, _) = run_program(|b| {
            b.lit(2).newarr().lit(0).div().halt();
        });
        assert_eq!(outcome.fault, Some(Fault::DivByZero));
    }

    #[test]
    fn test_shift_masking() {
        let (outcome, _) = run_program(|b| {
            b.lit(1).lit(65).shl().halt();
        });
        // 65 & 63 == 1
        assert_eq!(result_int(&outcome), 2);

        let (outcome, _) = run_program(|b| {
            b.lit(-8).lit(1).shr().halt();
        });
        // Arithmetic shift keeps the sign
        assert_eq!(result_int(&outcome), -4);
    }

    #[test]
    fn test_wrapping_arithmetic() {
        let (outcome, _) = run_program(|b| {
            b.lit(i64::MAX).lit(1).add().halt();
        });
        assert_eq!(result_int(&outcome), i64::MIN);
    }

    #[test]
    fn test_comparisons_yield_int() {
        let (outcome, _) = run_program(|b| {
            b.lit(1).lit(2).lt().halt();
        });
        assert_eq!(outcome.result, Some(Value::Int(1)));

        let (outcome, _) = run_program(|b| {
            b.lit(2).lit(2).neq().halt();
        });
        assert_eq!(outcome.result, Some(Value::Int(0)));
    }

    #[test]
    fn test_locals_and_globals() {
        let (outcome, _) = run_program(|b| {
            b.lit(42).let_(7).v(7).halt();
        });
        assert_eq!(result_int(&outcome), 42);

        let (outcome, _) = run_program(|b| {
            b.lit(9).set(100).lit(1).halt();
        });
        assert!(outcome.completed);
    }

    #[test]
    fn test_stack_shuffles() {
        let (outcome, vm) = run_program(|b| {
            b.lit(1).lit(2).lit(3).rot().halt();
        });
        assert!(outcome.completed);
        assert_eq!(
            vm.stack_snapshot(),
            vec![Value::Int(2), Value::Int(3), Value::Int(1)]
        );

        let (_, vm) = run_program(|b| {
            b.lit(1).lit(2).swp().halt();
        });
        assert_eq!(vm.stack_snapshot(), vec![Value::Int(2), Value::Int(1)]);
    }

    #[test]
    fn test_stack_overflow() {
        let mut b = ProgramBuilder::new();
        b.lit(1).jmp(-2); // push forever
        let mut vm = Vm::init(&b.finish().unwrap(), NullHost).unwrap();
        let outcome = vm.run();
        assert_eq!(outcome.fault, Some(Fault::StackOverflow));
    }

    #[test]
    fn test_if_executes_one_arm() {
        let (outcome, _) = run_program(|b| {
            b.lit(1);
            b.if_else(
                |b| {
                    b.lit(10);
                },
                |b| {
                    b.lit(20);
                },
            );
            b.halt();
        });
        assert_eq!(result_int(&outcome), 10);

        let (outcome, _) = run_program(|b| {
            b.lit(0);
            b.if_else(
                |b| {
                    b.lit(10);
                },
                |b| {
                    b.lit(20);
                },
            );
            b.halt();
        });
        assert_eq!(result_int(&outcome), 20);
    }

    #[test]
    fn test_nested_if() {
        let (outcome, _) = run_program(|b| {
            b.lit(1);
            b.if_else(
                |b| {
                    b.lit(0);
                    b.if_else(
                        |b| {
                            b.lit(1);
                        },
                        |b| {
                            b.lit(2);
                        },
                    );
                },
                |b| {
                    b.lit(3);
                },
            );
            b.halt();
        });
        assert_eq!(result_int(&outcome), 2);
    }

    #[test]
    fn test_lowered_while_loop() {
        // sum = 0; i = 5; while i > 0 { sum += i; i -= 1 }; result = sum
        let (outcome, _) = run_program(|b| {
            b.lit(0).let_(0); // sum
            b.lit(5).let_(1); // i
            b.v(1).lit(0).gt().wh();
            b.block(|b| {
                b.v(0).v(1).add().let_(0);
                b.v(1).lit(1).sub().let_(1);
            });
            b.v(0).halt();
        });
        assert!(outcome.completed);
        assert_eq!(result_int(&outcome), 15);
    }

    #[test]
    fn test_lowered_for_loop() {
        // for (i = 0; i < 4; i += 1) { sum += 2 }
        let (outcome, _) = run_program(|b| {
            b.lit(0).let_(0); // i
            b.lit(0).let_(1); // sum
            b.v(0).lit(4).lt(); // condition
            b.v(0).lit(1).add().let_(0); // increment
            b.fr();
            b.block(|b| {
                b.v(1).lit(2).add().let_(1);
            });
            b.v(1).halt();
        });
        assert!(outcome.completed);
        assert_eq!(result_int(&outcome), 8);
    }

    #[test]
    fn test_function_call() {
        let (outcome, _) = run_program(|b| {
            b.lit(5).cl("double", 1).halt();
            b.fn_def("double", 1, |b| {
                b.v(0).v(0).add().rt();
            });
        });
        assert!(outcome.completed);
        assert_eq!(result_int(&outcome), 10);
    }

    #[test]
    fn test_nested_calls() {
        // add(a, b) = a + b; double(x) = add(x, x); double(5) + double(3)
        let (outcome, _) = run_program(|b| {
            b.fn_def("add", 2, |b| {
                b.v(0).v(1).add().rt();
            });
            b.fn_def("double", 1, |b| {
                b.v(0).v(0).cl("add", 2).rt();
            });
            b.lit(5).cl("double", 1);
            b.lit(3).cl("double", 1);
            b.add().halt();
        });
        assert!(outcome.completed);
        assert_eq!(result_int(&outcome), 16);
    }

    #[test]
    fn test_argument_order() {
        // sub(a, b) = a - b; sub(10, 3) must be 7, not -7
        let (outcome, _) = run_program(|b| {
            b.lit(10).lit(3).cl("sub", 2).halt();
            b.fn_def("sub", 2, |b| {
                b.v(0).v(1).sub().rt();
            });
        });
        assert_eq!(result_int(&outcome), 7);
    }

    #[test]
    fn test_locals_isolated_per_frame() {
        let (outcome, _) = run_program(|b| {
            b.lit(1).let_(0);
            b.lit(9).cl("clobber", 1).drp();
            b.v(0).halt();
            b.fn_def("clobber", 1, |b| {
                b.lit(777).let_(0).v(0).rt();
            });
        });
        // Caller's local 0 survives the callee writing its own local 0
        assert_eq!(result_int(&outcome), 1);
    }

    #[test]
    fn test_call_depth_limit() {
        let (outcome, _) = run_program(|b| {
            b.lit(0).cl("spin", 1).halt();
            b.fn_def("spin", 1, |b| {
                b.v(0).cl("spin", 1).rt();
            });
        });
        assert_eq!(outcome.fault, Some(Fault::CallDepthLimit));
    }

    #[test]
    fn test_return_without_call() {
        let (outcome, _) = run_program(|b| {
            b.lit(1).rt().halt();
        });
        assert_eq!(outcome.fault, Some(Fault::RetStackUnderflow));
    }

    #[test]
    fn test_step_limit() {
        let mut b = ProgramBuilder::new();
        b.jmp(-1); // tight infinite loop
        let mut config = RuntimeConfig::default();
        config.step_limit = 1000;
        let mut vm = Vm::with_config(&b.finish().unwrap(), NullHost, &config).unwrap();
        let outcome = vm.run();
        assert_eq!(outcome.fault, Some(Fault::StepLimit));
        assert_eq!(outcome.steps, 1001);
    }

    #[test]
    fn test_gas_exhaustion() {
        let mut b = ProgramBuilder::new();
        b.lit(1).lit(1).div().jmp(-4);
        let mut config = RuntimeConfig::default();
        config.gas_limit = 50;
        let mut vm = Vm::with_config(&b.finish().unwrap(), NullHost, &config).unwrap();
        let outcome = vm.run();
        assert_eq!(outcome.fault, Some(Fault::GasExhausted));
    }

    #[test]
    fn test_gas_disabled_by_default() {
        let (outcome, vm) = run_program(|b| {
            b.lit(1).lit(1).div().halt();
        });
        assert!(outcome.completed);
        assert_eq!(vm.gas(), 0);
    }

    #[test]
    fn test_unauthorized_io() {
        let (outcome, _) = run_program(|b| {
            b.lit(1).iow(5).halt();
        });
        assert!(!outcome.completed);
        assert_eq!(outcome.fault, Some(Fault::Unauthorized));
    }

    #[test]
    fn test_gateway_authorizes_device() {
        let mut b = ProgramBuilder::new();
        b.gtway(5).lit(42).iow(5).halt();
        let mut vm = Vm::init(&b.finish().unwrap(), RecordingHost::new()).unwrap();
        let outcome = vm.run();
        assert!(outcome.completed);
        assert_eq!(vm.host().writes(), vec![(5, Value::Int(42))]);
    }

    #[test]
    fn test_gateway_is_per_device() {
        let (outcome, _) = run_program(|b| {
            b.gtway(4).lit(1).iow(5).halt();
        });
        assert_eq!(outcome.fault, Some(Fault::Unauthorized));
    }

    #[test]
    fn test_gateway_cap_bounds() {
        let (outcome, _) = run_program(|b| {
            b.gtway(256).halt();
        });
        assert_eq!(outcome.fault, Some(Fault::BadArg));

        let (outcome, _) = run_program(|b| {
            b.gtway(255).halt();
        });
        assert!(outcome.completed);
    }

    #[test]
    fn test_ior_pushes_host_value() {
        let mut b = ProgramBuilder::new();
        b.gtway(2).ior(2).halt();
        let host = RecordingHost::with_reads(vec![Value::Int(123)]);
        let mut vm = Vm::init(&b.finish().unwrap(), host).unwrap();
        let outcome = vm.run();
        assert_eq!(result_int(&outcome), 123);
    }

    #[test]
    fn test_io_order_is_program_order() {
        let mut b = ProgramBuilder::new();
        b.gtway(1).gtway(2);
        b.lit(10).iow(1).ior(2).drp().lit(30).iow(1).halt();
        let mut vm = Vm::init(&b.finish().unwrap(), RecordingHost::new()).unwrap();
        vm.run();
        let events: Vec<_> = vm
            .host()
            .events
            .iter()
            .filter(|e| !matches!(e, HostEvent::Trace { .. }))
            .cloned()
            .collect();
        assert_eq!(
            events,
            vec![
                HostEvent::Write {
                    device: 1,
                    value: Value::Int(10)
                },
                HostEvent::Read {
                    device: 2,
                    value: Value::Int(0)
                },
                HostEvent::Write {
                    device: 1,
                    value: Value::Int(30)
                },
            ]
        );
    }

    #[test]
    fn test_wait_reaches_host() {
        let mut b = ProgramBuilder::new();
        b.wait(250).halt();
        let mut vm = Vm::init(&b.finish().unwrap(), RecordingHost::new()).unwrap();
        vm.run();
        assert_eq!(vm.host().events, vec![HostEvent::Sleep { ms: 250 }]);
    }

    #[test]
    fn test_trace_does_not_disturb_stack() {
        let mut b = ProgramBuilder::new();
        b.lit(7).trace(2).halt();
        let mut vm = Vm::init(&b.finish().unwrap(), RecordingHost::new()).unwrap();
        let outcome = vm.run();
        assert_eq!(result_int(&outcome), 7);
        assert!(matches!(
            vm.host().events[0],
            HostEvent::Trace { level: 2, .. }
        ));
    }

    #[test]
    fn test_arrays() {
        let (outcome, _) = run_program(|b| {
            b.lit(3).newarr(); // [0, 0, 0]
            b.lit(1).lit(42).sto(); // a[1] = 42
            b.lit(1).idx(); // a[1]
            b.halt();
        });
        assert!(outcome.completed);
        assert_eq!(result_int(&outcome), 42);
    }

    #[test]
    fn test_array_len() {
        let (outcome, _) = run_program(|b| {
            b.lit(5).newarr().len().halt();
        });
        assert_eq!(result_int(&outcome), 5);
    }

    #[test]
    fn test_array_index_bounds() {
        let (outcome, _) = run_program(|b| {
            b.lit(3).newarr().lit(3).idx().halt();
        });
        assert_eq!(outcome.fault, Some(Fault::IndexOob));

        let (outcome, _) = run_program(|b| {
            b.lit(3).newarr().lit(2).idx().halt();
        });
        assert!(outcome.completed);

        let (outcome, _) = run_program(|b| {
            b.lit(3).newarr().lit(-1).idx().halt();
        });
        assert_eq!(outcome.fault, Some(Fault::IndexOob));
    }

    #[test]
    fn test_index_non_array() {
        let (outcome, _) = run_program(|b| {
            b.lit(9).lit(0).idx().halt();
        });
        assert_eq!(outcome.fault, Some(Fault::TypeMismatch));
    }

    #[test]
    fn test_array_reference_semantics() {
        // DUP copies the reference; a store through one copy is visible
        // through the other
        let (outcome, _) = run_program(|b| {
            b.lit(2).newarr().dup();
            b.lit(0).lit(9).sto().drp();
            b.lit(0).idx().halt();
        });
        assert_eq!(result_int(&outcome), 9);
    }

    #[test]
    fn test_alloc_free() {
        let (outcome, vm) = run_program(|b| {
            b.lit(64).alloc().free().lit(1).halt();
        });
        assert!(outcome.completed);
        assert_eq!(vm.heap().object_count(), 0);
    }

    #[test]
    fn test_alloc_size_out_of_range() {
        let (outcome, _) = run_program(|b| {
            b.lit(0).alloc().halt();
        });
        assert_eq!(outcome.fault, Some(Fault::OutOfMemory));

        let (outcome, _) = run_program(|b| {
            b.lit(1_000_001).alloc().halt();
        });
        assert_eq!(outcome.fault, Some(Fault::OutOfMemory));
    }

    #[test]
    fn test_free_requires_opaque() {
        let (outcome, _) = run_program(|b| {
            b.lit(2).newarr().free().halt();
        });
        assert_eq!(outcome.fault, Some(Fault::TypeMismatch));
    }

    #[test]
    fn test_gc_opcode_frees_garbage() {
        let (outcome, vm) = run_program(|b| {
            b.lit(8).newarr().drp(); // unreachable after the drop
            b.lit(8).newarr().let_(0); // rooted in a local
            b.gc();
            b.lit(1).halt();
        });
        assert!(outcome.completed);
        assert_eq!(vm.heap().object_count(), 1);
    }

    #[test]
    fn test_jump_to_last_token_succeeds() {
        let mut b = ProgramBuilder::new();
        b.jmp(1).lit(1).halt(); // skip the LIT, land on HALT
        let mut vm = Vm::init(&b.finish().unwrap(), NullHost).unwrap();
        let outcome = vm.run();
        assert!(outcome.completed);
        assert_eq!(outcome.steps, 2);
    }

    #[test]
    fn test_jump_past_end_traps() {
        let mut b = ProgramBuilder::new();
        b.jmp(2).lit(1).halt(); // one past HALT
        let mut vm = Vm::init(&b.finish().unwrap(), NullHost).unwrap();
        let outcome = vm.run();
        assert_eq!(outcome.fault, Some(Fault::PcOob));
    }

    #[test]
    fn test_running_off_end_traps() {
        let (outcome, _) = run_program(|b| {
            b.lit(1).drp();
        });
        assert_eq!(outcome.fault, Some(Fault::PcOob));
    }

    #[test]
    fn test_breakpoint_pause_and_resume() {
        let mut b = ProgramBuilder::new();
        // Loop over a BP site: first pass installs, second pass pauses
        b.lit(0).let_(0);
        b.bp(1);
        b.v(0).lit(1).add().let_(0);
        b.v(0).lit(3).lt().jnz(-9); // back to the BP token
        b.v(0).halt();
        let mut vm = Vm::init(&b.finish().unwrap(), NullHost).unwrap();

        let outcome = vm.run();
        assert_eq!(outcome.fault, Some(Fault::Breakpoint));
        assert_eq!(vm.mode(), Mode::Stopped);

        // Resume repeatedly until the loop exits
        let mut guard = 0;
        let outcome = loop {
            let o = vm.run();
            if o.fault != Some(Fault::Breakpoint) {
                break o;
            }
            guard += 1;
            assert!(guard < 10, "breakpoint never released");
        };
        assert!(outcome.completed);
        assert_eq!(result_int(&outcome), 3);
    }

    #[test]
    fn test_breakpoints_survive_reset() {
        let mut b = ProgramBuilder::new();
        b.bp(1).jmp(-2);
        let mut vm = Vm::init(&b.finish().unwrap(), NullHost).unwrap();
        let outcome = vm.run();
        assert_eq!(outcome.fault, Some(Fault::Breakpoint));

        vm.reset();
        // The installed breakpoint fires again on the second pass
        let outcome = vm.run();
        assert_eq!(outcome.fault, Some(Fault::Breakpoint));
    }

    #[test]
    fn test_single_step_latch() {
        let mut b = ProgramBuilder::new();
        b.step().lit(42).lit(7).halt();
        let mut vm = Vm::init(&b.finish().unwrap(), NullHost).unwrap();

        // STEP arms the latch; the next opcode executes, then pauses
        let outcome = vm.run();
        assert_eq!(outcome.fault, Some(Fault::DebugStep));
        assert_eq!(vm.stack_snapshot(), vec![Value::Int(42)]);

        let outcome = vm.run();
        assert!(outcome.completed);
        assert_eq!(vm.stack_snapshot(), vec![Value::Int(42), Value::Int(7)]);
    }

    #[test]
    fn test_faulted_vm_requires_reset() {
        let (_, mut vm) = run_program(|b| {
            b.lit(1).lit(0).div().halt();
        });
        assert_eq!(vm.mode(), Mode::Faulted);

        // run without reset refuses to continue
        let outcome = vm.run();
        assert_eq!(outcome.fault, Some(Fault::DivByZero));

        vm.reset();
        assert_eq!(vm.mode(), Mode::Stopped);
        let outcome = vm.run();
        assert_eq!(outcome.fault, Some(Fault::DivByZero)); // same program, same trap
    }

    #[test]
    fn test_reset_clears_capabilities() {
        let mut b = ProgramBuilder::new();
        b.gtway(5).lit(1).iow(5).halt();
        let mut vm = Vm::init(&b.finish().unwrap(), RecordingHost::new()).unwrap();
        assert!(vm.run().completed);

        vm.reset();
        // Capabilities were cleared; the program re-grants on the next run
        assert!(vm.run().completed);
        assert_eq!(vm.host().writes().len(), 2);
    }

    #[test]
    fn test_step_drives_one_opcode() {
        let mut b = ProgramBuilder::new();
        b.lit(1).lit(2).add().halt();
        let mut vm = Vm::init(&b.finish().unwrap(), NullHost).unwrap();

        let o = vm.step();
        assert_eq!(o.steps, 1);
        assert_eq!(vm.stack_snapshot(), vec![Value::Int(1)]);
        vm.step();
        vm.step();
        assert_eq!(vm.stack_snapshot(), vec![Value::Int(3)]);
    }

    #[test]
    fn test_string_interop_via_io() {
        // Host hands a string in through IOR; the program measures it
        let mut b = ProgramBuilder::new();
        b.gtway(0).ior(0).len().halt();
        let mut vm = Vm::init(&b.finish().unwrap(), RecordingHost::new()).unwrap();
        let s = vm.intern_string("hello").unwrap();
        vm.host_mut().read_queue.push(s);

        let outcome = vm.run();
        assert!(outcome.completed);
        assert_eq!(outcome.result, Some(Value::Int(5)));
    }

    #[test]
    fn test_float_io_interop() {
        let mut b = ProgramBuilder::new();
        b.gtway(0).ior(0).halt();
        let host = RecordingHost::with_reads(vec![Value::Float(2.5)]);
        let mut vm = Vm::init(&b.finish().unwrap(), host).unwrap();
        let outcome = vm.run();
        assert!(outcome.completed);
        assert_eq!(outcome.result, Some(Value::Float(2.5)));

        // Floats stay out of integer arithmetic
        let mut b = ProgramBuilder::new();
        b.gtway(0).ior(0).lit(1).add().halt();
        let host = RecordingHost::with_reads(vec![Value::Float(2.5)]);
        let mut vm = Vm::init(&b.finish().unwrap(), host).unwrap();
        assert_eq!(vm.run().fault, Some(Fault::TypeMismatch));
    }

    #[test]
    fn test_eq_mixed_kinds() {
        let (outcome, _) = run_program(|b| {
            b.lit(3).newarr().lit(3).eq().halt();
        });
        assert_eq!(result_int(&outcome), 0);
    }

    #[test]
    fn test_if_inside_function_with_early_return() {
        // RT from inside a then-arm must not leak a pending skip into the
        // caller
        let (outcome, _) = run_program(|b| {
            b.lit(1).cl("pick", 1);
            // The caller runs its own IF afterwards; both arms must work
            b.if_else(
                |b| {
                    b.lit(100);
                },
                |b| {
                    b.lit(200);
                },
            );
            b.halt();
            b.fn_def("pick", 1, |b| {
                b.v(0);
                b.if_else(
                    |b| {
                        b.lit(1).rt();
                    },
                    |b| {
                        b.ph();
                    },
                );
                b.lit(0).rt();
            });
        });
        assert!(outcome.completed);
        assert_eq!(result_int(&outcome), 100);
    }
}
