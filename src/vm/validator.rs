//! Static validation: a program that passes here cannot underflow the
//! stack through control-flow confusion, jump outside the token range,
//! touch out-of-range locals/globals, reach dead code, or perform I/O on a
//! device no dominating `GTWAY` authorized.
//!
//! The normal pipeline validates the lowered program, but structured
//! `WH`/`FR` are also understood so that hosts can vet a raw program
//! without loading it into a VM. The analysis is a worklist abstract
//! interpretation over token indices, tracking stack height (must be equal
//! whenever two paths merge) and the capability bitmap (intersected at
//! merges, so only capabilities granted on every incoming path count).

use std::collections::HashMap;

use super::fault::Fault;
use super::ops::{self, Operand, Token};
use super::{CapSet, Program};

/// Locals array size; `V`/`LET` indices must stay below this.
pub const LOCALS_MAX: u32 = 64;
/// Globals array size; `SET` indices must stay below this.
pub const GLOBALS_MAX: u32 = 128;

/// A rejected program, reported through the shared fault taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidateError {
    pub fault: Fault,
    pub token: usize,
    pub detail: String,
}

impl ValidateError {
    fn new(fault: Fault, token: usize, detail: impl Into<String>) -> Self {
        Self {
            fault,
            token,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for ValidateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at token {}: {}", self.fault, self.token, self.detail)
    }
}

impl std::error::Error for ValidateError {}

/// Validation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    /// Accept the full instruction set
    #[default]
    Full,
    /// Reject extension opcodes (>= 100); used at the public ABI boundary
    CoreOnly,
}

/// Validate a loaded program under the default policy.
pub fn validate(program: &Program) -> Result<(), ValidateError> {
    Validator::new().validate(program)
}

/// The validator. Holds no state across runs; the struct carries policy.
#[derive(Debug, Default)]
pub struct Validator {
    pub policy: Policy,
}

/// Block structure discovered before the flow analysis.
struct Structure {
    /// For each `B` token, its matching `E`
    pair: HashMap<usize, usize>,
    /// then-`E` -> merge token (one past the else-`E`)
    then_skips: HashMap<usize, usize>,
    /// loop body `E` -> condition start (back edge)
    back_edges: HashMap<usize, usize>,
    /// `FN` token -> (entry token, closing `E`, arity)
    functions: HashMap<usize, (usize, usize, u32)>,
    /// Tokens scanned over by structural skips, reachable by construction
    structural: Vec<usize>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn core_only() -> Self {
        Self {
            policy: Policy::CoreOnly,
        }
    }

    pub fn validate(&self, program: &Program) -> Result<(), ValidateError> {
        let tokens = program.tokens();

        self.check_encoding(program)?;
        let structure = self.check_blocks(tokens)?;
        self.check_operand_bounds(tokens)?;
        self.check_jump_targets(tokens)?;
        self.check_calls(program, &structure)?;
        self.check_flow(program, &structure)
    }

    /// Check 1: every opcode is in range and known; the token map agrees
    /// with itself. Check 8 (policy): no extension opcodes in core mode.
    fn check_encoding(&self, program: &Program) -> Result<(), ValidateError> {
        for (i, t) in program.tokens().iter().enumerate() {
            if t.opcode > ops::OPCODE_MAX {
                return Err(ValidateError::new(
                    Fault::BadEncoding,
                    i,
                    format!("opcode {} out of range", t.opcode),
                ));
            }
            if ops::opcode_name(t.opcode).is_none() {
                return Err(ValidateError::new(
                    Fault::UnknownOp,
                    i,
                    format!("opcode {}", t.opcode),
                ));
            }
            if self.policy == Policy::CoreOnly && t.opcode >= ops::EXTENSION_BASE {
                return Err(ValidateError::new(
                    Fault::UnknownOp,
                    i,
                    format!("extension opcode {} rejected by core-only policy", t.opcode),
                ));
            }
            let off = program.token_offset(i).unwrap_or(usize::MAX);
            if program.token_at_byte(off) != Some(i) {
                return Err(ValidateError::new(
                    Fault::AssertFailed,
                    i,
                    "token map disagrees with itself",
                ));
            }
        }
        Ok(())
    }

    /// Checks 2 and 4: block tree and the `IF`/`WH`/`FR`/`FN` layouts.
    fn check_blocks(&self, tokens: &[Token]) -> Result<Structure, ValidateError> {
        let mut pair = HashMap::new();
        let mut open: Vec<usize> = Vec::new();
        for (i, t) in tokens.iter().enumerate() {
            match t.opcode {
                ops::OP_B => open.push(i),
                ops::OP_E => {
                    let b = open.pop().ok_or_else(|| {
                        ValidateError::new(Fault::BadArg, i, "E without matching B")
                    })?;
                    pair.insert(b, i);
                }
                _ => {}
            }
        }
        if let Some(&b) = open.last() {
            return Err(ValidateError::new(Fault::BadArg, b, "unmatched B"));
        }

        let block_after = |at: usize| -> Result<(usize, usize), ValidateError> {
            match tokens.get(at).map(|t| t.opcode) {
                Some(ops::OP_B) => Ok((at, pair[&at])),
                _ => Err(ValidateError::new(
                    Fault::BadArg,
                    at.min(tokens.len().saturating_sub(1)),
                    "expected a block here",
                )),
            }
        };

        let mut then_skips = HashMap::new();
        let mut back_edges = HashMap::new();
        let mut functions = HashMap::new();
        let mut structural = Vec::new();

        for (i, t) in tokens.iter().enumerate() {
            match t.opcode {
                ops::OP_IF => {
                    let (then_b, then_e) = block_after(i + 1)?;
                    let (else_b, else_e) = block_after(then_e + 1)?;
                    then_skips.insert(then_e, else_e + 1);
                    structural.extend([then_b, then_e, else_b, else_e]);
                }
                ops::OP_WH | ops::OP_FR => {
                    let (b, e) = block_after(i + 1)?;
                    let cond = ops::producer_ranges(tokens, i);
                    let &(cond_start, _) = cond.last().ok_or_else(|| {
                        ValidateError::new(Fault::BadArg, i, "loop has no condition")
                    })?;
                    back_edges.insert(e, cond_start);
                    structural.extend([b, e]);
                }
                ops::OP_FN => {
                    let arity = match t.operand {
                        Operand::Arity(a) => a,
                        _ => 0,
                    };
                    let (b, e) = block_after(i + 1)?;
                    functions.insert(i, (b + 1, e, arity));
                    // CL enters past the FN header, so the header tokens are
                    // scanned over rather than executed
                    structural.extend([i, b, e]);
                }
                _ => {}
            }
        }

        Ok(Structure {
            pair,
            then_skips,
            back_edges,
            functions,
            structural,
        })
    }

    /// Check 3 plus the static operand range checks.
    fn check_operand_bounds(&self, tokens: &[Token]) -> Result<(), ValidateError> {
        for (i, t) in tokens.iter().enumerate() {
            if let Operand::Index(v) = t.operand {
                match t.opcode {
                    ops::OP_V | ops::OP_LET if v >= LOCALS_MAX => {
                        return Err(ValidateError::new(
                            Fault::LocalsOob,
                            i,
                            format!("local index {}", v),
                        ));
                    }
                    ops::OP_SET if v >= GLOBALS_MAX => {
                        return Err(ValidateError::new(
                            Fault::GlobalsOob,
                            i,
                            format!("global index {}", v),
                        ));
                    }
                    ops::OP_GTWAY | ops::OP_IOW | ops::OP_IOR if v > 255 => {
                        return Err(ValidateError::new(
                            Fault::BadArg,
                            i,
                            format!("device id {}", v),
                        ));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Check 6: every jump target is a token index in range. Offsets are in
    /// token units, so landing inside an operand is impossible by
    /// construction.
    fn check_jump_targets(&self, tokens: &[Token]) -> Result<(), ValidateError> {
        let n = tokens.len() as i64;
        for (i, t) in tokens.iter().enumerate() {
            if let Operand::Jump(off) = t.operand {
                let target = i as i64 + 1 + off;
                if target < 0 || target >= n {
                    return Err(ValidateError::new(
                        Fault::PcOob,
                        i,
                        format!("jump target {}", target),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Every `CL` must target an `FN` token and pass as many arguments as
    /// the definition declares.
    fn check_calls(
        &self,
        program: &Program,
        structure: &Structure,
    ) -> Result<(), ValidateError> {
        for (i, t) in program.tokens().iter().enumerate() {
            if let Operand::Call { entry, argc } = t.operand {
                let target = program.token_at_byte(entry as usize).ok_or_else(|| {
                    ValidateError::new(
                        Fault::BadArg,
                        i,
                        format!("call entry {} is not a token boundary", entry),
                    )
                })?;
                let (_, _, arity) = structure.functions.get(&target).ok_or_else(|| {
                    ValidateError::new(Fault::BadArg, i, "call target is not a function")
                })?;
                if argc != *arity {
                    return Err(ValidateError::new(
                        Fault::BadArg,
                        i,
                        format!("call passes {} args, function takes {}", argc, arity),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Checks 5, 7, 8: stack-height consistency, capability dominance, and
    /// reachability, in one worklist fixpoint.
    fn check_flow(&self, program: &Program, structure: &Structure) -> Result<(), ValidateError> {
        let tokens = program.tokens();
        let n = tokens.len();
        if n == 0 {
            return Ok(());
        }

        let mut heights: Vec<Option<i64>> = vec![None; n];
        let mut caps_in: Vec<Option<CapSet>> = vec![None; n];
        // FN token -> entry capability set (AND over call sites seen so far)
        let mut fn_caps: HashMap<usize, CapSet> = HashMap::new();
        let mut worklist: Vec<usize> = Vec::new();

        let mut schedule =
            |i: usize,
             h: i64,
             caps: CapSet,
             heights: &mut Vec<Option<i64>>,
             caps_in: &mut Vec<Option<CapSet>>,
             worklist: &mut Vec<usize>|
             -> Result<(), ValidateError> {
                if i >= n {
                    // Falling past the last token is a run-time PcOob, not a
                    // static rejection
                    return Ok(());
                }
                let mut dirty = false;
                match heights[i] {
                    None => {
                        heights[i] = Some(h);
                        dirty = true;
                    }
                    Some(existing) if existing != h => {
                        return Err(ValidateError::new(
                            Fault::BadArg,
                            i,
                            format!("branch stack mismatch: {} vs {}", existing, h),
                        ));
                    }
                    Some(_) => {}
                }
                let merged = match caps_in[i] {
                    None => caps,
                    Some(existing) => existing.and(&caps),
                };
                if caps_in[i] != Some(merged) {
                    caps_in[i] = Some(merged);
                    dirty = true;
                }
                if dirty {
                    worklist.push(i);
                }
                Ok(())
            };

        schedule(0, 0, CapSet::new(), &mut heights, &mut caps_in, &mut worklist)?;

        while let Some(i) = worklist.pop() {
            let t = &tokens[i];
            let h = heights[i].unwrap_or(0);
            let caps = caps_in[i].unwrap_or_default();

            let (pops, pushes) = ops::stack_effect(t);
            if h < pops as i64 {
                return Err(ValidateError::new(
                    Fault::StackUnderflow,
                    i,
                    format!("needs {} values, stack holds {}", pops, h),
                ));
            }
            let h_out = h - pops as i64 + pushes as i64;

            let mut caps_out = caps;
            match t.opcode {
                ops::OP_GTWAY => {
                    if let Operand::Index(cap) = t.operand {
                        caps_out.set(cap);
                    }
                }
                ops::OP_IOW | ops::OP_IOR => {
                    if let Operand::Index(device) = t.operand
                        && !caps.test(device)
                    {
                        return Err(ValidateError::new(
                            Fault::Unauthorized,
                            i,
                            format!("device {} not authorized on every path", device),
                        ));
                    }
                }
                _ => {}
            }

            // Successors
            match t.opcode {
                ops::OP_HALT | ops::OP_RT => {}
                ops::OP_JMP => {
                    if let Operand::Jump(off) = t.operand {
                        let target = (i as i64 + 1 + off) as usize;
                        schedule(target, h_out, caps_out, &mut heights, &mut caps_in, &mut worklist)?;
                    }
                }
                ops::OP_JZ | ops::OP_JNZ => {
                    if let Operand::Jump(off) = t.operand {
                        let target = (i as i64 + 1 + off) as usize;
                        schedule(target, h_out, caps_out, &mut heights, &mut caps_in, &mut worklist)?;
                    }
                    schedule(i + 1, h_out, caps_out, &mut heights, &mut caps_in, &mut worklist)?;
                }
                ops::OP_IF => {
                    // Truthy falls into the then block; falsy resumes just
                    // inside the else block
                    let then_b = i + 1;
                    let then_e = structure.pair.get(&then_b).copied().unwrap_or(i);
                    schedule(then_b, h_out, caps_out, &mut heights, &mut caps_in, &mut worklist)?;
                    schedule(then_e + 2, h_out, caps_out, &mut heights, &mut caps_in, &mut worklist)?;
                }
                ops::OP_WH | ops::OP_FR => {
                    let b = i + 1;
                    let e = structure.pair.get(&b).copied().unwrap_or(i);
                    schedule(b, h_out, caps_out, &mut heights, &mut caps_in, &mut worklist)?;
                    schedule(e + 1, h_out, caps_out, &mut heights, &mut caps_in, &mut worklist)?;
                }
                ops::OP_FN => {
                    if let Some(&(_, e, _)) = structure.functions.get(&i) {
                        schedule(e + 1, h_out, caps_out, &mut heights, &mut caps_in, &mut worklist)?;
                    }
                }
                ops::OP_CL => {
                    if let Operand::Call { entry, .. } = t.operand
                        && let Some(target) = program.token_at_byte(entry as usize)
                        && let Some(&(fn_entry, _, _)) = structure.functions.get(&target)
                    {
                        let merged = match fn_caps.get(&target) {
                            None => caps_out,
                            Some(existing) => existing.and(&caps_out),
                        };
                        if fn_caps.insert(target, merged) != Some(merged) {
                            schedule(fn_entry, 0, merged, &mut heights, &mut caps_in, &mut worklist)?;
                        }
                    }
                    schedule(i + 1, h_out, caps_out, &mut heights, &mut caps_in, &mut worklist)?;
                }
                ops::OP_E => {
                    if let Some(&merge) = structure.then_skips.get(&i) {
                        schedule(merge, h_out, caps_out, &mut heights, &mut caps_in, &mut worklist)?;
                    } else if let Some(&cond) = structure.back_edges.get(&i) {
                        schedule(cond, h_out, caps_out, &mut heights, &mut caps_in, &mut worklist)?;
                    } else {
                        schedule(i + 1, h_out, caps_out, &mut heights, &mut caps_in, &mut worklist)?;
                    }
                }
                _ => {
                    schedule(i + 1, h_out, caps_out, &mut heights, &mut caps_in, &mut worklist)?;
                }
            }
        }

        // Check 8: reachability. Visited tokens plus tokens scanned over by
        // structural skips count; anything else is dead code.
        let mut reachable: Vec<bool> = heights.iter().map(|h| h.is_some()).collect();
        for &i in &structure.structural {
            if i < n {
                reachable[i] = true;
            }
        }
        if let Some(dead) = reachable.iter().position(|r| !r) {
            return Err(ValidateError::new(Fault::BadArg, dead, "unreachable"));
        }

        Ok(())
    }
}
