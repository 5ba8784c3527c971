//! Program loading: tokenize, build the token map, lower structured loops.
//!
//! Loading happens exactly once, before validation. The tokenizer walks the
//! raw bytes front to back, decoding each opcode and skipping its operands
//! by shape. The lowerer then rewrites every `WH`/`FR` into `JZ`/`JMP` over
//! token indices, and the whole program is re-encoded so the emitted byte
//! buffer (with fresh `token_offsets`/`byte_to_token` tables) becomes the
//! authoritative form. Structured `IF` is left alone; the interpreter
//! executes it directly.

use super::Program;
use super::fault::Fault;
use super::ops::{self, Operand, OperandKind, Token};
use super::varint;

/// Why a raw byte sequence was rejected at load time.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadError {
    pub fault: Fault,
    /// Byte offset (tokenize) or token index (lowering) of the failure
    pub at: usize,
    pub detail: String,
}

impl LoadError {
    fn new(fault: Fault, at: usize, detail: impl Into<String>) -> Self {
        Self {
            fault,
            at,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}: {}", self.fault, self.at, self.detail)
    }
}

impl std::error::Error for LoadError {}

/// Load a raw byte sequence: tokenize, lower loops, rebuild the token map.
pub fn load(bytes: &[u8]) -> Result<Program, LoadError> {
    let raw = tokenize(bytes)?;
    let mut work = to_work(&raw)?;
    while let Some(w) = work
        .iter()
        .position(|t| t.opcode == ops::OP_WH || t.opcode == ops::OP_FR)
    {
        work = lower_one(work, w)?;
    }
    encode(&work)
}

/// A decoded token plus the byte offset it starts at.
#[derive(Debug, Clone, Copy)]
struct RawTok {
    token: Token,
    offset: usize,
}

fn tokenize(bytes: &[u8]) -> Result<Vec<RawTok>, LoadError> {
    let mut toks = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let offset = pos;
        let (opcode, n) = varint::decode_u32(&bytes[pos..])
            .map_err(|e| LoadError::new(Fault::BadEncoding, pos, e.to_string()))?;
        pos += n;

        let kind = operand_shape(opcode, offset)?;
        let operand = match kind {
            OperandKind::None => Operand::None,
            OperandKind::Lit => {
                let (v, n) = varint::decode_i64(&bytes[pos..])
                    .map_err(|e| LoadError::new(Fault::BadEncoding, pos, e.to_string()))?;
                pos += n;
                Operand::Lit(v)
            }
            OperandKind::Index => {
                let (v, n) = varint::decode_u32(&bytes[pos..])
                    .map_err(|e| LoadError::new(Fault::BadEncoding, pos, e.to_string()))?;
                pos += n;
                Operand::Index(v)
            }
            OperandKind::Jump => {
                let (v, n) = varint::decode_i64(&bytes[pos..])
                    .map_err(|e| LoadError::new(Fault::BadEncoding, pos, e.to_string()))?;
                pos += n;
                Operand::Jump(v)
            }
            OperandKind::Arity => {
                let (v, n) = varint::decode_u32(&bytes[pos..])
                    .map_err(|e| LoadError::new(Fault::BadEncoding, pos, e.to_string()))?;
                pos += n;
                Operand::Arity(v)
            }
            OperandKind::Call => {
                let (entry, n) = varint::decode_u32(&bytes[pos..])
                    .map_err(|e| LoadError::new(Fault::BadEncoding, pos, e.to_string()))?;
                pos += n;
                let (argc, n) = varint::decode_u32(&bytes[pos..])
                    .map_err(|e| LoadError::new(Fault::BadEncoding, pos, e.to_string()))?;
                pos += n;
                Operand::Call { entry, argc }
            }
        };

        toks.push(RawTok {
            token: Token { opcode, operand },
            offset,
        });
    }
    Ok(toks)
}

fn operand_shape(opcode: u32, offset: usize) -> Result<OperandKind, LoadError> {
    ops::operand_kind(opcode).ok_or_else(|| {
        LoadError::new(
            Fault::BadEncoding,
            offset,
            format!("unknown opcode {}", opcode),
        )
    })
}

/// Working form used by the lowerer: jump targets and call entries resolved
/// to absolute token indices, so tokens can be moved freely and re-encoded
/// afterwards.
#[derive(Debug, Clone, Copy)]
struct WorkTok {
    opcode: u32,
    operand: WorkOperand,
}

#[derive(Debug, Clone, Copy)]
enum WorkOperand {
    None,
    Lit(i64),
    Index(u32),
    /// Absolute target token index (may be out of range; the validator and
    /// the interpreter both re-check)
    JumpAbs(i64),
    Call {
        entry_tok: usize,
        argc: u32,
    },
    Arity(u32),
}

fn to_work(raw: &[RawTok]) -> Result<Vec<WorkTok>, LoadError> {
    // Byte offset -> token index, for resolving CL entry offsets
    let find_token = |byte: usize| raw.binary_search_by_key(&byte, |t| t.offset).ok();

    let mut work = Vec::with_capacity(raw.len());
    for (i, t) in raw.iter().enumerate() {
        let operand = match t.token.operand {
            Operand::None => WorkOperand::None,
            Operand::Lit(v) => WorkOperand::Lit(v),
            Operand::Index(v) => WorkOperand::Index(v),
            Operand::Arity(v) => WorkOperand::Arity(v),
            Operand::Jump(off) => WorkOperand::JumpAbs(i as i64 + 1 + off),
            Operand::Call { entry, argc } => {
                let entry_tok = find_token(entry as usize).ok_or_else(|| {
                    LoadError::new(
                        Fault::BadArg,
                        t.offset,
                        format!("call entry {} is not a token boundary", entry),
                    )
                })?;
                WorkOperand::Call { entry_tok, argc }
            }
        };
        work.push(WorkTok {
            opcode: t.token.opcode,
            operand,
        });
    }
    Ok(work)
}

/// View a working token through the shared stack-effect model.
fn materialize(t: &WorkTok) -> Token {
    let operand = match t.operand {
        WorkOperand::None => Operand::None,
        WorkOperand::Lit(v) => Operand::Lit(v),
        WorkOperand::Index(v) => Operand::Index(v),
        WorkOperand::Arity(v) => Operand::Arity(v),
        WorkOperand::JumpAbs(_) => Operand::Jump(0),
        WorkOperand::Call { argc, .. } => Operand::Call { entry: 0, argc },
    };
    Token {
        opcode: t.opcode,
        operand,
    }
}

/// Find the matching `E` for the `B` at `open`, by depth count.
fn matching_end(work: &[WorkTok], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, t) in work.iter().enumerate().skip(open) {
        match t.opcode {
            ops::OP_B => depth += 1,
            ops::OP_E => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Rewrite the single loop headed at token `w` into condition + `JZ` +
/// body (+ increment for `FR`) + back-edge `JMP`, remapping every other
/// jump and call target across the move.
fn lower_one(work: Vec<WorkTok>, w: usize) -> Result<Vec<WorkTok>, LoadError> {
    let is_for = work[w].opcode == ops::OP_FR;

    let view: Vec<Token> = work.iter().map(materialize).collect();
    let sim = ops::producer_ranges(&view, w);
    let &(cond_start, cond_last) = sim
        .last()
        .ok_or_else(|| LoadError::new(Fault::BadArg, w, "loop has no condition"))?;

    // FR carries its increment between the condition and the keyword
    let (cond_end, incr_start, incr_end) = if is_for {
        (cond_last, cond_last + 1, w) // incr = [cond_last+1, w)
    } else {
        (w - 1, w, w) // empty increment
    };

    if work.get(w + 1).map(|t| t.opcode) != Some(ops::OP_B) {
        return Err(LoadError::new(Fault::BadArg, w, "loop body must open with B"));
    }
    let e = matching_end(&work, w + 1)
        .ok_or_else(|| LoadError::new(Fault::BadArg, w, "unterminated loop body"))?;

    let body_start = w + 2;
    let body_len = e - body_start;
    let incr_len = incr_end - incr_start;

    // New layout:
    //   [0, cond_end]  condition (unchanged position)
    //   jz             -> exit
    //   body           (old [body_start, e))
    //   incr           (old [incr_start, incr_end), FR only)
    //   jmp            -> cond_start
    //   suffix         (old (e, ..))
    let jz_new = cond_end + 1;
    let body_new = jz_new + 1;
    let incr_new = body_new + body_len;
    let jmp_new = incr_new + incr_len;
    let exit_new = jmp_new + 1;

    let map_index = |old: i64| -> i64 {
        if old < 0 {
            return old;
        }
        let old = old as usize;
        let mapped = if old <= cond_end {
            old
        } else if is_for && old >= incr_start && old < incr_end {
            incr_new + (old - incr_start)
        } else if old == w {
            // Jump onto the loop keyword lands on the loop header
            cond_start
        } else if old == w + 1 {
            body_new
        } else if old >= body_start && old < e {
            body_new + (old - body_start)
        } else if old == e {
            jmp_new
        } else {
            exit_new + (old - (e + 1))
        };
        mapped as i64
    };

    let remap = |t: &WorkTok| -> WorkTok {
        let operand = match t.operand {
            WorkOperand::JumpAbs(target) => WorkOperand::JumpAbs(map_index(target)),
            WorkOperand::Call { entry_tok, argc } => WorkOperand::Call {
                entry_tok: map_index(entry_tok as i64).max(0) as usize,
                argc,
            },
            other => other,
        };
        WorkTok {
            opcode: t.opcode,
            operand,
        }
    };

    let mut out = Vec::with_capacity(work.len() + 2);
    out.extend(work[..=cond_end].iter().map(&remap));
    out.push(WorkTok {
        opcode: ops::OP_JZ,
        operand: WorkOperand::JumpAbs(exit_new as i64),
    });
    out.extend(work[body_start..e].iter().map(&remap));
    if is_for {
        out.extend(work[incr_start..incr_end].iter().map(&remap));
    }
    out.push(WorkTok {
        opcode: ops::OP_JMP,
        operand: WorkOperand::JumpAbs(cond_start as i64),
    });
    out.extend(work[e + 1..].iter().map(&remap));
    Ok(out)
}

/// Re-encode working tokens into wire bytes and rebuild the token map.
///
/// Jump offsets are token-relative, so their encoded lengths are known up
/// front; `CL` entries are byte offsets, so their lengths are settled by a
/// short fixpoint (offsets only ever grow from the 1-byte initial guess).
fn encode(work: &[WorkTok]) -> Result<Program, LoadError> {
    let mut entry_lens: Vec<usize> = vec![1; work.len()];
    let mut offsets: Vec<usize> = vec![0; work.len()];

    for _round in 0..10 {
        let mut pos = 0usize;
        for (i, t) in work.iter().enumerate() {
            offsets[i] = pos;
            pos += encoded_len(t, i, entry_lens[i]);
        }

        let mut stable = true;
        for (i, t) in work.iter().enumerate() {
            if let WorkOperand::Call { entry_tok, .. } = t.operand {
                let target = offsets.get(entry_tok).copied().unwrap_or(0);
                let mut probe = Vec::new();
                varint::encode_u32(target as u32, &mut probe);
                if probe.len() != entry_lens[i] {
                    entry_lens[i] = probe.len();
                    stable = false;
                }
            }
        }
        if stable {
            return emit(work, &offsets);
        }
    }
    Err(LoadError::new(
        Fault::AssertFailed,
        0,
        "call-offset layout did not converge",
    ))
}

fn encoded_len(t: &WorkTok, index: usize, entry_len: usize) -> usize {
    let mut buf = Vec::new();
    varint::encode_u32(t.opcode, &mut buf);
    match t.operand {
        WorkOperand::None => {}
        WorkOperand::Lit(v) => varint::encode_i64(v, &mut buf),
        WorkOperand::Index(v) | WorkOperand::Arity(v) => varint::encode_u32(v, &mut buf),
        WorkOperand::JumpAbs(target) => {
            varint::encode_i64(target - (index as i64 + 1), &mut buf)
        }
        WorkOperand::Call { argc, .. } => {
            buf.extend(std::iter::repeat_n(0, entry_len));
            varint::encode_u32(argc, &mut buf);
        }
    }
    buf.len()
}

fn emit(work: &[WorkTok], offsets: &[usize]) -> Result<Program, LoadError> {
    let mut bytes = Vec::new();
    let mut tokens = Vec::with_capacity(work.len());

    for (i, t) in work.iter().enumerate() {
        debug_assert_eq!(bytes.len(), offsets[i]);
        varint::encode_u32(t.opcode, &mut bytes);
        let operand = match t.operand {
            WorkOperand::None => Operand::None,
            WorkOperand::Lit(v) => {
                varint::encode_i64(v, &mut bytes);
                Operand::Lit(v)
            }
            WorkOperand::Index(v) => {
                varint::encode_u32(v, &mut bytes);
                Operand::Index(v)
            }
            WorkOperand::Arity(v) => {
                varint::encode_u32(v, &mut bytes);
                Operand::Arity(v)
            }
            WorkOperand::JumpAbs(target) => {
                let rel = target - (i as i64 + 1);
                varint::encode_i64(rel, &mut bytes);
                Operand::Jump(rel)
            }
            WorkOperand::Call { entry_tok, argc } => {
                let entry = offsets.get(entry_tok).copied().unwrap_or(0) as u32;
                varint::encode_u32(entry, &mut bytes);
                varint::encode_u32(argc, &mut bytes);
                Operand::Call { entry, argc }
            }
        };
        tokens.push(Token {
            opcode: t.opcode,
            operand,
        });
    }

    let mut byte_to_token = vec![super::NO_TOKEN; bytes.len()];
    for (i, &off) in offsets.iter().enumerate() {
        byte_to_token[off] = i as u32;
    }

    Ok(Program::new(bytes, offsets.to_vec(), byte_to_token, tokens))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::asm::ProgramBuilder;

    fn load_ops(build: impl FnOnce(&mut ProgramBuilder)) -> Program {
        let mut b = ProgramBuilder::new();
        build(&mut b);
        load(&b.finish().unwrap()).unwrap()
    }

    #[test]
    fn test_tokenize_flat_program() {
        let program = load_ops(|b| {
            b.lit(5).lit(3).add().halt();
        });
        assert_eq!(program.token_count(), 4);
        assert_eq!(program.tokens()[0].opcode, ops::OP_LIT);
        assert_eq!(program.tokens()[3].opcode, ops::OP_HALT);
    }

    #[test]
    fn test_tokenize_rejects_unknown_opcode() {
        let err = load(&[0x05]).unwrap_err();
        assert_eq!(err.fault, Fault::BadEncoding);
    }

    #[test]
    fn test_tokenize_rejects_truncated_operand() {
        let mut bytes = Vec::new();
        varint::encode_u32(ops::OP_LIT, &mut bytes);
        // LIT with no literal following
        let err = load(&bytes).unwrap_err();
        assert_eq!(err.fault, Fault::BadEncoding);
    }

    #[test]
    fn test_while_is_lowered_to_jumps() {
        // while (v0 > 0) { v0 - 1 -> v0 }
        let program = load_ops(|b| {
            b.v(0).lit(0).gt().wh();
            b.block(|b| {
                b.v(0).lit(1).sub().let_(0);
            });
            b.v(0).halt();
        });

        let opcodes: Vec<u32> = program.tokens().iter().map(|t| t.opcode).collect();
        assert!(!opcodes.contains(&ops::OP_WH));
        assert!(!opcodes.contains(&ops::OP_B));
        assert!(opcodes.contains(&ops::OP_JZ));
        assert!(opcodes.contains(&ops::OP_JMP));

        // Back edge lands on the first condition token
        let jmp = opcodes.iter().position(|&o| o == ops::OP_JMP).unwrap();
        if let Operand::Jump(rel) = program.tokens()[jmp].operand {
            assert_eq!(jmp as i64 + 1 + rel, 0);
        } else {
            panic!("JMP lost its operand");
        }

        // JZ exits one past the back edge
        let jz = opcodes.iter().position(|&o| o == ops::OP_JZ).unwrap();
        if let Operand::Jump(rel) = program.tokens()[jz].operand {
            assert_eq!(jz as i64 + 1 + rel, jmp as i64 + 1);
        } else {
            panic!("JZ lost its operand");
        }
    }

    #[test]
    fn test_for_moves_increment_after_body() {
        // cond: v0 < 3; incr: v0 + 1 -> v0; body: PH
        let program = load_ops(|b| {
            b.v(0).lit(3).lt(); // condition
            b.v(0).lit(1).add().let_(0); // increment, between cond and FR
            b.fr();
            b.block(|b| {
                b.ph();
            });
            b.halt();
        });

        let opcodes: Vec<u32> = program.tokens().iter().map(|t| t.opcode).collect();
        assert!(!opcodes.contains(&ops::OP_FR));
        // Layout: cond(3) JZ body(1) incr(4) JMP HALT
        assert_eq!(opcodes[3], ops::OP_JZ);
        assert_eq!(opcodes[4], ops::OP_PH);
        assert_eq!(opcodes[5], ops::OP_V);
        assert_eq!(opcodes[8], ops::OP_LET);
        assert_eq!(opcodes[9], ops::OP_JMP);
        assert_eq!(opcodes[10], ops::OP_HALT);
    }

    #[test]
    fn test_nested_loops_lower() {
        let program = load_ops(|b| {
            b.v(0).wh();
            b.block(|b| {
                b.v(1).wh();
                b.block(|b| {
                    b.lit(0).let_(1);
                });
                b.lit(0).let_(0);
            });
            b.halt();
        });

        let opcodes: Vec<u32> = program.tokens().iter().map(|t| t.opcode).collect();
        assert!(!opcodes.contains(&ops::OP_WH));
        assert_eq!(opcodes.iter().filter(|&&o| o == ops::OP_JZ).count(), 2);
        assert_eq!(opcodes.iter().filter(|&&o| o == ops::OP_JMP).count(), 2);
    }

    #[test]
    fn test_loop_without_block_rejected() {
        let mut b = ProgramBuilder::new();
        b.v(0).wh().halt();
        let err = load(&b.finish().unwrap()).unwrap_err();
        assert_eq!(err.fault, Fault::BadArg);
    }

    #[test]
    fn test_call_offsets_survive_lowering() {
        // A function defined after a loop: lowering shifts it, the CL
        // operand must still point at the FN token.
        let mut b = ProgramBuilder::new();
        b.lit(1).wh();
        b.block(|b| {
            b.lit(0).drp();
        });
        b.cl("double", 1);
        b.halt();
        b.fn_def("double", 1, |b| {
            b.v(0).v(0).add().rt();
        });
        let program = load(&b.finish().unwrap()).unwrap();

        let cl_tok = program
            .tokens()
            .iter()
            .position(|t| t.opcode == ops::OP_CL)
            .unwrap();
        let Operand::Call { entry, .. } = program.tokens()[cl_tok].operand else {
            panic!("CL lost its operand");
        };
        let entry_tok = program.token_at_byte(entry as usize).unwrap();
        assert_eq!(program.tokens()[entry_tok].opcode, ops::OP_FN);
    }
}
