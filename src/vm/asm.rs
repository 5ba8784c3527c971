//! Program builder: the typed way to emit M-Token wire bytes.
//!
//! Agents emit token streams directly; a Rust host (and this crate's own
//! test suite) goes through `ProgramBuilder` instead of hand-packing
//! varints. Function calls are expressed by label so the builder can
//! resolve `CL` entry byte offsets at `finish` time, after every token's
//! encoded length is known.

use std::collections::HashMap;

use super::ops;
use super::varint;

/// Assembly failure: a `cl` names a function no `fn_def` defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmError {
    pub label: String,
}

impl std::fmt::Display for AsmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call to undefined function '{}'", self.label)
    }
}

impl std::error::Error for AsmError {}

#[derive(Debug, Clone)]
enum AsmOperand {
    None,
    Lit(i64),
    Index(u32),
    Jump(i64),
    CallNamed { name: String, argc: u32 },
    Arity(u32),
}

#[derive(Debug, Clone)]
struct AsmTok {
    opcode: u32,
    operand: AsmOperand,
}

/// Builds a raw program byte sequence.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    toks: Vec<AsmTok>,
    labels: HashMap<String, usize>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, opcode: u32, operand: AsmOperand) -> &mut Self {
        self.toks.push(AsmTok { opcode, operand });
        self
    }

    pub fn halt(&mut self) -> &mut Self {
        self.push(ops::OP_HALT, AsmOperand::None)
    }

    pub fn lit(&mut self, v: i64) -> &mut Self {
        self.push(ops::OP_LIT, AsmOperand::Lit(v))
    }

    pub fn v(&mut self, slot: u32) -> &mut Self {
        self.push(ops::OP_V, AsmOperand::Index(slot))
    }

    pub fn let_(&mut self, slot: u32) -> &mut Self {
        self.push(ops::OP_LET, AsmOperand::Index(slot))
    }

    pub fn set(&mut self, slot: u32) -> &mut Self {
        self.push(ops::OP_SET, AsmOperand::Index(slot))
    }

    pub fn add(&mut self) -> &mut Self {
        self.push(ops::OP_ADD, AsmOperand::None)
    }

    pub fn sub(&mut self) -> &mut Self {
        self.push(ops::OP_SUB, AsmOperand::None)
    }

    pub fn mul(&mut self) -> &mut Self {
        self.push(ops::OP_MUL, AsmOperand::None)
    }

    pub fn div(&mut self) -> &mut Self {
        self.push(ops::OP_DIV, AsmOperand::None)
    }

    pub fn mod_(&mut self) -> &mut Self {
        self.push(ops::OP_MOD, AsmOperand::None)
    }

    pub fn neg(&mut self) -> &mut Self {
        self.push(ops::OP_NEG, AsmOperand::None)
    }

    pub fn and(&mut self) -> &mut Self {
        self.push(ops::OP_AND, AsmOperand::None)
    }

    pub fn or(&mut self) -> &mut Self {
        self.push(ops::OP_OR, AsmOperand::None)
    }

    pub fn xor(&mut self) -> &mut Self {
        self.push(ops::OP_XOR, AsmOperand::None)
    }

    pub fn shl(&mut self) -> &mut Self {
        self.push(ops::OP_SHL, AsmOperand::None)
    }

    pub fn shr(&mut self) -> &mut Self {
        self.push(ops::OP_SHR, AsmOperand::None)
    }

    pub fn not(&mut self) -> &mut Self {
        self.push(ops::OP_NOT, AsmOperand::None)
    }

    pub fn lt(&mut self) -> &mut Self {
        self.push(ops::OP_LT, AsmOperand::None)
    }

    pub fn gt(&mut self) -> &mut Self {
        self.push(ops::OP_GT, AsmOperand::None)
    }

    pub fn le(&mut self) -> &mut Self {
        self.push(ops::OP_LE, AsmOperand::None)
    }

    pub fn ge(&mut self) -> &mut Self {
        self.push(ops::OP_GE, AsmOperand::None)
    }

    pub fn eq(&mut self) -> &mut Self {
        self.push(ops::OP_EQ, AsmOperand::None)
    }

    pub fn neq(&mut self) -> &mut Self {
        self.push(ops::OP_NEQ, AsmOperand::None)
    }

    pub fn dup(&mut self) -> &mut Self {
        self.push(ops::OP_DUP, AsmOperand::None)
    }

    pub fn drp(&mut self) -> &mut Self {
        self.push(ops::OP_DRP, AsmOperand::None)
    }

    pub fn rot(&mut self) -> &mut Self {
        self.push(ops::OP_ROT, AsmOperand::None)
    }

    pub fn swp(&mut self) -> &mut Self {
        self.push(ops::OP_SWP, AsmOperand::None)
    }

    /// Emit `B`, run the body, emit the matching `E`.
    pub fn block(&mut self, body: impl FnOnce(&mut Self)) -> &mut Self {
        self.push(ops::OP_B, AsmOperand::None);
        body(self);
        self.push(ops::OP_E, AsmOperand::None)
    }

    /// Emit `IF` with its two back-to-back blocks.
    pub fn if_else(
        &mut self,
        then_body: impl FnOnce(&mut Self),
        else_body: impl FnOnce(&mut Self),
    ) -> &mut Self {
        self.push(ops::OP_IF, AsmOperand::None);
        self.block(then_body);
        self.block(else_body)
    }

    pub fn wh(&mut self) -> &mut Self {
        self.push(ops::OP_WH, AsmOperand::None)
    }

    pub fn fr(&mut self) -> &mut Self {
        self.push(ops::OP_FR, AsmOperand::None)
    }

    pub fn ph(&mut self) -> &mut Self {
        self.push(ops::OP_PH, AsmOperand::None)
    }

    pub fn newarr(&mut self) -> &mut Self {
        self.push(ops::OP_NEWARR, AsmOperand::None)
    }

    pub fn idx(&mut self) -> &mut Self {
        self.push(ops::OP_IDX, AsmOperand::None)
    }

    pub fn sto(&mut self) -> &mut Self {
        self.push(ops::OP_STO, AsmOperand::None)
    }

    /// Alternate name for `IDX`; identical encoding.
    pub fn get(&mut self) -> &mut Self {
        self.idx()
    }

    /// Alternate name for `STO`; identical encoding.
    pub fn put(&mut self) -> &mut Self {
        self.sto()
    }

    pub fn len(&mut self) -> &mut Self {
        self.push(ops::OP_LEN, AsmOperand::None)
    }

    /// Define a function: `FN arity`, a block, and the body inside it. The
    /// label becomes callable via [`ProgramBuilder::cl`].
    pub fn fn_def(
        &mut self,
        name: &str,
        arity: u32,
        body: impl FnOnce(&mut Self),
    ) -> &mut Self {
        self.labels.insert(name.to_string(), self.toks.len());
        self.push(ops::OP_FN, AsmOperand::Arity(arity));
        self.block(body)
    }

    /// Call a function defined (before or after this point) with `fn_def`.
    pub fn cl(&mut self, name: &str, argc: u32) -> &mut Self {
        self.push(
            ops::OP_CL,
            AsmOperand::CallNamed {
                name: name.to_string(),
                argc,
            },
        )
    }

    pub fn rt(&mut self) -> &mut Self {
        self.push(ops::OP_RT, AsmOperand::None)
    }

    pub fn iow(&mut self, device: u32) -> &mut Self {
        self.push(ops::OP_IOW, AsmOperand::Index(device))
    }

    pub fn ior(&mut self, device: u32) -> &mut Self {
        self.push(ops::OP_IOR, AsmOperand::Index(device))
    }

    pub fn gtway(&mut self, cap: u32) -> &mut Self {
        self.push(ops::OP_GTWAY, AsmOperand::Index(cap))
    }

    pub fn wait(&mut self, ms: u32) -> &mut Self {
        self.push(ops::OP_WAIT, AsmOperand::Index(ms))
    }

    pub fn trace(&mut self, level: u32) -> &mut Self {
        self.push(ops::OP_TRACE, AsmOperand::Index(level))
    }

    pub fn gc(&mut self) -> &mut Self {
        self.push(ops::OP_GC, AsmOperand::None)
    }

    pub fn bp(&mut self, id: u32) -> &mut Self {
        self.push(ops::OP_BP, AsmOperand::Index(id))
    }

    pub fn step(&mut self) -> &mut Self {
        self.push(ops::OP_STEP, AsmOperand::None)
    }

    /// Flat jump, offset in tokens relative to the next token.
    pub fn jmp(&mut self, off: i64) -> &mut Self {
        self.push(ops::OP_JMP, AsmOperand::Jump(off))
    }

    pub fn jz(&mut self, off: i64) -> &mut Self {
        self.push(ops::OP_JZ, AsmOperand::Jump(off))
    }

    pub fn jnz(&mut self, off: i64) -> &mut Self {
        self.push(ops::OP_JNZ, AsmOperand::Jump(off))
    }

    pub fn alloc(&mut self) -> &mut Self {
        self.push(ops::OP_ALLOC, AsmOperand::None)
    }

    pub fn free(&mut self) -> &mut Self {
        self.push(ops::OP_FREE, AsmOperand::None)
    }

    /// Assemble the wire bytes. Fails if a `cl` names a label no `fn_def`
    /// defined.
    pub fn finish(&self) -> Result<Vec<u8>, AsmError> {
        // CL entries are byte offsets of their FN tokens; offsets depend on
        // operand lengths, so settle the layout first. Lengths only grow
        // from the 1-byte guess, which bounds the iteration.
        let mut entry_lens: Vec<usize> = vec![1; self.toks.len()];
        let mut offsets: Vec<usize> = vec![0; self.toks.len()];

        loop {
            let mut pos = 0usize;
            for (i, t) in self.toks.iter().enumerate() {
                offsets[i] = pos;
                pos += self.encoded_len(t, entry_lens[i]);
            }

            let mut stable = true;
            for (i, t) in self.toks.iter().enumerate() {
                if let AsmOperand::CallNamed { name, .. } = &t.operand {
                    let target = self.resolve(name)?;
                    let mut probe = Vec::new();
                    varint::encode_u32(offsets[target] as u32, &mut probe);
                    if probe.len() != entry_lens[i] {
                        entry_lens[i] = probe.len();
                        stable = false;
                    }
                }
            }
            if stable {
                break;
            }
        }

        let mut bytes = Vec::new();
        for t in &self.toks {
            varint::encode_u32(t.opcode, &mut bytes);
            match &t.operand {
                AsmOperand::None => {}
                AsmOperand::Lit(v) => varint::encode_i64(*v, &mut bytes),
                AsmOperand::Index(v) | AsmOperand::Arity(v) => {
                    varint::encode_u32(*v, &mut bytes)
                }
                AsmOperand::Jump(off) => varint::encode_i64(*off, &mut bytes),
                AsmOperand::CallNamed { name, argc } => {
                    varint::encode_u32(offsets[self.resolve(name)?] as u32, &mut bytes);
                    varint::encode_u32(*argc, &mut bytes);
                }
            }
        }
        Ok(bytes)
    }

    fn resolve(&self, name: &str) -> Result<usize, AsmError> {
        self.labels.get(name).copied().ok_or_else(|| AsmError {
            label: name.to_string(),
        })
    }

    fn encoded_len(&self, t: &AsmTok, entry_len: usize) -> usize {
        let mut buf = Vec::new();
        varint::encode_u32(t.opcode, &mut buf);
        match &t.operand {
            AsmOperand::None => {}
            AsmOperand::Lit(v) => varint::encode_i64(*v, &mut buf),
            AsmOperand::Index(v) | AsmOperand::Arity(v) => varint::encode_u32(*v, &mut buf),
            AsmOperand::Jump(off) => varint::encode_i64(*off, &mut buf),
            AsmOperand::CallNamed { argc, .. } => {
                buf.extend(vec![0u8; entry_len]);
                varint::encode_u32(*argc, &mut buf);
            }
        }
        buf.len()
    }
}
