//! M-Token opcode numbering and static per-opcode metadata.
//!
//! Opcode space: 0-99 is the frozen public core, 100-199 is loader/debug
//! IR (the flat jumps emitted by the lowerer live here), 200/201 are the
//! heap extension. Opcodes are varint-encoded on the wire, never
//! fixed-width.

// Core: system
pub const OP_HALT: u32 = 0;
pub const OP_LIT: u32 = 1;
pub const OP_V: u32 = 2;
pub const OP_LET: u32 = 3;
pub const OP_SET: u32 = 4;

// Core: integer arithmetic
pub const OP_ADD: u32 = 10;
pub const OP_SUB: u32 = 11;
pub const OP_MUL: u32 = 12;
pub const OP_DIV: u32 = 13;
pub const OP_MOD: u32 = 14;
pub const OP_NEG: u32 = 15;
pub const OP_AND: u32 = 16;
pub const OP_OR: u32 = 17;
pub const OP_XOR: u32 = 18;
pub const OP_SHL: u32 = 19;
pub const OP_SHR: u32 = 20;
pub const OP_NOT: u32 = 21;

// Core: comparison
pub const OP_LT: u32 = 30;
pub const OP_GT: u32 = 31;
pub const OP_LE: u32 = 32;
pub const OP_GE: u32 = 33;
pub const OP_EQ: u32 = 34;
pub const OP_NEQ: u32 = 35;

// Core: stack shuffles
pub const OP_DUP: u32 = 40;
pub const OP_DRP: u32 = 41;
pub const OP_ROT: u32 = 42;
pub const OP_SWP: u32 = 43;

// Core: structured control
pub const OP_B: u32 = 50;
pub const OP_E: u32 = 51;
pub const OP_IF: u32 = 52;
pub const OP_WH: u32 = 53;
pub const OP_FR: u32 = 54;
pub const OP_PH: u32 = 55;

// Core: arrays
pub const OP_NEWARR: u32 = 60;
pub const OP_IDX: u32 = 61;
pub const OP_STO: u32 = 62;
pub const OP_LEN: u32 = 63;

// Core: functions
pub const OP_FN: u32 = 70;
pub const OP_CL: u32 = 71;
pub const OP_RT: u32 = 72;

// Core: I/O and system
pub const OP_IOW: u32 = 80;
pub const OP_IOR: u32 = 81;
pub const OP_GTWAY: u32 = 82;
pub const OP_WAIT: u32 = 83;
pub const OP_TRACE: u32 = 84;
pub const OP_GC: u32 = 85;
pub const OP_BP: u32 = 86;
pub const OP_STEP: u32 = 87;

// Extension IR: flat jumps, offsets in tokens relative to the next token
pub const OP_JMP: u32 = 100;
pub const OP_JZ: u32 = 101;
pub const OP_JNZ: u32 = 102;

// Heap extension
pub const OP_ALLOC: u32 = 200;
pub const OP_FREE: u32 = 201;

/// First extension opcode; a `core_only` validation rejects anything at or
/// above this value.
pub const EXTENSION_BASE: u32 = 100;

/// Largest opcode value the encoding admits.
pub const OPCODE_MAX: u32 = 255;

/// Operand shape attached to an opcode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    None,
    /// Zigzag-encoded literal (`LIT`)
    Lit(i64),
    /// Unsigned index: local/global slot, device id, cap id, trace level,
    /// breakpoint id, wait ms
    Index(u32),
    /// Signed jump offset in token units, relative to the next token
    Jump(i64),
    /// Call site: function-entry byte offset plus argument count
    Call { entry: u32, argc: u32 },
    /// Function definition arity
    Arity(u32),
}

/// One opcode together with its decoded operands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token {
    pub opcode: u32,
    pub operand: Operand,
}

/// Operand shape classes used by the tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Lit,
    Index,
    Jump,
    Call,
    Arity,
}

/// Operand shape for a known opcode, or `None` for values outside the
/// instruction set.
pub fn operand_kind(opcode: u32) -> Option<OperandKind> {
    let kind = match opcode {
        OP_LIT => OperandKind::Lit,
        OP_V | OP_LET | OP_SET => OperandKind::Index,
        OP_IOW | OP_IOR | OP_GTWAY | OP_WAIT | OP_TRACE | OP_BP => OperandKind::Index,
        OP_FN => OperandKind::Arity,
        OP_CL => OperandKind::Call,
        OP_JMP | OP_JZ | OP_JNZ => OperandKind::Jump,
        OP_HALT
        | OP_ADD | OP_SUB | OP_MUL | OP_DIV | OP_MOD | OP_NEG
        | OP_AND | OP_OR | OP_XOR | OP_SHL | OP_SHR | OP_NOT
        | OP_LT | OP_GT | OP_LE | OP_GE | OP_EQ | OP_NEQ
        | OP_DUP | OP_DRP | OP_ROT | OP_SWP
        | OP_B | OP_E | OP_IF | OP_WH | OP_FR | OP_PH
        | OP_NEWARR | OP_IDX | OP_STO | OP_LEN
        | OP_RT
        | OP_GC | OP_STEP
        | OP_ALLOC | OP_FREE => OperandKind::None,
        _ => return None,
    };
    Some(kind)
}

/// Stable display name, or `None` for values outside the instruction set.
pub fn opcode_name(opcode: u32) -> Option<&'static str> {
    let name = match opcode {
        OP_HALT => "HALT",
        OP_LIT => "LIT",
        OP_V => "V",
        OP_LET => "LET",
        OP_SET => "SET",
        OP_ADD => "ADD",
        OP_SUB => "SUB",
        OP_MUL => "MUL",
        OP_DIV => "DIV",
        OP_MOD => "MOD",
        OP_NEG => "NEG",
        OP_AND => "AND",
        OP_OR => "OR",
        OP_XOR => "XOR",
        OP_SHL => "SHL",
        OP_SHR => "SHR",
        OP_NOT => "NOT",
        OP_LT => "LT",
        OP_GT => "GT",
        OP_LE => "LE",
        OP_GE => "GE",
        OP_EQ => "EQ",
        OP_NEQ => "NEQ",
        OP_DUP => "DUP",
        OP_DRP => "DRP",
        OP_ROT => "ROT",
        OP_SWP => "SWP",
        OP_B => "B",
        OP_E => "E",
        OP_IF => "IF",
        OP_WH => "WH",
        OP_FR => "FR",
        OP_PH => "PH",
        OP_NEWARR => "NEWARR",
        OP_IDX => "IDX",
        OP_STO => "STO",
        OP_LEN => "LEN",
        OP_FN => "FN",
        OP_CL => "CL",
        OP_RT => "RT",
        OP_IOW => "IOW",
        OP_IOR => "IOR",
        OP_GTWAY => "GTWAY",
        OP_WAIT => "WAIT",
        OP_TRACE => "TRACE",
        OP_GC => "GC",
        OP_BP => "BP",
        OP_STEP => "STEP",
        OP_JMP => "JMP",
        OP_JZ => "JZ",
        OP_JNZ => "JNZ",
        OP_ALLOC => "ALLOC",
        OP_FREE => "FREE",
        _ => return None,
    };
    Some(name)
}

/// Linear stack effect of a token: (pops, pushes).
///
/// This is the model shared by the lowerer's condition-range scan and the
/// validator's height tracking; control transfer itself is handled by the
/// caller.
pub fn stack_effect(token: &Token) -> (usize, usize) {
    match token.opcode {
        OP_LIT | OP_V | OP_IOR => (0, 1),
        OP_LET | OP_SET | OP_DRP | OP_RT | OP_IOW => (1, 0),
        OP_IF | OP_WH | OP_FR | OP_JZ | OP_JNZ => (1, 0),

        OP_ADD | OP_SUB | OP_MUL | OP_DIV | OP_MOD | OP_AND | OP_OR | OP_XOR | OP_SHL
        | OP_SHR => (2, 1),
        OP_NEG | OP_NOT => (1, 1),
        OP_LT | OP_GT | OP_LE | OP_GE | OP_EQ | OP_NEQ => (2, 1),

        OP_DUP => (1, 2),
        OP_ROT => (3, 3),
        OP_SWP => (2, 2),

        OP_NEWARR | OP_LEN | OP_ALLOC => (1, 1),
        OP_IDX => (2, 1),
        OP_STO => (3, 1),
        OP_FREE => (1, 0),

        OP_CL => match token.operand {
            Operand::Call { argc, .. } => (argc as usize, 1),
            _ => (0, 1),
        },

        // B, E, PH, FN, HALT, JMP, GTWAY, WAIT, TRACE, GC, BP, STEP
        _ => (0, 0),
    }
}

/// Producer ranges under the linear stack model: for each live stack slot,
/// the first and last token index of the expression that produced it.
///
/// The lowerer uses the top entry to find the condition feeding a `WH`/`FR`;
/// the validator uses it to find loop back-edge targets. A pop from an empty
/// model stack is treated as produced on the spot so the scan always
/// completes; real underflows are the validator's to report.
pub fn producer_ranges(tokens: &[Token], upto: usize) -> Vec<(usize, usize)> {
    let mut sim: Vec<(usize, usize)> = Vec::new();
    for (i, token) in tokens.iter().take(upto).enumerate() {
        let (pops, pushes) = stack_effect(token);
        let mut start = i;
        for _ in 0..pops {
            if let Some((s, _)) = sim.pop() {
                start = start.min(s);
            }
        }
        for _ in 0..pushes {
            sim.push((start, i));
        }
    }
    sim
}

/// Fixed, platform-independent gas cost per opcode. Only consulted when the
/// gas limit is non-zero.
pub fn gas_cost(opcode: u32) -> u64 {
    match opcode {
        OP_B | OP_E | OP_HALT | OP_PH => 0,
        OP_LIT | OP_V | OP_LET | OP_IDX | OP_LEN | OP_FREE => 2,
        OP_SET | OP_STO | OP_IOR | OP_MUL => 3,
        OP_DIV | OP_MOD | OP_NEWARR | OP_ALLOC | OP_CL | OP_IOW => 5,
        OP_GC => 10,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_named_opcode_has_a_shape() {
        for op in 0..=OPCODE_MAX {
            assert_eq!(
                opcode_name(op).is_some(),
                operand_kind(op).is_some(),
                "op={}",
                op
            );
        }
    }

    #[test]
    fn test_core_extension_split() {
        assert!(OP_STEP < EXTENSION_BASE);
        assert!(OP_JMP >= EXTENSION_BASE);
        assert!(OP_ALLOC >= EXTENSION_BASE);
    }

    #[test]
    fn test_gas_table_markers_free() {
        for op in [OP_B, OP_E, OP_HALT, OP_PH] {
            assert_eq!(gas_cost(op), 0);
        }
        assert_eq!(gas_cost(OP_DIV), 5);
        assert_eq!(gas_cost(OP_GC), 10);
    }

    #[test]
    fn test_call_stack_effect_uses_argc() {
        let token = Token {
            opcode: OP_CL,
            operand: Operand::Call { entry: 0, argc: 3 },
        };
        assert_eq!(stack_effect(&token), (3, 1));
    }
}
