//! Disassembler: a read-only, token-per-line view of a loaded program.

use super::Program;
use super::ops::{self, Operand};

/// Disassembler over a loaded program.
pub struct Disassembler<'a> {
    program: &'a Program,
    output: String,
}

impl<'a> Disassembler<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self {
            program,
            output: String::new(),
        }
    }

    pub fn disassemble(&mut self) -> &str {
        for (i, token) in self.program.tokens().iter().enumerate() {
            let offset = self.program.token_offset(i).unwrap_or(0);
            self.output.push_str(&format!("{:04} {:05}: ", i, offset));
            self.disassemble_token(i, token);
            self.output.push('\n');
        }
        &self.output
    }

    fn disassemble_token(&mut self, index: usize, token: &ops::Token) {
        let name = ops::opcode_name(token.opcode).unwrap_or("???");
        match token.operand {
            Operand::None => self.output.push_str(name),
            Operand::Lit(v) => self.output.push_str(&format!("{} {}", name, v)),
            Operand::Index(v) => self.output.push_str(&format!("{} {}", name, v)),
            Operand::Arity(v) => self.output.push_str(&format!("{} {}", name, v)),
            Operand::Jump(off) => {
                let target = index as i64 + 1 + off;
                self.output
                    .push_str(&format!("{} {:+} ; -> {:04}", name, off, target));
            }
            Operand::Call { entry, argc } => {
                let target = self
                    .program
                    .token_at_byte(entry as usize)
                    .map(|t| format!("{:04}", t))
                    .unwrap_or_else(|| "????".to_string());
                self.output
                    .push_str(&format!("{} @{} argc={} ; -> {}", name, entry, argc, target));
            }
        }
    }
}

/// Format a loaded program as a disassembly listing.
pub fn format_program(program: &Program) -> String {
    let mut d = Disassembler::new(program);
    d.disassemble().to_string()
}
