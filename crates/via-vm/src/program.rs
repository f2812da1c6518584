//! Loading a compiled unit into something the dispatch loop can run:
//! builds the label table by scanning for `LBL id` entries, the one
//! load-time step the VM itself depends on. Wiring a top-level closure and
//! aggregating diagnostics is the `via` crate's job, one layer up; this is
//! the mechanical half both that and `via-vm`'s own tests share.

use std::collections::HashMap;

use via_compiler::{ConstValue, Instruction, Opcode};

/// Instructions, constants, and the label→PC table a loaded program is
/// dispatched against.
pub struct Program<'a> {
    pub instructions: Vec<Instruction>,
    pub constants: Vec<ConstValue<'a>>,
    pub labels: HashMap<u16, usize>,
}

impl<'a> Program<'a> {
    #[must_use]
    pub fn load(instructions: Vec<Instruction>, constants: Vec<ConstValue<'a>>) -> Self {
        let labels = instructions
            .iter()
            .enumerate()
            .filter_map(|(pc, instr)| (instr.op == Opcode::Lbl).then_some((instr.a, pc)))
            .collect();
        Self { instructions, constants, labels }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use via_compiler::Instruction;

    #[test]
    fn label_table_maps_ids_to_instruction_indices() {
        let instructions = vec![
            Instruction::nullary(Opcode::Nop),
            Instruction::a_only(Opcode::Lbl, 7),
            Instruction::nullary(Opcode::Exit),
        ];
        let program = Program::load(instructions, Vec::new());
        assert_eq!(program.labels.get(&7), Some(&1));
    }
}
