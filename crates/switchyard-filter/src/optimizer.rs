//! Peephole cleanup over the opcode arena.

use crate::opcode::{Opcode, Program};
use crate::FilterError;

/// Remove jumps that can never be taken together with the constant feeding
/// them, then block ends nothing jumps to. Returns the number of opcodes
/// removed.
pub fn optimize(program: &mut Program) -> Result<usize, FilterError> {
    let mut removed = 0;

    for id in program.ids() {
        let Some(next) = program.next(id) else {
            continue;
        };
        let never_taken = matches!(
            (program.op(id), program.op(next)),
            (Opcode::PushBool(true), Opcode::JumpIfFalse { .. })
                | (Opcode::PushBool(false), Opcode::JumpIfTrue { .. })
        );
        if never_taken && program.jump_sources(id).is_empty() {
            program.remove(next)?;
            program.remove(id)?;
            removed += 2;
        }
    }

    for id in program.ids() {
        if *program.op(id) == Opcode::BlockEnd && program.jump_sources(id).is_empty() {
            program.remove(id)?;
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::debug!(removed, remaining = program.len(), "optimized filter program");
    }
    Ok(removed)
}
