//! Semantic analysis and bytecode generation for via (§4.3, §6.3): walks
//! the arena-allocated AST that `via-syntax` produces and lowers it to a
//! flat [`Instruction`] stream, folding constants and checking declaration,
//! assignment, and call-site type compatibility along the way.

mod codegen;
mod constpool;
mod instruction;
mod regalloc;
mod symbols;
mod types;

pub use codegen::{compile, disassemble, CompiledUnit};
pub use constpool::{ConstValue, ConstantPool};
pub use instruction::{join_f32, join_i32, split_f32, split_i32, Instruction, Opcode};
pub use regalloc::RegisterAllocator;
pub use symbols::{LoopLabels, Resolution, SymbolTable};
pub use types::{compatible, Ty};
