//! Architecture-specific instruction handling.
//!
//! DOS MZ executables only ever carry real-mode x86 code.

pub mod x86;

pub use x86::{
    decode, Comparison, Correspondence, Flow, Instruction, InstructionMatch, MemoryOperand,
    Operand,
};
