//! Portable stub instruction set and the code buffer it assembles into.

// Encoding uses explicit 'as' casts for byte packing.
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

mod blob;
mod instruction;
mod opcode;

pub(crate) use blob::encode_var_u32;
pub use blob::CodeBuffer;
pub use instruction::Instruction;
pub use opcode::Opcode;
