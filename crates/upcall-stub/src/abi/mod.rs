//! Register model, calling-convention descriptors and the fixed layout
//! constants shared by the frame planner, the emitter and the tests.
//!
//! Everything that names a concrete register or a byte offset inside a
//! runtime structure lives here so the generator and the simulator agree.

mod convention;
mod descriptor;
mod register;

pub use convention::{ArgSlot, BasicType, CallingConvention, Signature};
pub use descriptor::{ConventionDescriptor, DescriptorBuilder};
pub use register::{Location, PlatformRegisters, RegKind, Register, RegisterSet, StackArea, TargetArch};

// ── Stack slots ──

/// Size of one stack slot as counted by `ArgumentShuffle::out_arg_stack_slots`.
pub const STACK_SLOT_SIZE: usize = 4;

/// Bytes occupied by one stack-passed argument (two stack slots).
pub const STACK_ARG_SIZE: usize = 8;

/// Machine word size.
pub const WORD_SIZE: usize = 8;

/// Bytes pushed by `Enter`: saved frame pointer and link register.
/// Incoming stack arguments start this far above the frame pointer.
pub const ENTER_FRAME_SIZE: usize = 16;

// ── Register widths ──

/// Spill width of a general-purpose register.
pub const GP_SPILL_WIDTH: usize = 8;

/// Spill width of a floating/vector register (full 128-bit value).
pub const VECTOR_SPILL_WIDTH: usize = 16;

/// Bytes stored per callee-saved register. For vector registers only the
/// lower 64 bits are preserved.
pub const CALLEE_SAVE_WIDTH: usize = 8;

/// Return buffer slot width for a general return register.
pub const RET_BUF_GP_SLOT: usize = 8;

/// Return buffer slot width for a floating return register.
/// Must match the vector register size the runtime uses when it writes the buffer.
pub const RET_BUF_VECTOR_SLOT: usize = 16;

// ── Frame regions ──

/// Deopt spill slot: room for one reference across a deoptimization.
pub const DEOPT_SPILL_SIZE: usize = WORD_SIZE;

/// Frame metadata record handed to `on_entry`/`on_exit`.
///
/// Layout:
/// - 0: frame anchor sp
/// - 8: frame anchor fp
/// - 16: frame anchor pc
/// - 24: thread context
/// - 32: old handle block
/// - 40: new handle block
/// - 48: should-detach flag (one word)
///
/// Total: 7 * 8 = 56 bytes.
pub const FRAME_DATA_SIZE: usize = 56;

pub const FRAME_DATA_ANCHOR_SP: usize = 0;
pub const FRAME_DATA_ANCHOR_FP: usize = 8;
pub const FRAME_DATA_ANCHOR_PC: usize = 16;
pub const FRAME_DATA_THREAD: usize = 24;
pub const FRAME_DATA_OLD_HANDLES: usize = 32;
pub const FRAME_DATA_NEW_HANDLES: usize = 40;
pub const FRAME_DATA_SHOULD_DETACH: usize = 48;

// ── Runtime structure offsets ──

/// Offset of the callee-target field inside the runtime's thread context.
/// The stub records the method it is about to call there so a deoptimization
/// of the callee can find it.
pub const THREAD_CALLEE_TARGET_OFFSET: i32 = 0x48;

/// Offset of the current compiled entry point inside the method metadata.
/// This is the callee-target cell the runtime rewrites on recompilation.
pub const METHOD_FROM_COMPILED_OFFSET: i32 = 0x30;

/// Low bit set on weak receiver handles.
pub const WEAK_HANDLE_TAG: u64 = 1;
