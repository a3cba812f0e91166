#![allow(
    clippy::cast_possible_truncation, // intentional: register indices are u8, frame offsets fit i32
    clippy::cast_possible_wrap, // intentional: signed immediates built from unsigned frame offsets
    clippy::missing_errors_doc // every fallible function returns the crate Error
)]

pub mod abi;
pub mod error;
pub mod masm;
pub mod upcall;

/// Test harness module for writing unit and integration tests.
///
/// This module is only available when running tests or when the
/// `test-harness` feature is enabled.
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use abi::{
    BasicType, CallingConvention, ConventionDescriptor, Location, Register, RegisterSet,
    Signature, TargetArch,
};
pub use error::{Error, Result};
pub use masm::{CodeBuffer, Instruction, Opcode};
pub use upcall::{
    ReturnBuffer, StubBlob, StubOptions, StubRequest, generate_upcall_stub, plan_shuffle,
};
