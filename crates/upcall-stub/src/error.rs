use crate::abi::{BasicType, Register};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid convention descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Unsupported return type: {0:?}")]
    UnsupportedReturnType(BasicType),

    #[error("Argument count mismatch: {native} native arguments, {runtime} runtime arguments")]
    SignatureMismatch { native: usize, runtime: usize },

    #[error("Argument shuffle conflict: {0}")]
    ShuffleConflict(String),

    #[error("Register {register} cannot be used as {role}")]
    RegisterConflict { register: Register, role: &'static str },

    #[error("Return buffer too small: {provided} bytes provided, {required} bytes required")]
    ReturnBufferTooSmall { required: usize, provided: usize },

    #[error("Code buffer overflow: {size} bytes emitted, capacity is {capacity}")]
    CodeBufferOverflow { size: usize, capacity: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
