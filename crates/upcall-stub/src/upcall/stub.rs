use std::fmt;

use super::emitter::{PhaseMark, StubPhase};
use super::frame::FrameLayout;
use super::hooks::{ReceiverHandle, TargetMethod};
use super::shuffle::ArgumentShuffle;
use crate::masm::{CodeBuffer, Instruction, encode_var_u32};

/// A generated upcall stub. Entry is at offset 0 and uses the native ABI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubBlob {
    pub(crate) name: String,
    pub(crate) code: CodeBuffer,
    pub(crate) layout: FrameLayout,
    pub(crate) shuffle: ArgumentShuffle,
    pub(crate) exception_handler_offset: usize,
    pub(crate) phases: Vec<PhaseMark>,
    pub(crate) method: TargetMethod,
    pub(crate) receiver: ReceiverHandle,
}

impl StubBlob {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        self.code.instructions()
    }

    #[must_use]
    pub fn code(&self) -> &CodeBuffer {
        &self.code
    }

    #[must_use]
    pub const fn entry_offset(&self) -> usize {
        0
    }

    #[must_use]
    pub const fn exception_handler_offset(&self) -> usize {
        self.exception_handler_offset
    }

    #[must_use]
    pub const fn frame_size(&self) -> usize {
        self.layout.frame_size()
    }

    #[must_use]
    pub fn frame_data_offset(&self) -> usize {
        self.layout.offset(super::frame::FrameRegion::FrameData)
    }

    #[must_use]
    pub const fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    #[must_use]
    pub const fn shuffle(&self) -> &ArgumentShuffle {
        &self.shuffle
    }

    #[must_use]
    pub fn phases(&self) -> &[PhaseMark] {
        &self.phases
    }

    #[must_use]
    pub fn phase_offset(&self, phase: StubPhase) -> Option<usize> {
        self.phases
            .iter()
            .find(|mark| mark.phase == phase)
            .map(|mark| mark.offset)
    }

    #[must_use]
    pub const fn method(&self) -> &TargetMethod {
        &self.method
    }

    #[must_use]
    pub const fn receiver(&self) -> ReceiverHandle {
        self.receiver
    }

    /// Serialized form: var-int header (code length, exception handler
    /// offset, frame size, frame data offset) followed by the code.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let code = self.code.code();
        let mut blob = Vec::with_capacity(code.len() + 16);
        for value in [
            code.len(),
            self.exception_handler_offset,
            self.frame_size(),
            self.frame_data_offset(),
        ] {
            blob.extend(encode_var_u32(value as u32));
        }
        blob.extend_from_slice(code);
        blob
    }
}

impl fmt::Display for StubBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} -> {} ({} bytes, exception handler at {})",
            self.name,
            self.method.name(),
            self.code.len(),
            self.exception_handler_offset
        )?;
        write!(f, "{}", self.layout)?;
        write!(f, "{}", self.code.disassemble())
    }
}
