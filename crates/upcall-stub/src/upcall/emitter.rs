use std::fmt;

use crate::masm::{CodeBuffer, Instruction};
use crate::{Error, Result};

/// Emission phases of an upcall stub, in the order they are laid down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubPhase {
    Prologue,
    SpillArgs,
    PreserveCallee,
    OnEntryHook,
    ShuffleArgs,
    ResolveReceiver,
    Invoke,
    HandleResult,
    SpillResult,
    OnExitHook,
    RestoreCallee,
    FillResult,
    Epilogue,
    /// Out-of-line; reached only when the target raises.
    ExceptionAbort,
}

impl StubPhase {
    pub const ALL: [Self; 14] = [
        Self::Prologue,
        Self::SpillArgs,
        Self::PreserveCallee,
        Self::OnEntryHook,
        Self::ShuffleArgs,
        Self::ResolveReceiver,
        Self::Invoke,
        Self::HandleResult,
        Self::SpillResult,
        Self::OnExitHook,
        Self::RestoreCallee,
        Self::FillResult,
        Self::Epilogue,
        Self::ExceptionAbort,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Prologue => "prologue",
            Self::SpillArgs => "spill_args",
            Self::PreserveCallee => "preserve_callee_saved",
            Self::OnEntryHook => "on_entry",
            Self::ShuffleArgs => "argument_shuffle",
            Self::ResolveReceiver => "receiver",
            Self::Invoke => "invoke",
            Self::HandleResult => "handle_result",
            Self::SpillResult => "spill_result",
            Self::OnExitHook => "on_exit",
            Self::RestoreCallee => "restore_callee_saved",
            Self::FillResult => "fill_result",
            Self::Epilogue => "epilogue",
            Self::ExceptionAbort => "exception_handler",
        }
    }
}

impl fmt::Display for StubPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Byte offset at which a phase begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseMark {
    pub phase: StubPhase,
    pub offset: usize,
}

/// Straight-line instruction sink for one stub.
///
/// Tracks the running byte offset so phase starts and the exception handler
/// entry can be published without re-encoding.
#[derive(Debug, Default)]
pub struct StubEmitter {
    instructions: Vec<Instruction>,
    byte_offset: usize,
    phases: Vec<PhaseMark>,
}

impl StubEmitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, instr: Instruction) {
        self.byte_offset += instr.encode().len();
        self.instructions.push(instr);
    }

    #[must_use]
    pub const fn current_offset(&self) -> usize {
        self.byte_offset
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    #[must_use]
    pub fn phases(&self) -> &[PhaseMark] {
        &self.phases
    }

    pub fn block_comment(&mut self, text: &'static str) {
        self.emit(Instruction::Comment(text));
    }

    /// Record the start of `phase` at the current offset.
    pub fn begin_phase(&mut self, phase: StubPhase) {
        tracing::debug!(%phase, offset = self.byte_offset, "emitting phase");
        self.phases.push(PhaseMark {
            phase,
            offset: self.byte_offset,
        });
    }

    /// Assemble into a code buffer of at most `capacity` bytes.
    pub fn finish(self, capacity: usize) -> Result<(CodeBuffer, Vec<PhaseMark>)> {
        let code = CodeBuffer::assemble(self.instructions, capacity)?;
        debug_assert_eq!(code.len(), self.byte_offset);
        Ok((code, self.phases))
    }
}

/// Convert a frame offset to an instruction immediate.
pub(crate) fn frame_offset(offset: usize) -> Result<i32> {
    i32::try_from(offset)
        .map_err(|_| Error::Internal(format!("frame offset {offset} does not fit in an immediate")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_track_encoded_length() {
        let mut e = StubEmitter::new();
        e.begin_phase(StubPhase::Prologue);
        e.emit(Instruction::Enter);
        e.block_comment("{ on_entry");
        e.begin_phase(StubPhase::OnEntryHook);
        e.emit(Instruction::LoadImm64 { reg: 8, value: 7 });
        assert_eq!(e.current_offset(), 11);
        assert_eq!(
            e.phases()[1],
            PhaseMark {
                phase: StubPhase::OnEntryHook,
                offset: 1
            }
        );
        let (code, phases) = e.finish(64).unwrap();
        assert_eq!(code.len(), 11);
        assert_eq!(phases.len(), 2);
    }

    #[test]
    fn test_frame_offset_overflow() {
        assert_eq!(frame_offset(16).unwrap(), 16);
        assert!(frame_offset(usize::MAX).is_err());
    }
}
