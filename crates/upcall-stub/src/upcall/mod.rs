//! Upcall stub generation: native code calling into a managed method.
//!
//! A stub is generated once per (signature, target) pair. On entry it saves
//! what the native caller expects preserved, attaches the thread through
//! `on_entry`, moves the arguments into the runtime convention, resolves
//! the receiver and calls the method's current entry point. On return it
//! collects the result into the native return registers, detaches through
//! `on_exit` and restores the caller's registers. An exception escaping the
//! target lands in an out-of-line handler that never returns.

mod emitter;
mod frame;
mod hooks;
mod shuffle;
mod spill;
mod stub;

pub use emitter::{PhaseMark, StubEmitter, StubPhase};
pub use frame::{FrameLayout, FrameLayoutPlanner, FrameRegion, RegionSpan, align_up};
pub use hooks::{CalleeTarget, EntryAbi, ExternalEntry, ReceiverHandle, TargetMethod, UpcallHooks};
pub use shuffle::{ArgumentShuffle, Move, MoveContext};
pub use spill::{CalleeSaved, RegSpiller};
pub use stub::StubBlob;

use crate::abi::{
    BasicType, CallingConvention, ConventionDescriptor, ENTER_FRAME_SIZE, Location,
    METHOD_FROM_COMPILED_OFFSET, RET_BUF_GP_SLOT, RET_BUF_VECTOR_SLOT, RegKind, Register,
    Signature, StackArea, THREAD_CALLEE_TARGET_OFFSET, TargetArch,
};
use crate::masm::Instruction;
use crate::{Error, Result};
use emitter::frame_offset;

pub const DEFAULT_CODE_CAPACITY: usize = 2048;

/// Whether results travel through a frame-resident return buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnBuffer {
    /// Use a buffer unless the runtime hands the result back in the native
    /// return register. Always a buffer for multi-register results.
    #[default]
    Auto,
    /// Always use a buffer of this many bytes.
    Explicit(usize),
}

impl ReturnBuffer {
    /// Bytes to reserve, or `None` when the result comes back in registers.
    /// `in_registers` says whether the runtime returns the result in exactly
    /// the registers the native caller reads it from.
    pub fn resolve(self, signature: &Signature, in_registers: bool) -> Result<Option<usize>> {
        let required = signature.return_buffer_bytes();
        match self {
            Self::Auto => Ok((!in_registers).then_some(required)),
            Self::Explicit(provided) if provided < required => {
                Err(Error::ReturnBufferTooSmall { required, provided })
            }
            Self::Explicit(provided) => Ok(Some(provided)),
        }
    }
}

/// Diagnostics and limits for generation. None of these change the code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubOptions {
    /// Log the argument shuffle plan.
    pub print_shuffle_plan: bool,
    /// Log the disassembled stub.
    pub trace_stubs: bool,
    /// Upper bound on emitted code size in bytes.
    pub code_capacity: usize,
}

impl Default for StubOptions {
    fn default() -> Self {
        Self {
            print_shuffle_plan: false,
            trace_stubs: false,
            code_capacity: DEFAULT_CODE_CAPACITY,
        }
    }
}

/// Everything needed to generate one stub.
#[derive(Debug, Clone)]
pub struct StubRequest {
    pub target: TargetArch,
    pub native: ConventionDescriptor,
    pub runtime: ConventionDescriptor,
    pub signature: Signature,
    pub method: TargetMethod,
    pub receiver: ReceiverHandle,
    pub hooks: UpcallHooks,
    pub return_buffer: ReturnBuffer,
}

impl StubRequest {
    /// AArch64 target with the AAPCS64 native side and the runtime's own convention.
    #[must_use]
    pub fn aarch64(
        signature: Signature,
        method: TargetMethod,
        receiver: ReceiverHandle,
        hooks: UpcallHooks,
    ) -> Self {
        Self {
            target: TargetArch::aarch64(),
            native: ConventionDescriptor::aapcs64(),
            runtime: ConventionDescriptor::aarch64_runtime(),
            signature,
            method,
            receiver,
            hooks,
            return_buffer: ReturnBuffer::Auto,
        }
    }

    #[must_use]
    pub fn with_target(mut self, target: TargetArch) -> Self {
        self.target = target;
        self
    }

    #[must_use]
    pub fn with_conventions(
        mut self,
        native: ConventionDescriptor,
        runtime: ConventionDescriptor,
    ) -> Self {
        self.native = native;
        self.runtime = runtime;
        self
    }

    #[must_use]
    pub fn with_return_buffer(mut self, return_buffer: ReturnBuffer) -> Self {
        self.return_buffer = return_buffer;
        self
    }

    fn stub_name(&self) -> String {
        if cfg!(debug_assertions) {
            format!("upcall_stub_{}", self.signature)
        } else {
            "upcall_stub".to_string()
        }
    }
}

/// Native and runtime placements for one request, before any code exists.
struct Placement {
    native_args: CallingConvention,
    runtime_args: CallingConvention,
    native_returns: CallingConvention,
    /// Buffer size and the runtime register carrying its address.
    return_buffer: Option<(usize, Register)>,
    receiver: Register,
}

fn place(request: &StubRequest) -> Result<Placement> {
    let regs = request.target.registers();
    request.native.validate(regs)?;
    request.runtime.validate(regs)?;
    request.hooks.validate()?;

    let signature = &request.signature;
    let native_args =
        CallingConvention::arguments(&request.native, signature.args(), StackArea::Incoming);
    let runtime_types: Vec<_> = std::iter::once(BasicType::Object)
        .chain(signature.args().iter().copied())
        .collect();
    let runtime_args =
        CallingConvention::arguments(&request.runtime, &runtime_types, StackArea::Outgoing);
    let native_returns = CallingConvention::returns(&request.native, signature.returns())?;
    // A runtime without a matching result register returns through memory.
    let in_registers = signature.returns().len() <= 1
        && CallingConvention::returns(&request.runtime, signature.returns())
            .is_ok_and(|runtime| runtime.registers() == native_returns.registers());
    let return_buffer = request.return_buffer.resolve(signature, in_registers)?;

    let (receiver, return_buffer_register) = validate_register_roles(
        request,
        &native_args,
        &runtime_args,
        &native_returns,
        return_buffer.is_some(),
    )?;
    let return_buffer = return_buffer.zip(return_buffer_register);

    Ok(Placement {
        native_args,
        runtime_args,
        native_returns,
        return_buffer,
        receiver,
    })
}

/// Check that the stub's fixed registers stay out of the way of the values
/// it moves. Returns the runtime receiver register and, when a return buffer
/// is used, the register that carries its address.
fn validate_register_roles(
    request: &StubRequest,
    native_args: &CallingConvention,
    runtime_args: &CallingConvention,
    native_returns: &CallingConvention,
    uses_return_buffer: bool,
) -> Result<(Register, Option<Register>)> {
    let p = request.target.platform();
    let native_regs = native_args.registers();
    let runtime_regs = runtime_args.registers();
    let conflict = |register, role| Err(Error::RegisterConflict { register, role });

    for (reg, role) in [
        (p.scratch1, "scratch register"),
        (p.method, "method register"),
        (p.thread, "thread register"),
    ] {
        if runtime_regs.contains(&reg) {
            return conflict(reg, role);
        }
    }
    // Native arguments are refilled after the thread register is loaded.
    if native_regs.contains(&p.thread) {
        return conflict(p.thread, "thread register");
    }
    for (reg, role) in [
        (p.shuffle, "shuffle register"),
        (p.scratch2, "second scratch register"),
    ] {
        if native_regs.contains(&reg) || runtime_regs.contains(&reg) {
            return conflict(reg, role);
        }
    }

    let mut return_buffer_register = None;
    if uses_return_buffer {
        if native_returns.registers().contains(&p.scratch1) {
            return conflict(p.scratch1, "scratch register");
        }
        let reg = request.runtime.return_buffer_register().ok_or_else(|| {
            Error::InvalidDescriptor(format!(
                "{}: a return buffer is needed but no return buffer register is defined",
                request.runtime.name()
            ))
        })?;
        let platform_regs = [p.thread, p.method, p.scratch1, p.scratch2, p.shuffle];
        if runtime_regs.contains(&reg) || platform_regs.contains(&reg) {
            return conflict(reg, "return buffer register");
        }
        return_buffer_register = Some(reg);
    }

    match runtime_args.slots().first().map(|slot| slot.location) {
        Some(Location::Reg(reg)) if reg.is_gp() => Ok((reg, return_buffer_register)),
        Some(other) => Err(Error::InvalidDescriptor(format!(
            "{}: receiver must be passed in a general register, not {other}",
            request.runtime.name()
        ))),
        None => Err(Error::Internal("runtime convention has no receiver slot".to_string())),
    }
}

fn first_register(regs: &[Register], what: &str, desc: &ConventionDescriptor) -> Result<Register> {
    regs.first().copied().ok_or_else(|| {
        Error::InvalidDescriptor(format!("{}: no {what} register", desc.name()))
    })
}

/// Compute only the argument shuffle a request would use.
pub fn plan_shuffle(request: &StubRequest) -> Result<ArgumentShuffle> {
    let placement = place(request)?;
    ArgumentShuffle::new(
        &placement.native_args,
        &placement.runtime_args,
        request.target.platform().shuffle,
    )
}

/// Generate an upcall stub for `request`.
#[allow(clippy::too_many_lines)]
pub fn generate_upcall_stub(request: &StubRequest, options: &StubOptions) -> Result<StubBlob> {
    let placement = place(request)?;
    let native = &request.native;
    let runtime = &request.runtime;
    let regs = request.target.registers();
    let p = *request.target.platform();
    let sp = regs.stack_pointer();
    let fp = regs.frame_pointer();

    let native_arg0 = first_register(native.int_args(), "integer argument", native)?;
    let native_ret0 = first_register(native.int_returns(), "integer return", native)?;
    let exception_reg = first_register(runtime.int_returns(), "integer return", runtime)?;

    let shuffle = ArgumentShuffle::new(&placement.native_args, &placement.runtime_args, p.shuffle)?;
    if options.print_shuffle_plan {
        tracing::info!("{shuffle}");
    }

    let arg_spiller = RegSpiller::new(placement.native_args.registers());
    let result_spiller = RegSpiller::new(placement.native_returns.registers());
    let callee_saved = CalleeSaved::new(native.non_volatile(regs));

    let layout = FrameLayoutPlanner::new(native)
        .out_arg_stack_slots(shuffle.out_arg_stack_slots())
        .result_spill_bytes(result_spiller.spill_size_bytes())
        .arg_spill_bytes(arg_spiller.spill_size_bytes())
        .callee_save_bytes(callee_saved.size_bytes())
        .return_buffer(placement.return_buffer.map(|(bytes, _)| bytes))
        .plan();

    let frame_size = frame_offset(layout.frame_size())?;
    let frame_data = frame_offset(layout.offset(FrameRegion::FrameData))?;
    let arg_save = layout.offset(FrameRegion::ArgSave);
    let result_save = layout.offset(FrameRegion::ResultSave);
    let callee_save = layout.offset(FrameRegion::CalleeSave);
    let return_buffer = match placement.return_buffer {
        Some((_, reg)) => {
            let span = layout.region(FrameRegion::ReturnBuffer).ok_or_else(|| {
                Error::Internal("return buffer region missing from frame".to_string())
            })?;
            Some((frame_offset(span.offset)?, reg))
        }
        None => None,
    };

    let mut e = StubEmitter::new();

    // ── Entry ──

    e.begin_phase(StubPhase::Prologue);
    e.emit(Instruction::Enter);
    e.emit(Instruction::AddImm64 {
        dst: sp.index(),
        src: sp.index(),
        value: -frame_size,
    });

    e.begin_phase(StubPhase::SpillArgs);
    arg_spiller.generate_spill(&mut e, sp, arg_save)?;

    e.begin_phase(StubPhase::PreserveCallee);
    callee_saved.generate_preserve(&mut e, sp, callee_save)?;

    e.begin_phase(StubPhase::OnEntryHook);
    e.block_comment("{ on_entry");
    e.emit(Instruction::AddImm64 {
        dst: native_arg0.index(),
        src: sp.index(),
        value: frame_data,
    });
    emit_call(&mut e, p.scratch1, request.hooks.on_entry.address());
    e.emit(Instruction::MoveReg {
        dst: p.thread.index(),
        src: native_ret0.index(),
    });
    e.block_comment("} on_entry");

    e.begin_phase(StubPhase::ShuffleArgs);
    e.block_comment("{ argument shuffle");
    arg_spiller.generate_fill(&mut e, sp, arg_save)?;
    shuffle.generate(
        &mut e,
        &MoveContext {
            frame_pointer: fp,
            stack_pointer: sp,
            incoming_base: ENTER_FRAME_SIZE + native.shadow_space_bytes(),
            temp: p.scratch2,
        },
    )?;
    if let Some((offset, reg)) = return_buffer {
        e.emit(Instruction::AddImm64 {
            dst: reg.index(),
            src: sp.index(),
            value: offset,
        });
    }
    e.block_comment("} argument shuffle");

    e.begin_phase(StubPhase::ResolveReceiver);
    e.block_comment("{ receiver");
    e.emit(Instruction::LoadImm64 {
        reg: p.shuffle.index(),
        value: request.receiver.raw(),
    });
    e.emit(Instruction::ResolveHandle {
        reg: p.shuffle.index(),
        thread: p.thread.index(),
        tmp: p.scratch2.index(),
    });
    e.emit(Instruction::MoveReg {
        dst: placement.receiver.index(),
        src: p.shuffle.index(),
    });
    e.block_comment("} receiver");

    e.begin_phase(StubPhase::Invoke);
    e.emit(Instruction::LoadImm64 {
        reg: p.method.index(),
        value: request.method.metadata(),
    });
    e.emit(Instruction::StoreIndU64 {
        base: p.thread.index(),
        src: p.method.index(),
        offset: THREAD_CALLEE_TARGET_OFFSET,
    });
    e.emit(Instruction::LoadAcquireU64 {
        dst: p.scratch1.index(),
        base: p.method.index(),
        offset: METHOD_FROM_COMPILED_OFFSET,
    });
    e.emit(Instruction::CallInd {
        reg: p.scratch1.index(),
    });

    // ── Exit ──

    e.begin_phase(StubPhase::HandleResult);
    if let Some((offset, _)) = return_buffer {
        e.emit(Instruction::AddImm64 {
            dst: p.scratch1.index(),
            src: sp.index(),
            value: offset,
        });
        let mut slot = 0;
        for reg in placement.native_returns.registers() {
            let at = frame_offset(slot)?;
            match reg.kind() {
                RegKind::Gp => {
                    e.emit(Instruction::LoadIndU64 {
                        dst: reg.index(),
                        base: p.scratch1.index(),
                        offset: at,
                    });
                    slot += RET_BUF_GP_SLOT;
                }
                RegKind::Fp => {
                    e.emit(Instruction::LoadIndF64 {
                        dst: reg.index(),
                        base: p.scratch1.index(),
                        offset: at,
                    });
                    slot += RET_BUF_VECTOR_SLOT;
                }
            }
        }
    } else {
        let declared = request.signature.declared_return();
        if declared != BasicType::Void {
            let produced = if declared.is_floating() {
                runtime.float_returns().first()
            } else {
                runtime.int_returns().first()
            };
            debug_assert_eq!(
                produced.copied(),
                placement.native_returns.registers().first().copied(),
                "runtime result register must be the native return register"
            );
        }
    }

    e.begin_phase(StubPhase::SpillResult);
    result_spiller.generate_spill(&mut e, sp, result_save)?;

    e.begin_phase(StubPhase::OnExitHook);
    e.block_comment("{ on_exit");
    e.emit(Instruction::AddImm64 {
        dst: native_arg0.index(),
        src: sp.index(),
        value: frame_data,
    });
    emit_call(&mut e, p.scratch1, request.hooks.on_exit.address());
    e.block_comment("} on_exit");

    e.begin_phase(StubPhase::RestoreCallee);
    callee_saved.generate_restore(&mut e, sp, callee_save)?;

    e.begin_phase(StubPhase::FillResult);
    result_spiller.generate_fill(&mut e, sp, result_save)?;

    e.begin_phase(StubPhase::Epilogue);
    e.emit(Instruction::Leave);
    e.emit(Instruction::Ret);

    // ── Exception handler ──

    let exception_handler_offset = e.current_offset();
    e.begin_phase(StubPhase::ExceptionAbort);
    e.block_comment("{ exception handler");
    e.emit(Instruction::MoveReg {
        dst: native_arg0.index(),
        src: exception_reg.index(),
    });
    emit_call(
        &mut e,
        p.scratch1,
        request.hooks.handle_uncaught_exception.address(),
    );
    // handle_uncaught_exception does not return.
    e.emit(Instruction::Trap);
    e.block_comment("} exception handler");

    let (code, phases) = e.finish(options.code_capacity)?;
    let blob = StubBlob {
        name: request.stub_name(),
        code,
        layout,
        shuffle,
        exception_handler_offset,
        phases,
        method: request.method.clone(),
        receiver: request.receiver,
    };

    tracing::debug!(
        name = blob.name(),
        size = blob.code().len(),
        frame_size = blob.frame_size(),
        "generated upcall stub"
    );
    if options.trace_stubs {
        tracing::info!("{blob}");
    }
    Ok(blob)
}

fn emit_call(e: &mut StubEmitter, scratch: Register, address: u64) {
    e.emit(Instruction::LoadImm64 {
        reg: scratch.index(),
        value: address,
    });
    e.emit(Instruction::CallInd {
        reg: scratch.index(),
    });
}
