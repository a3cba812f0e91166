//! Test harness for upcall-stub tests
//!
//! Provides a small interpreter for stub instructions, a symbolic move
//! simulator for argument shuffles, and fixtures for the AArch64 presets.
//!
//! # Example
//!
//! ```rust
//! use upcall_stub::test_harness::*;
//! use upcall_stub::{StubOptions, generate_upcall_stub};
//!
//! let request = aarch64_request("(JJ)J").unwrap();
//! let blob = generate_upcall_stub(&request, &StubOptions::default()).unwrap();
//!
//! let mut machine = machine_for(&request);
//! machine.on_call(TARGET_ENTRY, "target", |cpu| {
//!     // runtime convention: receiver in r1, arguments in r2, r3
//!     let sum = cpu.gp(2) + cpu.gp(3);
//!     cpu.set_gp(0, sum);
//!     CallOutcome::Return
//! });
//! machine.state_mut().set_gp(0, 40);
//! machine.state_mut().set_gp(1, 2);
//!
//! assert_eq!(machine.run(&blob), Exit::Returned);
//! assert_eq!(machine.state().gp(0), 42);
//! ```

#![allow(
    clippy::must_use_candidate,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation
)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::abi::{
    ConventionDescriptor, FRAME_DATA_THREAD, Location, RegKind, Register, RegisterSet,
    Signature, WEAK_HANDLE_TAG,
};
use crate::masm::{Instruction, Opcode};
use crate::upcall::{
    ArgumentShuffle, CalleeTarget, ExternalEntry, Move, ReceiverHandle, StubBlob, StubRequest,
    TargetMethod, UpcallHooks,
};
use crate::Result;

// ── Fixture addresses ──

pub const ON_ENTRY: u64 = 0x1_0000;
pub const ON_EXIT: u64 = 0x2_0000;
pub const UNCAUGHT_EXCEPTION: u64 = 0x3_0000;
pub const TARGET_ENTRY: u64 = 0x5_0000;
pub const ALT_TARGET_ENTRY: u64 = 0x5_8000;
pub const THREAD: u64 = 0x6_0000;
pub const RECEIVER_SLOT: u64 = 0x7_0000;
pub const RECEIVER_OBJECT: u64 = 0xCAFE_0000;
pub const METHOD_METADATA: u64 = 0x9_0000;

/// Initial stack pointer: the caller's SP at the call into the stub.
pub const STACK_TOP: u64 = 0x7FFF_0000;
pub const CALLER_FP: u64 = 0xF00D_F00D;
pub const CALLER_LR: u64 = 0x1A1A_1A1A;

/// Value external calls write into registers they are allowed to clobber.
pub const CLOBBER: u64 = 0xDEAD_DEAD_DEAD_DEAD;

// ── Machine ──

/// What an external entry does when the stub calls it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Return,
    /// Raise; the value is the exception reference.
    Throw(u64),
    /// Never return control to the stub.
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// Reached `Ret` with the caller's frame restored.
    Returned,
    /// Hit a `Trap` at this byte offset.
    Trapped { offset: usize },
    /// An external entry terminated execution.
    Terminated { by: String },
    Fault(String),
}

/// Registers and sparse byte memory.
#[derive(Debug, Default)]
pub struct CpuState {
    gp: [u64; 32],
    fp: [u128; 32],
    memory: HashMap<u64, u8>,
    cells: HashMap<u64, Arc<CalleeTarget>>,
}

impl CpuState {
    pub fn gp(&self, index: u8) -> u64 {
        self.gp[usize::from(index)]
    }

    pub fn set_gp(&mut self, index: u8, value: u64) {
        self.gp[usize::from(index)] = value;
    }

    pub fn vec(&self, index: u8) -> u128 {
        self.fp[usize::from(index)]
    }

    pub fn set_vec(&mut self, index: u8, value: u128) {
        self.fp[usize::from(index)] = value;
    }

    /// Register value; vector registers are returned whole.
    pub fn reg(&self, reg: Register) -> u128 {
        match reg.kind() {
            RegKind::Gp => u128::from(self.gp(reg.index())),
            RegKind::Fp => self.vec(reg.index()),
        }
    }

    pub fn set_reg(&mut self, reg: Register, value: u128) {
        match reg.kind() {
            RegKind::Gp => self.set_gp(reg.index(), value as u64),
            RegKind::Fp => self.set_vec(reg.index(), value),
        }
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.memory.get(&(addr + i as u64)).copied().unwrap_or(0);
        }
        u64::from_le_bytes(bytes)
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.memory.insert(addr + i as u64, byte);
        }
    }

    pub fn read_u128(&self, addr: u64) -> u128 {
        u128::from(self.read_u64(addr)) | (u128::from(self.read_u64(addr + 8)) << 64)
    }

    pub fn write_u128(&mut self, addr: u64, value: u128) {
        self.write_u64(addr, value as u64);
        self.write_u64(addr + 8, (value >> 64) as u64);
    }

    /// Overwrite every volatile register of `desc` except `keep`.
    pub fn clobber_volatile(&mut self, desc: &ConventionDescriptor, keep: &[Register]) {
        for reg in desc.volatile_registers() {
            if !keep.contains(&reg) {
                self.set_reg(reg, (u128::from(CLOBBER) << 64) | u128::from(CLOBBER));
            }
        }
    }

    fn address(&self, base: u8, offset: i32) -> u64 {
        self.gp(base).wrapping_add_signed(i64::from(offset))
    }
}

type ExternalFn = Box<dyn FnMut(&mut CpuState) -> CallOutcome>;

/// Interpreter for generated stubs.
pub struct Machine {
    state: CpuState,
    registers: RegisterSet,
    externals: HashMap<u64, (String, ExternalFn)>,
    calls: Vec<String>,
    exception_register: Register,
    step_limit: usize,
}

impl Machine {
    pub fn new(registers: RegisterSet) -> Self {
        let mut state = CpuState::default();
        state.set_gp(registers.stack_pointer().index(), STACK_TOP);
        state.set_gp(registers.frame_pointer().index(), CALLER_FP);
        state.set_gp(registers.link_register().index(), CALLER_LR);
        Self {
            state,
            registers,
            externals: HashMap::new(),
            calls: Vec::new(),
            exception_register: Register::gp(0),
            step_limit: 10_000,
        }
    }

    pub fn state(&self) -> &CpuState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }

    /// Register where a thrown exception reference is delivered.
    pub fn set_exception_register(&mut self, reg: Register) {
        self.exception_register = reg;
    }

    /// Install (or replace) the behavior of the code at `address`.
    pub fn on_call(
        &mut self,
        address: u64,
        name: &str,
        f: impl FnMut(&mut CpuState) -> CallOutcome + 'static,
    ) {
        self.externals.insert(address, (name.to_string(), Box::new(f)));
    }

    /// Serve acquire loads of `address` from `cell`.
    pub fn map_callee_target(&mut self, address: u64, cell: Arc<CalleeTarget>) {
        self.state.cells.insert(address, cell);
    }

    /// Names of external entries called, in order.
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.calls.iter().filter(|call| *call == name).count()
    }

    /// Address of incoming stack argument bytes at `offset` for a caller
    /// with `shadow_space` bytes reserved.
    pub fn incoming_arg_address(&self, shadow_space: usize, offset: i32) -> u64 {
        (STACK_TOP + shadow_space as u64).wrapping_add_signed(i64::from(offset))
    }

    pub fn run(&mut self, blob: &StubBlob) -> Exit {
        let code = blob.code();
        let instructions = code.instructions();
        let sp = self.registers.stack_pointer().index();
        let fp = self.registers.frame_pointer().index();
        let lr = self.registers.link_register().index();
        let mut pc = 0;

        for _ in 0..self.step_limit {
            let Some(instr) = instructions.get(pc) else {
                return Exit::Fault(format!("fell off the end at instruction {pc}"));
            };
            let offset = code.offset_of(pc).unwrap_or(0);
            pc += 1;
            let cpu = &mut self.state;
            match *instr {
                Instruction::Comment(_) => {}
                Instruction::Trap => return Exit::Trapped { offset },
                Instruction::Enter => {
                    let top = cpu.gp(sp) - 16;
                    cpu.write_u64(top, cpu.gp(fp));
                    cpu.write_u64(top + 8, cpu.gp(lr));
                    cpu.set_gp(sp, top);
                    cpu.set_gp(fp, top);
                }
                Instruction::Leave => {
                    let top = cpu.gp(fp);
                    cpu.set_gp(fp, cpu.read_u64(top));
                    cpu.set_gp(lr, cpu.read_u64(top + 8));
                    cpu.set_gp(sp, top + 16);
                }
                Instruction::Ret => {
                    if cpu.gp(sp) != STACK_TOP {
                        return Exit::Fault(format!("returned with sp {:#x}", cpu.gp(sp)));
                    }
                    return Exit::Returned;
                }
                Instruction::LoadImm64 { reg, value } => cpu.set_gp(reg, value),
                Instruction::AddImm64 { dst, src, value } => {
                    let result = cpu.address(src, value);
                    cpu.set_gp(dst, result);
                }
                Instruction::MoveReg { dst, src } => cpu.set_gp(dst, cpu.gp(src)),
                Instruction::MoveFp { dst, src } => cpu.set_vec(dst, cpu.vec(src)),
                Instruction::MoveGpToFp { dst, src } => cpu.set_vec(dst, u128::from(cpu.gp(src))),
                Instruction::MoveFpToGp { dst, src } => cpu.set_gp(dst, cpu.vec(src) as u64),
                Instruction::LoadIndU64 { dst, base, offset } => {
                    let value = cpu.read_u64(cpu.address(base, offset));
                    cpu.set_gp(dst, value);
                }
                Instruction::StoreIndU64 { base, src, offset } => {
                    cpu.write_u64(cpu.address(base, offset), cpu.gp(src));
                }
                Instruction::LoadIndF64 { dst, base, offset } => {
                    let value = cpu.read_u64(cpu.address(base, offset));
                    cpu.set_vec(dst, u128::from(value));
                }
                Instruction::StoreIndF64 { base, src, offset } => {
                    cpu.write_u64(cpu.address(base, offset), cpu.vec(src) as u64);
                }
                Instruction::LoadIndV128 { dst, base, offset } => {
                    let value = cpu.read_u128(cpu.address(base, offset));
                    cpu.set_vec(dst, value);
                }
                Instruction::StoreIndV128 { base, src, offset } => {
                    cpu.write_u128(cpu.address(base, offset), cpu.vec(src));
                }
                Instruction::LoadAcquireU64 { dst, base, offset } => {
                    let addr = cpu.address(base, offset);
                    let value = match cpu.cells.get(&addr) {
                        Some(cell) => cell.load(),
                        None => cpu.read_u64(addr),
                    };
                    cpu.set_gp(dst, value);
                }
                Instruction::ResolveHandle { reg, .. } => {
                    let slot = cpu.gp(reg) & !WEAK_HANDLE_TAG;
                    let value = cpu.read_u64(slot);
                    cpu.set_gp(reg, value);
                }
                Instruction::CallInd { reg } => {
                    let target = cpu.gp(reg);
                    let Some((name, f)) = self.externals.get_mut(&target) else {
                        return Exit::Fault(format!("call to unknown address {target:#x}"));
                    };
                    self.calls.push(name.clone());
                    match f(&mut self.state) {
                        CallOutcome::Return => {}
                        CallOutcome::Throw(exception) => {
                            self.state
                                .set_gp(self.exception_register.index(), exception);
                            let Some(handler) = code.index_at(blob.exception_handler_offset())
                            else {
                                return Exit::Fault("no exception handler".to_string());
                            };
                            pc = handler;
                        }
                        CallOutcome::Terminate => {
                            return Exit::Terminated { by: name.clone() };
                        }
                    }
                }
            }
        }
        Exit::Fault(format!("step limit {} exceeded", self.step_limit))
    }
}

// ── Fixtures ──

pub fn aarch64_hooks() -> UpcallHooks {
    UpcallHooks {
        on_entry: ExternalEntry::native("on_entry", ON_ENTRY),
        on_exit: ExternalEntry::native("on_exit", ON_EXIT),
        handle_uncaught_exception: ExternalEntry::native(
            "handle_uncaught_exception",
            UNCAUGHT_EXCEPTION,
        ),
    }
}

pub fn target_method() -> TargetMethod {
    TargetMethod::new(
        "Target.invoke",
        METHOD_METADATA,
        Arc::new(CalleeTarget::new(TARGET_ENTRY)),
    )
}

/// AArch64 request for `signature` calling [`target_method`] on a strong
/// receiver handle at [`RECEIVER_SLOT`].
pub fn aarch64_request(signature: &str) -> Result<StubRequest> {
    Ok(StubRequest::aarch64(
        Signature::parse(signature)?,
        target_method(),
        ReceiverHandle::new(RECEIVER_SLOT),
        aarch64_hooks(),
    ))
}

/// A machine with the runtime side of `request` installed: the receiver
/// handle resolves to [`RECEIVER_OBJECT`], the callee-target cell is mapped,
/// `on_entry` publishes [`THREAD`] and both hooks clobber every native
/// volatile register. `handle_uncaught_exception` returns, so the stub's trap
/// is what ends an exceptional run. The target itself is left to the test.
pub fn machine_for(request: &StubRequest) -> Machine {
    let mut machine = Machine::new(request.target.registers().clone());
    let native = request.native.clone();
    let arg0 = native.int_args()[0];
    let ret0 = native.int_returns()[0];

    if let Some(exception) = request.runtime.int_returns().first() {
        machine.set_exception_register(*exception);
    }
    machine
        .state_mut()
        .write_u64(request.receiver.slot_address(), RECEIVER_OBJECT);
    machine.map_callee_target(
        request.method.callee_target_address(),
        Arc::clone(request.method.callee_target()),
    );

    let entry_desc = native.clone();
    machine.on_call(ON_ENTRY, "on_entry", move |cpu| {
        let frame_data = cpu.gp(arg0.index());
        cpu.write_u64(frame_data + FRAME_DATA_THREAD as u64, THREAD);
        cpu.clobber_volatile(&entry_desc, &[]);
        cpu.set_gp(ret0.index(), THREAD);
        CallOutcome::Return
    });
    machine.on_call(ON_EXIT, "on_exit", move |cpu| {
        let frame_data = cpu.gp(arg0.index());
        assert_eq!(
            cpu.read_u64(frame_data + FRAME_DATA_THREAD as u64),
            THREAD,
            "on_exit must see the frame data on_entry filled in"
        );
        cpu.clobber_volatile(&native, &[]);
        CallOutcome::Return
    });
    machine.on_call(UNCAUGHT_EXCEPTION, "handle_uncaught_exception", |_| {
        CallOutcome::Return
    });
    machine
}

// ── Shuffle verification ──

/// Run `moves` over symbolic values: every location starts out holding
/// itself. Returns the final contents of every written location.
pub fn simulate_moves(moves: &[Move]) -> HashMap<Location, Location> {
    let mut contents: HashMap<Location, Location> = HashMap::new();
    for mv in moves {
        let value = contents.get(&mv.src).copied().unwrap_or(mv.src);
        contents.insert(mv.dst, value);
    }
    contents
}

/// Assert that the shuffle's move list delivers every source to its
/// destination and writes nothing but destinations and the scratch register.
pub fn assert_shuffle_correct(shuffle: &ArgumentShuffle) {
    let contents = simulate_moves(shuffle.moves());
    for mv in shuffle.mapping() {
        let got = contents.get(&mv.dst).copied().unwrap_or(mv.dst);
        assert_eq!(got, mv.src, "destination {} holds {got}, expected {}", mv.dst, mv.src);
    }
    let destinations: HashSet<_> = shuffle.mapping().iter().map(|mv| mv.dst).collect();
    let scratch = Location::Reg(shuffle.scratch());
    for written in contents.keys() {
        assert!(
            destinations.contains(written) || *written == scratch,
            "shuffle clobbered {written}"
        );
    }
}

/// Number of times the scratch register is loaded.
pub fn scratch_uses(shuffle: &ArgumentShuffle) -> usize {
    let scratch = Location::Reg(shuffle.scratch());
    shuffle.moves().iter().filter(|mv| mv.dst == scratch).count()
}

// ── Instruction inspection ──

/// Count instructions with a given opcode.
pub fn count_opcode(instructions: &[Instruction], opcode: Opcode) -> usize {
    instructions
        .iter()
        .filter(|instr| instr.opcode() == Some(opcode))
        .count()
}

/// Check if an instruction sequence contains a specific opcode.
pub fn has_opcode(instructions: &[Instruction], opcode: Opcode) -> bool {
    count_opcode(instructions, opcode) > 0
}

/// Instructions of `blob` between two byte offsets.
pub fn instructions_between(blob: &StubBlob, start: usize, end: usize) -> Vec<Instruction> {
    let code = blob.code();
    code.instructions()
        .iter()
        .enumerate()
        .filter(|&(i, _)| code.offset_of(i).is_some_and(|at| at >= start && at < end))
        .map(|(_, instr)| instr.clone())
        .collect()
}
