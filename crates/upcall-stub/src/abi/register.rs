use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegKind {
    /// General-purpose (integer/pointer) register.
    Gp,
    /// Floating-point / vector register.
    Fp,
}

/// A physical register: its class plus its hardware index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Register {
    kind: RegKind,
    index: u8,
}

impl Register {
    #[must_use]
    pub const fn gp(index: u8) -> Self {
        Self {
            kind: RegKind::Gp,
            index,
        }
    }

    #[must_use]
    pub const fn fp(index: u8) -> Self {
        Self {
            kind: RegKind::Fp,
            index,
        }
    }

    #[must_use]
    pub const fn kind(self) -> RegKind {
        self.kind
    }

    #[must_use]
    pub const fn index(self) -> u8 {
        self.index
    }

    #[must_use]
    pub const fn is_gp(self) -> bool {
        matches!(self.kind, RegKind::Gp)
    }

    #[must_use]
    pub const fn is_fp(self) -> bool {
        matches!(self.kind, RegKind::Fp)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RegKind::Gp => write!(f, "r{}", self.index),
            RegKind::Fp => write!(f, "v{}", self.index),
        }
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Register {
    type Err = Error;

    /// Parses `rN`/`xN` as a general register and `vN`/`dN` as a vector register.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || Error::InvalidDescriptor(format!("invalid register name '{s}'"));
        let mut chars = s.chars();
        let prefix = chars.next().ok_or_else(invalid)?;
        let index: u8 = chars.as_str().parse().map_err(|_| invalid())?;
        match prefix {
            'r' | 'x' => Ok(Self::gp(index)),
            'v' | 'd' => Ok(Self::fp(index)),
            _ => Err(invalid()),
        }
    }
}

/// Which stack an argument slot lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StackArea {
    /// The native caller's outgoing argument area, above our frame (FP-relative).
    Incoming,
    /// This stub's outgoing argument area at the bottom of the frame (SP-relative).
    Outgoing,
}

/// Physical home of one argument or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Location {
    Reg(Register),
    Stack { area: StackArea, offset: i32 },
}

impl Location {
    #[must_use]
    pub const fn incoming(offset: i32) -> Self {
        Self::Stack {
            area: StackArea::Incoming,
            offset,
        }
    }

    #[must_use]
    pub const fn outgoing(offset: i32) -> Self {
        Self::Stack {
            area: StackArea::Outgoing,
            offset,
        }
    }

    #[must_use]
    pub const fn as_reg(self) -> Option<Register> {
        match self {
            Self::Reg(reg) => Some(reg),
            Self::Stack { .. } => None,
        }
    }

    #[must_use]
    pub const fn is_stack(self) -> bool {
        matches!(self, Self::Stack { .. })
    }
}

impl From<Register> for Location {
    fn from(reg: Register) -> Self {
        Self::Reg(reg)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reg(reg) => write!(f, "{reg}"),
            Self::Stack {
                area: StackArea::Incoming,
                offset,
            } => write!(f, "in[+{offset}]"),
            Self::Stack {
                area: StackArea::Outgoing,
                offset,
            } => write!(f, "out[+{offset}]"),
        }
    }
}

/// The finite register file of one target architecture.
///
/// Constructed once per target and passed to every component that iterates
/// registers, so planners can be exercised against synthetic architectures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSet {
    gp_count: u8,
    fp_count: u8,
    frame_pointer: Register,
    link_register: Register,
    stack_pointer: Register,
}

impl RegisterSet {
    /// General registers are `r0..gp_count`, vector registers `v0..fp_count`.
    /// The stack pointer may sit outside the general range (as on AArch64).
    pub fn new(
        gp_count: u8,
        fp_count: u8,
        frame_pointer: Register,
        link_register: Register,
        stack_pointer: Register,
    ) -> Result<Self> {
        for (reg, role) in [
            (frame_pointer, "frame pointer"),
            (link_register, "link register"),
            (stack_pointer, "stack pointer"),
        ] {
            if !reg.is_gp() {
                return Err(Error::RegisterConflict { register: reg, role });
            }
        }
        if frame_pointer.index() >= gp_count || link_register.index() >= gp_count {
            return Err(Error::InvalidDescriptor(format!(
                "frame pointer {frame_pointer} and link register {link_register} must be \
                 within r0..r{gp_count}"
            )));
        }
        if frame_pointer == stack_pointer || frame_pointer == link_register {
            return Err(Error::InvalidDescriptor(
                "frame pointer must be distinct from the stack pointer and link register"
                    .to_string(),
            ));
        }
        Ok(Self {
            gp_count,
            fp_count,
            frame_pointer,
            link_register,
            stack_pointer,
        })
    }

    /// AArch64: r0-r30, v0-v31, fp = r29, lr = r30, sp encoded as r31.
    #[must_use]
    pub const fn aarch64() -> Self {
        Self {
            gp_count: 31,
            fp_count: 32,
            frame_pointer: Register::gp(29),
            link_register: Register::gp(30),
            stack_pointer: Register::gp(31),
        }
    }

    pub fn gp_registers(&self) -> impl Iterator<Item = Register> + '_ {
        (0..self.gp_count).map(Register::gp)
    }

    pub fn fp_registers(&self) -> impl Iterator<Item = Register> + '_ {
        (0..self.fp_count).map(Register::fp)
    }

    #[must_use]
    pub const fn gp_count(&self) -> u8 {
        self.gp_count
    }

    #[must_use]
    pub const fn fp_count(&self) -> u8 {
        self.fp_count
    }

    #[must_use]
    pub const fn frame_pointer(&self) -> Register {
        self.frame_pointer
    }

    #[must_use]
    pub const fn link_register(&self) -> Register {
        self.link_register
    }

    #[must_use]
    pub const fn stack_pointer(&self) -> Register {
        self.stack_pointer
    }

    #[must_use]
    pub fn contains(&self, reg: Register) -> bool {
        match reg.kind() {
            RegKind::Gp => reg.index() < self.gp_count || reg == self.stack_pointer,
            RegKind::Fp => reg.index() < self.fp_count,
        }
    }

    /// Registers saved and restored by the prologue/epilogue rather than by
    /// callee-saved preservation.
    #[must_use]
    pub fn is_frame_register(&self, reg: Register) -> bool {
        reg == self.frame_pointer || reg == self.stack_pointer
    }
}

/// Fixed registers the stub itself uses on a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformRegisters {
    /// Holds the thread context returned by `on_entry`.
    pub thread: Register,
    /// Holds the target method metadata during Invoke.
    pub method: Register,
    /// Address temporary for hook/target calls and the return buffer.
    pub scratch1: Register,
    /// Temporary for stack-to-stack copies and handle resolution.
    pub scratch2: Register,
    /// Breaks argument shuffle cycles; later holds the receiver.
    pub shuffle: Register,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetArch {
    name: &'static str,
    registers: RegisterSet,
    platform: PlatformRegisters,
}

impl TargetArch {
    pub fn new(
        name: &'static str,
        registers: RegisterSet,
        platform: PlatformRegisters,
    ) -> Result<Self> {
        let roles = [
            (platform.thread, "thread register"),
            (platform.method, "method register"),
            (platform.scratch1, "scratch register"),
            (platform.scratch2, "second scratch register"),
            (platform.shuffle, "shuffle register"),
        ];
        for (i, &(reg, role)) in roles.iter().enumerate() {
            if !reg.is_gp() || !registers.contains(reg) || registers.is_frame_register(reg) {
                return Err(Error::RegisterConflict { register: reg, role });
            }
            if roles[..i].iter().any(|&(other, _)| other == reg) {
                return Err(Error::RegisterConflict { register: reg, role });
            }
        }
        Ok(Self {
            name,
            registers,
            platform,
        })
    }

    /// AArch64 with the runtime's usual register roles:
    /// thread = r28, method = r12, scratch = r8/r9, shuffle = r19.
    #[must_use]
    pub const fn aarch64() -> Self {
        Self {
            name: "aarch64",
            registers: RegisterSet::aarch64(),
            platform: PlatformRegisters {
                thread: Register::gp(28),
                method: Register::gp(12),
                scratch1: Register::gp(8),
                scratch2: Register::gp(9),
                shuffle: Register::gp(19),
            },
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn registers(&self) -> &RegisterSet {
        &self.registers
    }

    #[must_use]
    pub const fn platform(&self) -> &PlatformRegisters {
        &self.platform
    }
}
