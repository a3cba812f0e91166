use std::collections::BTreeSet;

use super::register::{RegKind, Register, RegisterSet};
use super::WORD_SIZE;
use crate::{Error, Result};

/// Describes one calling convention: which registers a callee may clobber,
/// the order in which arguments and return values are assigned to registers,
/// and the stack rules.
///
/// Immutable once built. The non-volatile set is not stored; it is derived
/// against a [`RegisterSet`] so the same descriptor can be checked against
/// synthetic architectures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConventionDescriptor {
    name: String,
    volatile: BTreeSet<Register>,
    int_args: Vec<Register>,
    float_args: Vec<Register>,
    int_returns: Vec<Register>,
    float_returns: Vec<Register>,
    stack_alignment_bytes: usize,
    shadow_space_bytes: usize,
    return_buffer_register: Option<Register>,
}

impl ConventionDescriptor {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder::new(name)
    }

    /// The AArch64 procedure call standard as seen by a native caller.
    #[must_use]
    pub fn aapcs64() -> Self {
        let volatile = (0..=18)
            .map(Register::gp)
            .chain(std::iter::once(Register::gp(30)))
            .chain((0..=7).map(Register::fp))
            .chain((16..=31).map(Register::fp))
            .collect();
        Self {
            name: "aapcs64".to_string(),
            volatile,
            int_args: (0..=7).map(Register::gp).collect(),
            float_args: (0..=7).map(Register::fp).collect(),
            int_returns: vec![Register::gp(0), Register::gp(1)],
            float_returns: (0..=3).map(Register::fp).collect(),
            stack_alignment_bytes: 16,
            shadow_space_bytes: 0,
            return_buffer_register: None,
        }
    }

    /// The runtime's internal convention on AArch64. The first integer
    /// argument register (r1) carries the receiver; r0 is the last integer
    /// argument register so results and arguments do not collide on entry.
    #[must_use]
    pub fn aarch64_runtime() -> Self {
        let volatile = (0..=26)
            .map(Register::gp)
            .chain(std::iter::once(Register::gp(30)))
            .chain((0..=31).map(Register::fp))
            .collect();
        Self {
            name: "aarch64-runtime".to_string(),
            volatile,
            int_args: (1..=7)
                .map(Register::gp)
                .chain(std::iter::once(Register::gp(0)))
                .collect(),
            float_args: (0..=7).map(Register::fp).collect(),
            int_returns: vec![Register::gp(0)],
            float_returns: vec![Register::fp(0)],
            stack_alignment_bytes: 16,
            shadow_space_bytes: 0,
            return_buffer_register: Some(Register::gp(10)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_volatile(&self, reg: Register) -> bool {
        self.volatile.contains(&reg)
    }

    pub fn volatile_registers(&self) -> impl Iterator<Item = Register> + '_ {
        self.volatile.iter().copied()
    }

    /// Registers a callee under this convention must preserve: the complement
    /// of the volatile set within `regs`, excluding the frame and stack
    /// pointers (handled by the prologue/epilogue). General registers first,
    /// then vector registers, each in index order.
    #[must_use]
    pub fn non_volatile(&self, regs: &RegisterSet) -> Vec<Register> {
        regs.gp_registers()
            .chain(regs.fp_registers())
            .filter(|&reg| !regs.is_frame_register(reg) && !self.is_volatile(reg))
            .collect()
    }

    #[must_use]
    pub fn int_args(&self) -> &[Register] {
        &self.int_args
    }

    #[must_use]
    pub fn float_args(&self) -> &[Register] {
        &self.float_args
    }

    #[must_use]
    pub fn int_returns(&self) -> &[Register] {
        &self.int_returns
    }

    #[must_use]
    pub fn float_returns(&self) -> &[Register] {
        &self.float_returns
    }

    #[must_use]
    pub const fn stack_alignment_bytes(&self) -> usize {
        self.stack_alignment_bytes
    }

    #[must_use]
    pub const fn shadow_space_bytes(&self) -> usize {
        self.shadow_space_bytes
    }

    #[must_use]
    pub const fn return_buffer_register(&self) -> Option<Register> {
        self.return_buffer_register
    }

    /// Check that every register this descriptor names exists in `regs` and
    /// is not the frame or stack pointer.
    pub fn validate(&self, regs: &RegisterSet) -> Result<()> {
        let named = self
            .volatile
            .iter()
            .chain(&self.int_args)
            .chain(&self.float_args)
            .chain(&self.int_returns)
            .chain(&self.float_returns)
            .chain(self.return_buffer_register.iter());
        for &reg in named {
            if !regs.contains(reg) {
                return Err(Error::InvalidDescriptor(format!(
                    "{}: register {reg} does not exist on this target",
                    self.name
                )));
            }
            if regs.is_frame_register(reg) {
                return Err(Error::InvalidDescriptor(format!(
                    "{}: frame register {reg} cannot carry values",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Builder for descriptors that do not come from a preset.
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    name: String,
    volatile: BTreeSet<Register>,
    int_args: Vec<Register>,
    float_args: Vec<Register>,
    int_returns: Vec<Register>,
    float_returns: Vec<Register>,
    stack_alignment_bytes: usize,
    shadow_space_bytes: usize,
    return_buffer_register: Option<Register>,
}

impl DescriptorBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            volatile: BTreeSet::new(),
            int_args: Vec::new(),
            float_args: Vec::new(),
            int_returns: Vec::new(),
            float_returns: Vec::new(),
            stack_alignment_bytes: 16,
            shadow_space_bytes: 0,
            return_buffer_register: None,
        }
    }

    #[must_use]
    pub fn volatile(mut self, regs: impl IntoIterator<Item = Register>) -> Self {
        self.volatile.extend(regs);
        self
    }

    #[must_use]
    pub fn int_args(mut self, regs: impl IntoIterator<Item = Register>) -> Self {
        self.int_args = regs.into_iter().collect();
        self
    }

    #[must_use]
    pub fn float_args(mut self, regs: impl IntoIterator<Item = Register>) -> Self {
        self.float_args = regs.into_iter().collect();
        self
    }

    #[must_use]
    pub fn int_returns(mut self, regs: impl IntoIterator<Item = Register>) -> Self {
        self.int_returns = regs.into_iter().collect();
        self
    }

    #[must_use]
    pub fn float_returns(mut self, regs: impl IntoIterator<Item = Register>) -> Self {
        self.float_returns = regs.into_iter().collect();
        self
    }

    #[must_use]
    pub const fn stack_alignment(mut self, bytes: usize) -> Self {
        self.stack_alignment_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn shadow_space(mut self, bytes: usize) -> Self {
        self.shadow_space_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn return_buffer_register(mut self, reg: Register) -> Self {
        self.return_buffer_register = Some(reg);
        self
    }

    pub fn build(self) -> Result<ConventionDescriptor> {
        let name = &self.name;
        if !self.stack_alignment_bytes.is_power_of_two() || self.stack_alignment_bytes < WORD_SIZE
        {
            return Err(Error::InvalidDescriptor(format!(
                "{name}: stack alignment {} must be a power of two of at least {WORD_SIZE}",
                self.stack_alignment_bytes
            )));
        }
        if self.shadow_space_bytes % WORD_SIZE != 0 {
            return Err(Error::InvalidDescriptor(format!(
                "{name}: shadow space {} is not a multiple of {WORD_SIZE}",
                self.shadow_space_bytes
            )));
        }
        for (list, kind, what) in [
            (&self.int_args, RegKind::Gp, "integer argument"),
            (&self.float_args, RegKind::Fp, "float argument"),
            (&self.int_returns, RegKind::Gp, "integer return"),
            (&self.float_returns, RegKind::Fp, "float return"),
        ] {
            if let Some(reg) = list.iter().find(|reg| reg.kind() != kind) {
                return Err(Error::InvalidDescriptor(format!(
                    "{name}: {reg} cannot be an {what} register"
                )));
            }
            let unique: BTreeSet<_> = list.iter().collect();
            if unique.len() != list.len() {
                return Err(Error::InvalidDescriptor(format!(
                    "{name}: duplicate {what} register"
                )));
            }
        }
        if let Some(reg) = self.return_buffer_register
            && !reg.is_gp()
        {
            return Err(Error::InvalidDescriptor(format!(
                "{name}: return buffer register {reg} must be a general register"
            )));
        }

        Ok(ConventionDescriptor {
            name: self.name,
            volatile: self.volatile,
            int_args: self.int_args,
            float_args: self.float_args,
            int_returns: self.int_returns,
            float_returns: self.float_returns,
            stack_alignment_bytes: self.stack_alignment_bytes,
            shadow_space_bytes: self.shadow_space_bytes,
            return_buffer_register: self.return_buffer_register,
        })
    }
}
