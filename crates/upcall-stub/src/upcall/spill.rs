use super::emitter::{StubEmitter, frame_offset};
use crate::abi::{CALLEE_SAVE_WIDTH, GP_SPILL_WIDTH, RegKind, Register, VECTOR_SPILL_WIDTH};
use crate::masm::Instruction;
use crate::Result;

/// Saves an ordered register list into one contiguous area and reloads it
/// from the same per-register offsets.
///
/// General registers take 8 bytes, vector registers 16 (the full 128-bit
/// value), so `fill(spill(x))` restores every bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegSpiller {
    registers: Vec<Register>,
}

impl RegSpiller {
    #[must_use]
    pub fn new(registers: impl IntoIterator<Item = Register>) -> Self {
        Self {
            registers: registers.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    #[must_use]
    pub const fn width(reg: Register) -> usize {
        match reg.kind() {
            RegKind::Gp => GP_SPILL_WIDTH,
            RegKind::Fp => VECTOR_SPILL_WIDTH,
        }
    }

    #[must_use]
    pub fn spill_size_bytes(&self) -> usize {
        self.registers.iter().map(|&reg| Self::width(reg)).sum()
    }

    /// Register and its offset relative to the start of the area.
    pub fn slots(&self) -> impl Iterator<Item = (Register, usize)> + '_ {
        self.registers.iter().scan(0, |offset, &reg| {
            let at = *offset;
            *offset += Self::width(reg);
            Some((reg, at))
        })
    }

    /// Store every register at `[base + offset + slot]`.
    pub fn generate_spill(
        &self,
        e: &mut StubEmitter,
        base: Register,
        offset: usize,
    ) -> Result<()> {
        for (reg, slot) in self.slots() {
            let at = frame_offset(offset + slot)?;
            e.emit(match reg.kind() {
                RegKind::Gp => Instruction::StoreIndU64 {
                    base: base.index(),
                    src: reg.index(),
                    offset: at,
                },
                RegKind::Fp => Instruction::StoreIndV128 {
                    base: base.index(),
                    src: reg.index(),
                    offset: at,
                },
            });
        }
        Ok(())
    }

    /// Reload every register from the offsets `generate_spill` used.
    pub fn generate_fill(&self, e: &mut StubEmitter, base: Register, offset: usize) -> Result<()> {
        for (reg, slot) in self.slots() {
            let at = frame_offset(offset + slot)?;
            e.emit(match reg.kind() {
                RegKind::Gp => Instruction::LoadIndU64 {
                    dst: reg.index(),
                    base: base.index(),
                    offset: at,
                },
                RegKind::Fp => Instruction::LoadIndV128 {
                    dst: reg.index(),
                    base: base.index(),
                    offset: at,
                },
            });
        }
        Ok(())
    }
}

/// The native caller's non-volatile registers, preserved across the stub.
///
/// Every register takes one 8-byte slot. Vector registers keep only their
/// low 64 bits here; the upper half is not preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalleeSaved {
    registers: Vec<Register>,
}

impl CalleeSaved {
    #[must_use]
    pub fn new(registers: Vec<Register>) -> Self {
        Self { registers }
    }

    #[must_use]
    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.registers.len() * CALLEE_SAVE_WIDTH
    }

    pub fn generate_preserve(
        &self,
        e: &mut StubEmitter,
        base: Register,
        offset: usize,
    ) -> Result<()> {
        tracing::debug!(count = self.registers.len(), offset, "preserving callee-saved registers");
        for (i, &reg) in self.registers.iter().enumerate() {
            let at = frame_offset(offset + i * CALLEE_SAVE_WIDTH)?;
            e.emit(match reg.kind() {
                RegKind::Gp => Instruction::StoreIndU64 {
                    base: base.index(),
                    src: reg.index(),
                    offset: at,
                },
                RegKind::Fp => Instruction::StoreIndF64 {
                    base: base.index(),
                    src: reg.index(),
                    offset: at,
                },
            });
        }
        Ok(())
    }

    pub fn generate_restore(
        &self,
        e: &mut StubEmitter,
        base: Register,
        offset: usize,
    ) -> Result<()> {
        for (i, &reg) in self.registers.iter().enumerate() {
            let at = frame_offset(offset + i * CALLEE_SAVE_WIDTH)?;
            e.emit(match reg.kind() {
                RegKind::Gp => Instruction::LoadIndU64 {
                    dst: reg.index(),
                    base: base.index(),
                    offset: at,
                },
                RegKind::Fp => Instruction::LoadIndF64 {
                    dst: reg.index(),
                    base: base.index(),
                    offset: at,
                },
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spill_size_mixes_widths() {
        let spiller = RegSpiller::new([Register::gp(0), Register::fp(0), Register::gp(1)]);
        assert_eq!(spiller.spill_size_bytes(), 8 + 16 + 8);
        let slots: Vec<_> = spiller.slots().map(|(_, at)| at).collect();
        assert_eq!(slots, vec![0, 8, 24]);
    }

    #[test]
    fn test_spill_and_fill_use_same_offsets() {
        let spiller = RegSpiller::new([Register::gp(3), Register::fp(2)]);
        let sp = Register::gp(31);
        let mut e = StubEmitter::new();
        spiller.generate_spill(&mut e, sp, 32).unwrap();
        spiller.generate_fill(&mut e, sp, 32).unwrap();
        let instrs = e.instructions();
        assert_eq!(
            instrs[1],
            Instruction::StoreIndV128 {
                base: 31,
                src: 2,
                offset: 40
            }
        );
        assert_eq!(
            instrs[3],
            Instruction::LoadIndV128 {
                dst: 2,
                base: 31,
                offset: 40
            }
        );
    }

    #[test]
    fn test_empty_spiller() {
        let spiller = RegSpiller::new(Vec::new());
        let mut e = StubEmitter::new();
        spiller.generate_spill(&mut e, Register::gp(31), 0).unwrap();
        assert_eq!(spiller.spill_size_bytes(), 0);
        assert!(e.instructions().is_empty());
    }

    #[test]
    fn test_callee_saved_vector_uses_low_half() {
        let saved = CalleeSaved::new(vec![Register::gp(19), Register::fp(8)]);
        assert_eq!(saved.size_bytes(), 16);
        let mut e = StubEmitter::new();
        saved.generate_preserve(&mut e, Register::gp(31), 8).unwrap();
        assert_eq!(
            e.instructions()[1],
            Instruction::StoreIndF64 {
                base: 31,
                src: 8,
                offset: 16
            }
        );
    }
}
