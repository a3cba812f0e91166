use super::Instruction;
use crate::{Error, Result};

/// Concatenated stub code plus the per-instruction start offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBuffer {
    instructions: Vec<Instruction>,
    code: Vec<u8>,
    offsets: Vec<usize>,
}

impl CodeBuffer {
    /// Encode `instructions`, failing if the result exceeds `capacity` bytes.
    pub fn assemble(instructions: Vec<Instruction>, capacity: usize) -> Result<Self> {
        let mut code = Vec::new();
        let mut offsets = Vec::with_capacity(instructions.len());
        for instr in &instructions {
            offsets.push(code.len());
            code.extend(instr.encode());
        }
        if code.len() > capacity {
            return Err(Error::CodeBufferOverflow {
                size: code.len(),
                capacity,
            });
        }
        Ok(Self {
            instructions,
            code,
            offsets,
        })
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Byte offset at which instruction `index` starts.
    #[must_use]
    pub fn offset_of(&self, index: usize) -> Option<usize> {
        self.offsets.get(index).copied()
    }

    /// Index of the instruction starting exactly at byte `offset`. Zero-width
    /// comments share their offset with the next real instruction and are skipped.
    #[must_use]
    pub fn index_at(&self, offset: usize) -> Option<usize> {
        self.offsets
            .iter()
            .zip(&self.instructions)
            .position(|(&start, instr)| start == offset && instr.opcode().is_some())
    }

    /// `offset: instruction` per line, comments included.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (offset, instr) in self.offsets.iter().zip(&self.instructions) {
            out.push_str(&format!("{offset:5}: {instr}\n"));
        }
        out
    }
}

/// Variable-length little-endian integer: the count of leading one bits in
/// the first byte gives the number of trailing bytes.
pub(crate) fn encode_var_u32(value: u32) -> Vec<u8> {
    if value == 0 {
        return vec![0];
    }

    let value = u64::from(value);
    let max_encoded: u64 = 1 << (7 * 8);

    let mut min_encoded = max_encoded >> 7;
    for l in (0..=7).rev() {
        if value >= min_encoded {
            let mut dest = vec![0u8; l + 1];
            let max_val = 1u64 << (8 * l);
            let first_byte = (1u64 << 8) - (1u64 << (8 - l)) + value / max_val;
            dest[0] = first_byte as u8;

            let mut rest = value % max_val;
            for item in dest.iter_mut().skip(1) {
                *item = rest as u8;
                rest >>= 8;
            }
            return dest;
        }
        min_encoded >>= 7;
    }

    vec![value as u8]
}
