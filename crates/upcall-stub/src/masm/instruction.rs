use std::fmt;

use super::Opcode;

/// One stub instruction.
///
/// Register fields hold hardware indices; the register class is implied by
/// the variant (`*Fp*`, `*F64`, `*V128` operate on vector registers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Annotation only; encodes to nothing.
    Comment(&'static str),
    Trap,
    /// Push frame pointer and link register, then `fp = sp`.
    Enter,
    /// `sp = fp`, then pop frame pointer and link register.
    Leave,
    Ret,
    LoadImm64 {
        reg: u8,
        value: u64,
    },
    /// `reg[dst] = reg[src] + value`; also used to materialize frame addresses.
    AddImm64 {
        dst: u8,
        src: u8,
        value: i32,
    },
    MoveReg {
        dst: u8,
        src: u8,
    },
    /// Full 128-bit vector register copy.
    MoveFp {
        dst: u8,
        src: u8,
    },
    /// Low 64 bits of a general register into a vector register (upper bits zeroed).
    MoveGpToFp {
        dst: u8,
        src: u8,
    },
    /// Low 64 bits of a vector register into a general register.
    MoveFpToGp {
        dst: u8,
        src: u8,
    },
    LoadIndU64 {
        dst: u8,
        base: u8,
        offset: i32,
    },
    StoreIndU64 {
        base: u8,
        src: u8,
        offset: i32,
    },
    /// Low 64 bits of a vector register.
    LoadIndF64 {
        dst: u8,
        base: u8,
        offset: i32,
    },
    StoreIndF64 {
        base: u8,
        src: u8,
        offset: i32,
    },
    LoadIndV128 {
        dst: u8,
        base: u8,
        offset: i32,
    },
    StoreIndV128 {
        base: u8,
        src: u8,
        offset: i32,
    },
    /// Single-word load with acquire ordering, for cells the runtime rewrites concurrently.
    LoadAcquireU64 {
        dst: u8,
        base: u8,
        offset: i32,
    },
    CallInd {
        reg: u8,
    },
    /// Resolve the handle in `reg` to a direct reference in place: clear the
    /// weak tag and load through it. `tmp` is clobbered.
    ResolveHandle {
        reg: u8,
        thread: u8,
        tmp: u8,
    },
}

impl Instruction {
    #[must_use]
    pub const fn opcode(&self) -> Option<Opcode> {
        Some(match self {
            Self::Comment(_) => return None,
            Self::Trap => Opcode::Trap,
            Self::Enter => Opcode::Enter,
            Self::Leave => Opcode::Leave,
            Self::Ret => Opcode::Ret,
            Self::LoadImm64 { .. } => Opcode::LoadImm64,
            Self::AddImm64 { .. } => Opcode::AddImm64,
            Self::MoveReg { .. } => Opcode::MoveReg,
            Self::MoveFp { .. } => Opcode::MoveFp,
            Self::MoveGpToFp { .. } => Opcode::MoveGpToFp,
            Self::MoveFpToGp { .. } => Opcode::MoveFpToGp,
            Self::LoadIndU64 { .. } => Opcode::LoadIndU64,
            Self::StoreIndU64 { .. } => Opcode::StoreIndU64,
            Self::LoadIndF64 { .. } => Opcode::LoadIndF64,
            Self::StoreIndF64 { .. } => Opcode::StoreIndF64,
            Self::LoadIndV128 { .. } => Opcode::LoadIndV128,
            Self::StoreIndV128 { .. } => Opcode::StoreIndV128,
            Self::LoadAcquireU64 { .. } => Opcode::LoadAcquireU64,
            Self::CallInd { .. } => Opcode::CallInd,
            Self::ResolveHandle { .. } => Opcode::ResolveHandle,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Comment(_) => Vec::new(),
            Self::Trap => vec![Opcode::Trap as u8],
            Self::Enter => vec![Opcode::Enter as u8],
            Self::Leave => vec![Opcode::Leave as u8],
            Self::Ret => vec![Opcode::Ret as u8],
            Self::LoadImm64 { reg, value } => {
                let mut bytes = vec![Opcode::LoadImm64 as u8, *reg & 0x1F];
                bytes.extend_from_slice(&value.to_le_bytes());
                bytes
            }
            Self::AddImm64 { dst, src, value } => {
                encode_two_reg_one_imm(Opcode::AddImm64, *dst, *src, *value)
            }
            Self::MoveReg { dst, src } => encode_two_reg(Opcode::MoveReg, *dst, *src),
            Self::MoveFp { dst, src } => encode_two_reg(Opcode::MoveFp, *dst, *src),
            Self::MoveGpToFp { dst, src } => encode_two_reg(Opcode::MoveGpToFp, *dst, *src),
            Self::MoveFpToGp { dst, src } => encode_two_reg(Opcode::MoveFpToGp, *dst, *src),
            Self::LoadIndU64 { dst, base, offset } => {
                encode_two_reg_one_imm(Opcode::LoadIndU64, *dst, *base, *offset)
            }
            Self::StoreIndU64 { base, src, offset } => {
                encode_two_reg_one_imm(Opcode::StoreIndU64, *src, *base, *offset)
            }
            Self::LoadIndF64 { dst, base, offset } => {
                encode_two_reg_one_imm(Opcode::LoadIndF64, *dst, *base, *offset)
            }
            Self::StoreIndF64 { base, src, offset } => {
                encode_two_reg_one_imm(Opcode::StoreIndF64, *src, *base, *offset)
            }
            Self::LoadIndV128 { dst, base, offset } => {
                encode_two_reg_one_imm(Opcode::LoadIndV128, *dst, *base, *offset)
            }
            Self::StoreIndV128 { base, src, offset } => {
                encode_two_reg_one_imm(Opcode::StoreIndV128, *src, *base, *offset)
            }
            Self::LoadAcquireU64 { dst, base, offset } => {
                encode_two_reg_one_imm(Opcode::LoadAcquireU64, *dst, *base, *offset)
            }
            Self::CallInd { reg } => vec![Opcode::CallInd as u8, *reg & 0x1F],
            Self::ResolveHandle { reg, thread, tmp } => vec![
                Opcode::ResolveHandle as u8,
                *reg & 0x1F,
                *thread & 0x1F,
                *tmp & 0x1F,
            ],
        }
    }

    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.opcode().is_some_and(Opcode::is_terminating)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Comment(text) => write!(f, ";; {text}"),
            Self::Trap => f.write_str("trap"),
            Self::Enter => f.write_str("enter"),
            Self::Leave => f.write_str("leave"),
            Self::Ret => f.write_str("ret"),
            Self::LoadImm64 { reg, value } => write!(f, "mov r{reg}, {value:#x}"),
            Self::AddImm64 { dst, src, value } => write!(f, "add r{dst}, r{src}, {value}"),
            Self::MoveReg { dst, src } => write!(f, "mov r{dst}, r{src}"),
            Self::MoveFp { dst, src } => write!(f, "mov v{dst}, v{src}"),
            Self::MoveGpToFp { dst, src } => write!(f, "fmov v{dst}, r{src}"),
            Self::MoveFpToGp { dst, src } => write!(f, "fmov r{dst}, v{src}"),
            Self::LoadIndU64 { dst, base, offset } => write!(f, "ldr r{dst}, [r{base}, {offset}]"),
            Self::StoreIndU64 { base, src, offset } => {
                write!(f, "str r{src}, [r{base}, {offset}]")
            }
            Self::LoadIndF64 { dst, base, offset } => write!(f, "ldr d{dst}, [r{base}, {offset}]"),
            Self::StoreIndF64 { base, src, offset } => {
                write!(f, "str d{src}, [r{base}, {offset}]")
            }
            Self::LoadIndV128 { dst, base, offset } => {
                write!(f, "ldr q{dst}, [r{base}, {offset}]")
            }
            Self::StoreIndV128 { base, src, offset } => {
                write!(f, "str q{src}, [r{base}, {offset}]")
            }
            Self::LoadAcquireU64 { dst, base, offset } => {
                write!(f, "ldar r{dst}, [r{base}, {offset}]")
            }
            Self::CallInd { reg } => write!(f, "blr r{reg}"),
            Self::ResolveHandle { reg, thread, tmp } => {
                write!(f, "resolve_handle r{reg}, r{thread}, r{tmp}")
            }
        }
    }
}

fn encode_two_reg(opcode: Opcode, dst: u8, src: u8) -> Vec<u8> {
    vec![opcode as u8, dst & 0x1F, src & 0x1F]
}

/// `[opcode, a, imm_len << 5 | b, imm...]` with a compact sign-extended immediate.
fn encode_two_reg_one_imm(opcode: Opcode, a: u8, b: u8, value: i32) -> Vec<u8> {
    let imm = encode_imm(value);
    let imm_len = imm.len() as u8;
    let mut bytes = vec![opcode as u8, a & 0x1F, (imm_len << 5) | (b & 0x1F)];
    bytes.extend_from_slice(&imm);
    bytes
}

fn encode_imm(value: i32) -> Vec<u8> {
    let bytes = value.to_le_bytes();
    let len = if value == 0 {
        0
    } else if (-128..=127).contains(&value) {
        1
    } else if (-32768..=32767).contains(&value) {
        2
    } else if (-8_388_608..=8_388_607).contains(&value) {
        3
    } else {
        4
    };
    bytes[..len].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_imm(bytes: &[u8]) -> i32 {
        let mut buf = [0u8; 4];
        buf[..bytes.len()].copy_from_slice(bytes);
        if let Some(&last) = bytes.last()
            && last & 0x80 != 0
        {
            for b in buf.iter_mut().skip(bytes.len()) {
                *b = 0xFF;
            }
        }
        i32::from_le_bytes(buf)
    }

    #[test]
    fn test_two_reg_one_imm_encoding() {
        let instr = Instruction::LoadIndU64 {
            dst: 3,
            base: 31,
            offset: 16,
        };
        let encoded = instr.encode();
        assert_eq!(encoded[0], Opcode::LoadIndU64 as u8);
        assert_eq!(encoded[1], 3);
        // imm_len=1 in the top three bits, base=31 in the low five.
        assert_eq!(encoded[2], (1 << 5) | 31);
        assert_eq!(encoded[3], 16);
        assert_eq!(encoded.len(), 4);
    }

    #[test]
    fn test_zero_offset_has_no_immediate_bytes() {
        let instr = Instruction::StoreIndU64 {
            base: 31,
            src: 19,
            offset: 0,
        };
        assert_eq!(instr.encode(), vec![Opcode::StoreIndU64 as u8, 19, 31]);
    }

    #[test]
    fn test_immediate_sign_extension() {
        for value in [-1, 127, -129, 40_000, -8_388_608, i32::MAX, i32::MIN] {
            let encoded = Instruction::AddImm64 {
                dst: 31,
                src: 31,
                value,
            }
            .encode();
            let imm_len = (encoded[2] >> 5) as usize;
            assert_eq!(encoded.len(), 3 + imm_len);
            assert_eq!(decode_imm(&encoded[3..]), value, "value {value}");
        }
    }

    #[test]
    fn test_load_imm64_encoding() {
        let encoded = Instruction::LoadImm64 {
            reg: 8,
            value: 0xDEAD_BEEF_0000_0001,
        }
        .encode();
        assert_eq!(encoded.len(), 10);
        assert_eq!(encoded[1], 8);
        assert_eq!(
            u64::from_le_bytes(encoded[2..10].try_into().unwrap()),
            0xDEAD_BEEF_0000_0001
        );
    }

    #[test]
    fn test_comment_is_zero_width() {
        let instr = Instruction::Comment("{ on_entry");
        assert!(instr.encode().is_empty());
        assert!(instr.opcode().is_none());
        assert!(!instr.is_terminating());
    }

    #[test]
    fn test_terminating_instructions() {
        assert!(Instruction::Ret.is_terminating());
        assert!(Instruction::Trap.is_terminating());
        assert!(!Instruction::CallInd { reg: 8 }.is_terminating());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Instruction::StoreIndF64 {
                base: 31,
                src: 8,
                offset: 24
            }
            .to_string(),
            "str d8, [r31, 24]"
        );
        assert_eq!(Instruction::CallInd { reg: 8 }.to_string(), "blr r8");
    }
}
