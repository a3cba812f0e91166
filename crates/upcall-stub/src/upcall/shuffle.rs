use std::collections::HashSet;
use std::fmt;

use super::emitter::{StubEmitter, frame_offset};
use crate::abi::{
    CallingConvention, Location, RegKind, Register, STACK_ARG_SIZE, STACK_SLOT_SIZE, StackArea,
};
use crate::masm::Instruction;
use crate::{Error, Result};

/// One value copy from `src` to `dst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Move {
    pub src: Location,
    pub dst: Location,
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Where the stack areas live once the frame is set up.
#[derive(Debug, Clone, Copy)]
pub struct MoveContext {
    pub frame_pointer: Register,
    pub stack_pointer: Register,
    /// Distance from the frame pointer to the first incoming stack argument.
    pub incoming_base: usize,
    /// Temporary for stack-to-stack copies. Must not be a source or destination.
    pub temp: Register,
}

impl MoveContext {
    fn address(&self, loc: Location) -> Result<(u8, i32)> {
        match loc {
            Location::Stack {
                area: StackArea::Incoming,
                offset,
            } => {
                let base = frame_offset(self.incoming_base)?;
                Ok((self.frame_pointer.index(), base + offset))
            }
            Location::Stack {
                area: StackArea::Outgoing,
                offset,
            } => Ok((self.stack_pointer.index(), offset)),
            Location::Reg(reg) => Err(Error::Internal(format!(
                "register {reg} has no stack address"
            ))),
        }
    }
}

/// Relocates native argument locations to runtime argument locations.
///
/// Moves are ordered so no pending source is overwritten; cycles are broken
/// by parking one value in the scratch register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentShuffle {
    mapping: Vec<Move>,
    moves: Vec<Move>,
    out_arg_stack_slots: usize,
    scratch: Register,
}

impl ArgumentShuffle {
    /// Pair native argument `i` with runtime argument `i + 1`. Runtime slot 0
    /// is the receiver and is not produced by the shuffle.
    pub fn new(
        native: &CallingConvention,
        runtime: &CallingConvention,
        scratch: Register,
    ) -> Result<Self> {
        let runtime_args = runtime.split_first().map(|(_, rest)| rest).unwrap_or_default();
        if runtime_args.len() != native.len() {
            return Err(Error::SignatureMismatch {
                native: native.len(),
                runtime: runtime_args.len(),
            });
        }
        Self::from_pairs(native.locations().zip(runtime_args.locations()), scratch)
    }

    /// Plan moves for explicit `(source, destination)` pairs.
    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (Location, Location)>,
        scratch: Register,
    ) -> Result<Self> {
        let mapping: Vec<Move> = pairs
            .into_iter()
            .map(|(src, dst)| Move { src, dst })
            .collect();

        let scratch_loc = Location::Reg(scratch);
        let mut sources = HashSet::new();
        let mut destinations = HashSet::new();
        for mv in &mapping {
            if mv.src == scratch_loc || mv.dst == scratch_loc {
                return Err(Error::ShuffleConflict(format!(
                    "scratch register {scratch} used by move {mv}"
                )));
            }
            if let Location::Stack {
                area: StackArea::Incoming,
                ..
            } = mv.dst
            {
                return Err(Error::ShuffleConflict(format!(
                    "move {mv} writes into the caller's argument area"
                )));
            }
            if !destinations.insert(mv.dst) {
                return Err(Error::ShuffleConflict(format!(
                    "destination {} written twice",
                    mv.dst
                )));
            }
            if !sources.insert(mv.src) {
                return Err(Error::ShuffleConflict(format!(
                    "source {} read by two arguments",
                    mv.src
                )));
            }
        }

        let out_arg_stack_slots = mapping
            .iter()
            .filter_map(|mv| match mv.dst {
                Location::Stack {
                    area: StackArea::Outgoing,
                    offset,
                } => usize::try_from(offset).ok(),
                _ => None,
            })
            .map(|offset| (offset + STACK_ARG_SIZE) / STACK_SLOT_SIZE)
            .max()
            .unwrap_or(0);

        let pending = mapping.iter().copied().filter(|mv| mv.src != mv.dst).collect();
        let moves = resolve_parallel_moves(pending, scratch);

        Ok(Self {
            mapping,
            moves,
            out_arg_stack_slots,
            scratch,
        })
    }

    /// Per-argument source/destination pairs, identity pairs included.
    #[must_use]
    pub fn mapping(&self) -> &[Move] {
        &self.mapping
    }

    /// Sequential moves that realize the mapping.
    #[must_use]
    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    /// Outgoing stack space needed, in 4-byte slots.
    #[must_use]
    pub const fn out_arg_stack_slots(&self) -> usize {
        self.out_arg_stack_slots
    }

    #[must_use]
    pub const fn scratch(&self) -> Register {
        self.scratch
    }

    pub fn generate(&self, e: &mut StubEmitter, ctx: &MoveContext) -> Result<()> {
        for &mv in &self.moves {
            lower_move(e, mv, ctx)?;
        }
        Ok(())
    }
}

impl fmt::Display for ArgumentShuffle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "argument shuffle (scratch {}, {} out arg slots)",
            self.scratch, self.out_arg_stack_slots
        )?;
        writeln!(f, "  mapping:")?;
        for (i, mv) in self.mapping.iter().enumerate() {
            writeln!(f, "    {i}: {mv}")?;
        }
        writeln!(f, "  moves:")?;
        for mv in &self.moves {
            writeln!(f, "    {mv}")?;
        }
        Ok(())
    }
}

/// Sequentialize a parallel copy with unique sources and destinations.
///
/// A move is safe once no pending move still reads its destination. When no
/// move is safe, every pending move sits on a cycle; park one source in
/// `scratch` and let its destination read from there. The cycle then drains
/// before the scratch is needed again.
fn resolve_parallel_moves(mut pending: Vec<Move>, scratch: Register) -> Vec<Move> {
    let scratch = Location::Reg(scratch);
    let mut resolved = Vec::with_capacity(pending.len() + 1);
    let mut scratch_busy = false;

    while !pending.is_empty() {
        let safe = pending
            .iter()
            .position(|mv| !pending.iter().any(|other| other.src == mv.dst));
        if let Some(i) = safe {
            let mv = pending.remove(i);
            if mv.src == scratch {
                scratch_busy = false;
            }
            resolved.push(mv);
        } else {
            debug_assert!(!scratch_busy, "shuffle scratch reused before its cycle drained");
            let parked = &mut pending[0];
            resolved.push(Move {
                src: parked.src,
                dst: scratch,
            });
            parked.src = scratch;
            scratch_busy = true;
        }
    }
    resolved
}

fn lower_move(e: &mut StubEmitter, mv: Move, ctx: &MoveContext) -> Result<()> {
    match (mv.src, mv.dst) {
        (Location::Reg(src), Location::Reg(dst)) => {
            let (d, s) = (dst.index(), src.index());
            e.emit(match (src.kind(), dst.kind()) {
                (RegKind::Gp, RegKind::Gp) => Instruction::MoveReg { dst: d, src: s },
                (RegKind::Fp, RegKind::Fp) => Instruction::MoveFp { dst: d, src: s },
                (RegKind::Gp, RegKind::Fp) => Instruction::MoveGpToFp { dst: d, src: s },
                (RegKind::Fp, RegKind::Gp) => Instruction::MoveFpToGp { dst: d, src: s },
            });
        }
        (Location::Reg(src), dst @ Location::Stack { .. }) => {
            let (base, offset) = ctx.address(dst)?;
            e.emit(store(src, base, offset));
        }
        (src @ Location::Stack { .. }, Location::Reg(dst)) => {
            let (base, offset) = ctx.address(src)?;
            e.emit(load(dst, base, offset));
        }
        (src @ Location::Stack { .. }, dst @ Location::Stack { .. }) => {
            let (src_base, src_offset) = ctx.address(src)?;
            let (dst_base, dst_offset) = ctx.address(dst)?;
            e.emit(load(ctx.temp, src_base, src_offset));
            e.emit(store(ctx.temp, dst_base, dst_offset));
        }
    }
    Ok(())
}

/// Stack-passed floating values occupy the low 64 bits of a vector register.
fn store(src: Register, base: u8, offset: i32) -> Instruction {
    match src.kind() {
        RegKind::Gp => Instruction::StoreIndU64 {
            base,
            src: src.index(),
            offset,
        },
        RegKind::Fp => Instruction::StoreIndF64 {
            base,
            src: src.index(),
            offset,
        },
    }
}

fn load(dst: Register, base: u8, offset: i32) -> Instruction {
    match dst.kind() {
        RegKind::Gp => Instruction::LoadIndU64 {
            dst: dst.index(),
            base,
            offset,
        },
        RegKind::Fp => Instruction::LoadIndF64 {
            dst: dst.index(),
            base,
            offset,
        },
    }
}
