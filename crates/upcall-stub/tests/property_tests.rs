//! Property-based tests for frame planning, argument shuffling and spilling.
//!
//! Uses `proptest` to generate random inputs and verify invariants:
//! - Any register permutation is realized with a single scratch register
//! - Frame sizes are positive multiples of the alignment, regions are ordered
//! - Spilled argument registers come back bit for bit on the simulator
//! - Instruction encodings always start with the instruction's opcode

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;
use upcall_stub::abi::{ConventionDescriptor, Location, Register};
use upcall_stub::test_harness::*;
use upcall_stub::upcall::{ArgumentShuffle, FrameLayoutPlanner, FrameRegion};
use upcall_stub::{Instruction, StubOptions, generate_upcall_stub};

fn cycle_count(permutation: &[usize]) -> usize {
    let mut seen = vec![false; permutation.len()];
    let mut cycles = 0;
    for start in 0..permutation.len() {
        if seen[start] || permutation[start] == start {
            continue;
        }
        cycles += 1;
        let mut i = start;
        while !seen[i] {
            seen[i] = true;
            i = permutation[i];
        }
    }
    cycles
}

fn permutation_strategy() -> impl Strategy<Value = Vec<usize>> {
    (1usize..=12).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
}

fn instruction_strategy() -> impl Strategy<Value = Instruction> {
    let reg = 0u8..32;
    prop_oneof![
        Just(Instruction::Enter),
        Just(Instruction::Ret),
        (reg.clone(), any::<u64>()).prop_map(|(reg, value)| Instruction::LoadImm64 { reg, value }),
        (reg.clone(), reg.clone(), any::<i32>())
            .prop_map(|(dst, src, value)| Instruction::AddImm64 { dst, src, value }),
        (reg.clone(), reg.clone(), any::<i32>())
            .prop_map(|(dst, base, offset)| Instruction::LoadIndV128 { dst, base, offset }),
        (reg.clone(), reg.clone(), any::<i32>())
            .prop_map(|(base, src, offset)| Instruction::StoreIndF64 { base, src, offset }),
        (reg.clone(), reg).prop_map(|(dst, src)| Instruction::MoveFpToGp { dst, src }),
    ]
}

proptest! {
    #[test]
    fn prop_permutation_shuffle_is_correct(permutation in permutation_strategy()) {
        let reg = |i: usize| Location::Reg(Register::gp(i as u8));
        let shuffle = ArgumentShuffle::from_pairs(
            permutation.iter().enumerate().map(|(i, &j)| (reg(i), reg(j))),
            Register::gp(19),
        )
        .unwrap();
        assert_shuffle_correct(&shuffle);

        let cycles = cycle_count(&permutation);
        let moved = permutation.iter().enumerate().filter(|&(i, &j)| i != j).count();
        prop_assert_eq!(scratch_uses(&shuffle), cycles);
        prop_assert_eq!(shuffle.moves().len(), moved + cycles);
    }

    #[test]
    fn prop_frame_size_is_aligned(
        alignment_log2 in 3u32..=6,
        shadow_words in 0usize..=8,
        slots in 0usize..=32,
        result_bytes in 0usize..=64,
        arg_bytes in 0usize..=256,
        callee_regs in 0usize..=20,
        return_buffer in proptest::option::of(0usize..=64),
    ) {
        let desc = ConventionDescriptor::builder("random")
            .stack_alignment(1 << alignment_log2)
            .shadow_space(shadow_words * 8)
            .build()
            .unwrap();
        let layout = FrameLayoutPlanner::new(&desc)
            .out_arg_stack_slots(slots)
            .result_spill_bytes(result_bytes)
            .arg_spill_bytes(arg_bytes)
            .callee_save_bytes(callee_regs * 8)
            .return_buffer(return_buffer)
            .plan();

        prop_assert!(layout.frame_size() > 0);
        prop_assert_eq!(layout.frame_size() % desc.stack_alignment_bytes(), 0);

        let regions = layout.regions();
        prop_assert_eq!(regions[0].offset, 0);
        for pair in regions.windows(2) {
            prop_assert!(pair[0].region < pair[1].region);
            prop_assert_eq!(pair[0].end(), pair[1].offset);
        }
        let last = regions[regions.len() - 1];
        prop_assert!(last.end() <= layout.frame_size());

        let out_args = layout.region(FrameRegion::OutArgs).unwrap();
        prop_assert!(out_args.size >= slots * 4);
        prop_assert!(out_args.size >= shadow_words * 8);
        prop_assert_eq!(
            layout.region(FrameRegion::ReturnBuffer).map(|span| span.size),
            return_buffer
        );
    }

    #[test]
    fn prop_argument_registers_round_trip(
        ints in proptest::collection::vec(any::<u64>(), 2),
        vectors in proptest::collection::vec(any::<u128>(), 2),
    ) {
        // (JDJD): native r0, v0, r1, v1 -> runtime r2, v0, r3, v1.
        let request = aarch64_request("(JDJD)V").unwrap();
        let blob = generate_upcall_stub(&request, &StubOptions::default()).unwrap();
        let mut machine = machine_for(&request);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        machine.on_call(TARGET_ENTRY, "target", move |cpu| {
            log.borrow_mut().extend([
                u128::from(cpu.gp(2)),
                cpu.vec(0),
                u128::from(cpu.gp(3)),
                cpu.vec(1),
            ]);
            CallOutcome::Return
        });

        let cpu = machine.state_mut();
        cpu.set_gp(0, ints[0]);
        cpu.set_gp(1, ints[1]);
        cpu.set_vec(0, vectors[0]);
        cpu.set_vec(1, vectors[1]);

        prop_assert_eq!(machine.run(&blob), Exit::Returned);
        prop_assert_eq!(
            seen.borrow().clone(),
            vec![
                u128::from(ints[0]),
                vectors[0],
                u128::from(ints[1]),
                vectors[1],
            ]
        );
    }

    #[test]
    fn prop_encoding_starts_with_opcode(instr in instruction_strategy()) {
        let encoded = instr.encode();
        let opcode = instr.opcode().unwrap();
        prop_assert_eq!(encoded[0], opcode as u8);
        prop_assert!(encoded.len() <= 10);
    }
}
