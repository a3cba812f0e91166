//! Shape of the emitted instruction stream, phase by phase.

use std::io;
use std::sync::{Arc, Mutex};

use upcall_stub::abi::{METHOD_FROM_COMPILED_OFFSET, THREAD_CALLEE_TARGET_OFFSET};
use upcall_stub::test_harness::*;
use upcall_stub::upcall::{StubBlob, StubPhase};
use upcall_stub::{Instruction, Opcode, StubOptions, generate_upcall_stub};

fn generate(sig: &str) -> StubBlob {
    let request = aarch64_request(sig).unwrap();
    generate_upcall_stub(&request, &StubOptions::default()).unwrap()
}

/// Real instructions of one phase, block comments dropped.
fn phase(blob: &StubBlob, phase: StubPhase) -> Vec<Instruction> {
    let marks = blob.phases();
    let at = marks.iter().position(|mark| mark.phase == phase).unwrap();
    let end = marks.get(at + 1).map_or(blob.code().len(), |mark| mark.offset);
    instructions_between(blob, marks[at].offset, end)
        .into_iter()
        .filter(|instr| instr.opcode().is_some())
        .collect()
}

// ── Entry ──

#[test]
fn test_prologue_reserves_frame() {
    let blob = generate("(J)J");
    assert_eq!(blob.entry_offset(), 0);
    let prologue = phase(&blob, StubPhase::Prologue);
    assert_eq!(prologue[0], Instruction::Enter);
    assert_eq!(
        prologue[1],
        Instruction::AddImm64 {
            dst: 31,
            src: 31,
            value: -(blob.frame_size() as i32),
        }
    );
}

#[test]
fn test_preserve_uses_low_half_for_vectors() {
    let blob = generate("()V");
    let preserve = phase(&blob, StubPhase::PreserveCallee);
    assert_eq!(count_opcode(&preserve, Opcode::StoreIndU64), 10);
    assert_eq!(count_opcode(&preserve, Opcode::StoreIndF64), 8);
    assert!(!has_opcode(&preserve, Opcode::StoreIndV128));

    let restore = phase(&blob, StubPhase::RestoreCallee);
    assert_eq!(count_opcode(&restore, Opcode::LoadIndU64), 10);
    assert_eq!(count_opcode(&restore, Opcode::LoadIndF64), 8);
}

#[test]
fn test_argument_spill_keeps_full_vectors() {
    let blob = generate("(JD)V");
    let spill = phase(&blob, StubPhase::SpillArgs);
    assert_eq!(count_opcode(&spill, Opcode::StoreIndU64), 1);
    assert_eq!(count_opcode(&spill, Opcode::StoreIndV128), 1);
}

#[test]
fn test_on_entry_passes_frame_data_and_keeps_thread() {
    let blob = generate("()V");
    assert_eq!(
        phase(&blob, StubPhase::OnEntryHook),
        vec![
            Instruction::AddImm64 {
                dst: 0,
                src: 31,
                value: blob.frame_data_offset() as i32,
            },
            Instruction::LoadImm64 {
                reg: 8,
                value: ON_ENTRY,
            },
            Instruction::CallInd { reg: 8 },
            Instruction::MoveReg { dst: 28, src: 0 },
        ]
    );
    assert!(blob.instructions().contains(&Instruction::Comment("{ on_entry")));
}

// ── Invoke ──

#[test]
fn test_invoke_records_method_and_loads_entry_with_acquire() {
    let blob = generate("(I)I");
    let invoke = phase(&blob, StubPhase::Invoke);
    assert_eq!(
        invoke,
        vec![
            Instruction::LoadImm64 {
                reg: 12,
                value: METHOD_METADATA,
            },
            Instruction::StoreIndU64 {
                base: 28,
                src: 12,
                offset: THREAD_CALLEE_TARGET_OFFSET,
            },
            Instruction::LoadAcquireU64 {
                dst: 8,
                base: 12,
                offset: METHOD_FROM_COMPILED_OFFSET,
            },
            Instruction::CallInd { reg: 8 },
        ]
    );
    assert_eq!(count_opcode(blob.instructions(), Opcode::LoadAcquireU64), 1);
}

#[test]
fn test_receiver_resolved_through_shuffle_register() {
    let blob = generate("()V");
    assert_eq!(
        phase(&blob, StubPhase::ResolveReceiver),
        vec![
            Instruction::LoadImm64 {
                reg: 19,
                value: RECEIVER_SLOT,
            },
            Instruction::ResolveHandle {
                reg: 19,
                thread: 28,
                tmp: 9,
            },
            Instruction::MoveReg { dst: 1, src: 19 },
        ]
    );
}

// ── Exit ──

#[test]
fn test_handle_result_loads_return_buffer_slots() {
    let blob = generate("()[JD]");
    let handle = phase(&blob, StubPhase::HandleResult);
    assert!(matches!(handle[0], Instruction::AddImm64 { dst: 8, src: 31, .. }));
    assert_eq!(
        handle[1..],
        [
            Instruction::LoadIndU64 {
                dst: 0,
                base: 8,
                offset: 0
            },
            Instruction::LoadIndF64 {
                dst: 0,
                base: 8,
                offset: 8
            },
        ]
    );
}

#[test]
fn test_handle_result_without_buffer_is_empty() {
    let blob = generate("(J)J");
    assert!(phase(&blob, StubPhase::HandleResult).is_empty());
}

#[test]
fn test_epilogue_and_exception_handler() {
    let blob = generate("()V");
    assert_eq!(
        phase(&blob, StubPhase::Epilogue),
        vec![Instruction::Leave, Instruction::Ret]
    );
    assert_eq!(
        phase(&blob, StubPhase::ExceptionAbort),
        vec![
            Instruction::MoveReg { dst: 0, src: 0 },
            Instruction::LoadImm64 {
                reg: 8,
                value: UNCAUGHT_EXCEPTION,
            },
            Instruction::CallInd { reg: 8 },
            Instruction::Trap,
        ]
    );
    let last = blob.instructions().iter().rev().find(|i| i.opcode().is_some());
    assert_eq!(last, Some(&Instruction::Trap));
}

// ── Blob ──

#[test]
fn test_encoded_blob_header() {
    let blob = generate("(J)J");
    let encoded = blob.encode();
    let code = blob.code().code();
    assert!(encoded.ends_with(code));
    assert!(encoded.len() > code.len());
    assert!(!blob.code().disassemble().is_empty());
}

/// Log sink shared between the subscriber and the test.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn generate_logged(sig: &str, options: &StubOptions) -> (StubBlob, String) {
    let request = aarch64_request(sig).unwrap();
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .finish();
    let blob = tracing::subscriber::with_default(subscriber, || {
        generate_upcall_stub(&request, options)
    })
    .unwrap();
    let text = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
    (blob, text)
}

#[test]
fn test_shuffle_plan_logged_when_requested() {
    let options = StubOptions {
        print_shuffle_plan: true,
        ..StubOptions::default()
    };
    let (blob, text) = generate_logged("(JJJJ)J", &options);
    assert!(text.contains(&blob.shuffle().to_string()), "{text}");
    assert!(!text.contains(&blob.code().disassemble()));
}

#[test]
fn test_stub_trace_logged_when_requested() {
    let options = StubOptions {
        trace_stubs: true,
        ..StubOptions::default()
    };
    let (blob, text) = generate_logged("(ID)[JD]", &options);
    assert!(text.contains(&blob.to_string()), "{text}");
    assert!(!text.contains("mapping:"));
}

#[test]
fn test_nothing_logged_at_info_by_default() {
    let (_, text) = generate_logged("(J)J", &StubOptions::default());
    assert!(text.is_empty(), "{text}");
}

#[test]
fn test_print_and_trace_options_do_not_change_code() {
    let request = aarch64_request("(JDJ)D").unwrap();
    let plain = generate_upcall_stub(&request, &StubOptions::default()).unwrap();
    let traced = generate_upcall_stub(
        &request,
        &StubOptions {
            print_shuffle_plan: true,
            trace_stubs: true,
            ..StubOptions::default()
        },
    )
    .unwrap();
    assert_eq!(plain.code(), traced.code());
}
