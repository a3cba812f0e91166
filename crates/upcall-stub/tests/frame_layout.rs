//! Frame layouts of generated stubs.

use upcall_stub::abi::{ConventionDescriptor, Register, RegisterSet};
use upcall_stub::test_harness::*;
use upcall_stub::upcall::{FrameRegion, ReturnBuffer};
use upcall_stub::{Error, StubOptions, generate_upcall_stub};

fn region_size(sig: &str, region: FrameRegion) -> Option<usize> {
    let request = aarch64_request(sig).unwrap();
    let blob = generate_upcall_stub(&request, &StubOptions::default()).unwrap();
    blob.layout().region(region).map(|span| span.size)
}

#[test]
fn test_aapcs64_callee_save_area() {
    // r19-r28 and v8-v15, one 8-byte slot each.
    assert_eq!(region_size("()V", FrameRegion::CalleeSave), Some(18 * 8));
}

#[test]
fn test_argument_and_result_save_areas() {
    // r0, r1 at 8 bytes, v0 at 16 bytes.
    assert_eq!(region_size("(IJD)J", FrameRegion::ArgSave), Some(32));
    assert_eq!(region_size("(IJD)J", FrameRegion::ResultSave), Some(8));
    assert_eq!(region_size("(IJD)D", FrameRegion::ResultSave), Some(16));
    assert_eq!(region_size("()V", FrameRegion::ResultSave), Some(0));
}

#[test]
fn test_out_args_sized_from_stack_arguments() {
    assert_eq!(region_size("(JJJJJJJJJJ)V", FrameRegion::OutArgs), Some(32));
    assert_eq!(region_size("(J)V", FrameRegion::OutArgs), Some(0));
}

#[test]
fn test_return_buffer_for_two_registers() {
    assert_eq!(region_size("()[JJ]", FrameRegion::ReturnBuffer), Some(16));
    assert_eq!(region_size("()[JD]", FrameRegion::ReturnBuffer), Some(24));
    assert_eq!(region_size("()J", FrameRegion::ReturnBuffer), None);
}

fn runtime_returning(
    float_returns: &[Register],
    return_buffer: Option<Register>,
) -> ConventionDescriptor {
    let builder = ConventionDescriptor::builder("runtime")
        .volatile((0..=18).map(Register::gp))
        .int_args((1..=7).map(Register::gp))
        .float_args((0..=7).map(Register::fp))
        .int_returns([Register::gp(0)])
        .float_returns(float_returns.iter().copied());
    match return_buffer {
        Some(reg) => builder.return_buffer_register(reg).build().unwrap(),
        None => builder.build().unwrap(),
    }
}

#[test]
fn test_return_buffer_when_runtime_lacks_result_register() {
    let runtime = runtime_returning(&[], Some(Register::gp(10)));
    let request = aarch64_request("()D")
        .unwrap()
        .with_conventions(ConventionDescriptor::aapcs64(), runtime);
    let blob = generate_upcall_stub(&request, &StubOptions::default()).unwrap();
    let span = blob.layout().region(FrameRegion::ReturnBuffer).unwrap();
    assert_eq!(span.size, 16);
}

#[test]
fn test_return_buffer_when_runtime_result_register_differs() {
    let runtime = runtime_returning(&[Register::fp(1)], Some(Register::gp(10)));
    let request = aarch64_request("(J)D")
        .unwrap()
        .with_conventions(ConventionDescriptor::aapcs64(), runtime);
    let blob = generate_upcall_stub(&request, &StubOptions::default()).unwrap();
    assert_eq!(
        blob.layout().region(FrameRegion::ReturnBuffer).map(|span| span.size),
        Some(16)
    );
}

#[test]
fn test_missing_result_register_without_buffer_register_is_rejected() {
    let runtime = runtime_returning(&[], None);
    let request = aarch64_request("()D")
        .unwrap()
        .with_conventions(ConventionDescriptor::aapcs64(), runtime);
    let err = generate_upcall_stub(&request, &StubOptions::default()).unwrap_err();
    assert!(matches!(err, Error::InvalidDescriptor(_)), "{err}");
}

#[test]
fn test_matching_result_register_needs_no_buffer() {
    let runtime = runtime_returning(&[Register::fp(0)], None);
    let request = aarch64_request("(D)D")
        .unwrap()
        .with_conventions(ConventionDescriptor::aapcs64(), runtime);
    let blob = generate_upcall_stub(&request, &StubOptions::default()).unwrap();
    assert!(blob.layout().region(FrameRegion::ReturnBuffer).is_none());
}

#[test]
fn test_return_buffer_override_must_not_shrink() {
    let request = aarch64_request("()[JD]")
        .unwrap()
        .with_return_buffer(ReturnBuffer::Explicit(16));
    let err = generate_upcall_stub(&request, &StubOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        Error::ReturnBufferTooSmall {
            required: 24,
            provided: 16
        }
    ));
}

#[test]
fn test_regions_are_ordered_and_frame_aligned() {
    for sig in ["()V", "(IJD)J", "(JJJJJJJJJJ)V", "(I)[JD]"] {
        let request = aarch64_request(sig).unwrap();
        let blob = generate_upcall_stub(&request, &StubOptions::default()).unwrap();
        let layout = blob.layout();
        assert_eq!(blob.frame_size() % 16, 0, "{sig}");
        for pair in layout.regions().windows(2) {
            assert!(pair[0].region < pair[1].region, "{sig}");
            assert_eq!(pair[0].end(), pair[1].offset, "{sig}");
        }
        assert!(layout.regions().last().unwrap().end() <= blob.frame_size());
    }
}

#[test]
fn test_empty_non_volatile_set() {
    let everything = (0..=28)
        .map(Register::gp)
        .chain(std::iter::once(Register::gp(30)))
        .chain((0..32).map(Register::fp));
    let native = ConventionDescriptor::builder("all-volatile")
        .volatile(everything)
        .int_args((0..=7).map(Register::gp))
        .float_args((0..=7).map(Register::fp))
        .int_returns([Register::gp(0), Register::gp(1)])
        .float_returns([Register::fp(0)])
        .build()
        .unwrap();
    assert!(native.non_volatile(&RegisterSet::aarch64()).is_empty());

    let request = aarch64_request("(J)J")
        .unwrap()
        .with_conventions(native, ConventionDescriptor::aarch64_runtime());
    let blob = generate_upcall_stub(&request, &StubOptions::default()).unwrap();
    let layout = blob.layout();
    let callee = layout.region(FrameRegion::CalleeSave).unwrap();
    assert_eq!(callee.size, 0);
    assert_eq!(callee.offset, layout.offset(FrameRegion::FrameData));
    assert!(layout.offset(FrameRegion::ArgSave) <= callee.offset);
}

#[test]
fn test_shadow_space_reserved_for_hooks() {
    let native = ConventionDescriptor::builder("shadowed")
        .volatile((0..=18).map(Register::gp))
        .int_args((0..=3).map(Register::gp))
        .float_args((0..=3).map(Register::fp))
        .int_returns([Register::gp(0)])
        .float_returns([Register::fp(0)])
        .shadow_space(32)
        .build()
        .unwrap();
    let request = aarch64_request("(JJ)J")
        .unwrap()
        .with_conventions(native, ConventionDescriptor::aarch64_runtime());
    let blob = generate_upcall_stub(&request, &StubOptions::default()).unwrap();
    assert_eq!(blob.layout().region(FrameRegion::OutArgs).unwrap().size, 32);
}
