use crossjit::driver::template::TemplateBackend;
use crossjit::driver::{BackendId, Driver};
use crossjit::isa::{Isa, aarch64, armv7};
use crossjit::link::{LinkError, LinkedImage, Linker};
use crossjit::routine::{CallKind, CallSite, CompiledRoutine, SelfPatch};

fn code(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn word_at(bytes: &[u8], offset: u64) -> u32 {
    let at = offset as usize;
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

/// Every patched call must land on its target inside the buffer.
fn assert_sound(isa: Isa, image: &LinkedImage) {
    let bytes = image.buffer.bytes();
    assert!(!image.calls.is_empty());
    for call in &image.calls {
        assert!(call.site < image.buffer.size(), "site {:#x} outside buffer", call.site);
        assert!(call.target < image.buffer.size(), "target {:#x} outside buffer", call.target);
        let disp = isa
            .decode_call(bytes, call.site as usize)
            .unwrap_or_else(|| panic!("no call at {:#x}", call.site));
        assert_eq!(
            call.site as i64 + disp,
            call.target as i64,
            "call in {} at {:#x}",
            call.routine,
            call.site
        );
    }
    assert!(image.entry.offset + 4 <= image.buffer.size());
}

fn armv7_routines() -> Vec<CompiledRoutine> {
    let blank_sequence = [armv7::movw(armv7::IP, 0), armv7::movt(armv7::IP, 0), armv7::ADD_IP_PC_IP, armv7::BLX_IP];
    let mut caller = blank_sequence.to_vec();
    caller.push(0xEBFFFFFE); // bl .
    caller.push(armv7::RET);
    let test = CompiledRoutine::method(
        "test",
        0x2000,
        code(&caller),
        vec![
            CallSite::call(0, 0x3000),
            CallSite {
                site_offset: 16,
                target_address: 0x1000,
                kind: CallKind::Call,
                via_trampoline: true,
            },
        ],
    )
    .unwrap();
    let helper = CompiledRoutine::method("helper", 0x3000, code(&[armv7::NOP, armv7::RET]), vec![]).unwrap();
    let trampoline = CompiledRoutine::trampoline(
        "trampoline",
        0x1000,
        code(&[0xE92D4000, 0xEBFFFFFE, armv7::NOP, armv7::RET]),
        vec![CallSite::call(4, 0x1000)],
        Some(SelfPatch {
            offset: 0,
            length: 8,
            resolves_to: Some(0x3000),
        }),
    )
    .unwrap();
    vec![test, helper, trampoline]
}

#[test]
fn test_armv7_relocation_is_sound() {
    let image = Linker::new(Isa::Armv7).link(armv7_routines(), "test").unwrap();

    assert_eq!(image.buffer.base(), 0x1000);
    assert_eq!(image.buffer.limit(), 0x3008);
    assert_eq!(image.entry.offset, 0x1000);
    assert_sound(Isa::Armv7, &image);

    // trampoline region: direct jump to the helper, then a no-op
    let jump = word_at(image.buffer.bytes(), 0);
    assert_eq!(armv7::decode_branch(jump), Some((false, 0x2000)));
    assert_eq!(word_at(image.buffer.bytes(), 4), armv7::NOP);

    // the routed call goes to the trampoline copy
    let routed = word_at(image.buffer.bytes(), 0x1010);
    assert_eq!(armv7::decode_branch(routed), Some((true, -0x1010)));
}

#[test]
fn test_relinking_is_deterministic() {
    let linker = Linker::new(Isa::Armv7);
    let first = linker.link(armv7_routines(), "test").unwrap();
    let second = linker.link(armv7_routines(), "test").unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_template_backend_images_are_sound() {
    let linker = Linker::new(Isa::Aarch64);
    let mut driver = Driver::new(Box::new(TemplateBackend::new()));
    for backend in BackendId::ALL {
        let image = driver
            .open_session("invokestatic", backend)
            .unwrap()
            .link(&linker)
            .unwrap();
        assert_sound(Isa::Aarch64, &image);
        assert!(image.placements.iter().any(|p| p.name == "invokestatic"));
    }
}

#[test]
fn test_reset_between_sessions_gives_identical_buffers() {
    let linker = Linker::new(Isa::Aarch64);
    let mut driver = Driver::new(Box::new(TemplateBackend::new()));
    let first = driver
        .open_session("ladd", BackendId::Baseline)
        .unwrap()
        .link(&linker)
        .unwrap();
    // an unrelated compilation in between must not leak into the next session
    driver
        .open_session("dmul", BackendId::Optimizing)
        .unwrap();
    let second = driver
        .open_session("ladd", BackendId::Baseline)
        .unwrap()
        .link(&linker)
        .unwrap();
    assert_eq!(first.buffer, second.buffer);
    assert_eq!(first.entry, second.entry);
}

#[test]
fn test_call_outside_buffer_is_a_relocation_gap() {
    let caller = CompiledRoutine::method(
        "test",
        0x4000,
        code(&[0x94000000, aarch64::RET]),
        vec![CallSite::call(0, 0x8000)],
    )
    .unwrap();
    let err = Linker::new(Isa::Aarch64).link(vec![caller], "test").unwrap_err();
    assert!(matches!(err, LinkError::OutOfRange { target: 0x8000, .. }));
    assert!(err.to_string().contains("relocation gap"));
}
