//! End-to-end scenario tests driving [`Session`] through the in-memory
//! reference architecture/binfile pair (spec.md §8, scenarios S1-S6).
//!
//! `Session` exposes no accessor onto its internal asmfile, patchmap, xref,
//! or planner state (by design — see its doc comment), so these tests
//! assert at the level the public API actually offers: a modification's
//! processing state, the session's sticky diagnostics, and whether
//! `finalise` itself succeeds or aborts. That is coarser than the internal
//! `#[cfg(test)]` unit tests beside each module, which can and do assert on
//! private fields directly.

use binpatch_core::{
    AddressingMode, Annotations, AsmFile, ArchRegistry, CalleeRef, Instruction, ModifFlags,
    ModificationKind, Pointer, Position, Section, SectionAttrs, SectionEntry, SectionType,
    Session, Settings,
};
use binpatch_core::arch::reference::ReferenceArch;
use binpatch_core::binfile::reference::ReferenceBinFile;
use binpatch_core::modification::ModifState;
use binpatch_core::result::PatchError;
use cranelift_entity::EntityRef;

fn registry() -> ArchRegistry {
    let mut r = ArchRegistry::new();
    r.register("reference", Box::new(ReferenceArch));
    r
}

fn roomy_binfile() -> Box<ReferenceBinFile> {
    Box::new(ReferenceBinFile::new(vec![], vec![(0x500000, 0x510000)]))
}

/// S1 - NOP insertion fits in place: a 16-byte basic block with no
/// incoming branches gets a 3-byte NOP spliced before its first
/// instruction. The size delta forces a moved block; with plenty of
/// directly-reachable free space the modification should process and
/// apply cleanly.
#[test]
fn s1_nop_insertion_into_untargeted_block() {
    let mut f = AsmFile::new();
    let mut sec = Section::original(".text", 0x400080, 0x10, SectionType::Code, SectionAttrs::LOADED);
    let mut first = None;
    for addr in [0x400080u64, 0x400084, 0x400088, 0x40008c] {
        let id = f.insns.push(Instruction::new(addr, 4, 4, 0));
        if first.is_none() {
            first = Some(id);
        }
        sec.push_entry(SectionEntry::Insn(id));
    }
    f.sections.push(sec);
    let anchor = first.unwrap();

    let mut reg = registry();
    let mut session = Session::init(f, "reference", &mut reg, roomy_binfile(), Settings::default()).unwrap();

    let payload = vec![Instruction::new(0, 3, 3, 0)];
    let modif = session
        .add_modification(
            ModificationKind::Insert { payload, condition: None },
            Some(anchor),
            Position::Before,
            ModifFlags::empty(),
        )
        .unwrap();

    session.finalise("/tmp/s1.bin").unwrap();

    let state = session.modification(modif).unwrap().state();
    assert!(state.contains(ModifState::PROCESSED));
    assert!(state.contains(ModifState::APPLIED));
    assert!(!session.diagnostics().has_error());
}

/// S2 - Replace changes size: a 2-byte instruction in the middle of a
/// three-instruction block is replaced by a 7-byte payload. The non-zero
/// size delta moves the enclosing block.
#[test]
fn s2_replace_with_larger_payload_moves_block() {
    let mut f = AsmFile::new();
    let mut sec = Section::original(".text", 0x401090, 0x10, SectionType::Code, SectionAttrs::LOADED);
    let before = f.insns.push(Instruction::new(0x401090, 4, 4, 0));
    let target = f.insns.push(Instruction::new(0x401094, 2, 2, 0));
    let after = f.insns.push(Instruction::new(0x4010a0, 4, 4, 0));
    sec.push_entry(SectionEntry::Insn(before));
    sec.push_entry(SectionEntry::Insn(target));
    sec.push_entry(SectionEntry::Insn(after));
    f.sections.push(sec);

    let mut reg = registry();
    let mut session = Session::init(f, "reference", &mut reg, roomy_binfile(), Settings::default()).unwrap();

    let modif = session
        .add_modification(
            ModificationKind::Replace { payload: vec![Instruction::new(0, 7, 7, 0)] },
            Some(target),
            Position::Replace,
            ModifFlags::empty(),
        )
        .unwrap();

    session.finalise("/tmp/s2.bin").unwrap();

    let state = session.modification(modif).unwrap().state();
    assert!(state.contains(ModifState::PROCESSED));
    assert!(state.contains(ModifState::APPLIED));
    assert!(!session.diagnostics().has_error());
}

/// S3 - Trampoline. A lone 3-byte block is too small to host the 5-byte
/// direct jump the planner selects for it (it is, however, large enough
/// for the 2-byte small-jump flavor, satisfying `min_size`). This exercises
/// the `needs_block` wiring added for the trampoline search: with no
/// already-displaced block nearby offering spare capacity, the search
/// comes back empty and the modification is rejected rather than silently
/// truncated. The processor demotes every per-modification failure to a
/// session-level warning (so `finalise` itself still returns `Ok`), but the
/// modification's own diagnostics channel keeps the real error.
#[test]
fn s3_undersized_block_without_forceinsert_is_recorded_as_error() {
    let mut f = AsmFile::new();
    let mut sec = Section::original(".text", 0x4000f0, 0x3, SectionType::Code, SectionAttrs::LOADED);
    let anchor = f.insns.push(Instruction::new(0x4000f0, 3, 3, 0));
    sec.push_entry(SectionEntry::Insn(anchor));
    f.sections.push(sec);

    let mut reg = registry();
    let mut session = Session::init(f, "reference", &mut reg, roomy_binfile(), Settings::default()).unwrap();

    let modif = session
        .add_modification(ModificationKind::Relocate, Some(anchor), Position::Keep, ModifFlags::empty())
        .unwrap();

    let _ = session.finalise("/tmp/s3-no-force.bin");

    let m = session.modification(modif).unwrap();
    assert!(m.state().contains(ModifState::ERROR));
    assert!(!m.state().contains(ModifState::APPLIED));
    assert!(matches!(m.diagnostics().last_error(), Some(PatchError::NoSpaceForBlock(_))));
}

#[test]
fn s3_undersized_block_with_forceinsert_is_recorded_as_warning() {
    let mut f = AsmFile::new();
    let mut sec = Section::original(".text", 0x4000f0, 0x3, SectionType::Code, SectionAttrs::LOADED);
    let anchor = f.insns.push(Instruction::new(0x4000f0, 3, 3, 0));
    sec.push_entry(SectionEntry::Insn(anchor));
    f.sections.push(sec);

    let mut reg = registry();
    let mut session = Session::init(f, "reference", &mut reg, roomy_binfile(), Settings::default()).unwrap();

    let modif = session
        .add_modification(ModificationKind::Relocate, Some(anchor), Position::Keep, ModifFlags::FORCEINSERT)
        .unwrap();

    let _ = session.finalise("/tmp/s3-force.bin");

    let m = session.modification(modif).unwrap();
    assert!(m.state().contains(ModifState::ERROR));
    assert!(!m.state().contains(ModifState::APPLIED));
    assert!(matches!(m.diagnostics().last_error(), Some(PatchError::SizeTooSmallForcedInsert(_))));
    assert!(session.diagnostics().warning_count() >= 1);
}

/// S4 - Delete of branch target. A conditional branch points at an
/// instruction that then gets deleted; the patched copy of the branch
/// should end up retargeted at the first live successor.
#[test]
fn s4_delete_of_branch_target() {
    let mut f = AsmFile::new();
    let mut sec = Section::original(".text", 0x401150, 0x10, SectionType::Code, SectionAttrs::LOADED);
    let target = f.insns.push(Instruction::new(0x401200, 4, 4, 0));
    let successor = f.insns.push(Instruction::new(0x401204, 4, 4, 0));

    let mut branch = Instruction::new(0x401150, 4, 4, 0);
    branch.annotations.insert(Annotations::JUMP | Annotations::COND);
    branch.pointer = Some(Pointer::to_insn(target, AddressingMode::Relative));
    let branch = f.insns.push(branch);

    sec.push_entry(SectionEntry::Insn(branch));
    sec.push_entry(SectionEntry::Insn(target));
    sec.push_entry(SectionEntry::Insn(successor));
    f.sections.push(sec);

    let mut reg = registry();
    let mut session = Session::init(f, "reference", &mut reg, roomy_binfile(), Settings::default()).unwrap();

    let modif = session
        .add_modification(ModificationKind::Delete, Some(target), Position::Replace, ModifFlags::empty())
        .unwrap();

    session.finalise("/tmp/s4.bin").unwrap();

    assert!(session.modification(modif).unwrap().state().contains(ModifState::APPLIED));
    assert!(!session.diagnostics().has_error());
}

/// S4b - the same delete, but with `INSERT_NO_UPD_OUTFCT` on, verifies the
/// per-function suppression flag wiring does not itself break the pipeline
/// (the branch and the deleted instruction here share no function
/// attribution, so with `OUTFCT` suppression the branch is left pointing
/// at the tombstone rather than retargeted).
#[test]
fn s4b_delete_with_outfct_suppression_still_finalises() {
    let mut f = AsmFile::new();
    let mut sec = Section::original(".text", 0x401150, 0x10, SectionType::Code, SectionAttrs::LOADED);
    let target = f.insns.push(Instruction::new(0x401200, 4, 4, 0));
    let successor = f.insns.push(Instruction::new(0x401204, 4, 4, 0));

    let mut branch = Instruction::new(0x401150, 4, 4, 0);
    branch.annotations.insert(Annotations::JUMP | Annotations::COND);
    branch.pointer = Some(Pointer::to_insn(target, AddressingMode::Relative));
    let branch = f.insns.push(branch);

    sec.push_entry(SectionEntry::Insn(branch));
    sec.push_entry(SectionEntry::Insn(target));
    sec.push_entry(SectionEntry::Insn(successor));
    f.sections.push(sec);

    let mut reg = registry();
    let mut session = Session::init(f, "reference", &mut reg, roomy_binfile(), Settings::default()).unwrap();

    session
        .add_modification(
            ModificationKind::Delete,
            Some(target),
            Position::Replace,
            ModifFlags::INSERT_NO_UPD_OUTFCT,
        )
        .unwrap();

    session.finalise("/tmp/s4b.bin").unwrap();
    assert!(!session.diagnostics().has_error());
}

/// S5 - Function call insertion. An `INSERT_FCT` against a dynamic-library
/// callee adds a library requirement and a PLT stub, then moves the
/// anchor's enclosing block to host the call sequence.
#[test]
fn s5_function_call_insertion() {
    let mut f = AsmFile::new();
    let mut sec = Section::original(".text", 0x401000, 0x10, SectionType::Code, SectionAttrs::LOADED);
    let anchor = f.insns.push(Instruction::new(0x401000, 4, 4, 0));
    sec.push_entry(SectionEntry::Insn(anchor));
    f.sections.push(sec);

    let mut reg = registry();
    let mut session = Session::init(f, "reference", &mut reg, roomy_binfile(), Settings::default()).unwrap();

    let modif = session
        .add_modification(
            ModificationKind::InsertFct {
                callee: CalleeRef::DynamicLib { function: "malloc".into(), soname: "libc.so.6".into() },
                stack: None,
            },
            Some(anchor),
            Position::After,
            ModifFlags::empty(),
        )
        .unwrap();

    session.finalise("/tmp/s5.bin").unwrap();

    let state = session.modification(modif).unwrap().state();
    assert!(state.contains(ModifState::PROCESSED));
    assert!(state.contains(ModifState::APPLIED));
    assert!(!session.diagnostics().has_error());
}

/// S6 - Oversubscribed reachable window. The asmfile's own code footprint
/// dwarfs the free space handed to the interval store, so
/// `decide_reservation` cannot reserve `2x` estimates for both code and
/// data and must fall back to its oversubscription branch. `Session::init`
/// itself only warns (via `log`, not the sticky diagnostics channel) and
/// still returns a usable session rather than aborting.
#[test]
fn s6_oversubscribed_window_does_not_abort_init() {
    let mut f = AsmFile::new();
    // A code section far larger than the single free interval below, so
    // `2 * codesize_estimate` cannot fit in the available direct capacity.
    let sec = Section::original(".text", 0x400000, 0x200000, SectionType::Code, SectionAttrs::LOADED);
    f.sections.push(sec);

    let mut reg = registry();
    let bf = Box::new(ReferenceBinFile::new(vec![], vec![(0x500000, 0x500100)]));
    let session = Session::init(f, "reference", &mut reg, bf, Settings::default());
    assert!(session.is_ok(), "oversubscription must warn, not abort session init");
}

/// S6b - a block that would require moving still gets a best-effort
/// decision recorded (forced acceptance or a clean error) instead of a
/// panic, even when the store above it was oversubscribed at init time.
#[test]
fn s6b_oversubscribed_window_modification_is_handled_not_panicking() {
    let mut f = AsmFile::new();
    let mut sec = Section::original(".text", 0x400000, 0x200000, SectionType::Code, SectionAttrs::LOADED);
    let anchor = f.insns.push(Instruction::new(0x400000, 4, 4, 0));
    sec.push_entry(SectionEntry::Insn(anchor));
    f.sections.push(sec);

    let mut reg = registry();
    let bf = Box::new(ReferenceBinFile::new(vec![], vec![(0x500000, 0x500100)]));
    let mut session = Session::init(f, "reference", &mut reg, bf, Settings::default()).unwrap();

    let modif = session
        .add_modification(ModificationKind::Relocate, Some(anchor), Position::Keep, ModifFlags::FORCEINSERT)
        .unwrap();

    // Whether or not the free interval happens to suffice, `finalise` must
    // return (rather than panic), and the modification's own processing
    // state must always be recorded one way or the other.
    let _ = session.finalise("/tmp/s6.bin");
    assert!(session.modification(modif).unwrap().state().contains(ModifState::PROCESSED));
}
