//! The patch session (spec.md §6 "Session lifecycle calls", §5
//! "Concurrency & Resource Model"): the single owner of every mutable
//! resource the pipeline touches, sequencing configure → submit
//! modifications → finalise → write.
//!
//! Grounded on the teacher's own top-level pipeline owner,
//! `Context` (`context.rs`): one struct holding every pass's working
//! state, with a `compile`-style method that runs the passes in a fixed
//! order and a sticky diagnostics/error field rather than a bag of
//! globals (spec.md §9 "Global mutable state").

use crate::arch::ArchDriver;
use crate::binfile::BinFile;
use crate::cursor::{Cursor, InsnCursor};
use crate::entities::{FunctionId, InsnId, LoopId, SectionId};
use crate::finalize::Finaliser;
use crate::fixpoint;
use crate::intervals::IntervalStore;
use crate::ir::asmfile::AsmFile;
use crate::ir::instruction::{Annotations, PointerTarget};
use crate::ir::label::LabelType;
use crate::ir::section::{Section, SectionType};
use crate::modification::{Modification, ModificationKind, ModificationProcessor, ModifFlags, Position};
use crate::patchmap::PatchMap;
use crate::planner::Planner;
use crate::result::{Diagnostics, PatchError, PatchResult};
use crate::settings::Settings;
use crate::xref::XrefIndex;
use cranelift_entity::EntityRef;
use log::{debug, info};
use std::collections::HashMap;

/// A name-keyed registry of architecture drivers (spec.md §9 "Driver
/// dispatch via function-pointer tables... a trait/interface with one
/// implementation per architecture, selected at session-init time").
#[derive(Default)]
pub struct ArchRegistry {
    drivers: HashMap<String, Box<dyn ArchDriver>>,
}

impl ArchRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under `name`, overwriting any previous driver
    /// registered under the same name.
    pub fn register(&mut self, name: impl Into<String>, driver: Box<dyn ArchDriver>) {
        self.drivers.insert(name.into(), driver);
    }

    /// Remove and return the driver registered under `name`, if any.
    pub fn take(&mut self, name: &str) -> Option<Box<dyn ArchDriver>> {
        self.drivers.remove(name)
    }
}

/// The patch session: owns the asmfile, the engine's working indices, and
/// the architecture/binfile back ends for the duration of one
/// configure/submit/finalise pipeline (spec.md §6 `session_init` through
/// `session_free`).
///
/// Field order matters for `Drop`: Rust drops struct fields in
/// declaration order, and spec.md §5's "Resource acquisition" requires
/// moved blocks and the patched-instruction map to release their claims
/// on the interval store before the store itself goes away. `planner`
/// and `patchmap` are declared ahead of `intervals` for exactly that
/// reason.
pub struct Session {
    asmfile: AsmFile,
    xref: XrefIndex,
    patchmap: PatchMap,
    planner: Planner,
    intervals: IntervalStore,
    modifications: ModificationProcessor,
    finaliser: Finaliser,
    arch: Box<dyn ArchDriver>,
    binfile: Box<dyn BinFile>,
    settings: Settings,
    diag: Diagnostics,
    finalised: bool,
}

impl Session {
    /// `session_init(asmfile) → session` (spec.md §6), resolving the
    /// named architecture driver from `registry`, building the interval
    /// store from the binfile back end's free-space map, and computing
    /// reachability/reservation from the asmfile's own section extents.
    ///
    /// The codesize/data-size estimates `decide_reservation` wants are
    /// not known this early (no modifications have been submitted yet);
    /// conservatively, the total size of the asmfile's own code and data
    /// sections is used instead. This routinely oversubscribes the
    /// store for non-trivial binaries, which is intentional: S6's
    /// oversubscription fallback is the common case, not an edge case.
    pub fn init(
        asmfile: AsmFile,
        arch_name: &str,
        registry: &mut ArchRegistry,
        mut binfile: Box<dyn BinFile>,
        settings: Settings,
    ) -> PatchResult<Self> {
        if asmfile.is_empty() {
            return Err(PatchError::MissingAsmFile);
        }
        let arch = registry
            .take(arch_name)
            .ok_or_else(|| PatchError::ArchUnknown(arch_name.to_string()))?;

        binfile.open_writable_copy()?;

        let mut intervals = IntervalStore::new(binfile.free_intervals());

        let mut lowest = u64::MAX;
        let mut highest = 0u64;
        let mut codesize = 0u64;
        let mut datasize = 0u64;
        for section in asmfile.sections.values() {
            match section.section_type() {
                SectionType::Code => {
                    lowest = lowest.min(section.address());
                    highest = highest.max(section.address() + section.size());
                    codesize += section.size();
                }
                SectionType::Data | SectionType::ZeroData => {
                    datasize += section.size();
                }
                SectionType::Reference | SectionType::PatchCopy => {}
            }
        }
        if lowest > highest {
            lowest = 0;
            highest = 0;
        }

        intervals.set_gaps(asmfile.gaps.clone());

        let (direct_back, direct_fwd) = arch.signed_reach(crate::arch::JumpFlavor::Direct);
        let (memrel_back, memrel_fwd) = arch.signed_reach(crate::arch::JumpFlavor::MemoryRelative);
        intervals.compute_reachability(
            lowest,
            highest,
            direct_back.unsigned_abs(),
            direct_fwd.unsigned_abs(),
            memrel_back.unsigned_abs(),
            memrel_fwd.unsigned_abs(),
        );
        intervals.decide_reservation(codesize, datasize);

        let mut xref = XrefIndex::new();
        for (id, insn) in asmfile.insns.iter() {
            if let Some(pointer) = &insn.pointer {
                match pointer.target {
                    PointerTarget::Insn(target) => xref.add_branch(target, id),
                    PointerTarget::Data(target) => xref.add_insn_ref_to_data(target, id),
                }
            }
        }

        info!(
            "session initialised: {} code bytes, {} data bytes spanning [{:#x}, {:#x})",
            codesize, datasize, lowest, highest
        );

        Ok(Self {
            asmfile,
            xref,
            patchmap: PatchMap::new(),
            planner: Planner::new(),
            intervals,
            modifications: ModificationProcessor::new(),
            finaliser: Finaliser::new(),
            arch,
            binfile,
            settings,
            diag: Diagnostics::new(),
            finalised: false,
        })
    }

    /// `session_add_modification(session, kind, anchor, payload, flags) →
    /// modif_id` (spec.md §6). `payload` is folded into `kind` itself
    /// (e.g. `ModificationKind::Insert { payload, .. }`), matching how
    /// `ModificationKind` already carries each variant's payload.
    pub fn add_modification(
        &mut self,
        kind: ModificationKind,
        anchor: Option<InsnId>,
        position: Position,
        flags: ModifFlags,
    ) -> PatchResult<crate::entities::ModifId> {
        if self.finalised {
            return Err(PatchError::SessionNotInitialised);
        }
        Ok(self.modifications.add(kind, anchor, position, flags))
    }

    /// Look up a previously submitted modification, e.g. to inspect its
    /// state or per-modification diagnostics after finalisation.
    pub fn modification(&self, id: crate::entities::ModifId) -> PatchResult<&Modification> {
        self.modifications.get(id)
    }

    /// `session_set_last_error_code(session, code) → previous` (spec.md
    /// §6): record `code` on the session's own sticky diagnostics channel
    /// and return whatever it previously held.
    pub fn set_last_error_code(&mut self, code: PatchError) -> Option<PatchError> {
        let previous = self.diag.last_error().cloned();
        self.diag.record(code);
        previous
    }

    /// The session's current sticky diagnostics (spec.md §7
    /// "Propagation policy").
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    /// `session_finalise(session, output_path) → status` (spec.md §6,
    /// §4.7): lower every submitted modification, propagate DEL
    /// annotations and retarget branches away from deleted instructions,
    /// splice generated instructions into their moved blocks, allocate
    /// new sections, synthesise return branches, run the address-
    /// assembly fixpoint, emit section byte images, place sections, and
    /// commit (apply queued labels, finalise layout, write).
    pub fn finalise(&mut self, output_path: &str) -> PatchResult<()> {
        if self.finalised {
            return Err(PatchError::SessionNotInitialised);
        }

        let warnings = self.modifications.process_all(
            &mut self.asmfile,
            &mut self.patchmap,
            &mut self.xref,
            &mut self.planner,
            &mut self.intervals,
            self.binfile.as_mut(),
            self.arch.as_ref(),
            &self.settings,
        );
        for w in warnings {
            self.diag.record(w);
        }
        if self.diag.has_error() {
            return Err(self
                .diag
                .last_error()
                .cloned()
                .unwrap_or(PatchError::SessionNotInitialised));
        }

        self.sync_annotations_from_patchmap();
        self.resolve_deleted_targets();
        self.splice_generated_instructions()?;
        self.allocate_new_sections()?;
        self.synthesize_return_branches()?;

        fixpoint::run(
            &self.planner,
            &mut self.patchmap,
            &self.asmfile,
            self.arch.as_ref(),
            &self.settings,
            &mut self.diag,
        )?;

        self.finaliser
            .copy_referenced_data(&self.asmfile, &mut self.patchmap, &mut self.xref, self.binfile.as_mut())?;

        self.emit_sections()?;

        self.finaliser.commit(
            &self.planner,
            &mut self.patchmap,
            &self.asmfile,
            self.arch.as_ref(),
            &self.settings,
            &mut self.diag,
            self.binfile.as_mut(),
            output_path,
        )?;

        self.finalised = true;
        Ok(())
    }

    /// Mirror each patchmap entry's annotation bits onto the
    /// corresponding original instruction (spec.md §5: "the session only
    /// sets annotation bits on original instructions; their addresses,
    /// encodings, and operand graphs are never mutated"). Needed because
    /// [`InsnCursor::next_live`]/`prev_live` read `asmfile.insns`
    /// directly, not the patchmap, so a tombstoned instruction would
    /// otherwise look alive to cursor-based traversal.
    fn sync_annotations_from_patchmap(&mut self) {
        let updates: Vec<(InsnId, Annotations)> =
            self.patchmap.iter().map(|(id, patched)| (id, patched.annotations)).collect();
        for (id, bits) in updates {
            self.asmfile.insns[id].annotations.insert(bits);
        }
    }

    /// For every tombstoned (DEL) instruction, retarget incoming branches
    /// at its first live successor, honoring spec.md §8's "Delete of a
    /// branch target" boundary behavior. A branch is left pointing at the
    /// deleted instruction instead — spec.md §2 supplement "Per-function
    /// tracking" — when the delete's own `INSERT_NO_UPD_OUTFCT`/
    /// `INSERT_NO_UPD_FROMFCT`/`INSERT_NO_UPD_FROMLOOP` flags say the
    /// branch's relationship to the deleted instruction's function/loop
    /// should be left alone.
    fn resolve_deleted_targets(&mut self) {
        let tombstones: Vec<InsnId> = self
            .patchmap
            .iter()
            .filter(|(_, patched)| patched.is_tombstone())
            .map(|(id, _)| id)
            .collect();

        for deleted in tombstones {
            if self.xref.has_no_incoming_branches(deleted) {
                continue;
            }
            let Some(section) = self.section_of(deleted) else { continue };
            let mut cursor = InsnCursor::new(&self.asmfile, section).at_inst(deleted);
            let Some(successor) = cursor.next_live() else { continue };

            let flags = self.modifications.flags_for_anchor(deleted);
            let deleted_fct = self.asmfile.function_of(deleted);
            let deleted_loop = self.asmfile.loop_of(deleted);

            let originals: Vec<InsnId> = self.xref.branches_to(deleted).to_vec();
            let new_ones: Vec<InsnId> = self.xref.new_branches_to(deleted).to_vec();

            let mut retargeted = Vec::new();
            for branch in originals {
                if self.branch_retarget_suppressed(branch, flags, deleted_fct, deleted_loop) {
                    continue;
                }
                self.xref.remove_branch(deleted, branch);
                self.xref.add_branch(successor, branch);
                retargeted.push(branch);
            }
            for branch in new_ones {
                if self.branch_retarget_suppressed(branch, flags, deleted_fct, deleted_loop) {
                    continue;
                }
                self.xref.remove_new_branch(deleted, branch);
                self.xref.add_new_branch(successor, branch);
                retargeted.push(branch);
            }

            for branch in retargeted {
                let original = self.asmfile.insns[branch].clone();
                let copy = self.patchmap.touch(branch, &original, &mut self.xref);
                if let Some(pointer) = &mut copy.pointer {
                    pointer.target = PointerTarget::Insn(successor);
                }
            }
        }
    }

    /// Whether `branch`'s edge to a just-deleted instruction should be
    /// left untouched rather than retargeted at the successor, per the
    /// deleting modification's `INSERT_NO_UPD_*` flags.
    fn branch_retarget_suppressed(
        &self,
        branch: InsnId,
        flags: ModifFlags,
        deleted_fct: Option<FunctionId>,
        deleted_loop: Option<LoopId>,
    ) -> bool {
        if flags.is_empty() {
            return false;
        }
        let branch_fct = self.asmfile.function_of(branch);
        if flags.contains(ModifFlags::INSERT_NO_UPD_OUTFCT) && branch_fct != deleted_fct {
            return true;
        }
        if flags.contains(ModifFlags::INSERT_NO_UPD_FROMFCT) && branch_fct == deleted_fct {
            return true;
        }
        if flags.contains(ModifFlags::INSERT_NO_UPD_FROMLOOP) {
            let branch_loop = self.asmfile.loop_of(branch);
            if branch_loop.is_some() && branch_loop == deleted_loop {
                return true;
            }
        }
        false
    }

    /// Mint fresh `InsnId`s for every modification's `generated`
    /// instructions and splice them into their anchor's moved block at
    /// the position the modification requested.
    fn splice_generated_instructions(&mut self) -> PatchResult<()> {
        let anchors: Vec<(InsnId, Position, Vec<crate::ir::instruction::Instruction>)> =
            self.modifications.anchored_generated();
        for (anchor, position, generated) in anchors {
            if generated.is_empty() {
                continue;
            }
            let Some(block_id) = self.planner.block_containing(anchor) else {
                continue;
            };
            let mut new_ids = Vec::with_capacity(generated.len());
            for insn in generated {
                let id = self.asmfile.insns.push(insn.clone());
                let copy = self.patchmap.touch(id, &insn, &mut self.xref);
                copy.annotations.insert(Annotations::NEW);
                new_ids.push(id);
            }

            let block = self.planner.block_mut(block_id);
            let anchor_pos = block
                .patched_insns
                .iter()
                .position(|&i| i == anchor)
                .unwrap_or(block.patched_insns.len());
            match position {
                Position::Before => {
                    for (offset, id) in new_ids.into_iter().enumerate() {
                        block.patched_insns.insert(anchor_pos + offset, id);
                    }
                }
                Position::After | Position::Keep | Position::Floating => {
                    for (offset, id) in new_ids.into_iter().enumerate() {
                        block.patched_insns.insert(anchor_pos + 1 + offset, id);
                    }
                }
                Position::Replace => {
                    block.patched_insns.remove(anchor_pos);
                    for (offset, id) in new_ids.into_iter().enumerate() {
                        block.patched_insns.insert(anchor_pos + offset, id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Request a new section from the binfile back end for every block
    /// that was assigned an interval but no section yet, and mirror it
    /// into `asmfile.sections` so the two `SectionId` spaces (the
    /// back end's own counter and this engine's `PrimaryMap`) stay in
    /// lockstep — the back end is the sole authority on the id; this
    /// call only teaches the engine's own model about it.
    fn allocate_new_sections(&mut self) -> PatchResult<()> {
        let block_ids: Vec<_> = self.planner.blocks_in_order().map(|(id, _)| id).collect();
        for id in block_ids {
            if self.planner.block(id).new_section.is_some() {
                continue;
            }
            let Some(range) = self.planner.block(id).assigned_range.clone() else {
                continue;
            };
            let size = range.end - range.start;
            let name = format!(".patch.text.{}", id.index());
            let section_id = self.binfile.add_section(&name, range.start, size, SectionType::Code)?;
            let mut section = Section::new_section(name.clone(), SectionType::Code);
            section.set_address(range.start);
            section.set_size(size);
            let pushed = self.asmfile.sections.push(section);
            debug_assert_eq!(
                pushed.index(),
                section_id.index(),
                "binfile and engine section id spaces must stay in lockstep"
            );
            self.planner.block_mut(id).new_section = Some(section_id);
        }
        Ok(())
    }

    /// For every moved block whose last patched instruction does not
    /// unconditionally stop control flow, synthesise a jump back to the
    /// original successor's current address (spec.md §4.4/§8 scenario
    /// S4.6 step 5).
    fn synthesize_return_branches(&mut self) -> PatchResult<()> {
        let block_ids: Vec<_> = self.planner.blocks_in_order().map(|(id, _)| id).collect();
        for id in block_ids {
            let last = *self
                .planner
                .block(id)
                .patched_insns
                .last()
                .expect("a moved block always has at least one member");
            let terminates = self
                .patchmap
                .get(last)
                .map(|i| i.terminates_flow())
                .unwrap_or_else(|| self.asmfile.insns[last].terminates_flow());
            if terminates {
                continue;
            }

            let original_last = self.planner.block(id).last;
            let Some(section) = self.section_of(original_last) else { continue };
            let mut cursor = InsnCursor::new(&self.asmfile, section).at_inst(original_last);
            let Some(successor) = cursor.next_live() else { continue };
            let successor_addr = self
                .patchmap
                .get(successor)
                .map(|p| p.address)
                .unwrap_or(self.asmfile.insns[successor].address);

            let seq = self.arch.generate_jump(crate::arch::JumpFlavor::Direct, 0)?;
            let mut branch = seq.instructions[seq.anchor_index].clone();
            if let Some(pointer) = &mut branch.pointer {
                pointer.target = PointerTarget::Insn(successor);
                pointer.refresh(successor_addr);
            }

            let branch_id = self.asmfile.insns.push(branch.clone());
            let copy = self.patchmap.touch(branch_id, &branch, &mut self.xref);
            copy.annotations.insert(Annotations::NEW | Annotations::JUMP);
            self.xref.add_new_branch(successor, branch_id);
            self.planner.block_mut(id).patched_insns.push(branch_id);
        }
        Ok(())
    }

    /// Emit the byte image of every affected section and store it on the
    /// engine's own `Section` model via `set_bytes` (spec.md §4.7); the
    /// binfile back end never receives raw bytes directly, since it is a
    /// consumed interface whose own `write` call is responsible for
    /// serialising whatever layout `finalise_layout`/`place_section`
    /// agreed to.
    fn emit_sections(&mut self) -> PatchResult<()> {
        let section_ids: Vec<SectionId> = self.asmfile.sections.keys().collect();
        for id in section_ids {
            let section = self.asmfile.sections[id].clone();
            let bytes = if section.attrs().contains(crate::ir::section::SectionAttrs::NEW) {
                match section.section_type() {
                    SectionType::Data | SectionType::ZeroData => {
                        let entries: Vec<crate::ir::data::DataEntry> = section
                            .entries()
                            .iter()
                            .filter_map(|e| match e {
                                crate::ir::section::SectionEntry::Data(d) => Some(self.asmfile.data[*d].clone()),
                                crate::ir::section::SectionEntry::Insn(_) => None,
                            })
                            .collect();
                        self.finaliser.emit_new_data_section(&entries)
                    }
                    _ => self.finaliser.emit_new_code_section(
                        &section,
                        id,
                        &self.planner,
                        &self.patchmap,
                        &self.asmfile,
                        &self.settings,
                    ),
                }
            } else {
                self.finaliser.emit_existing_code_section(
                    &section,
                    &self.asmfile,
                    &self.patchmap,
                    &self.planner,
                    self.arch.as_ref(),
                    &self.settings,
                )?
            };
            let window = section.address()..(section.address() + bytes.len() as u64);
            self.binfile.place_section(id, window)?;
            self.asmfile.sections[id].set_bytes(bytes);
        }
        Ok(())
    }

    /// Queue a label insertion, deferred until section addresses are
    /// final (spec.md §4.5 "insert-label").
    pub fn queue_label_insert(
        &mut self,
        name: impl Into<String>,
        target: crate::ir::label::LabelTarget,
        section: SectionId,
        ty: LabelType,
    ) {
        self.finaliser.queue_label_insert(name, target, section, ty);
    }

    /// Queue a label rename, deferred the same way.
    pub fn queue_label_rename(&mut self, old: impl Into<String>, new: impl Into<String>) {
        self.finaliser.queue_label_rename(old, new);
    }

    fn section_of(&self, insn: InsnId) -> Option<SectionId> {
        self.asmfile.sections.keys().find(|&s| {
            self.asmfile.sections[s]
                .entries()
                .iter()
                .any(|e| matches!(e, crate::ir::section::SectionEntry::Insn(i) if *i == insn))
        })
    }
}

/// `session_free(session)` (spec.md §6) happens implicitly via `Drop`:
/// field declaration order on [`Session`] already encodes spec.md §5's
/// "moved blocks [drop] before the interval store" rule, so no explicit
/// `Drop` impl is needed beyond documenting that ordering.
impl Drop for Session {
    fn drop(&mut self) {
        debug!("session released ({} modifications submitted)", self.modifications_submitted());
    }
}

impl Session {
    fn modifications_submitted(&self) -> usize {
        self.modifications.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::reference::ReferenceArch;
    use crate::binfile::reference::ReferenceBinFile;
    use crate::ir::instruction::Instruction;
    use crate::ir::section::{SectionAttrs, SectionEntry};

    fn sample_asmfile() -> AsmFile {
        let mut f = AsmFile::new();
        let mut sec = Section::original(".text", 0x400000, 0x10, SectionType::Code, SectionAttrs::LOADED);
        for addr in [0x400000u64, 0x400004, 0x400008, 0x40000c] {
            let id = f.insns.push(Instruction::new(addr, 4, 4, 0));
            sec.push_entry(SectionEntry::Insn(id));
        }
        f.sections.push(sec);
        f
    }

    fn registry() -> ArchRegistry {
        let mut r = ArchRegistry::new();
        r.register("reference", Box::new(ReferenceArch));
        r
    }

    #[test]
    fn init_rejects_unknown_architecture() {
        let asmfile = sample_asmfile();
        let mut reg = ArchRegistry::new();
        let bf = Box::new(ReferenceBinFile::new(vec![], vec![(0x500000, 0x501000)]));
        let err = Session::init(asmfile, "nonexistent", &mut reg, bf, Settings::default()).unwrap_err();
        assert!(matches!(err, PatchError::ArchUnknown(_)));
    }

    #[test]
    fn init_rejects_empty_asmfile() {
        let mut reg = registry();
        let bf = Box::new(ReferenceBinFile::new(vec![], vec![(0x500000, 0x501000)]));
        let err = Session::init(AsmFile::new(), "reference", &mut reg, bf, Settings::default()).unwrap_err();
        assert!(matches!(err, PatchError::MissingAsmFile));
    }

    #[test]
    fn init_succeeds_with_known_architecture() {
        let asmfile = sample_asmfile();
        let mut reg = registry();
        let bf = Box::new(ReferenceBinFile::new(vec![], vec![(0x500000, 0x501000)]));
        let session = Session::init(asmfile, "reference", &mut reg, bf, Settings::default()).unwrap();
        assert!(!session.finalised);
    }

    #[test]
    fn finalise_on_zero_modifications_writes_output() {
        let asmfile = sample_asmfile();
        let mut reg = registry();
        let bf = Box::new(ReferenceBinFile::new(vec![], vec![(0x500000, 0x501000)]));
        let mut session = Session::init(asmfile, "reference", &mut reg, bf, Settings::default()).unwrap();
        session.finalise("/tmp/out.bin").unwrap();
        assert!(session.finalised);
    }

    #[test]
    fn set_last_error_code_returns_previous() {
        let asmfile = sample_asmfile();
        let mut reg = registry();
        let bf = Box::new(ReferenceBinFile::new(vec![], vec![(0x500000, 0x501000)]));
        let mut session = Session::init(asmfile, "reference", &mut reg, bf, Settings::default()).unwrap();
        assert!(session.set_last_error_code(PatchError::MissingAsmFile).is_none());
        let previous = session.set_last_error_code(PatchError::FileSavedWithDefaultName);
        assert!(matches!(previous, Some(PatchError::MissingAsmFile)));
    }

    #[test]
    fn insert_modification_is_processed_and_applied() {
        let asmfile = sample_asmfile();
        let mut reg = registry();
        let bf = Box::new(ReferenceBinFile::new(vec![], vec![(0x500000, 0x501000)]));
        let mut session = Session::init(asmfile, "reference", &mut reg, bf, Settings::default()).unwrap();

        let anchor = InsnId::new(0);
        let payload = vec![Instruction::new(0, 1, 1, 0)];
        let modif = session
            .add_modification(
                ModificationKind::Insert { payload, condition: None },
                Some(anchor),
                Position::Before,
                ModifFlags::empty(),
            )
            .unwrap();

        session.finalise("/tmp/out-insert.bin").unwrap();

        let state = session.modification(modif).unwrap().state();
        assert!(state.contains(crate::modification::ModifState::PROCESSED));
        assert!(state.contains(crate::modification::ModifState::APPLIED));
        assert!(!session.diagnostics().has_error());
    }

    #[test]
    fn delete_modification_tombstones_the_anchor() {
        let asmfile = sample_asmfile();
        let mut reg = registry();
        let bf = Box::new(ReferenceBinFile::new(vec![], vec![(0x500000, 0x501000)]));
        let mut session = Session::init(asmfile, "reference", &mut reg, bf, Settings::default()).unwrap();

        let anchor = InsnId::new(1);
        let modif = session
            .add_modification(ModificationKind::Delete, Some(anchor), Position::Replace, ModifFlags::empty())
            .unwrap();

        session.finalise("/tmp/out-delete.bin").unwrap();

        assert!(session.modification(modif).unwrap().state().contains(crate::modification::ModifState::APPLIED));
        assert!(session.asmfile.insns[anchor].annotations.contains(Annotations::DEL));
    }

    #[test]
    fn add_modification_after_finalise_is_rejected() {
        let asmfile = sample_asmfile();
        let mut reg = registry();
        let bf = Box::new(ReferenceBinFile::new(vec![], vec![(0x500000, 0x501000)]));
        let mut session = Session::init(asmfile, "reference", &mut reg, bf, Settings::default()).unwrap();
        session.finalise("/tmp/out.bin").unwrap();
        let err = session
            .add_modification(ModificationKind::Relocate, None, Position::Floating, ModifFlags::empty())
            .unwrap_err();
        assert!(matches!(err, PatchError::SessionNotInitialised));
    }
}
