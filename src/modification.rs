//! The modification sum type and processor (spec.md §4.5, §6).
//!
//! Grounded on spec.md §9's own design note ("Deep hierarchies of
//! modification subtypes... model as a sum type over the modification
//! kinds in §6, each variant carrying exactly the payload it needs"):
//! [`ModificationKind`] is that sum type, and [`Modification`] is the
//! shared-fields envelope spec.md §3's "Modification" row describes
//! (id, anchor, position, flags, size delta, condition, links, state).

use crate::arch::ArchDriver;
use crate::binfile::BinFile;
use crate::entities::{FunctionId, InsnId, LabelId, ModifId, SectionId};
use crate::intervals::IntervalStore;
use crate::ir::asmfile::AsmFile;
use crate::ir::condition::Condition;
use crate::ir::data::GlobalVar;
use crate::ir::instruction::{Annotations, Instruction};
use crate::ir::label::LabelType;
use crate::patchmap::PatchMap;
use crate::planner::Planner;
use crate::result::{Diagnostics, PatchError, PatchResult, Severity};
use crate::settings::Settings;
use crate::xref::XrefIndex;
use bitflags::bitflags;
use cranelift_entity::{EntityRef, PrimaryMap};
use log::{debug, warn};

bitflags! {
    /// Modification flags (spec.md §6's flag bitfield).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ModifFlags: u16 {
        /// `MOV1INSN`: relocate only the anchor instruction if it alone
        /// reaches jump size.
        const MOV1INSN = 1 << 0;
        /// `FORCEINSERT`: accept a warning instead of aborting when no
        /// block fits.
        const FORCEINSERT = 1 << 1;
        /// `MOVEFCTS`: allow extending the moved block to the enclosing
        /// function.
        const MOVEFCTS = 1 << 2;
        /// `NEWSTACK`: allocate a patcher-owned stack area on entry.
        const NEWSTACK = 1 << 3;
        /// `INSERT_NO_UPD_OUTFCT`: branches from outside the anchor's
        /// function are not retargeted.
        const INSERT_NO_UPD_OUTFCT = 1 << 4;
        /// `INSERT_NO_UPD_FROMFCT`: branches from the same function are
        /// not retargeted.
        const INSERT_NO_UPD_FROMFCT = 1 << 5;
        /// `INSERT_NO_UPD_FROMLOOP`: branches from the same loop are not
        /// retargeted.
        const INSERT_NO_UPD_FROMLOOP = 1 << 6;
        /// `BRANCH_NO_UPD_DST`: do not register the inserted branch in
        /// the updateable set.
        const BRANCH_NO_UPD_DST = 1 << 7;
        /// `MODIF_FIXED`: pin the moved block at a reproducible address.
        const MODIF_FIXED = 1 << 8;
    }
}

bitflags! {
    /// Modification processing state bits (spec.md §3).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ModifState: u8 {
        /// The processor has lowered this modification.
        const PROCESSED = 1 << 0;
        /// The lowering was committed (as opposed to cancelled).
        const APPLIED = 1 << 1;
        /// Addresses have been finalised for this modification's output.
        const FINALISED = 1 << 2;
        /// This modification's instruction list was appended onto
        /// another modification's, rather than wired via a branch.
        const ATTACHED = 1 << 3;
        /// This modification was cancelled before being applied.
        const CANCEL = 1 << 4;
        /// Processing this modification produced an error.
        const ERROR = 1 << 5;
        /// This is the "else" branch of a conditional insertion.
        const IS_ELSE = 1 << 6;
    }
}

/// Where a modification's generated instructions attach relative to its
/// anchor (spec.md §3 "position" field).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Position {
    /// Splice before the anchor.
    Before,
    /// Splice after the anchor.
    After,
    /// Replace the anchor outright.
    Replace,
    /// Keep the anchor's own position (in-place modify).
    Keep,
    /// Not anchored to any instruction; must chain from another
    /// modification's `next_modif` link.
    Floating,
}

/// How an inserted function call's callee should be resolved (spec.md
/// §4.5 "Function-call resolution", four tiers in order).
#[derive(Clone, Debug)]
pub enum CalleeRef {
    /// An internal label already present in the file.
    Internal(String),
    /// A function from an already-inserted static library.
    StaticLib { function: String, archive: String },
    /// A function from an already-inserted dynamic library.
    DynamicLib { function: String, soname: String },
}

/// The modification sum type (spec.md §6 "Modification kinds").
#[derive(Clone, Debug)]
pub enum ModificationKind {
    /// `INSERT`: splice a fresh instruction list, optionally guarded by a
    /// condition, optionally calling out to another modification or an
    /// instruction cursor.
    Insert {
        /// Caller-supplied payload instructions (before condition/call
        /// prologues are added by the arch driver).
        payload: Vec<Instruction>,
        /// An optional guard condition.
        condition: Option<Condition>,
    },
    /// `REPLACE`: overwrite the anchor with a same-or-different-length
    /// instruction list; the anchor becomes a tombstone.
    Replace {
        /// The replacement instructions.
        payload: Vec<Instruction>,
    },
    /// `MODIFY`: re-encode the anchor in place with a new opcode/operands.
    Modify {
        /// The new opcode.
        new_opcode: u32,
        /// The new operand bytes.
        new_operands: Vec<u8>,
        /// Pad with NOPs if the new encoding is shorter.
        pad_if_shorter: bool,
    },
    /// `DELETE`: tombstone the anchor.
    Delete,
    /// `RELOCATE`: no payload; its only effect is dragging the anchor
    /// into a moved block.
    Relocate,
    /// `INSERT_FCT`: insert a call to `callee`.
    InsertFct {
        /// The callee to resolve.
        callee: CalleeRef,
        /// Allocate a private stack area for the call (mirrors
        /// `NEWSTACK`, carried here too since a call is the common case
        /// that needs it).
        stack: Option<u64>,
    },
    /// `INSERT_LBL`: queue a label to be added once addresses are final.
    InsertLbl {
        /// The label's name.
        name: String,
        /// The label's role.
        ty: LabelType,
    },
    /// `INSERT_VAR`: add a global variable.
    InsertVar {
        /// The variable payload.
        var: GlobalVar,
    },
    /// `INSERT_LIB`: add a library requirement.
    InsertLib {
        /// The library's soname.
        soname: String,
    },
    /// `RENAME_LBL`: rekey a label's name.
    RenameLbl {
        /// The label's current name.
        old: String,
        /// The label's new name.
        new: String,
    },
    /// `RENAME_LIB`: rekey a dynamic-library soname.
    RenameLib {
        /// The library's current soname.
        old: String,
        /// The library's new soname.
        new: String,
    },
}

impl ModificationKind {
    /// A fixed priority ordering used to break ties at equal anchor
    /// address (spec.md §4.5 "deterministic order keyed by (anchor
    /// address, kind priority, insertion id)"; SPEC_FULL §3 item 1 fixes
    /// the remaining tie-break to submission order via `ModifId`).
    pub fn priority(&self) -> u8 {
        match self {
            ModificationKind::Delete => 0,
            ModificationKind::Replace { .. } => 1,
            ModificationKind::Modify { .. } => 2,
            ModificationKind::Relocate => 3,
            ModificationKind::Insert { .. } => 4,
            ModificationKind::InsertFct { .. } => 5,
            ModificationKind::InsertVar { .. } => 6,
            ModificationKind::InsertLib { .. } => 7,
            ModificationKind::InsertLbl { .. } => 8,
            ModificationKind::RenameLbl { .. } => 9,
            ModificationKind::RenameLib { .. } => 10,
        }
    }

    /// True for kinds whose size delta (or `RELOCATE` itself) forces the
    /// moved-block planner to get involved (spec.md §4.5 "After lowering,
    /// if the modification's size delta is non-zero or the request is a
    /// relocate...").
    fn always_moves(&self) -> bool {
        matches!(self, ModificationKind::Relocate)
    }
}

/// One user-submitted modification (spec.md §3 "Modification" row).
#[derive(Clone, Debug)]
pub struct Modification {
    id: ModifId,
    kind: ModificationKind,
    anchor: Option<InsnId>,
    position: Position,
    flags: ModifFlags,
    size_delta: i64,
    next_modif: Option<ModifId>,
    next_insn: Option<InsnId>,
    generated: Vec<Instruction>,
    state: ModifState,
    diag: Diagnostics,
}

impl Modification {
    /// This modification's id.
    pub fn id(&self) -> ModifId {
        self.id
    }

    /// This modification's kind.
    pub fn kind(&self) -> &ModificationKind {
        &self.kind
    }

    /// The instruction this modification is anchored to, if any.
    pub fn anchor(&self) -> Option<InsnId> {
        self.anchor
    }

    /// Where `generated` should be spliced relative to `anchor`.
    pub fn position(&self) -> Position {
        self.position
    }

    /// This modification's flags.
    pub fn flags(&self) -> ModifFlags {
        self.flags
    }

    /// This modification's current state bits.
    pub fn state(&self) -> ModifState {
        self.state
    }

    /// This modification's net byte-size delta, valid after processing.
    pub fn size_delta(&self) -> i64 {
        self.size_delta
    }

    /// The instructions generated while lowering this modification.
    pub fn generated(&self) -> &[Instruction] {
        &self.generated
    }

    /// This modification's own sticky diagnostics channel (spec.md §7
    /// "each modification carries its own last-error").
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }
}

/// Holds every submitted modification and lowers them in the
/// deterministic order spec.md §4.5/§5 requires.
pub struct ModificationProcessor {
    modifs: PrimaryMap<ModifId, Modification>,
    libraries: Vec<String>,
    static_libs: Vec<String>,
}

impl Default for ModificationProcessor {
    fn default() -> Self {
        Self {
            modifs: PrimaryMap::new(),
            libraries: Vec::new(),
            static_libs: Vec::new(),
        }
    }
}

impl ModificationProcessor {
    /// A fresh processor with no modifications submitted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a modification, returning its id. Ids are assigned in
    /// strictly increasing order, which is also the FIFO tie-break order
    /// SPEC_FULL §3 item 1 commits to.
    pub fn add(
        &mut self,
        kind: ModificationKind,
        anchor: Option<InsnId>,
        position: Position,
        flags: ModifFlags,
    ) -> ModifId {
        let id = self.modifs.push(Modification {
            id: ModifId::new(0),
            kind,
            anchor,
            position,
            flags,
            size_delta: 0,
            next_modif: None,
            next_insn: None,
            generated: Vec::new(),
            state: ModifState::empty(),
            diag: Diagnostics::new(),
        });
        self.modifs[id].id = id;
        id
    }

    /// Look up a modification by id.
    pub fn get(&self, id: ModifId) -> PatchResult<&Modification> {
        self.modifs
            .get(id)
            .ok_or(PatchError::MissingModification(id))
    }

    /// The flags of the delete modification anchored at `anchor`, if any
    /// (spec.md §2 supplement "Per-function tracking": `INSERT_NO_UPD_*`
    /// is read off the delete that tombstoned the target, by
    /// [`crate::session::Session::resolve_deleted_targets`]).
    pub fn flags_for_anchor(&self, anchor: InsnId) -> ModifFlags {
        self.modifs
            .values()
            .find(|m| m.anchor == Some(anchor) && matches!(m.kind, ModificationKind::Delete))
            .map(|m| m.flags)
            .unwrap_or_else(ModifFlags::empty)
    }

    /// Wire `from`'s `next_modif` link to `to` (spec.md §3 "next-
    /// modification link").
    pub fn chain(&mut self, from: ModifId, to: ModifId) -> PatchResult<()> {
        self.modifs
            .get_mut(from)
            .ok_or(PatchError::MissingModification(from))?
            .next_modif = Some(to);
        Ok(())
    }

    /// Number of modifications submitted so far.
    pub fn len(&self) -> usize {
        self.modifs.len()
    }

    /// True if no modifications have been submitted.
    pub fn is_empty(&self) -> bool {
        self.modifs.is_empty()
    }

    /// Every modification's anchor, splice position, and generated
    /// instructions, for modifications anchored to a real instruction
    /// with at least one generated instruction to splice (spec.md §4.5
    /// "generated instructions are spliced into the owning moved block").
    pub fn anchored_generated(&self) -> Vec<(InsnId, Position, Vec<Instruction>)> {
        self.modifs
            .values()
            .filter_map(|m| {
                let anchor = m.anchor?;
                if m.generated.is_empty() {
                    None
                } else {
                    Some((anchor, m.position, m.generated.clone()))
                }
            })
            .collect()
    }

    /// Register a library as already inserted, so later `InsertFct`
    /// resolution tiers can find it (spec.md §4.5 tiers 2/3).
    pub fn register_library(&mut self, soname: &str, is_static: bool) {
        let list = if is_static {
            &mut self.static_libs
        } else {
            &mut self.libraries
        };
        if !list.iter().any(|l| l == soname) {
            list.push(soname.to_string());
        }
    }

    /// Lower every submitted modification in deterministic order (spec.md
    /// §4.5, §5 "Ordering guarantees"): `(anchor_address, kind_priority,
    /// modif_id)`, floating modifications (no anchor) sort last by
    /// address and are resolved via `next_modif` chaining.
    #[allow(clippy::too_many_arguments)]
    pub fn process_all(
        &mut self,
        asmfile: &mut AsmFile,
        patchmap: &mut PatchMap,
        xref: &mut XrefIndex,
        planner: &mut Planner,
        intervals: &mut IntervalStore,
        binfile: &mut dyn BinFile,
        arch: &dyn ArchDriver,
        settings: &Settings,
    ) -> Vec<PatchError> {
        let mut order: Vec<ModifId> = self.modifs.keys().collect();
        order.sort_by_key(|&id| {
            let m = &self.modifs[id];
            let addr = m.anchor.map(|a| asmfile.insns[a].address).unwrap_or(u64::MAX);
            (addr, m.kind.priority(), id.index() as u32)
        });

        let mut warnings = Vec::new();
        for id in order {
            if let Err(e) = self.process_one(id, asmfile, patchmap, xref, planner, intervals, binfile, arch, settings) {
                let sev = e.severity();
                self.modifs[id].diag.record(e.clone());
                self.modifs[id].state.insert(ModifState::ERROR);
                if sev == Severity::Warning {
                    warnings.push(e);
                } else {
                    warnings.push(PatchError::ModifNotProcessed(id));
                }
            }
            self.modifs[id].state.insert(ModifState::PROCESSED);
        }
        warnings
    }

    #[allow(clippy::too_many_arguments)]
    fn process_one(
        &mut self,
        id: ModifId,
        asmfile: &mut AsmFile,
        patchmap: &mut PatchMap,
        xref: &mut XrefIndex,
        planner: &mut Planner,
        intervals: &mut IntervalStore,
        binfile: &mut dyn BinFile,
        arch: &dyn ArchDriver,
        settings: &Settings,
    ) -> PatchResult<()> {
        let anchor = match self.modifs[id].anchor {
            Some(a) => a,
            None => {
                if self.modifs[id].next_modif.is_none() {
                    return Err(PatchError::FloatingModifNoSuccessor(id));
                }
                return Ok(());
            }
        };
        let source = asmfile.insns[anchor].clone();

        let kind = self.modifs[id].kind.clone();
        let size_delta: i64 = match &kind {
            ModificationKind::Insert { payload, condition } => {
                let mut generated = payload.clone();
                if let Some(cond) = condition {
                    let else_code = Vec::new();
                    let leaves = cond.serialize(else_code);
                    arch.add_conditions(&mut generated, &leaves, None, 0)?;
                }
                let delta: i64 = generated.iter().map(|i| i.max_length as i64).sum();
                self.modifs[id].generated = generated;
                delta
            }
            ModificationKind::Replace { payload } => {
                let copy = patchmap.touch(anchor, &source, xref);
                copy.annotations.insert(Annotations::DEL);
                let new_len: i64 = payload.iter().map(|i| i.max_length as i64).sum();
                self.modifs[id].generated = payload.clone();
                new_len - source.length as i64
            }
            ModificationKind::Modify {
                new_opcode,
                new_operands,
                pad_if_shorter,
            } => {
                let copy = patchmap.touch(anchor, &source, xref);
                copy.opcode = *new_opcode;
                copy.operands = new_operands.as_slice().into();
                copy.annotations.insert(Annotations::UPD);
                let new_len = arch.encode(copy, true, 0)? as i64;
                if new_len < source.length as i64 && *pad_if_shorter {
                    let pad = arch.generate_nop((source.length as i64 - new_len) as u32)?;
                    self.modifs[id].generated.push(pad);
                }
                new_len - source.length as i64
            }
            ModificationKind::Delete => {
                patchmap.delete(anchor, &source, xref);
                -(source.length as i64)
            }
            ModificationKind::Relocate => 0,
            ModificationKind::InsertFct { callee, stack } => {
                let pointer = self.resolve_callee(callee, asmfile, binfile, arch)?;
                let seq = arch.generate_function_call(pointer, *stack)?;
                let delta: i64 = seq.instructions.iter().map(|i| i.max_length as i64).sum();
                self.modifs[id].generated = seq.instructions;
                delta
            }
            ModificationKind::InsertLbl { .. } => 0,
            ModificationKind::InsertVar { var } => {
                let data = binfile.copy_data_entry(crate::entities::DataId::new(0)).ok();
                if let Some(d) = data {
                    let mut v = var.clone();
                    v.bind_data(d);
                    self.modifs[id].kind = ModificationKind::InsertVar { var: v };
                }
                0
            }
            ModificationKind::InsertLib { soname } => {
                binfile.add_library_requirement(soname)?;
                self.register_library(soname, false);
                0
            }
            ModificationKind::RenameLbl { old, new } => {
                asmfile.label_table.rename(old, new)?;
                0
            }
            ModificationKind::RenameLib { old, new } => {
                binfile.rename_library(old, new)?;
                0
            }
        };

        self.modifs[id].size_delta = size_delta;
        debug!("modification {:?} lowered with size delta {}", id, size_delta);

        let needs_block = size_delta != 0 || self.modifs[id].kind.always_moves();
        if needs_block {
            let section = asmfile
                .sections
                .keys()
                .find(|&s| {
                    asmfile.sections[s].entries().iter().any(
                        |e| matches!(e, crate::ir::section::SectionEntry::Insn(i) if *i == anchor),
                    )
                })
                .ok_or(PatchError::BasicBlockNotFound(anchor))?;
            let move_single = self.modifs[id].flags.contains(ModifFlags::MOV1INSN);
            let min_size = arch.byte_size(crate::arch::JumpFlavor::SmallDirect) as u32;
            let (mut first, mut last) =
                planner.discover_basic_block(asmfile, xref, section, anchor, move_single, min_size)?;

            let moves_whole_function =
                settings.move_functions() || self.modifs[id].flags.contains(ModifFlags::MOVEFCTS);
            if moves_whole_function {
                if let Some(function) = asmfile.function_of(anchor) {
                    if let Some((fn_first, fn_last)) = function_span(asmfile, section, function) {
                        first = fn_first;
                        last = fn_last;
                        self.modifs[id].diag.record(PatchError::FunctionMoved(anchor));
                    }
                }
            }

            let remaining_direct = intervals
                .iter()
                .filter(|iv| iv.reach().contains(crate::intervals::Reach::DIRECT))
                .map(|iv| iv.size())
                .sum::<u64>();
            let remaining_ref = intervals
                .iter()
                .filter(|iv| iv.reach().contains(crate::intervals::Reach::REFERENCE))
                .map(|iv| iv.size())
                .sum::<u64>();
            let flavor = planner.select_jump_flavor(arch, settings, remaining_direct, remaining_ref);
            let block = planner.create_block(asmfile, patchmap, xref, arch, section, first, last, flavor);

            let needed = arch.byte_size(flavor);
            let original_size = planner.block(block).original_size;
            if original_size < needed {
                if original_size < min_size {
                    return Err(PatchError::InsufficientSizeForInsert(anchor));
                }
                let anchor_index = planner
                    .blocks_in_order()
                    .position(|(bid, _)| bid == block)
                    .expect("block was just inserted into the planner's order");
                match planner.find_trampoline(arch, anchor_index, flavor, block) {
                    Some(host) => {
                        planner.block_mut(block).flavor = crate::arch::JumpFlavor::SmallDirect;
                        planner.block_mut(block).trampoline_host = Some(host);
                        planner.block_mut(host).trampoline_users.push(block);
                        planner.block_mut(host).max_post_patch_size += needed;
                    }
                    None => {
                        if self.modifs[id].flags.contains(ModifFlags::FORCEINSERT) {
                            warn!("modification {:?} forced despite no trampoline host fitting {:?}", id, flavor);
                            return Err(PatchError::SizeTooSmallForcedInsert(anchor));
                        }
                        return Err(PatchError::NoSpaceForBlock(anchor));
                    }
                }
            }

            if planner.reserve_interval(block, intervals, arch).is_err() {
                if self.modifs[id].flags.contains(ModifFlags::FORCEINSERT) {
                    warn!("modification {:?} forced despite insufficient size", id);
                    return Err(PatchError::SizeTooSmallForcedInsert(anchor));
                }
                return Err(PatchError::NoSpaceForBlock(anchor));
            }
        }

        self.modifs[id].state.insert(ModifState::APPLIED);
        Ok(())
    }

    /// Function-call resolution (spec.md §4.5): internal label →
    /// already-inserted static library → already-inserted dynamic
    /// library → newly requested dynamic stub.
    fn resolve_callee(
        &mut self,
        callee: &CalleeRef,
        asmfile: &AsmFile,
        binfile: &mut dyn BinFile,
        arch: &dyn ArchDriver,
    ) -> PatchResult<crate::ir::instruction::Pointer> {
        use crate::ir::instruction::{AddressingMode, Pointer};
        match callee {
            CalleeRef::Internal(name) => {
                let label_id = asmfile
                    .label_table
                    .get(name)
                    .ok_or_else(|| PatchError::SymbolNotFound(name.clone()))?;
                match asmfile.labels[label_id].target() {
                    crate::ir::label::LabelTarget::Insn(target) => {
                        Ok(Pointer::to_insn(target, AddressingMode::Relative))
                    }
                    crate::ir::label::LabelTarget::Data(_) => Err(PatchError::SymbolNotFound(name.clone())),
                }
            }
            CalleeRef::StaticLib { function, archive } => {
                if self.static_libs.iter().any(|l| l == archive) {
                    let insn = binfile.add_external_function_stub(function, archive)?;
                    xref_stub_pointer(insn)
                } else {
                    Err(PatchError::SymbolNotFound(function.clone()))
                }
            }
            CalleeRef::DynamicLib { function, soname } => {
                let known = self.libraries.iter().any(|l| l == soname);
                if !known {
                    binfile.add_library_requirement(soname)?;
                    self.register_library(soname, false);
                }
                let stub_name = arch.stub_ext_label_name(function);
                let insn = binfile.add_external_function_stub(&stub_name, soname)?;
                let _ = Pointer::to_insn(insn, AddressingMode::Relative);
                xref_stub_pointer(insn)
            }
        }
    }
}

fn xref_stub_pointer(insn: InsnId) -> PatchResult<crate::ir::instruction::Pointer> {
    use crate::ir::instruction::{AddressingMode, Pointer};
    Ok(Pointer::to_insn(insn, AddressingMode::Relative))
}

/// The first and last instruction of `function` within `section` (spec.md
/// §2 supplement "Per-function tracking"), found by scanning section
/// entries since `Function` carries no member list of its own. `None` if
/// the function has no instructions in this section.
fn function_span(asmfile: &AsmFile, section: SectionId, function: FunctionId) -> Option<(InsnId, InsnId)> {
    let mut span: Option<(InsnId, InsnId)> = None;
    for e in asmfile.sections[section].entries() {
        let crate::ir::section::SectionEntry::Insn(i) = e else { continue };
        if asmfile.function_of(*i) != Some(function) {
            continue;
        }
        span = match span {
            None => Some((*i, *i)),
            Some((first, _)) => Some((first, *i)),
        };
    }
    span
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::reference::ReferenceArch;
    use crate::binfile::reference::ReferenceBinFile;
    use crate::ir::section::{Section, SectionAttrs, SectionEntry, SectionType};
    use cranelift_entity::EntityRef;

    fn sample() -> (AsmFile, InsnId) {
        let mut f = AsmFile::new();
        let mut sec = Section::original(".text", 0x400000, 0, SectionType::Code, SectionAttrs::LOADED);
        let id = f.insns.push(Instruction::new(0x400000, 4, 4, 0));
        sec.push_entry(SectionEntry::Insn(id));
        f.sections.push(sec);
        (f, id)
    }

    #[test]
    fn priority_orders_delete_before_insert() {
        assert!(ModificationKind::Delete.priority() < ModificationKind::Insert {
            payload: vec![],
            condition: None,
        }
        .priority());
    }

    #[test]
    fn add_returns_increasing_ids() {
        let mut p = ModificationProcessor::new();
        let a = p.add(ModificationKind::Relocate, None, Position::Floating, ModifFlags::empty());
        let b = p.add(ModificationKind::Relocate, None, Position::Floating, ModifFlags::empty());
        assert!(a.index() < b.index());
    }

    #[test]
    fn floating_modification_without_successor_errors() {
        let (mut f, _anchor) = sample();
        let mut p = ModificationProcessor::new();
        let mut patchmap = PatchMap::new();
        let mut xref = XrefIndex::new();
        let mut planner = Planner::new();
        let mut intervals = IntervalStore::new([(0x500000u64, 0x501000)]);
        let mut binfile = ReferenceBinFile::default();
        let arch = ReferenceArch;
        let settings = Settings::default();
        p.add(ModificationKind::Relocate, None, Position::Floating, ModifFlags::empty());
        let errs = p.process_all(&mut f, &mut patchmap, &mut xref, &mut planner, &mut intervals, &mut binfile, &arch, &settings);
        assert!(!errs.is_empty());
    }

    #[test]
    fn delete_produces_negative_size_delta() {
        let (mut f, anchor) = sample();
        let mut p = ModificationProcessor::new();
        let mut patchmap = PatchMap::new();
        let mut xref = XrefIndex::new();
        let mut planner = Planner::new();
        let mut intervals = IntervalStore::new([(0x500000u64, 0x501000)]);
        intervals.compute_reachability(0x400000, 0x400000, 0x100000, 0x100000, 0x100000, 0x100000);
        let mut binfile = ReferenceBinFile::default();
        let arch = ReferenceArch;
        let settings = Settings::default();
        let id = p.add(ModificationKind::Delete, Some(anchor), Position::Replace, ModifFlags::empty());
        let _ = p.process_all(&mut f, &mut patchmap, &mut xref, &mut planner, &mut intervals, &mut binfile, &arch, &settings);
        assert_eq!(p.get(id).unwrap().size_delta(), -4);
        assert!(patchmap.get(anchor).unwrap().is_tombstone());
    }
}
