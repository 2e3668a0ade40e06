//! The branch/reference index (spec.md §4.2): four multimaps keyed by
//! target, tracking which instructions branch to or reference which
//! other instructions and data entries.
//!
//! Grounded on two sources: the teacher's `flowgraph.rs` (`CFGNode`'s
//! predecessor/successor lists, keyed by `Ebb`/`Inst` via
//! `SecondaryMap`) for the "index by target, `SecondaryMap` of small
//! vectors" shape, and the original's `la_asmfile.c` hashtables
//! (`branches_by_target_insn`, `insn_ptrs_by_target_data`,
//! `data_ptrs_by_target_insn`) for which four maps are actually needed
//! and their key/value directions.

use crate::entities::{DataId, InsnId};
use cranelift_entity::SecondaryMap;
use smallvec::SmallVec;

type Edges<K> = SecondaryMap<K, SmallVec<[K; 2]>>;

/// The four cross-reference multimaps of spec.md §4.2.
#[derive(Default)]
pub struct XrefIndex {
    /// `branches`: target instruction → branch instructions that target it.
    branches: Edges<InsnId>,
    /// `new_branches`: target instruction → patcher-created branches that
    /// target it.
    new_branches: Edges<InsnId>,
    /// `data_refs_by_insn`: target instruction → data entries pointing at
    /// it (an instruction can be the *target* of a data reference, e.g. a
    /// jump table entry).
    data_refs_by_insn: SecondaryMap<InsnId, SmallVec<[DataId; 2]>>,
    /// `insn_refs_by_data`: target data → instructions pointing at it.
    insn_refs_by_data: SecondaryMap<DataId, SmallVec<[InsnId; 2]>>,
}

impl XrefIndex {
    /// An empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register that `branch` targets `target` in the original-branches
    /// map.
    pub fn add_branch(&mut self, target: InsnId, branch: InsnId) {
        push_unique(&mut self.branches[target], branch);
    }

    /// Remove the (target, branch) pair from the original-branches map.
    pub fn remove_branch(&mut self, target: InsnId, branch: InsnId) {
        self.branches[target].retain(|b| *b != branch);
    }

    /// All original branches currently targeting `target`.
    pub fn branches_to(&self, target: InsnId) -> &[InsnId] {
        &self.branches[target]
    }

    /// Register a patcher-created branch targeting `target`.
    pub fn add_new_branch(&mut self, target: InsnId, branch: InsnId) {
        push_unique(&mut self.new_branches[target], branch);
    }

    /// Remove a patcher-created branch's edge.
    pub fn remove_new_branch(&mut self, target: InsnId, branch: InsnId) {
        self.new_branches[target].retain(|b| *b != branch);
    }

    /// All patcher-created branches currently targeting `target`.
    pub fn new_branches_to(&self, target: InsnId) -> &[InsnId] {
        &self.new_branches[target]
    }

    /// Re-target every branch (original and patcher-created) that pointed
    /// at `old_target` to `new_target` instead — the mutation invariant
    /// of spec.md §4.2: "the old pair is removed before the new pair is
    /// inserted, in a single critical section".
    pub fn retarget(&mut self, old_target: InsnId, new_target: InsnId) {
        let moved: SmallVec<[InsnId; 2]> = std::mem::take(&mut self.branches[old_target]);
        for b in &moved {
            push_unique(&mut self.branches[new_target], *b);
        }
        let moved_new: SmallVec<[InsnId; 2]> = std::mem::take(&mut self.new_branches[old_target]);
        for b in &moved_new {
            push_unique(&mut self.new_branches[new_target], *b);
        }
    }

    /// Register that `data` references `target` (an instruction).
    pub fn add_data_ref_to_insn(&mut self, target: InsnId, data: DataId) {
        push_unique(&mut self.data_refs_by_insn[target], data);
    }

    /// All data entries referencing instruction `target`.
    pub fn data_refs_to_insn(&self, target: InsnId) -> &[DataId] {
        &self.data_refs_by_insn[target]
    }

    /// Register that `insn` references `target` (a data entry).
    pub fn add_insn_ref_to_data(&mut self, target: DataId, insn: InsnId) {
        push_unique(&mut self.insn_refs_by_data[target], insn);
    }

    /// All instructions referencing data entry `target`.
    pub fn insns_referencing_data(&self, target: DataId) -> &[InsnId] {
        &self.insn_refs_by_data[target]
    }

    /// True if no branch (original or patcher-created) still targets
    /// `target` — used to confirm spec.md §3 invariant 6 after a
    /// modification tombstones an instruction.
    pub fn has_no_incoming_branches(&self, target: InsnId) -> bool {
        self.branches[target].is_empty() && self.new_branches[target].is_empty()
    }
}

fn push_unique<T: PartialEq, const N: usize>(v: &mut SmallVec<[T; N]>, item: T) {
    if !v.contains(&item) {
        v.push(item);
    }
}
