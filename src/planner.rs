//! The moved-block planner (spec.md §4.4): basic-block discovery,
//! jump-flavor selection, and trampoline search.
//!
//! Grounded on `binemit/relaxation.rs`'s `relax_branch`: that function
//! picks the smallest legal encoding by filtering candidates and taking
//! `min_by_key(byte_size)`; `select_jump_flavor` below is the same
//! "smallest legal option, first match wins" shape applied to jump
//! flavors instead of encodings, and `find_trampoline` extends it with
//! the backward/forward host search spec.md §4.4 describes.

use crate::arch::{ArchDriver, JumpFlavor};
use crate::entities::{BlockId, DataId, InsnId, IntervalId, ModifId, SectionId};
use crate::intervals::{IntervalStore, Reach, Reservation, Usage};
use crate::ir::asmfile::AsmFile;
use crate::ir::instruction::Annotations;
use crate::patchmap::PatchMap;
use crate::result::{PatchError, PatchResult};
use crate::settings::Settings;
use crate::xref::XrefIndex;
use cranelift_entity::PrimaryMap;
use log::{debug, trace};
use std::ops::Range;

/// A block of original instructions relocated to freshly-allocated
/// memory (spec.md §3 "Moved block" row).
#[derive(Clone, Debug)]
pub struct MovedBlock {
    /// First original instruction in the block.
    pub first: InsnId,
    /// Last original instruction in the block.
    pub last: InsnId,
    /// Sum of original instruction lengths.
    pub original_size: u32,
    /// Sum of architectural-maximum encoding lengths, plus a return-jump
    /// allowance and local-data padding (spec.md §4.4 "Block size
    /// estimate").
    pub max_post_patch_size: u32,
    /// The jump flavor chosen to redirect control flow here.
    pub flavor: JumpFlavor,
    /// The interval reserved to host this block, once assigned.
    pub interval: Option<IntervalId>,
    /// The virtual-address range actually assigned within that interval.
    pub assigned_range: Option<Range<u64>>,
    /// Patched-instruction-map keys of the block's contents, in order.
    pub patched_insns: Vec<InsnId>,
    /// Local data entries (e.g. a memory-relative jump's address cell)
    /// attached to this block.
    pub local_data: Vec<DataId>,
    /// The trampoline host this block's small jump redirects through, if
    /// the block itself was too small for its chosen flavor.
    pub trampoline_host: Option<BlockId>,
    /// Blocks that use this one as their trampoline host.
    pub trampoline_users: Vec<BlockId>,
    /// Modifications that caused this block to be created or grew it.
    pub modifications: Vec<ModifId>,
    /// The new section this block's code will be emitted into.
    pub new_section: Option<SectionId>,
}

impl MovedBlock {
    /// Bytes still available in this block's assigned range beyond its
    /// current post-patch size estimate (the "spare size" spec.md §4.4's
    /// trampoline search consults). `None` before an interval is
    /// assigned.
    pub fn available_size(&self) -> Option<u32> {
        self.assigned_range
            .as_ref()
            .map(|r| (r.end - r.start) as u32 - self.max_post_patch_size)
    }
}

/// The moved-block planner.
pub struct Planner {
    blocks: PrimaryMap<BlockId, MovedBlock>,
    /// Blocks ordered by original start address (spec.md §4.4 "enqueued
    /// in a global list ordered by original start address").
    order: Vec<BlockId>,
}

impl Default for Planner {
    fn default() -> Self {
        Self {
            blocks: PrimaryMap::new(),
            order: Vec::new(),
        }
    }
}

impl Planner {
    /// A fresh planner with no blocks.
    pub fn new() -> Self {
        Self::default()
    }

    /// The block with id `id`.
    pub fn block(&self, id: BlockId) -> &MovedBlock {
        &self.blocks[id]
    }

    /// The block with id `id`, mutably — used by the session to splice
    /// generated instructions into a block's member list and to assign
    /// its new section once one has been allocated.
    pub fn block_mut(&mut self, id: BlockId) -> &mut MovedBlock {
        &mut self.blocks[id]
    }

    /// The block, if any, whose member list currently contains `insn`.
    pub fn block_containing(&self, insn: InsnId) -> Option<BlockId> {
        self.order
            .iter()
            .copied()
            .find(|&id| self.blocks[id].patched_insns.contains(&insn))
    }

    /// All blocks, in original-start-address order.
    pub fn blocks_in_order(&self) -> impl Iterator<Item = (BlockId, &MovedBlock)> {
        self.order.iter().map(move |&id| (id, &self.blocks[id]))
    }

    /// Basic-block discovery (spec.md §4.4): starting at `anchor`, extend
    /// backward while the predecessor is not a branch, branch target,
    /// label site, the section's first instruction, or `BEGIN_LIST`;
    /// extend forward symmetrically, absorbing a trailing branch and its
    /// NOPs. `move_single_insn` stops extension as soon as the minimal
    /// jump-displacement size (`min_size`) is reached.
    pub fn discover_basic_block(
        &self,
        asmfile: &AsmFile,
        xref: &XrefIndex,
        section: SectionId,
        anchor: InsnId,
        move_single_insn: bool,
        min_size: u32,
    ) -> PatchResult<(InsnId, InsnId)> {
        let entries = asmfile.sections[section].entries();
        let order: Vec<InsnId> = entries
            .iter()
            .filter_map(|e| match e {
                crate::ir::section::SectionEntry::Insn(i) => Some(*i),
                crate::ir::section::SectionEntry::Data(_) => None,
            })
            .collect();
        let anchor_pos = order
            .iter()
            .position(|&i| i == anchor)
            .ok_or(PatchError::BasicBlockNotFound(anchor))?;

        let is_branch_target = |i: InsnId| -> bool {
            !xref.branches_to(i).is_empty() || !xref.new_branches_to(i).is_empty()
        };
        let is_branch = |i: InsnId| asmfile.insns[i].annotations.contains(Annotations::JUMP);
        let is_label_site = |i: InsnId| {
            asmfile
                .labels
                .values()
                .any(|l| matches!(l.target(), crate::ir::label::LabelTarget::Insn(t) if t == i))
        };

        let mut start = anchor_pos;
        let mut running_size = asmfile.insns[order[start]].length as u32;
        while start > 0 {
            let pred = order[start - 1];
            if is_branch(pred)
                || is_branch_target(order[start])
                || is_label_site(order[start])
                || asmfile.insns[pred].annotations.contains(Annotations::BEGIN_LIST)
            {
                break;
            }
            if move_single_insn && running_size >= min_size {
                break;
            }
            start -= 1;
            running_size += asmfile.insns[order[start]].length as u32;
        }

        let mut end = anchor_pos;
        while end + 1 < order.len() {
            let cur = order[end];
            if is_branch(cur) {
                break;
            }
            if is_branch_target(order[end + 1]) || is_label_site(order[end + 1]) {
                break;
            }
            if move_single_insn && running_size >= min_size {
                break;
            }
            end += 1;
            running_size += asmfile.insns[order[end]].length as u32;
        }
        // absorb a trailing branch and its trailing NOPs, unless they are
        // themselves branch targets or label sites.
        if end + 1 < order.len() && is_branch(order[end + 1]) {
            let candidate = order[end + 1];
            if !is_branch_target(candidate) && !is_label_site(candidate) {
                end += 1;
            }
        }

        trace!(
            "discovered basic block [{:?}..{:?}] around anchor {:?}",
            order[start], order[end], anchor
        );
        Ok((order[start], order[end]))
    }

    /// Jump-flavor selection (spec.md §4.4's table).
    pub fn select_jump_flavor(
        &self,
        arch: &dyn ArchDriver,
        settings: &Settings,
        remaining_code_reachable: u64,
        remaining_reference_reachable: u64,
    ) -> JumpFlavor {
        let direct_needed = arch.byte_size(JumpFlavor::Direct) as u64 + settings.direct_jump_safety_margin() as u64;
        if remaining_code_reachable >= direct_needed {
            return JumpFlavor::Direct;
        }
        let memrel_needed =
            arch.byte_size(JumpFlavor::MemoryRelative) as u64 + settings.memrel_jump_safety_margin() as u64;
        if remaining_reference_reachable >= memrel_needed {
            return JumpFlavor::MemoryRelative;
        }
        JumpFlavor::FullyIndirect
    }

    /// Small-block trampoline search (spec.md §4.4): scan backward then
    /// forward from `blocks_in_order` for an already-displaced block that
    /// can host the jump to the moved code. Returns the chosen host's id.
    pub fn find_trampoline(
        &self,
        arch: &dyn ArchDriver,
        anchor_index: usize,
        needed_flavor: JumpFlavor,
        exclude: BlockId,
    ) -> Option<BlockId> {
        let needed = arch.byte_size(needed_flavor);
        let candidates = &self.order;
        for i in (0..anchor_index).rev() {
            let id = candidates[i];
            if id == exclude {
                continue;
            }
            if self.blocks[id].available_size().unwrap_or(0) >= needed {
                debug!("trampoline host {:?} found scanning backward", id);
                return Some(id);
            }
        }
        for id in candidates.iter().skip(anchor_index + 1) {
            if *id == exclude {
                continue;
            }
            if self.blocks[*id].available_size().unwrap_or(0) >= needed {
                debug!("trampoline host {:?} found scanning forward", id);
                return Some(*id);
            }
        }
        None
    }

    /// Build a new moved block covering `[first, last]`, copy its
    /// instructions through the patched-instruction map, mark each
    /// original MOV, and enqueue it in original-start-address order
    /// (spec.md §4.4 "Block construction").
    #[allow(clippy::too_many_arguments)]
    pub fn create_block(
        &mut self,
        asmfile: &AsmFile,
        patchmap: &mut PatchMap,
        xref: &mut XrefIndex,
        arch: &dyn ArchDriver,
        section: SectionId,
        first: InsnId,
        last: InsnId,
        flavor: JumpFlavor,
    ) -> BlockId {
        let entries = asmfile.sections[section].entries();
        let mut members = Vec::new();
        let mut in_range = false;
        let mut original_size = 0u32;
        let mut max_post_patch_size = 0u32;
        for e in entries {
            if let crate::ir::section::SectionEntry::Insn(i) = e {
                if *i == first {
                    in_range = true;
                }
                if in_range {
                    members.push(*i);
                    let insn = &asmfile.insns[*i];
                    original_size += insn.length as u32;
                    max_post_patch_size += arch.max_bytesize(insn);
                    let copy = patchmap.touch(*i, insn, xref);
                    copy.annotations.insert(Annotations::MOV);
                }
                if *i == last {
                    break;
                }
            }
        }
        max_post_patch_size += arch.byte_size(JumpFlavor::Direct);

        let block = MovedBlock {
            first,
            last,
            original_size,
            max_post_patch_size,
            flavor,
            interval: None,
            assigned_range: None,
            patched_insns: members,
            local_data: Vec::new(),
            trampoline_host: None,
            trampoline_users: Vec::new(),
            modifications: Vec::new(),
            new_section: None,
        };
        let id = self.blocks.push(block);

        let insert_at = self
            .order
            .iter()
            .position(|&other| asmfile.insns[self.blocks[other].first].address > asmfile.insns[first].address)
            .unwrap_or(self.order.len());
        self.order.insert(insert_at, id);
        id
    }

    /// Reserve an interval for `block` from `store`, recording the
    /// interval id and assigned range (spec.md §3 invariant 4:
    /// `reserved-interval.size >= maximal-post-patch-size`).
    pub fn reserve_interval(&mut self, block: BlockId, store: &mut IntervalStore, arch: &dyn ArchDriver) -> PatchResult<()> {
        let required_reach = match self.blocks[block].flavor {
            JumpFlavor::Direct | JumpFlavor::SmallDirect => Reach::DIRECT,
            JumpFlavor::MemoryRelative => Reach::REFERENCE,
            JumpFlavor::FullyIndirect => Reach::empty(),
        };
        let size = self.blocks[block].max_post_patch_size as u64;
        let alignment = 1u64;
        let range = store
            .find_fit(size, alignment, required_reach, Reservation::Code, Usage::Code)
            .ok_or(PatchError::NoSpaceForBlock(self.blocks[block].first))?;
        let iv_id = store
            .iter()
            .find(|iv| iv.start() <= range.start && range.end <= iv.end())
            .map(|iv| iv.id());
        let _ = arch;
        self.blocks[block].interval = iv_id;
        self.blocks[block].assigned_range = Some(range);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::reference::ReferenceArch;
    use crate::ir::instruction::Instruction;
    use crate::ir::section::{Section, SectionAttrs, SectionEntry, SectionType};
    use cranelift_entity::EntityRef;

    fn sample() -> (AsmFile, SectionId) {
        let mut f = AsmFile::new();
        let mut sec = Section::original(".text", 0x400000, 0, SectionType::Code, SectionAttrs::LOADED);
        for addr in [0x400000u64, 0x400004, 0x400008, 0x40000c] {
            let id = f.insns.push(Instruction::new(addr, 4, 4, 0));
            sec.push_entry(SectionEntry::Insn(id));
        }
        let sid = f.sections.push(sec);
        (f, sid)
    }

    #[test]
    fn discover_basic_block_spans_whole_run_with_no_branches() {
        let (f, sid) = sample();
        let planner = Planner::new();
        let xref = XrefIndex::new();
        let anchor = InsnId::new(1);
        let (first, last) = planner
            .discover_basic_block(&f, &xref, sid, anchor, false, 0)
            .unwrap();
        assert_eq!(first, InsnId::new(0));
        assert_eq!(last, InsnId::new(3));
    }

    #[test]
    fn discover_basic_block_stops_at_branch_target() {
        let (mut f, sid) = sample();
        let mut xref = XrefIndex::new();
        xref.add_branch(InsnId::new(2), InsnId::new(0));
        let _ = &mut f;
        let planner = Planner::new();
        let (first, _last) = planner
            .discover_basic_block(&f, &xref, sid, InsnId::new(2), false, 0)
            .unwrap();
        assert_eq!(first, InsnId::new(2));
    }

    #[test]
    fn select_jump_flavor_prefers_direct_when_room_allows() {
        let planner = Planner::new();
        let arch = ReferenceArch;
        let settings = Settings::default();
        let flavor = planner.select_jump_flavor(&arch, &settings, 0x1000, 0x1000);
        assert_eq!(flavor, JumpFlavor::Direct);
    }

    #[test]
    fn select_jump_flavor_falls_back_to_memrel_then_indirect() {
        let planner = Planner::new();
        let arch = ReferenceArch;
        let settings = Settings::default();
        assert_eq!(
            planner.select_jump_flavor(&arch, &settings, 0, 0x1000),
            JumpFlavor::MemoryRelative
        );
        assert_eq!(planner.select_jump_flavor(&arch, &settings, 0, 0), JumpFlavor::FullyIndirect);
    }

    #[test]
    fn create_block_marks_members_mov() {
        let (f, sid) = sample();
        let mut planner = Planner::new();
        let mut patchmap = PatchMap::new();
        let mut xref = XrefIndex::new();
        let arch = ReferenceArch;
        let id = planner.create_block(
            &f,
            &mut patchmap,
            &mut xref,
            &arch,
            sid,
            InsnId::new(0),
            InsnId::new(1),
            JumpFlavor::Direct,
        );
        assert_eq!(planner.block(id).patched_insns.len(), 2);
        assert!(patchmap.get(InsnId::new(0)).unwrap().annotations.contains(Annotations::MOV));
    }
}
