//! The address-assembly fixpoint (spec.md §4.6): repeatedly assigns
//! addresses to instructions inside every moved block and re-encodes
//! address-dependent operands until sizes stop changing.
//!
//! Grounded on `binemit/relaxation.rs`'s `relax_branches`: the same
//! "clear offsets, compute an initial layout, then loop `while go_again`
//! recomputing offsets and re-encoding until nothing moves" control
//! structure, scoped here to one moved block's instruction run at a time
//! instead of one function's EBB layout, and with each block's interval
//! as the independence boundary spec.md §4.6 step 3 calls for ("blocks
//! in different intervals are independent").

use crate::arch::ArchDriver;
use crate::entities::BlockId;
use crate::ir::asmfile::AsmFile;
use crate::ir::instruction::Annotations;
use crate::patchmap::PatchMap;
use crate::planner::Planner;
use crate::result::{Diagnostics, PatchError, PatchResult};
use crate::settings::Settings;
use log::{debug, warn};

/// Outcome of one [`run`] call.
pub struct FixpointReport {
    /// Number of passes actually taken (>= 1).
    pub passes: u32,
    /// True if the recursion cap was hit and the widest-encoding fallback
    /// engaged (spec.md §4.6 "Termination").
    pub forced_widest: bool,
}

/// Run the address-assembly fixpoint over every moved block the planner
/// knows about, in deterministic order (spec.md §4.6's "Ordering
/// guarantees": "sorted by original start address").
pub fn run(
    planner: &Planner,
    patchmap: &mut PatchMap,
    asmfile: &AsmFile,
    arch: &dyn ArchDriver,
    settings: &Settings,
    diag: &mut Diagnostics,
) -> PatchResult<FixpointReport> {
    let order: Vec<BlockId> = planner.blocks_in_order().map(|(id, _)| id).collect();
    let cap = settings.fixpoint_recursion_cap();

    let mut pass = 0;
    let mut forced_widest = false;
    loop {
        pass += 1;
        let mut any_changed = false;
        for &id in &order {
            if assign_block(planner, id, patchmap, asmfile, arch, false)? {
                any_changed = true;
            }
        }
        if !any_changed {
            debug!("address-assembly fixpoint converged after {} pass(es)", pass);
            break;
        }
        if pass >= cap {
            if !settings.allow_widen_fallback() {
                return Err(PatchError::SizeWouldChange(
                    planner
                        .blocks_in_order()
                        .next()
                        .map(|(_, b)| b.first)
                        .unwrap_or_else(|| unreachable!("fixpoint with no blocks never iterates")),
                ));
            }
            warn!("fixpoint did not converge after {} passes, forcing widest encodings", cap);
            for &id in &order {
                assign_block(planner, id, patchmap, asmfile, arch, true)?;
            }
            diag.record(PatchError::FixpointForcedWidest(cap));
            forced_widest = true;
            let mut stable = true;
            for &id in &order {
                if assign_block(planner, id, patchmap, asmfile, arch, true)? {
                    stable = false;
                }
            }
            if !stable {
                let first = planner
                    .blocks_in_order()
                    .next()
                    .map(|(_, b)| b.first)
                    .expect("fixpoint with no blocks never iterates");
                return Err(PatchError::SizeWouldChange(first));
            }
            break;
        }
    }

    Ok(FixpointReport { passes: pass, forced_widest })
}

/// Assign addresses and re-encode one block's patched instructions
/// (spec.md §4.6 steps 1-2, 6). Returns true if any instruction's length
/// changed this pass, which forces another pass over the whole fixpoint.
fn assign_block(
    planner: &Planner,
    id: BlockId,
    patchmap: &mut PatchMap,
    asmfile: &AsmFile,
    arch: &dyn ArchDriver,
    force_widest: bool,
) -> PatchResult<bool> {
    let block = planner.block(id);
    let base = match &block.assigned_range {
        Some(range) => range.start,
        None => return Ok(false),
    };

    let mut changed = false;
    let mut offset = base;
    for &original in &block.patched_insns {
        let insn = patchmap
            .get_mut(original)
            .unwrap_or_else(|| panic!("moved block member {:?} has no patched copy", original));
        if insn.annotations.contains(Annotations::DEL) {
            continue;
        }
        insn.address = offset;

        if let Some(mut pointer) = insn.pointer {
            let target_address = resolve_target_address(&pointer, patchmap, asmfile);
            pointer.refresh(target_address);
            insn.pointer = Some(pointer);
            arch.update_pointer_in_operand(insn)?;

            let before = insn.length;
            let new_length = arch.encode(insn, force_widest, offset as i64 - original_address(asmfile, original) as i64)? as u8;
            if new_length != before {
                insn.length = new_length;
                changed = true;
            }
        }

        offset += insn.length as u64;
    }
    Ok(changed)
}

fn original_address(asmfile: &AsmFile, original: crate::entities::InsnId) -> u64 {
    asmfile.insns[original].address
}

/// Look up the current address of whatever a pointer targets: its
/// patched copy's address if one exists, otherwise the original
/// instruction's unmoved address (spec.md §4.6 step 2).
fn resolve_target_address(
    pointer: &crate::ir::instruction::Pointer,
    patchmap: &PatchMap,
    asmfile: &AsmFile,
) -> u64 {
    use crate::ir::instruction::PointerTarget;
    match pointer.target {
        PointerTarget::Insn(target) => patchmap
            .get(target)
            .map(|i| i.address)
            .unwrap_or_else(|| asmfile.insns[target].address),
        PointerTarget::Data(_) => pointer.target_address,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::reference::ReferenceArch;
    use crate::entities::{InsnId, SectionId};
    use crate::ir::instruction::{AddressingMode, Instruction, Pointer};
    use crate::ir::section::{Section, SectionAttrs, SectionEntry, SectionType};
    use crate::xref::XrefIndex;

    fn sample_asmfile() -> (AsmFile, SectionId, InsnId, InsnId) {
        let mut f = AsmFile::new();
        let mut section = Section::original(".text", 0x1000, 0x10, SectionType::Code, SectionAttrs::LOADED);
        let branch = f.insns.push(Instruction::new(0x1000, 2, 5, 1));
        let target = f.insns.push(Instruction::new(0x1002, 1, 1, 2));
        section.push_entry(SectionEntry::Insn(branch));
        section.push_entry(SectionEntry::Insn(target));
        let sec_id = f.sections.push(section);
        (f, sec_id, branch, target)
    }

    #[test]
    fn converges_in_one_pass_with_no_pointer_changes() {
        let (asmfile, sec, branch, target) = sample_asmfile();
        let mut patchmap = PatchMap::new();
        let mut xref = XrefIndex::new();

        let mut planner = Planner::new();
        let arch = ReferenceArch::default();
        let id = planner.create_block(&asmfile, &mut patchmap, &mut xref, &arch, sec, branch, target, crate::arch::JumpFlavor::Direct);
        let mut store = crate::intervals::IntervalStore::new([(0x2000, 0x3000)]);
        store.compute_reachability(0x1000, 0x1002, 0x10000, 0x10000, 0x10000, 0x10000);
        store.decide_reservation(0x100, 0);
        planner.reserve_interval(id, &mut store, &arch).unwrap();

        let mut diag = Diagnostics::new();
        let settings = Settings::default();
        let report = run(&planner, &mut patchmap, &asmfile, &arch, &settings, &mut diag).unwrap();
        assert_eq!(report.passes, 1);
        assert!(!report.forced_widest);
    }

    #[test]
    fn resolve_target_address_falls_back_to_original() {
        let (asmfile, _sec, _branch, target) = sample_asmfile();
        let patchmap = PatchMap::new();
        let pointer = Pointer::to_insn(target, AddressingMode::Relative);
        assert_eq!(resolve_target_address(&pointer, &patchmap, &asmfile), 0x1002);
    }
}
