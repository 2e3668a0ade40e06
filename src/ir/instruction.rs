//! Instruction and pointer data (spec.md §3, "Instruction" and "Pointer" rows).

use crate::entities::{DataId, InsnId};
use smallvec::SmallVec;

/// Sentinel opcode used for a partial patched-instruction copy (spec.md
/// §4.3): "a fresh instruction whose opcode is the sentinel
/// `BAD_INSN_CODE`, carrying only the original's address and annotation".
/// Its real opcode is never consulted because a partial copy is only ever
/// used to relocate an instruction unchanged — [`crate::patchmap::PatchMap`]
/// borrows the original's encoding at emission time.
pub const BAD_INSN_CODE: u32 = u32::MAX;

bitflags::bitflags! {
    /// Per-instruction annotation bits (spec.md §3's "annotation bitset").
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Annotations: u16 {
        /// Instruction has been moved into a displaced block.
        const MOV = 1 << 0;
        /// Instruction is newly synthesised by the planner or processor.
        const NEW = 1 << 1;
        /// Instruction (or its patched copy) has been deleted.
        const DEL = 1 << 2;
        /// Instruction's encoding was updated in place (no move, no delete).
        const UPD = 1 << 3;
        /// Instruction is a jump/branch of any kind.
        const JUMP = 1 << 4;
        /// Instruction is a conditional branch.
        const COND = 1 << 5;
        /// Instruction is a return.
        const RTRN = 1 << 6;
        /// Instruction is unreachable (falls after an unconditional
        /// terminator with no incoming branch).
        const UNREACHABLE = 1 << 7;
        /// Instruction opens a basic-block list that must not be split
        /// (caller-supplied grouping hint).
        const BEGIN_LIST = 1 << 8;
        /// Instruction closes a `BEGIN_LIST` group.
        const END_LIST = 1 << 9;
        /// Instruction is itself the target of at least one branch.
        const BRANCH_TARGET = 1 << 10;
    }
}

/// What kind of entity a [`Pointer`] refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PointerTarget {
    /// Points at an instruction.
    Insn(InsnId),
    /// Points at a data entry.
    Data(DataId),
}

/// How a pointer's operand encodes the target address (spec.md §3).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressingMode {
    /// The operand holds the absolute target address.
    Absolute,
    /// The operand holds a PC-relative signed displacement.
    Relative,
    /// The operand holds a PC-relative reference to a memory cell that in
    /// turn holds the absolute target address.
    MemoryRelative,
}

/// A reference operand: lives inside one instruction's operand list and is
/// updated whenever its target's address changes (spec.md §3 invariant: the
/// pointer, not the instruction, is the thing re-targeted).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pointer {
    /// What this pointer targets.
    pub target: PointerTarget,
    /// How the target address is encoded in the operand.
    pub mode: AddressingMode,
    /// The target's address as of the last time it was refreshed. Callers
    /// must not trust this across a planning phase without calling
    /// [`Pointer::refresh`].
    pub target_address: u64,
    /// A constant byte offset applied inside the target (e.g. "four bytes
    /// into this data entry").
    pub in_target_offset: i64,
}

impl Pointer {
    /// A pointer to an instruction.
    pub fn to_insn(target: InsnId, mode: AddressingMode) -> Self {
        Self {
            target: PointerTarget::Insn(target),
            mode,
            target_address: 0,
            in_target_offset: 0,
        }
    }

    /// A pointer to a data entry.
    pub fn to_data(target: DataId, mode: AddressingMode) -> Self {
        Self {
            target: PointerTarget::Data(target),
            mode,
            target_address: 0,
            in_target_offset: 0,
        }
    }

    /// Update the cached target address, e.g. after the address-assembly
    /// fixpoint moves the target.
    pub fn refresh(&mut self, new_target_address: u64) {
        self.target_address = new_target_address;
    }

    /// The effective address this pointer resolves to, including the
    /// in-target offset.
    pub fn effective_address(&self) -> u64 {
        (self.target_address as i64 + self.in_target_offset) as u64
    }
}

/// An operand slot. The engine treats operand *contents* as opaque bytes
/// owned by the architecture driver (it never interprets registers or
/// immediates itself); the one case it cares about is the reference
/// operand, modeled separately as [`Instruction::pointer`].
pub type OperandBytes = SmallVec<[u8; 16]>;

/// One instruction, original or synthesised (spec.md §3 "Instruction" row).
#[derive(Clone, Debug)]
pub struct Instruction {
    /// Current virtual address. Meaningless (and not relied upon) before
    /// the address-assembly fixpoint places it.
    pub address: u64,
    /// Current encoded length in bytes.
    pub length: u8,
    /// Architectural maximum length over all operand-size encodings of
    /// this opcode, as reported by [`crate::arch::ArchDriver::max_bytesize`].
    pub max_length: u8,
    /// Opaque opcode code understood by the architecture driver.
    /// [`BAD_INSN_CODE`] marks a partial patched-instruction copy.
    pub opcode: u32,
    /// Opaque operand bytes, meaningful only to the architecture driver.
    pub operands: OperandBytes,
    /// Annotation bits.
    pub annotations: Annotations,
    /// The reference operand, if this instruction has one.
    pub pointer: Option<Pointer>,
}

impl Instruction {
    /// Construct a plain instruction with no annotations and no reference
    /// operand.
    pub fn new(address: u64, length: u8, max_length: u8, opcode: u32) -> Self {
        Self {
            address,
            length,
            max_length,
            opcode,
            operands: OperandBytes::new(),
            annotations: Annotations::empty(),
            pointer: None,
        }
    }

    /// A tombstone partial copy: carries only address and annotation, per
    /// spec.md §4.3's memory-saving optimisation for the common case of
    /// pure relocation.
    pub fn partial_copy(address: u64, annotations: Annotations) -> Self {
        Self {
            address,
            length: 0,
            max_length: 0,
            opcode: BAD_INSN_CODE,
            operands: OperandBytes::new(),
            annotations,
            pointer: None,
        }
    }

    /// True if this is a [`Instruction::partial_copy`] that has not since
    /// been upgraded to carry real operands.
    pub fn is_partial(&self) -> bool {
        self.opcode == BAD_INSN_CODE
    }

    /// True if this instruction is a tombstone (deleted): `DEL` is set.
    pub fn is_tombstone(&self) -> bool {
        self.annotations.contains(Annotations::DEL)
    }

    /// True if this instruction unconditionally stops control flow
    /// (return or unconditional jump), so the finaliser need not
    /// synthesise a return branch after it.
    pub fn terminates_flow(&self) -> bool {
        self.annotations.contains(Annotations::RTRN)
            || (self.annotations.contains(Annotations::JUMP)
                && !self.annotations.contains(Annotations::COND))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotations_compose_and_query() {
        let mut a = Annotations::MOV | Annotations::JUMP;
        assert!(a.contains(Annotations::MOV));
        assert!(a.contains(Annotations::JUMP));
        assert!(!a.contains(Annotations::DEL));
        a.insert(Annotations::DEL);
        assert!(a.contains(Annotations::DEL));
        a.remove(Annotations::MOV);
        assert!(!a.contains(Annotations::MOV));
    }

    #[test]
    fn partial_copy_is_recognised() {
        let i = Instruction::partial_copy(0x1000, Annotations::MOV);
        assert!(i.is_partial());
        assert_eq!(i.address, 0x1000);
    }

    #[test]
    fn terminates_flow_distinguishes_conditional_branches() {
        let mut ret = Instruction::new(0, 1, 1, 1);
        ret.annotations.insert(Annotations::RTRN);
        assert!(ret.terminates_flow());

        let mut jmp = Instruction::new(0, 5, 5, 2);
        jmp.annotations.insert(Annotations::JUMP);
        assert!(jmp.terminates_flow());

        let mut cond = Instruction::new(0, 6, 6, 3);
        cond.annotations.insert(Annotations::JUMP | Annotations::COND);
        assert!(!cond.terminates_flow());
    }
}
