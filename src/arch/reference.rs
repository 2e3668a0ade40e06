//! A minimal in-memory reference architecture, used only by tests
//! (`cfg(test)` or the `testing` feature) to exercise the engine without
//! a real disassembler/ISA back end plugged in.
//!
//! Mirrors the teacher's pattern of shipping concrete `TargetIsa`
//! implementors (`isa::x86`, `isa::arm32`) behind the same trait the rest
//! of the crate programs against — this is the engine's equivalent of a
//! tiny "fake ISA" used purely to make the trait's contract testable.
//! Its opcode numbering and sizes are arbitrary but fixed, matching the
//! sizes spec.md's end-to-end scenarios assume (small-jump = 2 bytes,
//! direct-jump = 5 bytes).

use super::{ArchDriver, GeneratedSequence, JumpFlavor, SignedReach};
use crate::ir::condition::SerialisedLeaf;
use crate::ir::instruction::{AddressingMode, Instruction, Pointer, PointerTarget};
use crate::result::{PatchError, PatchResult};
use cranelift_entity::EntityRef;

/// Opcode for a NOP of `operands[0]` bytes.
pub const OP_NOP: u32 = 0;
/// Opcode for a `rel8`-displacement jump (2 bytes total).
pub const OP_SMALL_JUMP: u32 = 1;
/// Opcode for a `rel32`-displacement jump (5 bytes total).
pub const OP_DIRECT_JUMP: u32 = 2;
/// Opcode for a memory-relative indirect jump (6 bytes total).
pub const OP_MEMREL_JUMP: u32 = 3;
/// Opcode for a fully indirect jump (8 bytes total).
pub const OP_INDIRECT_JUMP: u32 = 4;
/// Opcode for a direct call (5 bytes total).
pub const OP_CALL: u32 = 5;
/// Opcode for a compare-and-branch condition leaf (3 bytes total).
pub const OP_COMPARE_BRANCH: u32 = 6;

/// The reference architecture driver.
#[derive(Default)]
pub struct ReferenceArch;

impl ReferenceArch {
    fn flavor_size(&self, flavor: JumpFlavor) -> u32 {
        match flavor {
            JumpFlavor::SmallDirect => 2,
            JumpFlavor::Direct => 5,
            JumpFlavor::MemoryRelative => 6,
            JumpFlavor::FullyIndirect => 8,
        }
    }

    fn flavor_opcode(&self, flavor: JumpFlavor) -> u32 {
        match flavor {
            JumpFlavor::SmallDirect => OP_SMALL_JUMP,
            JumpFlavor::Direct => OP_DIRECT_JUMP,
            JumpFlavor::MemoryRelative => OP_MEMREL_JUMP,
            JumpFlavor::FullyIndirect => OP_INDIRECT_JUMP,
        }
    }
}

impl ArchDriver for ReferenceArch {
    fn generate_jump(&self, flavor: JumpFlavor, from_addr: u64) -> PatchResult<GeneratedSequence<Pointer>> {
        let size = self.flavor_size(flavor);
        let opcode = self.flavor_opcode(flavor);
        let mode = match flavor {
            JumpFlavor::MemoryRelative => AddressingMode::MemoryRelative,
            JumpFlavor::FullyIndirect => AddressingMode::Absolute,
            _ => AddressingMode::Relative,
        };
        let mut insn = Instruction::new(from_addr, size as u8, size as u8, opcode);
        let pointer = Pointer::to_insn(crate::entities::InsnId::new(0), mode);
        insn.pointer = Some(pointer);
        Ok(GeneratedSequence {
            instructions: vec![insn],
            anchor_index: 0,
            extra: pointer,
        })
    }

    fn generate_nop(&self, size: u32) -> PatchResult<Instruction> {
        let mut insn = Instruction::new(0, size as u8, size as u8, OP_NOP);
        insn.operands.push(size as u8);
        Ok(insn)
    }

    fn generate_function_call(&self, callee: Pointer, _stack: Option<u64>) -> PatchResult<GeneratedSequence<()>> {
        let mut insn = Instruction::new(0, 5, 5, OP_CALL);
        insn.pointer = Some(callee);
        Ok(GeneratedSequence {
            instructions: vec![insn],
            anchor_index: 0,
            extra: (),
        })
    }

    fn add_conditions(
        &self,
        list: &mut Vec<Instruction>,
        condition: &[SerialisedLeaf],
        _stack: Option<u64>,
        _shift: i64,
    ) -> PatchResult<()> {
        for leaf in condition {
            let mut insn = Instruction::new(0, 3, 3, OP_COMPARE_BRANCH);
            insn.operands.push(leaf.comparison.operand as u8);
            insn.operands.push(leaf.opposite_to_take as u8);
            list.push(insn);
        }
        Ok(())
    }

    fn encode(&self, instruction: &mut Instruction, allow_opcode_change: bool, _shift_accumulator: i64) -> PatchResult<u32> {
        if instruction.opcode == OP_SMALL_JUMP {
            if let Some(pointer) = &instruction.pointer {
                let disp = pointer.target_address as i64 - instruction.address as i64;
                if !(i8::MIN as i64..=i8::MAX as i64).contains(&disp) {
                    if !allow_opcode_change {
                        return Err(PatchError::SizeWouldChange(crate::entities::InsnId::new(0)));
                    }
                    instruction.opcode = OP_DIRECT_JUMP;
                    instruction.length = 5;
                    instruction.max_length = 5;
                }
            }
        }
        Ok(instruction.length as u32)
    }

    fn max_bytesize(&self, instruction: &Instruction) -> u32 {
        match instruction.opcode {
            OP_NOP => instruction.max_length as u32,
            OP_SMALL_JUMP => 5,
            OP_DIRECT_JUMP => 5,
            OP_MEMREL_JUMP => 6,
            OP_INDIRECT_JUMP => 8,
            OP_CALL => 5,
            OP_COMPARE_BRANCH => 3,
            _ => instruction.max_length.max(instruction.length) as u32,
        }
    }

    fn is_nop(&self, instruction: &Instruction) -> bool {
        instruction.opcode == OP_NOP
    }

    fn signed_reach(&self, flavor: JumpFlavor) -> SignedReach {
        match flavor {
            JumpFlavor::SmallDirect => (i8::MIN as i64, i8::MAX as i64),
            JumpFlavor::Direct => (i32::MIN as i64, i32::MAX as i64),
            JumpFlavor::MemoryRelative => (i32::MIN as i64, i32::MAX as i64),
            JumpFlavor::FullyIndirect => (i64::MIN, i64::MAX),
        }
    }

    fn byte_size(&self, flavor: JumpFlavor) -> u32 {
        self.flavor_size(flavor)
    }

    fn stub_ext_label_name(&self, function_name: &str) -> String {
        format!("{}@plt", function_name)
    }

    fn update_pointer_in_operand(&self, instruction: &mut Instruction) -> PatchResult<()> {
        if let Some(pointer) = &instruction.pointer {
            let addr = pointer.effective_address();
            instruction.operands.clear();
            instruction.operands.extend_from_slice(&addr.to_le_bytes());
        }
        Ok(())
    }
}

/// Helper so `PointerTarget` stays reachable for downstream reference-impl
/// tests without an unused-import warning when only `Pointer` is needed.
pub fn pointer_target_kind(p: &Pointer) -> &'static str {
    match p.target {
        PointerTarget::Insn(_) => "insn",
        PointerTarget::Data(_) => "data",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_jump_widens_past_i8_reach() {
        let arch = ReferenceArch;
        let mut insn = Instruction::new(0x1000, 2, 5, OP_SMALL_JUMP);
        let mut ptr = Pointer::to_insn(crate::entities::InsnId::new(0), AddressingMode::Relative);
        ptr.refresh(0x2000);
        insn.pointer = Some(ptr);
        arch.encode(&mut insn, true, 0).unwrap();
        assert_eq!(insn.opcode, OP_DIRECT_JUMP);
        assert_eq!(insn.length, 5);
    }

    #[test]
    fn small_jump_keeps_size_within_reach() {
        let arch = ReferenceArch;
        let mut insn = Instruction::new(0x1000, 2, 5, OP_SMALL_JUMP);
        let mut ptr = Pointer::to_insn(crate::entities::InsnId::new(0), AddressingMode::Relative);
        ptr.refresh(0x1010);
        insn.pointer = Some(ptr);
        arch.encode(&mut insn, true, 0).unwrap();
        assert_eq!(insn.opcode, OP_SMALL_JUMP);
        assert_eq!(insn.length, 2);
    }

    #[test]
    fn byte_size_matches_scenario_constants() {
        let arch = ReferenceArch;
        assert_eq!(arch.byte_size(JumpFlavor::SmallDirect), 2);
        assert_eq!(arch.byte_size(JumpFlavor::Direct), 5);
    }
}
