//! The architecture driver interface (spec.md §6, "Arch-driver interface
//! (consumed)"): encoding instructions, generating jump/call/NOP
//! sequences, and reporting reach and size for a single ISA.
//!
//! This is a *consumed* interface — the engine never ships a production
//! implementation of it, exactly as spec.md's Non-goals exclude "the
//! architecture driver" as an external collaborator. The shape mirrors
//! the teacher's own `isa::TargetIsa` trait: one object-safe trait that
//! the rest of the crate programs against via `&dyn ArchDriver`, with
//! concrete per-ISA implementors living outside this crate (here, only a
//! minimal in-memory reference implementation exists, gated behind the
//! `testing` feature, in [`crate::arch::reference`]).

use crate::entities::InsnId;
use crate::ir::condition::SerialisedLeaf;
use crate::ir::instruction::{Instruction, Pointer};
use crate::result::PatchResult;

#[cfg(any(test, feature = "testing"))]
pub mod reference;

/// Which kind of jump the planner is asking the driver to synthesise
/// (spec.md §4.4's jump-flavor table).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum JumpFlavor {
    /// A full direct branch.
    Direct,
    /// A shorter, shorter-reach direct branch (e.g. `JMP rel8`).
    SmallDirect,
    /// An indirect jump through a nearby memory cell holding the target
    /// address (the memory cell lives in a new data section).
    MemoryRelative,
    /// A fully indirect jump requiring no nearby reachable interval.
    FullyIndirect,
}

/// The signed reach of a jump flavor: legal operand range in bytes,
/// relative to the branch instruction's own address.
pub type SignedReach = (i64, i64);

/// A freshly generated instruction sequence, plus a handle to the one
/// instruction in it that callers need to cross-reference (the branch
/// itself, or the call instruction).
pub struct GeneratedSequence<T> {
    /// The instructions to splice in, in order.
    pub instructions: Vec<Instruction>,
    /// The index into `instructions` of the instruction callers need a
    /// handle to (the branch or call instruction).
    pub anchor_index: usize,
    /// Extra data the specific generator call produces (a [`Pointer`] for
    /// jumps, `()` for NOPs).
    pub extra: T,
}

/// The architecture driver interface (spec.md §6). Implementors supply
/// everything the engine needs to know about one instruction set without
/// the engine ever interpreting an opcode or operand byte itself.
pub trait ArchDriver {
    /// Generate the instruction list for a jump of the given flavor
    /// originating at `from_addr`, along with the branch instruction's
    /// index in the list and its reference [`Pointer`] (spec.md §6
    /// `generate_jump`).
    fn generate_jump(&self, flavor: JumpFlavor, from_addr: u64) -> PatchResult<GeneratedSequence<Pointer>>;

    /// Generate `size` bytes of NOP padding as one instruction (spec.md
    /// §6 `generate_nop`).
    fn generate_nop(&self, size: u32) -> PatchResult<Instruction>;

    /// Generate the call sequence to `callee`, given a stack-area pointer
    /// for flag-gated stack allocation (`NEWSTACK`), returning the list
    /// and the call instruction's index (spec.md §6
    /// `generate_function_call`).
    fn generate_function_call(
        &self,
        callee: Pointer,
        stack: Option<u64>,
    ) -> PatchResult<GeneratedSequence<()>>;

    /// Lower a serialised condition tree into a compare-and-branch
    /// prologue, appended to `list` (spec.md §6 `add_conditions`).
    fn add_conditions(&self, list: &mut Vec<Instruction>, condition: &[SerialisedLeaf], stack: Option<u64>, shift: i64) -> PatchResult<()>;

    /// Re-encode `instruction` at its current address, returning the new
    /// byte length. `allow_opcode_change` permits widening to a
    /// different opcode variant (e.g. `rel8` → `rel32`);
    /// `shift_accumulator` is the running address delta already applied
    /// by the fixpoint this pass (spec.md §6 `encode`).
    fn encode(&self, instruction: &mut Instruction, allow_opcode_change: bool, shift_accumulator: i64) -> PatchResult<u32>;

    /// The architectural maximum encoded length over every operand-size
    /// variant of `instruction`'s opcode (spec.md §6 `max_bytesize`).
    fn max_bytesize(&self, instruction: &Instruction) -> u32;

    /// True if `instruction` is a NOP (spec.md §6 `is_nop`).
    fn is_nop(&self, instruction: &Instruction) -> bool;

    /// The signed reach of a jump flavor (spec.md §6 `signed_reach`).
    fn signed_reach(&self, flavor: JumpFlavor) -> SignedReach;

    /// The byte size of a jump flavor's canonical encoding (spec.md §6
    /// `byte_size`).
    fn byte_size(&self, flavor: JumpFlavor) -> u32;

    /// The PLT-stub label name the binfile back end should register for
    /// an externally resolved function (spec.md §6
    /// `stub_ext_label_name`).
    fn stub_ext_label_name(&self, function_name: &str) -> String;

    /// Rewrite `instruction`'s reference operand to reflect its
    /// pointer's current target address (spec.md §6
    /// `update_pointer_in_operand`).
    fn update_pointer_in_operand(&self, instruction: &mut Instruction) -> PatchResult<()>;
}

/// A record of which [`InsnId`] an arch-driver call introduced, for
/// callers that need to keep the `xref`/`patchmap` bookkeeping in sync
/// after splicing a [`GeneratedSequence`] into a moved block. Not part of
/// the consumed interface itself — a convenience the planner builds on
/// top of it.
#[derive(Copy, Clone, Debug)]
pub struct SpliceHandle {
    /// The first newly created instruction's id.
    pub first: InsnId,
    /// The anchor instruction's id (the branch or call).
    pub anchor: InsnId,
    /// The last newly created instruction's id.
    pub last: InsnId,
}
