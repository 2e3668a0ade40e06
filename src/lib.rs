//! Patch-planning and code-relocation engine for static binary rewriting.
//!
//! This crate owns the parts of a static binary patcher that decide
//! *where* patched code goes and *how* control flow gets redirected to
//! reach it: a free-space interval store, a branch/reference index, a
//! patched-instruction overlay that never mutates original instructions
//! in place, a moved-block planner that picks jump flavors and
//! trampolines, a modification processor that lowers user-submitted
//! edits in deterministic order, an address-assembly fixpoint, and a
//! finaliser that emits section byte images.
//!
//! It deliberately does not ship a disassembler, a binary-format back
//! end, or an architecture-specific encoder — those are external
//! collaborators, expressed here as the [`binfile::BinFile`] and
//! [`arch::ArchDriver`] traits. A caller wires in real implementations
//! of both and drives the pipeline through [`session::Session`].
//!
//! Minimal in-memory reference implementations of both traits exist
//! behind the `testing` feature (or automatically under `cfg(test)`)
//! so the planning and fixpoint logic can be exercised without a real
//! disassembler or object-file writer.

pub mod arch;
pub mod binfile;
pub mod cursor;
pub mod entities;
pub mod finalize;
pub mod fixpoint;
pub mod intervals;
pub mod ir;
pub mod modification;
pub mod patchmap;
pub mod planner;
pub mod result;
pub mod session;
pub mod settings;
pub mod xref;

pub use arch::{ArchDriver, GeneratedSequence, JumpFlavor, SignedReach};
pub use binfile::{BinFile, SectionDescriptor};
pub use cursor::{Cursor, CursorPosition, InsnCursor};
pub use entities::{
    AnyEntity, BlockId, DataId, FunctionId, InsnId, IntervalId, LabelId, LoopId, ModifId, SectionId,
    VarId,
};
pub use finalize::Finaliser;
pub use fixpoint::FixpointReport;
pub use intervals::{IntervalStore, Reach, Reservation, Usage};
pub use ir::{
    AddressingMode, Annotations, AsmFile, CompareOp, Comparison, Condition, DataEntry, Function,
    GlobalVar, Instruction, Label, LabelTable, LabelTarget, LabelType, Loop, Pointer, PointerTarget,
    Section, SectionAttrs, SectionEntry, SectionType, SerialisedLeaf,
};
pub use modification::{
    CalleeRef, ModifFlags, ModifState, Modification, ModificationKind, ModificationProcessor, Position,
};
pub use patchmap::PatchMap;
pub use planner::{MovedBlock, Planner};
pub use result::{Category, Diagnostics, PatchError, PatchResult, Severity};
pub use session::{ArchRegistry, Session};
pub use settings::{Settings, SettingsBuilder};
pub use xref::XrefIndex;
