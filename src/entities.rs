//! Entity references used throughout the engine.
//!
//! Every cross-referencing relationship the engine tracks — a branch
//! pointing at an instruction, a moved block owning a run of patched
//! instructions, a modification anchored at an instruction — is expressed
//! as a typed, densely-numbered index into an arena (a `PrimaryMap`) rather
//! than a raw pointer or address. This sidesteps the cyclic-ownership
//! problem the original C implementation manages by hand with hashtables
//! keyed on addresses (see `la_asmfile.c`'s `branches_by_target_insn`):
//! arena indices are `Copy`, never dangle, and require no reference
//! counting.

use core::fmt;
use cranelift_entity::entity_impl;

/// A reference to an instruction in the original disassembly, or a
/// synthetic instruction introduced by the planner.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsnId(u32);
entity_impl!(InsnId, "insn");

/// A reference to a data entry (a global variable, constant, or any other
/// byte-addressable object outside the code sections).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(u32);
entity_impl!(DataId, "data");

/// A reference to a label.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(u32);
entity_impl!(LabelId, "lbl");

/// A reference to a section, original or newly created.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(u32);
entity_impl!(SectionId, "sec");

/// A reference to a free-space interval tracked by the interval store.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntervalId(u32);
entity_impl!(IntervalId, "ival");

/// A reference to a moved (displaced) block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);
entity_impl!(BlockId, "blk");

/// A reference to a user-submitted modification.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModifId(u32);
entity_impl!(ModifId, "modif");

/// A reference to an inserted global variable.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u32);
entity_impl!(VarId, "var");

/// A reference to a function record (original code grouped by the
/// disassembler into functions; read-only input to the engine).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u32);
entity_impl!(FunctionId, "fct");

/// A reference to a loop record (also disassembler-provided, read-only).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(u32);
entity_impl!(LoopId, "loop");

/// A reference to any of the entities defined in this module, for
/// diagnostics that need to name "whatever it was" without committing to
/// a single entity type.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum AnyEntity {
    /// An instruction.
    Insn(InsnId),
    /// A data entry.
    Data(DataId),
    /// A label.
    Label(LabelId),
    /// A section.
    Section(SectionId),
    /// A moved block.
    Block(BlockId),
    /// A modification.
    Modif(ModifId),
    /// A global variable.
    Var(VarId),
}

impl fmt::Display for AnyEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AnyEntity::Insn(r) => r.fmt(f),
            AnyEntity::Data(r) => r.fmt(f),
            AnyEntity::Label(r) => r.fmt(f),
            AnyEntity::Section(r) => r.fmt(f),
            AnyEntity::Block(r) => r.fmt(f),
            AnyEntity::Modif(r) => r.fmt(f),
            AnyEntity::Var(r) => r.fmt(f),
        }
    }
}

impl fmt::Debug for AnyEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self as &dyn fmt::Display).fmt(f)
    }
}

macro_rules! any_entity_from {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for AnyEntity {
            fn from(r: $ty) -> Self {
                AnyEntity::$variant(r)
            }
        }
    };
}

any_entity_from!(Insn, InsnId);
any_entity_from!(Data, DataId);
any_entity_from!(Label, LabelId);
any_entity_from!(Section, SectionId);
any_entity_from!(Block, BlockId);
any_entity_from!(Modif, ModifId);
any_entity_from!(Var, VarId);

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    #[test]
    fn insn_id_roundtrips_through_index() {
        let a = InsnId::new(0);
        let b = InsnId::new(41);
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 41);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "insn0");
    }

    #[test]
    fn any_entity_displays_inner_id() {
        let e = AnyEntity::from(BlockId::new(3));
        assert_eq!(e.to_string(), "blk3");
    }
}
