//! The data model of spec.md §3: instructions, pointers, labels, sections,
//! data entries, conditions, and the `AsmFile` that aggregates them.

pub mod asmfile;
pub mod condition;
pub mod data;
pub mod instruction;
pub mod label;
pub mod section;

pub use asmfile::{AsmFile, Function, Loop};
pub use condition::{CompareOp, Comparison, Condition, SerialisedLeaf};
pub use data::{DataEntry, GlobalVar};
pub use instruction::{AddressingMode, Annotations, Instruction, Pointer, PointerTarget, BAD_INSN_CODE};
pub use label::{Label, LabelTable, LabelTarget, LabelType};
pub use section::{Section, SectionAttrs, SectionEntry, SectionType};
