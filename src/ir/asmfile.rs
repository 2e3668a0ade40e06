//! The aggregate in-memory disassembly (spec.md §3's full data model,
//! gathered into one owned structure; §2 supplement "Per-function
//! tracking").
//!
//! Mirrors the shape of the teacher's own `ir::Function`: dense
//! `PrimaryMap` arenas own every entity, and `SecondaryMap` side tables
//! attach extra per-entity data without growing the entity types
//! themselves. Unlike `Function`, an `AsmFile` is read-mostly input handed
//! to [`crate::session::Session::init`] — the session never adds to its
//! `insns`/`data`/`sections` arenas directly; new instructions and data
//! live in the patched-instruction map and moved blocks instead.

use crate::entities::{DataId, FunctionId, InsnId, LabelId, LoopId, SectionId};
use crate::ir::data::DataEntry;
use crate::ir::instruction::Instruction;
use crate::ir::label::{Label, LabelTable};
use crate::ir::section::Section;
use cranelift_entity::{PrimaryMap, SecondaryMap};
use std::ops::Range;

/// One function record, as grouped by the disassembler. Read-only input;
/// the engine never creates or destroys these.
#[derive(Clone, Debug)]
pub struct Function {
    /// The function's name, as the disassembler or symbol table named it.
    pub name: String,
    /// The function's first instruction.
    pub entry: InsnId,
}

/// One loop record, as grouped by the disassembler. Read-only input.
#[derive(Clone, Debug)]
pub struct Loop {
    /// The loop's header instruction (its first instruction, by address).
    pub header: InsnId,
    /// The function the loop belongs to.
    pub function: FunctionId,
}

/// The complete disassembled input, as produced by the (out-of-scope)
/// disassembler and handed to the engine.
///
/// Every arena here is append-only from the engine's point of view: the
/// patch-planning pipeline reads `insns`/`data`/`sections`/`labels` but
/// only ever *annotates* entries (setting bits in
/// [`crate::ir::instruction::Annotations`]) rather than mutating their
/// address, opcode, or operand content, per spec.md §5's "read-mostly"
/// resource policy.
#[derive(Clone, Debug, Default)]
pub struct AsmFile {
    /// Every instruction in the original disassembly.
    pub insns: PrimaryMap<InsnId, Instruction>,
    /// Every data entry (globals, constants, original data references).
    pub data: PrimaryMap<DataId, DataEntry>,
    /// Every section, original or (later) newly created.
    pub sections: PrimaryMap<SectionId, Section>,
    /// Every label, keyed by id; looked up by name through `label_table`.
    pub labels: PrimaryMap<LabelId, Label>,
    /// Every function record.
    pub functions: PrimaryMap<FunctionId, Function>,
    /// Every loop record.
    pub loops: PrimaryMap<LoopId, Loop>,
    /// Name-indexed view over `labels`.
    pub label_table: LabelTable,
    /// The enclosing function of each instruction, if known (spec.md §2
    /// supplement "Per-function tracking"). Instructions the disassembler
    /// could not attribute to any function (e.g. padding between
    /// functions) map to `None`.
    pub enclosing_function: SecondaryMap<InsnId, Option<FunctionId>>,
    /// The enclosing loop of each instruction, if any.
    pub enclosing_loop: SecondaryMap<InsnId, Option<LoopId>>,
    /// Address ranges the disassembler could not attribute to any
    /// instruction (alignment padding, data interleaved with code, bytes
    /// it declined to decode). Consulted by [`crate::intervals::IntervalStore`]
    /// when diagnosing "genuinely no room" reservation failures.
    pub gaps: Vec<Range<u64>>,
}

impl AsmFile {
    /// An empty asmfile, useful as a starting point for reference
    /// `ArchDriver`/`BinFile` implementations in tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if this asmfile carries no sections at all, the condition
    /// [`crate::result::PatchError::MissingAsmFile`] guards against.
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// The function enclosing `insn`, if the disassembler attributed one.
    pub fn function_of(&self, insn: InsnId) -> Option<FunctionId> {
        self.enclosing_function[insn]
    }

    /// The loop enclosing `insn`, if any.
    pub fn loop_of(&self, insn: InsnId) -> Option<LoopId> {
        self.enclosing_loop[insn]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::section::SectionAttrs;
    use crate::ir::section::SectionType;

    #[test]
    fn fresh_asmfile_is_empty() {
        let f = AsmFile::new();
        assert!(f.is_empty());
    }

    #[test]
    fn asmfile_with_a_section_is_not_empty() {
        let mut f = AsmFile::new();
        f.sections.push(Section::original(
            ".text",
            0x400000,
            0x1000,
            SectionType::Code,
            SectionAttrs::LOADED,
        ));
        assert!(!f.is_empty());
    }

    #[test]
    fn enclosing_function_defaults_to_none() {
        let f = AsmFile::new();
        use cranelift_entity::EntityRef;
        assert_eq!(f.function_of(InsnId::new(0)), None);
    }
}
