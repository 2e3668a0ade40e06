//! Array-backed instruction-sequence cursors.
//!
//! The original implementation threads an intrusive doubly-linked list
//! through instructions (`la_asmfile.c`'s `insns` queue). Since every
//! instruction here already lives in a dense [`cranelift_entity::PrimaryMap`]
//! arena (see [`crate::ir::AsmFile`]), there is no need for intrusive
//! links: a section's `entries` vector *is* the sequence, and a cursor is
//! just an index into it. This is the same trade teacher's own
//! `cursor.rs` makes relative to a hand-rolled linked list, adapted from
//! EBB-relative positions to section-relative ones.

use crate::entities::{InsnId, SectionId};
use crate::ir::asmfile::AsmFile;
use crate::ir::instruction::Annotations;
use crate::ir::section::SectionEntry;

/// The possible positions of an [`InsnCursor`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CursorPosition {
    /// Not pointing anywhere; no navigation is possible until repositioned.
    Nowhere,
    /// Pointing at a specific instruction inside its owning section.
    At(InsnId),
    /// Positioned before the first entry of a section.
    Before(SectionId),
    /// Positioned after the last entry of a section.
    After(SectionId),
}

/// Common navigation operations over an instruction sequence.
pub trait Cursor {
    /// The current position.
    fn position(&self) -> CursorPosition;

    /// Move to an arbitrary position.
    fn set_position(&mut self, pos: CursorPosition);

    /// Rebuild this cursor positioned at `pos`.
    fn at_position(mut self, pos: CursorPosition) -> Self
    where
        Self: Sized,
    {
        self.set_position(pos);
        self
    }

    /// Rebuild this cursor positioned at `insn`.
    fn at_inst(mut self, insn: InsnId) -> Self
    where
        Self: Sized,
    {
        self.set_position(CursorPosition::At(insn));
        self
    }
}

/// A cursor over one section's ordered entry list, skipping past data
/// entries (it only ever stops on instructions) and optionally skipping
/// past instructions annotated `DEL` (tombstones) when asked to.
pub struct InsnCursor<'f> {
    asmfile: &'f AsmFile,
    section: SectionId,
    pos: CursorPosition,
}

impl<'f> InsnCursor<'f> {
    /// A cursor over `section`, initially positioned before its first entry.
    pub fn new(asmfile: &'f AsmFile, section: SectionId) -> Self {
        Self {
            asmfile,
            section,
            pos: CursorPosition::Before(section),
        }
    }

    /// The section this cursor navigates.
    pub fn section(&self) -> SectionId {
        self.section
    }

    fn entries(&self) -> &[SectionEntry] {
        self.asmfile.sections[self.section].entries()
    }

    fn index_of(&self, insn: InsnId) -> Option<usize> {
        self.entries()
            .iter()
            .position(|e| matches!(e, SectionEntry::Insn(i) if *i == insn))
    }

    /// Advance to the next instruction entry in the section (skipping
    /// data entries), or `None` and [`CursorPosition::After`] at the end.
    pub fn next_inst(&mut self) -> Option<InsnId> {
        let start = match self.pos {
            CursorPosition::Nowhere => return None,
            CursorPosition::Before(_) => 0,
            CursorPosition::At(insn) => self.index_of(insn)? + 1,
            CursorPosition::After(_) => return None,
        };
        for (i, entry) in self.entries().iter().enumerate().skip(start) {
            if let SectionEntry::Insn(id) = entry {
                self.pos = CursorPosition::At(*id);
                let _ = i;
                return Some(*id);
            }
        }
        self.pos = CursorPosition::After(self.section);
        None
    }

    /// Step back to the previous instruction entry in the section.
    pub fn prev_inst(&mut self) -> Option<InsnId> {
        let end = match self.pos {
            CursorPosition::Nowhere => return None,
            CursorPosition::Before(_) => return None,
            CursorPosition::At(insn) => self.index_of(insn)?,
            CursorPosition::After(_) => self.entries().len(),
        };
        for i in (0..end).rev() {
            if let SectionEntry::Insn(id) = self.entries()[i] {
                self.pos = CursorPosition::At(id);
                return Some(id);
            }
        }
        self.pos = CursorPosition::Before(self.section);
        None
    }

    /// Like [`InsnCursor::next_inst`], but skips instructions annotated
    /// [`Annotations::DEL`] — used by the fixpoint and finaliser to find
    /// "the next live successor" past a deleted instruction (spec.md §4.6
    /// step 5, "skipping over any DEL tombstones").
    pub fn next_live(&mut self) -> Option<InsnId> {
        loop {
            let candidate = self.next_inst()?;
            if !self.asmfile.insns[candidate]
                .annotations
                .contains(Annotations::DEL)
            {
                return Some(candidate);
            }
        }
    }

    /// Like [`InsnCursor::prev_inst`], but skips tombstones.
    pub fn prev_live(&mut self) -> Option<InsnId> {
        loop {
            let candidate = self.prev_inst()?;
            if !self.asmfile.insns[candidate]
                .annotations
                .contains(Annotations::DEL)
            {
                return Some(candidate);
            }
        }
    }
}

impl<'f> Cursor for InsnCursor<'f> {
    fn position(&self) -> CursorPosition {
        self.pos
    }

    fn set_position(&mut self, pos: CursorPosition) {
        self.pos = pos;
    }
}
