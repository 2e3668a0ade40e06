//! Labels and the label table (spec.md §3 "Label" row; §6 "synthetic label"
//! naming convention; §2 supplement "Label rename").

use crate::entities::{DataId, InsnId, LabelId, SectionId};
use crate::result::{PatchError, PatchResult};
use std::collections::HashMap;

/// What a label points at.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LabelTarget {
    /// Points at an instruction.
    Insn(InsnId),
    /// Points at a data entry.
    Data(DataId),
}

/// The role a label plays, used by the binfile back end to decide its
/// symbol-table representation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LabelType {
    /// Names a function entry point.
    Function,
    /// Names a global variable.
    Variable,
    /// A placeholder with no real symbol-table presence.
    Dummy,
    /// Any other internal label (e.g. a moved block's synthetic label).
    Generic,
    /// Names an externally-resolved symbol.
    External,
}

/// One label.
#[derive(Clone, Debug)]
pub struct Label {
    name: String,
    address: u64,
    target: LabelTarget,
    section: SectionId,
    ty: LabelType,
}

impl Label {
    /// Construct a new label. `address` is finalised once the owning
    /// section's address is frozen (spec.md §3); until then it tracks the
    /// target's best current estimate.
    pub fn new(name: impl Into<String>, address: u64, target: LabelTarget, section: SectionId, ty: LabelType) -> Self {
        Self {
            name: name.into(),
            address,
            target,
            section,
            ty,
        }
    }

    /// The label's current name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The label's current address.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// What the label points at.
    pub fn target(&self) -> LabelTarget {
        self.target
    }

    /// The section the label is defined in.
    pub fn section(&self) -> SectionId {
        self.section
    }

    /// The label's role.
    pub fn label_type(&self) -> LabelType {
        self.ty
    }

    /// Update the label's cached address, called once its owning section's
    /// layout is frozen by the finaliser.
    pub fn set_address(&mut self, address: u64) {
        self.address = address;
    }

    /// The synthetic label name the finaliser assigns to a moved block
    /// (spec.md §6's persisted-state guarantee): `<original-function>@0x<hex>`.
    pub fn moved_block_name(original_function: &str, address: u64) -> String {
        format!("{}@{:#x}", original_function, address)
    }
}

/// Name-indexed label registry, mirroring the original's `label_table`
/// hashtable (`la_asmfile.c`) and supporting the `RENAME_LBL`/`RENAME_LIB`
/// modification kinds (spec.md §2 supplement).
#[derive(Default)]
pub struct LabelTable {
    by_name: HashMap<String, LabelId>,
}

impl LabelTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly-created label under its name.
    ///
    /// Errors with [`PatchError::LabelInsertFailure`] if the name is
    /// already taken.
    pub fn insert(&mut self, name: &str, id: LabelId) -> PatchResult<()> {
        if self.by_name.contains_key(name) {
            return Err(PatchError::LabelInsertFailure(format!(
                "label name already in use: {}",
                name
            )));
        }
        self.by_name.insert(name.to_string(), id);
        Ok(())
    }

    /// Look up a label by name.
    pub fn get(&self, name: &str) -> Option<LabelId> {
        self.by_name.get(name).copied()
    }

    /// Rename `old` to `new` in place (spec.md §2 supplement): remove the
    /// old entry, reject a colliding new name, re-insert.
    pub fn rename(&mut self, old: &str, new: &str) -> PatchResult<LabelId> {
        if self.by_name.contains_key(new) {
            return Err(PatchError::LabelInsertFailure(format!(
                "cannot rename {} to {}: name already in use",
                old, new
            )));
        }
        let id = self
            .by_name
            .remove(old)
            .ok_or_else(|| PatchError::LabelInsertFailure(format!("no such label: {}", old)))?;
        self.by_name.insert(new.to_string(), id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    #[test]
    fn moved_block_name_matches_convention() {
        assert_eq!(Label::moved_block_name("main", 0x4010a0), "main@0x4010a0");
    }

    #[test]
    fn rename_rejects_collision() {
        let mut t = LabelTable::new();
        t.insert("a", LabelId::new(0)).unwrap();
        t.insert("b", LabelId::new(1)).unwrap();
        assert!(t.rename("a", "b").is_err());
        assert!(t.rename("a", "c").is_ok());
        assert_eq!(t.get("c"), Some(LabelId::new(0)));
        assert_eq!(t.get("a"), None);
    }

    #[test]
    fn insert_rejects_duplicate_name() {
        let mut t = LabelTable::new();
        t.insert("dup", LabelId::new(0)).unwrap();
        assert!(t.insert("dup", LabelId::new(1)).is_err());
    }
}
