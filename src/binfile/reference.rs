//! A minimal in-memory reference [`BinFile`], used only by tests.
//!
//! Grounded on the original MADRAS asmfile's bookkeeping
//! (`la_asmfile.c`) scaled down to the handful of operations this
//! engine's tests actually exercise (S1–S6 of spec.md §8): it never
//! touches a real object-file format, just vectors and counters.

use super::{BinFile, SectionDescriptor};
use crate::entities::{DataId, InsnId, LabelId, SectionId};
use crate::ir::label::LabelType;
use crate::ir::section::SectionType;
use crate::result::{PatchError, PatchResult};
use cranelift_entity::EntityRef;
use std::ops::Range;

/// The reference back end.
#[derive(Default)]
pub struct ReferenceBinFile {
    descriptors: Vec<SectionDescriptor>,
    free: Vec<(u64, u64)>,
    next_section_id: u32,
    next_label_id: u32,
    next_insn_id: u32,
    next_data_id: u32,
    libraries: Vec<String>,
    stubs: Vec<(String, String)>,
    labels: Vec<(String, u64, LabelType)>,
    grown_sections: Vec<SectionId>,
    written_to: Option<String>,
    finalised: bool,
}

impl ReferenceBinFile {
    /// A new reference back end with the given pre-existing sections and
    /// free intervals.
    pub fn new(descriptors: Vec<SectionDescriptor>, free: Vec<(u64, u64)>) -> Self {
        Self {
            descriptors,
            free,
            ..Default::default()
        }
    }

    /// Mark a section as having grown, for `section_grew` queries in tests.
    pub fn mark_grew(&mut self, section: SectionId) {
        self.grown_sections.push(section);
    }

    /// The output path `write` was last called with, if any.
    pub fn written_to(&self) -> Option<&str> {
        self.written_to.as_deref()
    }

    /// True once `finalise_layout` has run.
    pub fn is_finalised(&self) -> bool {
        self.finalised
    }

    /// Every library requirement registered so far.
    pub fn libraries(&self) -> &[String] {
        &self.libraries
    }

    /// Every PLT stub registered so far, as (function name, soname) pairs.
    pub fn stubs(&self) -> &[(String, String)] {
        &self.stubs
    }
}

impl BinFile for ReferenceBinFile {
    fn open_writable_copy(&mut self) -> PatchResult<()> {
        Ok(())
    }

    fn sections(&self) -> &[SectionDescriptor] {
        &self.descriptors
    }

    fn free_intervals(&self) -> Vec<(u64, u64)> {
        self.free.clone()
    }

    fn add_section(&mut self, name: &str, address: u64, size: u64, ty: SectionType) -> PatchResult<SectionId> {
        self.descriptors.push(SectionDescriptor {
            name: name.to_string(),
            address,
            size,
            ty,
            loaded: true,
        });
        let id = SectionId::new(self.next_section_id as usize);
        self.next_section_id += 1;
        Ok(id)
    }

    fn copy_data_entry(&mut self, _original: DataId) -> PatchResult<DataId> {
        let id = DataId::new(self.next_data_id as usize);
        self.next_data_id += 1;
        Ok(id)
    }

    fn add_library_requirement(&mut self, soname: &str) -> PatchResult<()> {
        if !self.libraries.iter().any(|l| l == soname) {
            self.libraries.push(soname.to_string());
        }
        Ok(())
    }

    fn add_external_function_stub(&mut self, function_name: &str, soname: &str) -> PatchResult<InsnId> {
        self.stubs.push((function_name.to_string(), soname.to_string()));
        let id = InsnId::new(self.next_insn_id as usize);
        self.next_insn_id += 1;
        Ok(id)
    }

    fn add_label(&mut self, name: &str, address: u64, ty: LabelType) -> PatchResult<LabelId> {
        self.labels.push((name.to_string(), address, ty));
        let id = LabelId::new(self.next_label_id as usize);
        self.next_label_id += 1;
        Ok(id)
    }

    fn rename_library(&mut self, old_soname: &str, new_soname: &str) -> PatchResult<()> {
        let entry = self
            .libraries
            .iter_mut()
            .find(|l| *l == old_soname)
            .ok_or_else(|| PatchError::SymbolNotFound(old_soname.to_string()))?;
        *entry = new_soname.to_string();
        Ok(())
    }

    fn place_section(&mut self, _section: SectionId, window: Range<u64>) -> PatchResult<Range<u64>> {
        Ok(window)
    }

    fn section_grew(&self, section: SectionId) -> bool {
        self.grown_sections.contains(&section)
    }

    fn finalise_layout(&mut self) -> PatchResult<()> {
        self.finalised = true;
        Ok(())
    }

    fn write(&mut self, output_path: &str) -> PatchResult<()> {
        self.written_to = Some(output_path.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_section_allocates_increasing_ids() {
        let mut bf = ReferenceBinFile::default();
        let a = bf.add_section(".patch.text", 0x5000, 0x10, SectionType::Code).unwrap();
        let b = bf.add_section(".patch.data", 0x6000, 0x10, SectionType::Data).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rename_library_rejects_unknown_soname() {
        let mut bf = ReferenceBinFile::default();
        assert!(bf.rename_library("libfoo.so", "libbar.so").is_err());
        bf.add_library_requirement("libfoo.so").unwrap();
        assert!(bf.rename_library("libfoo.so", "libbar.so").is_ok());
        assert_eq!(bf.libraries(), &["libbar.so".to_string()]);
    }

    #[test]
    fn write_records_output_path() {
        let mut bf = ReferenceBinFile::default();
        bf.write("/tmp/out.bin").unwrap();
        assert_eq!(bf.written_to(), Some("/tmp/out.bin"));
    }
}
