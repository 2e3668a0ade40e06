//! The binary-format back-end interface (spec.md §6, "Binfile back-end
//! interface (consumed)"): object-file I/O, section/segment layout, and
//! relocation/symbol-table bookkeeping.
//!
//! A *consumed* interface, not implemented in production here — spec.md's
//! Non-goals exclude the binfile back end as an external collaborator,
//! the same way the original MADRAS system loads it as a separate
//! driver structure (`asmbldriver_t` in `asmb_archinterface.h`: a
//! function-pointer table filled in by whichever ELF/PE/Mach-O backend is
//! linked in). Here that function-pointer table becomes a Rust trait.

use crate::entities::{DataId, InsnId, LabelId, SectionId};
use crate::ir::label::LabelType;
use crate::ir::section::SectionType;
use crate::result::PatchResult;
use std::ops::Range;

#[cfg(any(test, feature = "testing"))]
pub mod reference;

/// One section as the binfile back end describes it at init time.
#[derive(Clone, Debug)]
pub struct SectionDescriptor {
    /// The section's name.
    pub name: String,
    /// Its virtual address.
    pub address: u64,
    /// Its size.
    pub size: u64,
    /// Its type.
    pub ty: SectionType,
    /// Whether it is mapped at load time.
    pub loaded: bool,
}

/// The binary-format back-end interface (spec.md §6).
pub trait BinFile {
    /// Initialise a writable in-memory copy of the file (spec.md §6
    /// "Initialise a writable copy").
    fn open_writable_copy(&mut self) -> PatchResult<()>;

    /// Enumerate loadable and code sections with their descriptors
    /// (spec.md §6 "enumerate loadable and code sections").
    fn sections(&self) -> &[SectionDescriptor];

    /// Build the initial list of free virtual-address ranges (spec.md §6
    /// "build the initial free-interval list").
    fn free_intervals(&self) -> Vec<(u64, u64)>;

    /// Add a new code or data section at `address` with `size` bytes
    /// (spec.md §6 "add a new code/data section at a given address and
    /// size").
    fn add_section(&mut self, name: &str, address: u64, size: u64, ty: SectionType) -> PatchResult<SectionId>;

    /// Fetch the bytes of an original data entry, or create a patched
    /// copy of it (spec.md §6 "fetch or create a copy of a data entry").
    fn copy_data_entry(&mut self, original: DataId) -> PatchResult<DataId>;

    /// Register a requirement on an external dynamic library (spec.md §6
    /// "add an external-library requirement").
    fn add_library_requirement(&mut self, soname: &str) -> PatchResult<()>;

    /// Register a PLT-style stub for an externally resolved function,
    /// returning the stub's entry instruction (spec.md §6 "add an
    /// external-function stub"; SPEC_FULL §3 item 4 resolves this to
    /// always return an `InsnId` the processor wires a branch to).
    fn add_external_function_stub(&mut self, function_name: &str, soname: &str) -> PatchResult<InsnId>;

    /// Register a label (spec.md §6 "add a label").
    fn add_label(&mut self, name: &str, address: u64, ty: LabelType) -> PatchResult<LabelId>;

    /// Rename a dynamic-library entry (spec.md §6 "rename a dynamic-
    /// library entry").
    fn rename_library(&mut self, old_soname: &str, new_soname: &str) -> PatchResult<()>;

    /// Move a section into the named interval, returning the portion
    /// actually used; may refuse (spec.md §6 "move a section into a
    /// named interval").
    fn place_section(&mut self, section: SectionId, window: Range<u64>) -> PatchResult<Range<u64>>;

    /// True if `section` grew relative to its original size (spec.md §6
    /// "query whether a section grew").
    fn section_grew(&self, section: SectionId) -> bool;

    /// Fix remaining section addresses, construct segment/program-header
    /// equivalents, and commit the new PLT (spec.md §6 "finalise section
    /// layout"; §4.7 "invokes the binfile back end's finalise").
    fn finalise_layout(&mut self) -> PatchResult<()>;

    /// Write the file to `output_path` (spec.md §6 "write the file").
    fn write(&mut self, output_path: &str) -> PatchResult<()>;
}
