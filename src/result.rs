//! Error values and the session-wide diagnostics channel.
//!
//! Spec.md §7 describes errors as "values of an open enumeration carrying a
//! severity (error vs. warning) and a category", with a propagation rule
//! that lets warnings be overwritten by anything but never lets an error be
//! overwritten. This module is that enumeration, plus the small piece of
//! state (`Diagnostics`) that implements the overwrite rule.

use crate::entities::{AnyEntity, InsnId, ModifId};
use thiserror::Error;

/// Convenience alias used by every fallible operation in the crate.
pub type PatchResult<T> = Result<T, PatchError>;

/// Whether a [`PatchError`] should abort the operation that produced it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// A non-fatal anomaly; the session's last-error field records it but
    /// processing continues.
    Warning,
    /// A fatal condition; the session (or the modification) must stop.
    Error,
}

/// The category groupings of spec.md §7, used to keep related codes
/// together without inventing a type per code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Category {
    /// Session/engine state is missing or inconsistent.
    Structural,
    /// The moved-block planner could not find room for something.
    Planning,
    /// Symbol, label, or library resolution failed.
    Resolution,
    /// Instruction encoding failed or would change unexpectedly.
    Encoding,
}

/// The open enumeration of error/warning codes.
///
/// Every variant names its category in its doc comment rather than via a
/// type parameter; `category()` and `severity()` recover that information
/// for callers (e.g. the sticky-overwrite rule in [`Diagnostics`]).
#[derive(Debug, Clone, Error)]
pub enum PatchError {
    /// Structural: a session method was called before `Session::init`
    /// completed, or was called again after `finalise`/`free`.
    #[error("patch session is not initialised")]
    SessionNotInitialised,

    /// Structural: a modification id does not refer to a live modification.
    #[error("no such modification: {0}")]
    MissingModification(ModifId),

    /// Structural: the asmfile handed to `Session::init` carries no
    /// sections, or is otherwise unusable.
    #[error("asmfile is missing or empty")]
    MissingAsmFile,

    /// Structural: no `ArchDriver` is registered for the requested
    /// architecture.
    #[error("unknown architecture: {0}")]
    ArchUnknown(String),

    /// Planning: basic-block discovery could not find a well-formed block
    /// enclosing the anchor instruction.
    #[error("no basic block could be found enclosing {0}")]
    BasicBlockNotFound(InsnId),

    /// Planning: the caller's insertion payload does not fit even in the
    /// largest jump encoding the architecture offers.
    #[error("insertion at {0} is too large to ever fit")]
    InsufficientSizeForInsert(InsnId),

    /// Planning: no free, adequately reachable interval exists for a moved
    /// block.
    #[error("no space found for moved block enclosing {0}")]
    NoSpaceForBlock(InsnId),

    /// Planning: no free interval exists for a new section (code or data).
    #[error("no space found for a new section of {0} bytes")]
    NoSpaceForSection(u32),

    /// Planning: no free interval exists for an inserted global variable.
    #[error("no space found for global variable {0:?}")]
    NoSpaceForGlobalVar(crate::entities::VarId),

    /// Planning: a floating modification (not anchored to any instruction
    /// or chained from another modification) has no successor to attach
    /// to.
    #[error("floating modification {0} has no successor")]
    FloatingModifNoSuccessor(ModifId),

    /// Resolution: an `insert-fct` modification named a callee that was
    /// never registered as internal, static, or dynamic.
    #[error("function {0:?} was never inserted")]
    FunctionNotInserted(AnyEntity),

    /// Resolution: an external symbol could not be found in the host file,
    /// any inserted object, or any linked static library.
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// Resolution: a symbol remained unresolved after all resolution
    /// tiers and could not be promoted to an external-dynamic stub.
    #[error("unresolved symbol: {0}")]
    UnresolvedSymbol(String),

    /// Resolution: a label insertion failed (name collision, no target).
    #[error("label insertion failed: {0}")]
    LabelInsertFailure(String),

    /// Resolution: the binfile back end refused to register a relocation.
    #[error("relocation could not be added at {0}")]
    RelocationNotAdded(InsnId),

    /// Encoding: a patched-instruction lookup referenced an instruction
    /// that does not exist (anymore).
    #[error("instruction not found: {0}")]
    InstructionNotFound(InsnId),

    /// Encoding: re-encoding an instruction produced a different length
    /// than the architectural maximum promised, after exhausting the
    /// fixpoint's recursion budget.
    #[error("size of {0} kept changing and did not converge")]
    SizeWouldChange(InsnId),

    /// Encoding: the binfile back end could not supply the bytes of a
    /// referenced data entry.
    #[error("could not retrieve bytes for data entry {0:?}")]
    ErrorRetrievingDataBytes(crate::entities::DataId),

    /// Encoding: a moved block's installed jump encodes longer than the
    /// original instruction span it overwrites. The planner's flavor
    /// selection and trampoline search should have prevented this before
    /// emission ever saw it, so this only fires on a genuine planning
    /// invariant violation.
    #[error("jump installed at {0} overflows the original block it overwrites")]
    JumpOverflowsOriginalBlock(InsnId),

    /// Warning: a symbol requested as internal/static ended up registered
    /// as an external dynamic stub instead.
    #[error("symbol {0} was added as external")]
    SymbolAddedAsExternal(String),

    /// Warning: `MOVEFCTS` caused an entire function to be relocated.
    #[error("function enclosing {0} was moved")]
    FunctionMoved(InsnId),

    /// Warning: a moved function contains an indirect branch whose target
    /// table could not be proven exhaustive.
    #[error("moved function enclosing {0} has an indirect branch")]
    MovedFunctionHasIndirectBranch(InsnId),

    /// Warning: `FORCEINSERT` accepted a block that was smaller than the
    /// chosen jump's encoding.
    #[error("insertion at {0} was forced despite insufficient size")]
    SizeTooSmallForcedInsert(InsnId),

    /// Warning: a modification was never lowered (its processing was
    /// skipped because an earlier, dependent modification failed).
    #[error("modification {0} was not processed")]
    ModifNotProcessed(ModifId),

    /// Warning: the output path was unusable and a default name was
    /// substituted.
    #[error("file saved with default name instead of requested path")]
    FileSavedWithDefaultName,

    /// Warning: the fixpoint did not naturally converge and the
    /// widest-encoding fallback (spec.md §9 Open Question 3) was used.
    #[error("fixpoint forced to widest encodings after {0} passes")]
    FixpointForcedWidest(u32),
}

impl PatchError {
    /// The category this code belongs to, per spec.md §7.
    pub fn category(&self) -> Category {
        use PatchError::*;
        match self {
            SessionNotInitialised | MissingModification(_) | MissingAsmFile | ArchUnknown(_) => {
                Category::Structural
            }
            BasicBlockNotFound(_)
            | InsufficientSizeForInsert(_)
            | NoSpaceForBlock(_)
            | NoSpaceForSection(_)
            | NoSpaceForGlobalVar(_)
            | FloatingModifNoSuccessor(_) => Category::Planning,
            FunctionNotInserted(_)
            | SymbolNotFound(_)
            | UnresolvedSymbol(_)
            | LabelInsertFailure(_)
            | RelocationNotAdded(_) => Category::Resolution,
            InstructionNotFound(_)
            | SizeWouldChange(_)
            | ErrorRetrievingDataBytes(_)
            | JumpOverflowsOriginalBlock(_) => Category::Encoding,
            SymbolAddedAsExternal(_)
            | FunctionMoved(_)
            | MovedFunctionHasIndirectBranch(_)
            | SizeTooSmallForcedInsert(_)
            | ModifNotProcessed(_)
            | FileSavedWithDefaultName
            | FixpointForcedWidest(_) => Category::Structural,
        }
    }

    /// Whether this code should abort the operation that produced it.
    pub fn severity(&self) -> Severity {
        use PatchError::*;
        match self {
            SymbolAddedAsExternal(_)
            | FunctionMoved(_)
            | MovedFunctionHasIndirectBranch(_)
            | SizeTooSmallForcedInsert(_)
            | ModifNotProcessed(_)
            | FileSavedWithDefaultName
            | FixpointForcedWidest(_) => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

/// Sticky last-error slot plus a running warning count, shared by
/// [`crate::session::Session`] and each
/// [`crate::modification::Modification`].
///
/// The merge rule (spec.md §7): "last-error takes the new code only if the
/// new code is not success *and* the current code is not already an
/// error". Warnings accumulate silently in `warning_count` in addition to
/// occupying the sticky slot, so a later error doesn't erase the fact that
/// warnings happened.
#[derive(Debug, Default)]
pub struct Diagnostics {
    last: Option<PatchError>,
    warning_count: u32,
}

impl Diagnostics {
    /// A fresh diagnostics channel with no recorded errors or warnings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err`, applying the sticky-overwrite rule, and return it
    /// unchanged for the caller's own propagation needs.
    pub fn record(&mut self, err: PatchError) -> PatchError {
        if err.severity() == Severity::Warning {
            self.warning_count += 1;
        }
        let should_overwrite = match &self.last {
            None => true,
            Some(current) => current.severity() != Severity::Error,
        };
        if should_overwrite {
            self.last = Some(err.clone());
        }
        err
    }

    /// The most recently recorded code that survived the overwrite rule,
    /// if any.
    pub fn last_error(&self) -> Option<&PatchError> {
        self.last.as_ref()
    }

    /// Total number of warning-severity codes recorded, including ones
    /// later shadowed in `last_error` by an error-severity code.
    pub fn warning_count(&self) -> u32 {
        self.warning_count
    }

    /// True if the sticky slot currently holds an error (not a warning and
    /// not empty).
    pub fn has_error(&self) -> bool {
        matches!(&self.last, Some(e) if e.severity() == Severity::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_does_not_overwrite_error() {
        let mut diag = Diagnostics::new();
        diag.record(PatchError::MissingAsmFile);
        assert!(diag.has_error());
        diag.record(PatchError::FileSavedWithDefaultName);
        assert!(diag.has_error(), "a warning must not clear a sticky error");
        assert_eq!(diag.warning_count(), 1);
    }

    #[test]
    fn error_overwrites_warning() {
        let mut diag = Diagnostics::new();
        diag.record(PatchError::FileSavedWithDefaultName);
        assert!(!diag.has_error());
        diag.record(PatchError::MissingAsmFile);
        assert!(diag.has_error());
    }
}
