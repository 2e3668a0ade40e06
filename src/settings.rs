//! Session-wide tunables (SPEC_FULL §1.3).
//!
//! Shaped like `cranelift_codegen::settings`'s builder-configured
//! constants, but without its string-keyed flag database: that machinery
//! exists to let `.clif` test files set arbitrary ISA flags by name,
//! which this crate has no equivalent use for. A plain builder over a
//! fixed field set is enough.

/// Tunable constants for a patch session.
#[derive(Clone, Debug)]
pub struct Settings {
    direct_jump_safety_margin: u32,
    memrel_jump_safety_margin: u32,
    fixpoint_recursion_cap: u32,
    padding_instruction: Vec<u8>,
    patcher_stack_size: u64,
    move_functions: bool,
    allow_widen_fallback: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            direct_jump_safety_margin: 0x100,
            memrel_jump_safety_margin: 0x100,
            fixpoint_recursion_cap: 16,
            padding_instruction: vec![0x90],
            patcher_stack_size: 1 << 20,
            move_functions: false,
            allow_widen_fallback: true,
        }
    }
}

impl Settings {
    /// Start a builder seeded with the defaults (spec.md §4.4/§4.6/§6/§9).
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder { settings: Settings::default() }
    }

    /// Bytes of headroom required beyond a direct jump's own encoding
    /// before the planner will choose the direct flavor (spec.md §4.4).
    pub fn direct_jump_safety_margin(&self) -> u32 {
        self.direct_jump_safety_margin
    }

    /// The memory-relative-jump analogue of
    /// [`Settings::direct_jump_safety_margin`] (SPEC_FULL §3 item 2:
    /// independently tunable).
    pub fn memrel_jump_safety_margin(&self) -> u32 {
        self.memrel_jump_safety_margin
    }

    /// Maximum address-assembly fixpoint passes before the widest-
    /// encoding fallback engages (spec.md §4.6).
    pub fn fixpoint_recursion_cap(&self) -> u32 {
        self.fixpoint_recursion_cap
    }

    /// The byte pattern the finaliser pads vacated space with (spec.md
    /// §4.7).
    pub fn padding_instruction(&self) -> &[u8] {
        &self.padding_instruction
    }

    /// Bytes allocated for a `NEWSTACK`-flagged insertion's private stack
    /// area (spec.md §6).
    pub fn patcher_stack_size(&self) -> u64 {
        self.patcher_stack_size
    }

    /// Whether `MOVEFCTS` is globally enabled by default for new
    /// modifications (spec.md §6).
    pub fn move_functions(&self) -> bool {
        self.move_functions
    }

    /// Whether the fixpoint may fall back to forcing every variable-
    /// length branch to its widest encoding (SPEC_FULL §3 item 3).
    pub fn allow_widen_fallback(&self) -> bool {
        self.allow_widen_fallback
    }
}

/// Builder for [`Settings`].
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    /// Override [`Settings::direct_jump_safety_margin`].
    pub fn direct_jump_safety_margin(mut self, bytes: u32) -> Self {
        self.settings.direct_jump_safety_margin = bytes;
        self
    }

    /// Override [`Settings::memrel_jump_safety_margin`].
    pub fn memrel_jump_safety_margin(mut self, bytes: u32) -> Self {
        self.settings.memrel_jump_safety_margin = bytes;
        self
    }

    /// Override [`Settings::fixpoint_recursion_cap`].
    pub fn fixpoint_recursion_cap(mut self, passes: u32) -> Self {
        self.settings.fixpoint_recursion_cap = passes;
        self
    }

    /// Override [`Settings::padding_instruction`].
    pub fn padding_instruction(mut self, bytes: Vec<u8>) -> Self {
        self.settings.padding_instruction = bytes;
        self
    }

    /// Override [`Settings::patcher_stack_size`].
    pub fn patcher_stack_size(mut self, bytes: u64) -> Self {
        self.settings.patcher_stack_size = bytes;
        self
    }

    /// Override [`Settings::move_functions`].
    pub fn move_functions(mut self, enabled: bool) -> Self {
        self.settings.move_functions = enabled;
        self
    }

    /// Override [`Settings::allow_widen_fallback`].
    pub fn allow_widen_fallback(mut self, enabled: bool) -> Self {
        self.settings.allow_widen_fallback = enabled;
        self
    }

    /// Finish building.
    pub fn build(self) -> Settings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let s = Settings::default();
        assert_eq!(s.direct_jump_safety_margin(), 0x100);
        assert_eq!(s.fixpoint_recursion_cap(), 16);
        assert!(s.allow_widen_fallback());
        assert!(!s.move_functions());
    }

    #[test]
    fn builder_overrides_individual_fields() {
        let s = Settings::builder().move_functions(true).fixpoint_recursion_cap(4).build();
        assert!(s.move_functions());
        assert_eq!(s.fixpoint_recursion_cap(), 4);
        assert_eq!(s.direct_jump_safety_margin(), 0x100);
    }
}
