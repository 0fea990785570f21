//! Undefined-variable handling policy (spec §4.3 "Rendering rules").
//!
//! The spec asks for `work` to render permissively and `task` to render
//! strictly while leaving unresolved variables visible as literal
//! placeholders. minijinja's `UndefinedBehavior` gives us the first two
//! directly; the third ("remains as literal placeholder") has no built-in
//! per-variable partial-substitution mode, so [`UndefinedPolicy::KeepLiteral`]
//! is implemented at whole-leaf granularity: a leaf string either renders
//! fully or falls back to its original unrendered text (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndefinedPolicy {
    /// Undefined variables are a hard error (`template_rendering`).
    Strict,
    /// Undefined variables render as an empty string.
    Lenient,
    /// Undefined variables cause the whole leaf to fall back to its
    /// original, unrendered template text.
    KeepLiteral,
}
