// diag.rs — Diagnostics collected alongside expansion results
//
// Composite-local operations never throw for soft problems; they return a
// best-effort result plus the diagnostics below. Errors here are the
// non-fatal kind (cycle placeholders, configuration placeholders); fatal
// resolution failures are `ExpandError`s instead.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::Serialize;

use crate::id::ComponentIdx;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0101`, `W0301`).
///
/// Codes are `&'static str` constants defined in the `codes` module. Once
/// assigned, a code keeps its meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// `numComponents` given without `createComponentOfType`.
    pub const E0101: DiagCode = DiagCode("E0101");
    /// Required attribute missing (e.g. `extract` without `prop`).
    pub const E0102: DiagCode = DiagCode("E0102");
    /// Copy/extract resolves to itself or an ancestor.
    pub const E0201: DiagCode = DiagCode("E0201");
    /// Requested prop is not a public state variable of the source.
    pub const W0301: DiagCode = DiagCode("W0301");
    /// `assignNames` has more names than replacements.
    pub const W0302: DiagCode = DiagCode("W0302");
    /// `target` names no component.
    pub const W0303: DiagCode = DiagCode("W0303");
    /// `sourceIndex` or `propIndex` outside the available range.
    pub const W0304: DiagCode = DiagCode("W0304");
    /// Sequence longer than `max_sequence_length`; the tail is dropped.
    pub const W0305: DiagCode = DiagCode("W0305");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted while expanding or recomputing a composite.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    /// The composite being expanded when the diagnostic was raised.
    pub component: Option<ComponentIdx>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, component, or hint.
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            component: None,
            message: message.into(),
            hint: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, message)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach the composite the diagnostic concerns.
    pub fn at(mut self, component: ComponentIdx) -> Self {
        self.component = Some(component);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(component) = &self.component {
            write!(f, " (at {})", component)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

/// Split a diagnostics list into (errors, warnings) views.
pub fn partition(diags: &[Diagnostic]) -> (Vec<&Diagnostic>, Vec<&Diagnostic>) {
    diags.iter().partition(|d| d.is_error())
}
