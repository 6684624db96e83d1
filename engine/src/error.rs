//! Error types for expansion and update operations.
//!
//! Composite-local problems (missing props, cycles in a single source) are
//! reported as [`Diagnostic`](crate::diag::Diagnostic)s next to a best-effort
//! result. The errors here abort the current `expand`/`update` call entirely.

use thiserror::Error;

use crate::id::ComponentIdx;

/// Errors that abort an expansion or recomputation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExpandError {
    // =========================================================================
    // RESOLUTION ERRORS
    // =========================================================================
    /// The dependency engine could not resolve a determine-dependencies step.
    #[error("Could not resolve {state_variable} of {component}: {message}")]
    Resolution {
        /// Component whose dependency failed to resolve.
        component: ComponentIdx,
        /// State variable (or dependency) being resolved.
        state_variable: String,
        /// Description of the failure.
        message: String,
    },

    /// A component index no longer refers to a live component.
    #[error("Component {0} does not exist")]
    UnknownComponent(ComponentIdx),

    /// Resolution requests kept coming back unresolved.
    #[error("Composite {component} still has unresolved dependencies after {rounds} rounds")]
    UnresolvedRequests {
        component: ComponentIdx,
        rounds: usize,
    },

    /// State evaluation exceeded the shadow-depth bound.
    #[error("Circular dependency evaluating {state_variable} of {component}")]
    CircularDependency {
        component: ComponentIdx,
        state_variable: String,
    },

    /// Recomputations kept triggering further recomputations.
    #[error("Update did not settle after {rounds} rounds")]
    UpdateDidNotSettle { rounds: usize },

    /// A patch does not fit the replacement list it is applied to.
    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// Attribute combination the composite cannot honor.
    #[error("Invalid attribute combination on <{component_type}>: {message}")]
    InvalidAttributeCombination {
        component_type: String,
        message: String,
    },

    /// Attribute the composite requires is absent.
    #[error("<{component_type}> requires attribute '{attribute}'")]
    MissingAttribute {
        component_type: String,
        attribute: String,
    },

    // =========================================================================
    // WRAPPED ERRORS
    // =========================================================================
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for expansion operations.
pub type Result<T> = std::result::Result<T, ExpandError>;

impl ExpandError {
    pub fn resolution(
        component: ComponentIdx,
        state_variable: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Resolution {
            component,
            state_variable: state_variable.into(),
            message: message.into(),
        }
    }

    /// Configuration errors are surfaced in place of the composite's output
    /// instead of aborting the whole document.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidAttributeCombination { .. } | Self::MissingAttribute { .. }
        )
    }

    /// Get a user-friendly suggestion for fixing this error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::InvalidAttributeCombination { .. } => {
                Some("Specify createComponentOfType whenever numComponents is given.")
            }
            Self::MissingAttribute { .. } => Some("Add the missing attribute to the composite."),
            Self::CircularDependency { .. } => {
                Some("Check that no copy targets itself or one of its ancestors.")
            }
            _ => None,
        }
    }
}
