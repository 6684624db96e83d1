// config.rs — Engine options
//
// Every field has a default so partial JSON files are accepted. The CLI
// layers its own overrides on top of a loaded file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineOptions {
    /// Bound on shadow-chain and target-chain walks; exceeding it is
    /// reported as a circular dependency.
    pub max_shadow_depth: usize,
    /// Bound on fixpoint rounds in `Document::update`.
    pub max_update_rounds: usize,
    /// Synthesize a placeholder when a composite produces nothing.
    pub composites_must_have_replacement: bool,
    /// Placeholder type used by the policy above.
    pub default_replacement_type: String,
    /// Length of a sequence with neither `to` nor `length`.
    pub sequence_default_length: usize,
    /// Longer sequences are clamped to this many entries.
    pub max_sequence_length: usize,
    /// Shared variant seed feeding `rng`.
    pub variant_seed: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_shadow_depth: 32,
            max_update_rounds: 16,
            composites_must_have_replacement: false,
            default_replacement_type: "text".to_string(),
            sequence_default_length: 10,
            max_sequence_length: 10_000,
            variant_seed: "0".to_string(),
        }
    }
}

impl EngineOptions {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
