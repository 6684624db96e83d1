// patch.rs — Replacement patch instructions
//
// The only wire format the engine must emit faithfully:
//
//   { changeType: "add" | "delete" | "changeReplacementsToWithhold"
//                 | "updateStateVariables",
//     changeTopLevelReplacements, firstReplacementInd,
//     numberReplacementsToReplace | numberReplacementsToDelete,
//     serializedReplacements?, replacementsToWithhold? }
//
// `apply_changes` replays a patch list against an in-memory replacement
// list. The document materializer performs the same edits on the arena.
//
// Preconditions: patches were computed against the list they are applied to.
// Postconditions: on success the list reflects every change in order.
// Failure modes: out-of-range indices or unknown components → InvalidPatch.
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ExpandError, Result};
use crate::id::ComponentIdx;
use crate::serialized::SerializedComponent;
use crate::value::Value;

// ── Change instructions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "changeType", rename_all = "camelCase")]
pub enum ReplacementChange {
    #[serde(rename_all = "camelCase")]
    Add {
        change_top_level_replacements: bool,
        first_replacement_ind: usize,
        number_replacements_to_replace: usize,
        serialized_replacements: Vec<SerializedComponent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replacements_to_withhold: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        change_top_level_replacements: bool,
        first_replacement_ind: usize,
        number_replacements_to_delete: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replacements_to_withhold: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    ChangeReplacementsToWithhold { replacements_to_withhold: usize },
    #[serde(rename_all = "camelCase")]
    UpdateStateVariables {
        component: ComponentIdx,
        state_changes: BTreeMap<String, Value>,
    },
}

impl ReplacementChange {
    pub fn add(first: usize, replace: usize, replacements: Vec<SerializedComponent>) -> Self {
        ReplacementChange::Add {
            change_top_level_replacements: true,
            first_replacement_ind: first,
            number_replacements_to_replace: replace,
            serialized_replacements: replacements,
            replacements_to_withhold: None,
        }
    }

    pub fn delete(first: usize, count: usize) -> Self {
        ReplacementChange::Delete {
            change_top_level_replacements: true,
            first_replacement_ind: first,
            number_replacements_to_delete: count,
            replacements_to_withhold: None,
        }
    }

    pub fn withhold(count: usize) -> Self {
        ReplacementChange::ChangeReplacementsToWithhold {
            replacements_to_withhold: count,
        }
    }

    pub fn update(component: ComponentIdx, state_changes: BTreeMap<String, Value>) -> Self {
        ReplacementChange::UpdateStateVariables {
            component,
            state_changes,
        }
    }

    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ReplacementChange::Add { .. } | ReplacementChange::Delete { .. }
        )
    }
}

impl fmt::Display for ReplacementChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplacementChange::Add {
                first_replacement_ind,
                number_replacements_to_replace,
                serialized_replacements,
                replacements_to_withhold,
                ..
            } => {
                let items: Vec<String> = serialized_replacements
                    .iter()
                    .map(|r| match &r.unique_identifier {
                        Some(id) => format!("{} {}", r.component_type, id),
                        None => r.component_type.clone(),
                    })
                    .collect();
                write!(
                    f,
                    "add @{} replace {} with [{}]",
                    first_replacement_ind,
                    number_replacements_to_replace,
                    items.join(", ")
                )?;
                if let Some(w) = replacements_to_withhold {
                    write!(f, " withhold {}", w)?;
                }
                Ok(())
            }
            ReplacementChange::Delete {
                first_replacement_ind,
                number_replacements_to_delete,
                ..
            } => write!(
                f,
                "delete @{} count {}",
                first_replacement_ind, number_replacements_to_delete
            ),
            ReplacementChange::ChangeReplacementsToWithhold {
                replacements_to_withhold,
            } => write!(f, "withhold {}", replacements_to_withhold),
            ReplacementChange::UpdateStateVariables {
                component,
                state_changes,
            } => {
                let parts: Vec<String> = state_changes
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v.to_text()))
                    .collect();
                write!(f, "update {} {{{}}}", component, parts.join(", "))
            }
        }
    }
}

// ── In-memory replacement list ──────────────────────────────────────────────

/// One materialized (or about-to-be materialized) replacement.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchEntry {
    /// Arena slot, when the entry is already materialized.
    pub component: Option<ComponentIdx>,
    pub serialized: SerializedComponent,
}

/// A composite's replacement list as seen by the patch consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplacementList {
    pub entries: Vec<PatchEntry>,
    pub withheld: usize,
}

impl ReplacementList {
    pub fn from_serialized(replacements: Vec<SerializedComponent>) -> Self {
        Self {
            entries: replacements
                .into_iter()
                .map(|serialized| PatchEntry {
                    component: None,
                    serialized,
                })
                .collect(),
            withheld: 0,
        }
    }

    /// Entries not hidden by the withheld count.
    pub fn active(&self) -> &[PatchEntry] {
        let n = self.entries.len().saturating_sub(self.withheld);
        &self.entries[..n]
    }

    pub fn active_serialized(&self) -> Vec<SerializedComponent> {
        self.active().iter().map(|e| e.serialized.clone()).collect()
    }
}

/// Apply `changes` to `list` in order.
pub fn apply_changes(list: &mut ReplacementList, changes: &[ReplacementChange]) -> Result<()> {
    for change in changes {
        apply_change(list, change)?;
    }
    Ok(())
}

fn apply_change(list: &mut ReplacementList, change: &ReplacementChange) -> Result<()> {
    match change {
        ReplacementChange::Add {
            first_replacement_ind,
            number_replacements_to_replace,
            serialized_replacements,
            replacements_to_withhold,
            ..
        } => {
            let first = *first_replacement_ind;
            if first > list.entries.len() {
                return Err(ExpandError::InvalidPatch(format!(
                    "add at {} beyond {} replacements",
                    first,
                    list.entries.len()
                )));
            }
            let end = (first + number_replacements_to_replace).min(list.entries.len());
            let inserted = serialized_replacements.iter().cloned().map(|serialized| PatchEntry {
                component: None,
                serialized,
            });
            list.entries.splice(first..end, inserted);
            if let Some(w) = replacements_to_withhold {
                list.withheld = *w;
            }
        }
        ReplacementChange::Delete {
            first_replacement_ind,
            number_replacements_to_delete,
            replacements_to_withhold,
            ..
        } => {
            let first = *first_replacement_ind;
            let end = first + number_replacements_to_delete;
            if end > list.entries.len() {
                return Err(ExpandError::InvalidPatch(format!(
                    "delete {}..{} beyond {} replacements",
                    first,
                    end,
                    list.entries.len()
                )));
            }
            list.entries.drain(first..end);
            if let Some(w) = replacements_to_withhold {
                list.withheld = *w;
            }
        }
        ReplacementChange::ChangeReplacementsToWithhold {
            replacements_to_withhold,
        } => {
            list.withheld = *replacements_to_withhold;
        }
        ReplacementChange::UpdateStateVariables {
            component,
            state_changes,
        } => {
            let entry = list
                .entries
                .iter_mut()
                .find(|e| e.component == Some(*component))
                .ok_or_else(|| {
                    ExpandError::InvalidPatch(format!("{} is not a replacement", component))
                })?;
            for (k, v) in state_changes {
                entry.serialized.state.insert(k.clone(), v.clone());
            }
        }
    }
    if list.withheld > list.entries.len() {
        return Err(ExpandError::InvalidPatch(format!(
            "withholding {} of {} replacements",
            list.withheld,
            list.entries.len()
        )));
    }
    Ok(())
}
