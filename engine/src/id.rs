// id.rs — Stable identifiers for components and replacements
//
// Two kinds of identity live here. `ComponentIdx` is the arena slot of a
// materialized component; it is allocated monotonically and never reused
// within one document, so a stale index is always detectable. Unique
// identifiers are the string names given to serialized replacements; they
// are derived from a base string plus a disambiguating counter, scoped per
// composite; sources kept across an update retain theirs.
//
// Preconditions: none.
// Postconditions: `assign_unique_identifier` never returns a string already
//                 present in the used set it was given.
// Failure modes: none.
// Side effects: registers returned identifiers in the caller's used set.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Arena index of a materialized component.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ComponentIdx(pub u32);

impl fmt::Display for ComponentIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Allocator for arena indices. Produces monotonically increasing indices in
/// allocation order, so materialization order fully determines identity.
#[derive(Debug, Default, Clone)]
pub struct IdAllocator {
    next_component: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_component(&mut self) -> ComponentIdx {
        let id = ComponentIdx(self.next_component);
        self.next_component += 1;
        id
    }

    /// Number of indices handed out so far.
    pub fn allocated(&self) -> u32 {
        self.next_component
    }
}

// ── Identity of a logical replacement source ───────────────────────────────

/// What a group of replacements was produced from.
///
/// Copies and extracts produce one group per source component; list-builders
/// produce one group per index. The diff engine compares these across
/// recomputations to decide whether a group can be patched in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceIdentity {
    Component(ComponentIdx),
    Index(usize),
    /// A source slot whose target could not be found.
    Missing,
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceIdentity::Component(idx) => write!(f, "{}", idx),
            SourceIdentity::Index(i) => write!(f, "[{}]", i),
            SourceIdentity::Missing => write!(f, "missing"),
        }
    }
}

// ── Unique identifier assignment ───────────────────────────────────────────

/// Identifiers already handed out within one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsedIdentifiers {
    used: BTreeSet<String>,
}

impl UsedIdentifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.used.contains(id)
    }

    /// Record an identifier that was produced elsewhere (e.g. retained from a
    /// previous expansion).
    pub fn register(&mut self, id: impl Into<String>) {
        self.used.insert(id.into());
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    pub fn clear(&mut self) {
        self.used.clear();
    }
}

/// Produce a collision-free identifier from `base`.
///
/// Returns `base` itself when unused. Otherwise appends `_n` for the smallest
/// `n >= 1` not yet taken; the bare base counts as index 0. The result is
/// registered in `used`.
pub fn assign_unique_identifier(base: &str, used: &mut UsedIdentifiers) -> String {
    if !used.contains(base) {
        used.register(base);
        return base.to_string();
    }
    let mut n = 1usize;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !used.contains(&candidate) {
            used.register(candidate.clone());
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_is_monotonic() {
        let mut alloc = IdAllocator::new();
        assert_eq!(alloc.alloc_component(), ComponentIdx(0));
        assert_eq!(alloc.alloc_component(), ComponentIdx(1));
        assert_eq!(alloc.allocated(), 2);
    }

    #[test]
    fn base_returned_unchanged_when_unused() {
        let mut used = UsedIdentifiers::new();
        assert_eq!(assign_unique_identifier("c1:n1", &mut used), "c1:n1");
        assert!(used.contains("c1:n1"));
    }

    #[test]
    fn suffix_is_smallest_free_integer() {
        let mut used = UsedIdentifiers::new();
        assert_eq!(assign_unique_identifier("a", &mut used), "a");
        assert_eq!(assign_unique_identifier("a", &mut used), "a_1");
        assert_eq!(assign_unique_identifier("a", &mut used), "a_2");

        let mut gap = UsedIdentifiers::new();
        gap.register("a");
        gap.register("a_2");
        assert_eq!(assign_unique_identifier("a", &mut gap), "a_1");
        assert_eq!(assign_unique_identifier("a", &mut gap), "a_3");
    }

    #[test]
    fn empty_scope_reproduces_sequence() {
        let run = || {
            let mut used = UsedIdentifiers::new();
            (0..4)
                .map(|_| assign_unique_identifier("s:x", &mut used))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn source_identity_display() {
        assert_eq!(SourceIdentity::Component(ComponentIdx(4)).to_string(), "#4");
        assert_eq!(SourceIdentity::Index(2).to_string(), "[2]");
        assert_eq!(SourceIdentity::Missing.to_string(), "missing");
    }
}
