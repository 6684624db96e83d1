// diff.rs — Replacement diff engine
//
// Compares freshly computed per-source batches with the workspace's record
// of the previous sources and the live replacement slots, and emits the
// patch that turns one into the other:
//
//   1. No-op: zero sources before and after → no patches, unless leftover
//      filler is still live, which is deleted.
//   2. Walk sources in order; a source is patched in place while its
//      identity, prop bindings, replacement count, and live slots are
//      unchanged. Per item, unlinked replacements with comparable state
//      emit `updateStateVariables`; a lone replacement whose type changed
//      is swapped in its own slot.
//   3. The first source that fails (1) forces a recreate of itself and of
//      every later source: one `add` spanning from its first slot to the
//      end of the list.
//   4. If no recreate happened and sources were dropped, trailing spans are
//      deleted or withheld according to the shrink policy.
//
// Preconditions: `live` lists the composite's materialized replacements in
//                order, withheld trailing entries included.
// Postconditions: applying the patches yields the fresh type/shadow
//                 sequence; the workspace records the new sources.
// Failure modes: none.
// Side effects: updates `ws.sources` and identifier scopes of recreated
//               sources.

use std::collections::BTreeMap;

use tracing::trace;

use crate::composite::{SourceBatch, SourceRecord, Workspace};
use crate::id::ComponentIdx;
use crate::patch::ReplacementChange;
use crate::serialized::SerializedComponent;
use crate::value::Value;

/// What happens to trailing replacements when sources disappear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShrinkPolicy {
    Delete,
    /// Keep them materialized but hidden; a later regrow re-shows them.
    Withhold,
}

/// A materialized replacement slot as the diff engine sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSlot {
    pub component: ComponentIdx,
    /// False when the slot's component was removed from the tree.
    pub alive: bool,
    pub component_type: String,
    pub shadow_target: Option<(ComponentIdx, Option<String>)>,
    pub state: BTreeMap<String, Value>,
}

impl LiveSlot {
    pub fn dead(component: ComponentIdx) -> Self {
        Self {
            component,
            alive: false,
            component_type: String::new(),
            shadow_target: None,
            state: BTreeMap::new(),
        }
    }
}

/// Emit the patches that bring `live` in line with `fresh`.
pub fn replacement_changes(
    ws: &mut Workspace,
    live: &[LiveSlot],
    withheld: usize,
    mut fresh: Vec<SourceBatch>,
    policy: ShrinkPolicy,
) -> Vec<ReplacementChange> {
    if ws.sources.is_empty() && fresh.is_empty() {
        // Anything still live is leftover verification filler.
        if live.is_empty() {
            return Vec::new();
        }
        ws.identifiers.clear();
        return vec![ReplacementChange::Delete {
            change_top_level_replacements: true,
            first_replacement_ind: 0,
            number_replacements_to_delete: live.len(),
            replacements_to_withhold: (withheld > 0).then_some(0),
        }];
    }

    let previous_total = ws.total_replacements();
    let fresh_total: usize = fresh.iter().map(|b| b.replacements.len()).sum();

    let mut changes = Vec::new();
    let mut recreate_from: Option<usize> = None;
    let mut offset = 0usize;

    for (i, batch) in fresh.iter_mut().enumerate() {
        let Some(prev) = ws.sources.get(i) else {
            recreate_from = Some(i);
            break;
        };
        let count = prev.count;
        let lone = previous_total == 1 && fresh_total == 1;
        match patch_in_place(prev, batch, live, offset, lone) {
            Some(InPlace { changes: mut source_changes, swapped }) => {
                trace!(source = %batch.identity, changes = source_changes.len(), "patched in place");
                if swapped {
                    // The whole list is this one replacement.
                    ws.identifiers.clear();
                    ws.assign_fresh(batch);
                    ws.sources[i] = batch.record();
                    source_changes = vec![ReplacementChange::add(offset, 1, batch.replacements.clone())];
                }
                changes.append(&mut source_changes);
            }
            None => {
                trace!(source = %batch.identity, "recreating from source");
                recreate_from = Some(i);
                break;
            }
        }
        offset += count;
    }

    match recreate_from {
        Some(r) => {
            let first: usize = ws.sources[..r.min(ws.sources.len())]
                .iter()
                .map(|s| s.count)
                .sum();
            ws.retain_identifiers(r);
            ws.sources.truncate(r);
            let mut replacements = Vec::new();
            for mut batch in fresh.into_iter().skip(r) {
                ws.assign_fresh(&mut batch);
                ws.sources.push(batch.record());
                replacements.extend(batch.replacements);
            }
            changes.push(ReplacementChange::Add {
                change_top_level_replacements: true,
                first_replacement_ind: first,
                number_replacements_to_replace: live.len().saturating_sub(first),
                serialized_replacements: replacements,
                replacements_to_withhold: (withheld > 0).then_some(0),
            });
        }
        None if fresh.len() < ws.sources.len() => {
            let kept: usize = ws.sources[..fresh.len()].iter().map(|s| s.count).sum();
            let trailing = live.len().saturating_sub(kept);
            match policy {
                ShrinkPolicy::Delete => {
                    changes.push(ReplacementChange::Delete {
                        change_top_level_replacements: true,
                        first_replacement_ind: kept,
                        number_replacements_to_delete: trailing,
                        replacements_to_withhold: (withheld > 0).then_some(0),
                    });
                    ws.retain_identifiers(fresh.len());
                    ws.sources.truncate(fresh.len());
                }
                ShrinkPolicy::Withhold => {
                    if trailing != withheld {
                        changes.push(ReplacementChange::withhold(trailing));
                    }
                }
            }
        }
        None => {
            if withheld > 0 {
                changes.push(ReplacementChange::withhold(0));
            }
        }
    }
    changes
}

struct InPlace {
    changes: Vec<ReplacementChange>,
    /// The source's lone replacement changed type and must be swapped in
    /// its slot.
    swapped: bool,
}

/// Patches for one unchanged source, or `None` if it must be recreated.
fn patch_in_place(
    prev: &SourceRecord,
    batch: &SourceBatch,
    live: &[LiveSlot],
    offset: usize,
    lone: bool,
) -> Option<InPlace> {
    if prev.identity != batch.identity
        || prev.prop_variables != batch.prop_variables
        || prev.count != batch.replacements.len()
    {
        return None;
    }
    let slots = live.get(offset..offset + prev.count)?;
    if slots.iter().any(|s| !s.alive) {
        return None;
    }

    let mut changes = Vec::new();
    for (slot, fresh) in slots.iter().zip(&batch.replacements) {
        if slot.component_type != fresh.component_type || slot.shadow_target != fresh.shadow_target() {
            // A lone replacement keeps its slot when only its type moved.
            if lone {
                return Some(InPlace {
                    changes: Vec::new(),
                    swapped: true,
                });
            }
            return None;
        }
        if batch.compare_state && !fresh.is_linked() {
            let state_changes = state_changes(&slot.state, fresh);
            if !state_changes.is_empty() {
                changes.push(ReplacementChange::update(slot.component, state_changes));
            }
        }
    }
    Some(InPlace { changes, swapped: false })
}

fn state_changes(live: &BTreeMap<String, Value>, fresh: &SerializedComponent) -> BTreeMap<String, Value> {
    fresh
        .state
        .iter()
        .filter(|(k, v)| !matches!(live.get(*k), Some(old) if old.same_as(v)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SourceIdentity;
    use crate::serialized::ShadowRecord;

    fn slot(c: u32, t: &str) -> LiveSlot {
        LiveSlot {
            component: ComponentIdx(c),
            alive: true,
            component_type: t.to_string(),
            shadow_target: None,
            state: BTreeMap::new(),
        }
    }

    fn number_slot(c: u32, v: f64) -> LiveSlot {
        let mut s = slot(c, "number");
        s.state.insert("value".into(), Value::Number(v));
        s
    }

    fn leaf_batch(i: usize, types: &[&str]) -> SourceBatch {
        let mut b = SourceBatch::new(SourceIdentity::Index(i));
        b.replacements = types
            .iter()
            .map(|t| SerializedComponent::new(*t).with_identifier(format!("s:{}", i)))
            .collect();
        b
    }

    fn value_batch(i: usize, v: f64) -> SourceBatch {
        let mut b = SourceBatch::new(SourceIdentity::Index(i));
        b.compare_state = true;
        b.replacements = vec![SerializedComponent::new("number")
            .with_identifier(format!("s:{}", i))
            .with_state("value", Value::Number(v))];
        b
    }

    fn workspace(batches: &[SourceBatch]) -> Workspace {
        Workspace {
            sources: batches.iter().map(SourceBatch::record).collect(),
            ..Workspace::default()
        }
    }

    #[test]
    fn zero_sources_stay_silent() {
        let mut ws = Workspace::default();
        let changes = replacement_changes(&mut ws, &[], 0, vec![], ShrinkPolicy::Delete);
        assert!(changes.is_empty());
    }

    #[test]
    fn unchanged_sources_emit_nothing() {
        let batches = vec![leaf_batch(0, &["number"]), leaf_batch(1, &["text"])];
        let mut ws = workspace(&batches);
        let live = vec![slot(10, "number"), slot(11, "text")];
        let changes = replacement_changes(&mut ws, &live, 0, batches, ShrinkPolicy::Delete);
        assert!(changes.is_empty());
    }

    #[test]
    fn value_change_updates_in_place() {
        let mut ws = workspace(&[value_batch(0, 3.0)]);
        let live = vec![number_slot(7, 3.0)];
        let changes = replacement_changes(&mut ws, &live, 0, vec![value_batch(0, 5.0)], ShrinkPolicy::Withhold);
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            ReplacementChange::UpdateStateVariables { component, state_changes } => {
                assert_eq!(*component, ComponentIdx(7));
                assert_eq!(state_changes["value"], Value::Number(5.0));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn count_change_cascades_to_later_sources() {
        let before = vec![
            leaf_batch(0, &["number"]),
            leaf_batch(1, &["number", "number"]),
            leaf_batch(2, &["number"]),
        ];
        let mut ws = workspace(&before);
        let live: Vec<LiveSlot> = (0..4).map(|c| slot(c, "number")).collect();
        let after = vec![
            leaf_batch(0, &["number"]),
            leaf_batch(1, &["number", "number", "number"]),
            leaf_batch(2, &["number"]),
        ];
        let changes = replacement_changes(&mut ws, &live, 0, after, ShrinkPolicy::Delete);
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            ReplacementChange::Add {
                first_replacement_ind,
                number_replacements_to_replace,
                serialized_replacements,
                ..
            } => {
                assert_eq!(*first_replacement_ind, 1);
                assert_eq!(*number_replacements_to_replace, 3);
                assert_eq!(serialized_replacements.len(), 4);
            }
            other => panic!("expected add, got {other:?}"),
        }
        assert_eq!(
            ws.sources.iter().map(|s| s.count).collect::<Vec<_>>(),
            vec![1, 3, 1]
        );
    }

    #[test]
    fn identity_change_recreates() {
        let mut ws = workspace(&[leaf_batch(0, &["number"])]);
        let live = vec![slot(3, "number")];
        let changes = replacement_changes(&mut ws, &live, 0, vec![leaf_batch(5, &["number"])], ShrinkPolicy::Delete);
        assert!(matches!(
            changes[0],
            ReplacementChange::Add { first_replacement_ind: 0, number_replacements_to_replace: 1, .. }
        ));
    }

    #[test]
    fn missing_slot_recreates() {
        let before = vec![leaf_batch(0, &["number"]), leaf_batch(1, &["number"])];
        let mut ws = workspace(&before);
        let live = vec![slot(3, "number"), LiveSlot::dead(ComponentIdx(4))];
        let changes = replacement_changes(&mut ws, &live, 0, before, ShrinkPolicy::Delete);
        assert!(matches!(
            changes[0],
            ReplacementChange::Add { first_replacement_ind: 1, number_replacements_to_replace: 1, .. }
        ));
    }

    #[test]
    fn lone_type_change_keeps_slot() {
        let mut ws = workspace(&[leaf_batch(0, &["number"])]);
        let live = vec![slot(3, "number")];
        let changes = replacement_changes(&mut ws, &live, 0, vec![leaf_batch(0, &["text"])], ShrinkPolicy::Delete);
        assert_eq!(changes, vec![ReplacementChange::add(0, 1, vec![SerializedComponent::new("text").with_identifier("s:0")])]);
    }

    #[test]
    fn lone_type_change_reassigns_its_identifier() {
        let mut ws = workspace(&[leaf_batch(0, &["number"])]);
        ws.identifiers.register("s:0");
        ws.identifiers.register("s:stale");
        let live = vec![slot(3, "number")];
        replacement_changes(&mut ws, &live, 0, vec![leaf_batch(0, &["text"])], ShrinkPolicy::Delete);
        assert!(ws.identifiers.contains("s:0"));
        assert!(!ws.identifiers.contains("s:stale"));
        assert_eq!(ws.sources[0].identifiers, vec!["s:0"]);
    }

    #[test]
    fn recreated_sources_never_reuse_kept_identifiers() {
        let mut a = SourceBatch::new(SourceIdentity::Index(0));
        a.replacements = vec![SerializedComponent::new("number").with_identifier("c:x")];
        let mut ws = Workspace::default();
        ws.assign_fresh(&mut a);
        ws.sources.push(a.record());
        let live = vec![slot(3, "number")];

        // A second source with the same base name appears.
        let mut b = SourceBatch::new(SourceIdentity::Index(1));
        b.replacements = vec![SerializedComponent::new("number").with_identifier("c:x")];
        let a_again = {
            let mut a = SourceBatch::new(SourceIdentity::Index(0));
            a.replacements = vec![SerializedComponent::new("number").with_identifier("c:x")];
            a
        };
        let changes = replacement_changes(&mut ws, &live, 0, vec![a_again, b], ShrinkPolicy::Delete);
        match &changes[0] {
            ReplacementChange::Add { serialized_replacements, .. } => {
                assert_eq!(serialized_replacements[0].unique_identifier.as_deref(), Some("c:x_1"));
            }
            other => panic!("expected add, got {other:?}"),
        }
        assert_eq!(ws.sources[1].identifiers, vec!["c:x_1"]);
    }

    #[test]
    fn leftover_filler_is_deleted() {
        let mut ws = Workspace::default();
        ws.identifiers.register("c:placeholder");
        let live = vec![slot(5, "text")];
        let changes = replacement_changes(&mut ws, &live, 0, vec![], ShrinkPolicy::Withhold);
        assert_eq!(changes, vec![ReplacementChange::delete(0, 1)]);
        assert!(ws.identifiers.is_empty());
    }

    #[test]
    fn type_change_among_many_recreates() {
        let before = vec![leaf_batch(0, &["number"]), leaf_batch(1, &["number"])];
        let mut ws = workspace(&before);
        let live = vec![slot(3, "number"), slot(4, "number")];
        let after = vec![leaf_batch(0, &["number"]), leaf_batch(1, &["text"])];
        let changes = replacement_changes(&mut ws, &live, 0, after, ShrinkPolicy::Delete);
        assert!(matches!(
            changes[0],
            ReplacementChange::Add { first_replacement_ind: 1, number_replacements_to_replace: 1, .. }
        ));
    }

    #[test]
    fn shadow_target_change_recreates() {
        let record = |source: u32| ShadowRecord {
            source: ComponentIdx(source),
            prop_variable: Some("xs[0]".into()),
            composite: ComponentIdx(1),
            is_primary_shadow: true,
        };
        let mut prev = SourceBatch::new(SourceIdentity::Component(ComponentIdx(2)));
        prev.prop_variables = vec!["xs[0]".into()];
        prev.replacements = vec![SerializedComponent::new("math").with_shadow(&record(2))];
        let mut second = prev.clone();
        second.identity = SourceIdentity::Component(ComponentIdx(3));
        second.replacements = vec![SerializedComponent::new("math").with_shadow(&record(3))];
        let mut ws = workspace(&[prev.clone(), second.clone()]);
        let mut live = vec![slot(8, "math"), slot(9, "math")];
        live[0].shadow_target = Some((ComponentIdx(2), Some("xs[0]".into())));
        live[1].shadow_target = Some((ComponentIdx(9), Some("xs[0]".into())));
        let changes = replacement_changes(&mut ws, &live, 0, vec![prev, second], ShrinkPolicy::Delete);
        assert!(matches!(
            changes[0],
            ReplacementChange::Add { first_replacement_ind: 1, .. }
        ));
    }

    #[test]
    fn shrink_deletes_or_withholds() {
        let before: Vec<SourceBatch> = (0..3).map(|i| value_batch(i, i as f64)).collect();
        let live: Vec<LiveSlot> = (0..3).map(|i| number_slot(i, i as f64)).collect();
        let after: Vec<SourceBatch> = (0..1).map(|i| value_batch(i, i as f64)).collect();

        let mut ws = workspace(&before);
        let deleted = replacement_changes(&mut ws, &live, 0, after.clone(), ShrinkPolicy::Delete);
        assert_eq!(deleted, vec![ReplacementChange::delete(1, 2)]);
        assert_eq!(ws.sources.len(), 1);

        let mut ws = workspace(&before);
        let withheld = replacement_changes(&mut ws, &live, 0, after, ShrinkPolicy::Withhold);
        assert_eq!(withheld, vec![ReplacementChange::withhold(2)]);
        assert_eq!(ws.sources.len(), 3);
    }

    #[test]
    fn regrow_within_withheld_reveals() {
        let before: Vec<SourceBatch> = (0..3).map(|i| value_batch(i, i as f64)).collect();
        let live: Vec<LiveSlot> = (0..3).map(|i| number_slot(i, i as f64)).collect();
        let mut ws = workspace(&before);
        let changes = replacement_changes(&mut ws, &live, 2, before, ShrinkPolicy::Withhold);
        assert_eq!(changes, vec![ReplacementChange::withhold(0)]);
    }

    #[test]
    fn growth_appends_after_last_slot() {
        let before = vec![value_batch(0, 1.0)];
        let live = vec![number_slot(4, 1.0)];
        let mut ws = workspace(&before);
        let after = vec![value_batch(0, 1.0), value_batch(1, 2.0)];
        let changes = replacement_changes(&mut ws, &live, 0, after, ShrinkPolicy::Withhold);
        assert!(matches!(
            &changes[0],
            ReplacementChange::Add { first_replacement_ind: 1, number_replacements_to_replace: 0, serialized_replacements, .. }
                if serialized_replacements.len() == 1
        ));
        assert_eq!(ws.sources.len(), 2);
    }
}
