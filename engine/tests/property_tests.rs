// Property-based tests for expansion invariants.
//
// Four categories:
// 1. Resizing: any sequence of length changes keeps the active replacement
//    count equal to the length, and never replaces a surviving entry
// 2. Patch replay: patches emitted by `update` transform the previous list
//    into what a full re-creation produces
// 3. Verification: a declared type/count constraint holds after expansion
//    and after every update
// 4. Identifier assignment: generated identifiers are unique and stable,
//    both from one scope and across every composite's replacements
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use cexp::id::{assign_unique_identifier, ComponentIdx, UsedIdentifiers};
use cexp::patch::{self, PatchEntry, ReplacementChange, ReplacementList};
use cexp::serialized::SerializedComponent;
use cexp::value::Value;
use cexp::{Document, EngineOptions};
use proptest::prelude::*;
use std::collections::BTreeSet;

// ── Test helpers ────────────────────────────────────────────────────────────

fn sequence_doc(length: usize) -> Document {
    let seq = SerializedComponent::new("sequence")
        .with_identifier("s")
        .with_attribute(
            "length",
            SerializedComponent::new("number")
                .with_identifier("len")
                .with_state("value", Value::Number(length as f64)),
        );
    let root = SerializedComponent::new("document")
        .with_child(seq)
        .with_child(
            SerializedComponent::new("copy")
                .with_identifier("c")
                .with_attribute("target", Value::Text("s".into())),
        );
    let mut doc = Document::from_serialized(root, EngineOptions::default()).unwrap();
    doc.expand().unwrap();
    doc
}

fn extract_doc(sizes: &[usize]) -> Document {
    let mut ex = SerializedComponent::new("extract")
        .with_identifier("ex")
        .with_attribute("prop", Value::Text("coords".into()));
    for (i, &n) in sizes.iter().enumerate() {
        ex = ex.with_child(
            SerializedComponent::new("point")
                .with_identifier(format!("P{}", i))
                .with_attribute("xs", Value::List((0..n).map(|k| Value::Number(k as f64)).collect())),
        );
    }
    let root = SerializedComponent::new("document").with_child(ex);
    let mut doc = Document::from_serialized(root, EngineOptions::default()).unwrap();
    doc.expand().unwrap();
    doc
}

fn constrained_extract_doc(sizes: &[usize], ty: &str, count: usize) -> Document {
    let mut ex = SerializedComponent::new("extract")
        .with_identifier("ex")
        .with_attribute("prop", Value::Text("coords".into()))
        .with_attribute("createComponentOfType", Value::Text(ty.into()))
        .with_attribute("numComponents", Value::Number(count as f64));
    for (i, &n) in sizes.iter().enumerate() {
        ex = ex.with_child(
            SerializedComponent::new("point")
                .with_identifier(format!("P{}", i))
                .with_attribute("xs", Value::List((0..n).map(|k| Value::Number(k as f64)).collect())),
        );
    }
    let root = SerializedComponent::new("document").with_child(ex);
    let mut doc = Document::from_serialized(root, EngineOptions::default()).unwrap();
    doc.expand().unwrap();
    doc
}

fn active_types(doc: &Document, c: ComponentIdx) -> Vec<String> {
    active(doc, c)
        .into_iter()
        .map(|r| doc.to_serialized(r).unwrap().component_type)
        .collect()
}

const NAMES: [&str; 3] = ["x", "y", "z"];

/// Shuffle, extract and copies whose sources share names and whose
/// `sourceIndex` repeats entries.
fn naming_doc(names: &[usize], picks: &[usize], length: usize) -> Document {
    let picks = picks
        .iter()
        .map(|p| (p % names.len() + 1).to_string())
        .collect::<Vec<_>>()
        .join(" ");
    let mut sh = SerializedComponent::new("shuffle").with_identifier("sh");
    let mut ex = SerializedComponent::new("extract")
        .with_identifier("ex")
        .with_attribute("prop", Value::Text("coords".into()));
    for (i, &n) in names.iter().enumerate() {
        sh = sh.with_child(
            SerializedComponent::new("number")
                .with_identifier(NAMES[n])
                .with_state("value", Value::Number(i as f64)),
        );
        ex = ex.with_child(
            SerializedComponent::new("point")
                .with_identifier(NAMES[n])
                .with_attribute("xs", Value::List(vec![Value::Number(i as f64), Value::Number(0.0)])),
        );
    }
    let seq = SerializedComponent::new("sequence").with_identifier("s").with_attribute(
        "length",
        SerializedComponent::new("number")
            .with_identifier("len")
            .with_state("value", Value::Number(length as f64)),
    );
    let copy = |name: &str, target: &str| {
        SerializedComponent::new("copy")
            .with_identifier(name)
            .with_attribute("target", Value::Text(target.into()))
            .with_attribute("sourceIndex", Value::Text(picks.clone()))
    };
    let root = SerializedComponent::new("document")
        .with_child(sh)
        .with_child(ex)
        .with_child(seq)
        .with_child(copy("c", "sh"))
        .with_child(copy("cs", "s"))
        .with_child(copy("cc", "c"));
    let mut doc = Document::from_serialized(root, EngineOptions::default()).unwrap();
    doc.expand().unwrap();
    doc
}

/// Identifiers that occur more than once among one composite's
/// replacement subtrees, withheld entries included.
fn duplicate_identifiers(doc: &Document) -> Vec<String> {
    let mut dupes = Vec::new();
    for c in doc.composites() {
        let mut seen = BTreeSet::new();
        for &r in doc.replacements(c).unwrap() {
            for id in doc.to_serialized(r).unwrap().identifiers() {
                if !seen.insert(id.clone()) {
                    dupes.push(id);
                }
            }
        }
    }
    dupes
}

fn active(doc: &Document, c: ComponentIdx) -> Vec<ComponentIdx> {
    let all = doc.replacements(c).unwrap();
    let n = all.len() - doc.replacements_to_withhold(c).unwrap();
    all[..n].to_vec()
}

fn mirror(doc: &Document, c: ComponentIdx) -> ReplacementList {
    ReplacementList {
        entries: doc
            .replacements(c)
            .unwrap()
            .iter()
            .map(|&r| PatchEntry {
                component: Some(r),
                serialized: doc.to_serialized(r).unwrap(),
            })
            .collect(),
        withheld: doc.replacements_to_withhold(c).unwrap(),
    }
}

type Shape = (String, Option<(ComponentIdx, Option<String>)>, Option<Value>);

fn shape(items: &[SerializedComponent]) -> Vec<Shape> {
    items
        .iter()
        .map(|r| {
            (
                r.component_type.clone(),
                r.shadow_target(),
                r.state.get("value").cloned(),
            )
        })
        .collect()
}

// ── Resizing ────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        ..ProptestConfig::default()
    })]

    /// The sequence shows exactly `length` entries after every resize, and
    /// an entry that stays visible keeps its component.
    #[test]
    fn resize_keeps_count_and_identity(
        initial in 0usize..8,
        lengths in prop::collection::vec(0usize..8, 1..6),
    ) {
        let mut doc = sequence_doc(initial);
        let s = doc.lookup("s").unwrap();
        let c = doc.lookup("c").unwrap();
        let len = doc.lookup("len").unwrap();

        for &n in &lengths {
            let before = active(&doc, s);
            doc.request_update(len, "value", Value::Number(n as f64)).unwrap();
            let report = doc.update().unwrap();
            prop_assert!(!report.has_errors());

            let after = active(&doc, s);
            prop_assert_eq!(after.len(), n);
            let kept = before.len().min(n);
            prop_assert_eq!(&after[..kept], &before[..kept]);

            // The copy mirrors exactly the visible entries.
            prop_assert_eq!(doc.replacements(c).unwrap().len(), n);
            prop_assert_eq!(doc.replacements_to_withhold(c).unwrap(), 0);
        }
    }

    /// Sequence resizes never delete: shrinking only withholds.
    #[test]
    fn sequence_never_deletes(
        initial in 1usize..8,
        smaller in 0usize..8,
    ) {
        let smaller = smaller.min(initial);
        let mut doc = sequence_doc(initial);
        let s = doc.lookup("s").unwrap();
        let len = doc.lookup("len").unwrap();
        doc.request_update(len, "value", Value::Number(smaller as f64)).unwrap();
        let report = doc.update().unwrap();
        let deletes = report
            .changes_for(s)
            .into_iter()
            .filter(|c| matches!(c, ReplacementChange::Delete { .. }))
            .count();
        prop_assert_eq!(deletes, 0);
        prop_assert_eq!(doc.replacements(s).unwrap().len(), initial);
    }
}

// ── Patch replay ────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        ..ProptestConfig::default()
    })]

    /// Replaying one update's patches on the previous list yields the list
    /// a full re-creation produces.
    #[test]
    fn extract_patches_replay(
        sizes in prop::collection::vec(0usize..4, 1..6),
        pick in 0usize..6,
        new_size in 0usize..4,
    ) {
        let mut doc = extract_doc(&sizes);
        let ex = doc.lookup("ex").unwrap();
        let point = doc.lookup(&format!("P{}", pick % sizes.len())).unwrap();
        let mut list = mirror(&doc, ex);

        let xs = Value::List((0..new_size).map(|k| Value::Number(10.0 + k as f64)).collect());
        doc.request_update(point, "xs", xs).unwrap();
        let report = doc.update().unwrap();
        let changes: Vec<ReplacementChange> = report.changes_for(ex).into_iter().cloned().collect();
        patch::apply_changes(&mut list, &changes).unwrap();

        let fresh = doc.create_serialized_replacements(ex).unwrap().replacements;
        prop_assert_eq!(shape(&list.active_serialized()), shape(&fresh));
        prop_assert_eq!(active(&doc, ex).len(), fresh.len());
    }

    /// The same holds for sequence resizes, whose patches mix withholding,
    /// appends and state updates.
    #[test]
    fn sequence_patches_replay(
        initial in 0usize..8,
        next in 0usize..8,
    ) {
        let mut doc = sequence_doc(initial);
        let s = doc.lookup("s").unwrap();
        let len = doc.lookup("len").unwrap();
        let mut list = mirror(&doc, s);

        doc.request_update(len, "value", Value::Number(next as f64)).unwrap();
        let report = doc.update().unwrap();
        let changes: Vec<ReplacementChange> = report.changes_for(s).into_iter().cloned().collect();
        patch::apply_changes(&mut list, &changes).unwrap();

        let fresh = doc.create_serialized_replacements(s).unwrap().replacements;
        prop_assert_eq!(shape(&list.active_serialized()), shape(&fresh));
    }
}

// ── Verification ────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        ..ProptestConfig::default()
    })]

    /// With `createComponentOfType`/`numComponents` declared, the visible
    /// replacements are exactly `numComponents` components of that type,
    /// whatever the sources produce.
    #[test]
    fn constraint_holds_across_updates(
        sizes in prop::collection::vec(0usize..4, 1..5),
        ty in prop_oneof![Just("math"), Just("number")],
        count in 1usize..5,
        pick in 0usize..5,
        new_size in 0usize..4,
    ) {
        let mut doc = constrained_extract_doc(&sizes, ty, count);
        let ex = doc.lookup("ex").unwrap();
        prop_assert_eq!(active_types(&doc, ex), vec![ty.to_string(); count]);

        let point = doc.lookup(&format!("P{}", pick % sizes.len())).unwrap();
        let xs = Value::List((0..new_size).map(|k| Value::Number(k as f64)).collect());
        doc.request_update(point, "xs", xs).unwrap();
        let report = doc.update().unwrap();
        prop_assert!(!report.has_errors());
        prop_assert_eq!(active_types(&doc, ex), vec![ty.to_string(); count]);
    }
}

// ── Identifier assignment ───────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    /// Every composite's replacement identifiers stay pairwise distinct
    /// after expansion and after each update, even with repeated sources
    /// and shared names.
    #[test]
    fn composite_identifiers_never_collide(
        names in prop::collection::vec(0usize..3, 1..5),
        picks in prop::collection::vec(0usize..5, 1..5),
        initial in 0usize..5,
        lengths in prop::collection::vec(0usize..5, 1..4),
    ) {
        let mut doc = naming_doc(&names, &picks, initial);
        prop_assert_eq!(duplicate_identifiers(&doc), Vec::<String>::new());

        let len = doc.lookup("len").unwrap();
        for &n in &lengths {
            doc.request_update(len, "value", Value::Number(n as f64)).unwrap();
            let report = doc.update().unwrap();
            prop_assert!(!report.has_errors());
            prop_assert_eq!(duplicate_identifiers(&doc), Vec::<String>::new());
        }
    }

    /// Identifiers drawn from one scope never collide, and replaying the
    /// same requests on a fresh scope reproduces them.
    #[test]
    fn identifiers_are_unique_and_reproducible(
        bases in prop::collection::vec(prop_oneof![Just("a"), Just("b"), Just("c:n1"), Just("a_1")], 0..24),
    ) {
        let run = || {
            let mut used = UsedIdentifiers::new();
            bases
                .iter()
                .map(|b| assign_unique_identifier(b, &mut used))
                .collect::<Vec<_>>()
        };
        let first = run();
        let mut sorted = first.clone();
        sorted.sort();
        sorted.dedup();
        prop_assert_eq!(sorted.len(), first.len());
        prop_assert_eq!(first, run());
    }
}
