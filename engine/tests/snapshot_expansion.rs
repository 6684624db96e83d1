// Snapshot tests: lock the effective tree and emitted patches of small
// documents to detect unintended changes in expansion output.
//
// Uses the library API (from_serialized → expand → update) and snapshots the
// rendered tree or the Display form of each patch. Snapshots are inline and
// managed by `insta`.
//
// Run `cargo insta review` after intentional output changes to update baselines.

use cexp::serialized::SerializedComponent;
use cexp::value::Value;
use cexp::{Document, EngineOptions, ExpansionReport};

fn number(name: &str, v: f64) -> SerializedComponent {
    SerializedComponent::new("number")
        .with_identifier(name)
        .with_state("value", Value::Number(v))
}

fn copy_of(name: &str, target: &str) -> SerializedComponent {
    SerializedComponent::new("copy")
        .with_identifier(name)
        .with_attribute("target", Value::Text(target.into()))
}

fn point(name: &str, xs: &[f64]) -> SerializedComponent {
    SerializedComponent::new("point")
        .with_identifier(name)
        .with_attribute("xs", Value::List(xs.iter().map(|&x| Value::Number(x)).collect()))
}

fn expanded(children: Vec<SerializedComponent>) -> Document {
    let mut root = SerializedComponent::new("document");
    root.children = children;
    let mut doc = Document::from_serialized(root, EngineOptions::default()).unwrap();
    doc.expand().unwrap();
    doc
}

/// One line per patch, prefixed with the composite that emitted it.
fn patch_lines(report: &ExpansionReport) -> String {
    let mut out = String::new();
    for c in &report.changes {
        for change in &c.changes {
            out.push_str(&format!("{}: {}\n", c.identifier, change));
        }
    }
    out
}

#[test]
fn snapshot_linked_copy_tree() {
    let doc = expanded(vec![number("n1", 3.0), copy_of("c1", "n1")]);
    insta::assert_snapshot!(doc.effective_tree(), @r"
    document
      number n1 = 3
      number c1:n1 = 3 <- #1
    ");
}

#[test]
fn snapshot_sequence_tree() {
    let seq = SerializedComponent::new("sequence")
        .with_identifier("s")
        .with_attribute("from", Value::Number(2.0))
        .with_attribute("length", Value::Number(3.0));
    let doc = expanded(vec![seq]);
    insta::assert_snapshot!(doc.effective_tree(), @r"
    document
      number s:1 = 2
      number s:2 = 3
      number s:3 = 4
    ");
}

#[test]
fn snapshot_cycle_placeholders() {
    let doc = expanded(vec![copy_of("c1", "c2"), copy_of("c2", "c1")]);
    insta::assert_snapshot!(doc.effective_tree(), @r"
    document
      _error c1:error = Circular dependency: <copy> c1 refers to 'c2'
      _error c2:error = Circular dependency: <copy> c2 refers to 'c1'
    ");
}

#[test]
fn snapshot_extract_cascade_patches() {
    let ex = SerializedComponent::new("extract")
        .with_identifier("ex")
        .with_attribute("prop", Value::Text("coords".into()))
        .with_child(point("A", &[1.0, 2.0]))
        .with_child(point("B", &[3.0]))
        .with_child(point("C", &[4.0, 5.0]));
    let mut doc = expanded(vec![ex]);
    insta::assert_snapshot!(patch_lines(doc.report()), @"ex: add @0 replace 0 with [math ex:A, math ex:A_1, math ex:B, math ex:C, math ex:C_1]");

    let b = doc.lookup("B").unwrap();
    doc.request_update(
        b,
        "xs",
        Value::List(vec![Value::Number(3.0), Value::Number(6.0)]),
    )
    .unwrap();
    let report = doc.update().unwrap();
    insta::assert_snapshot!(patch_lines(&report), @"ex: add @2 replace 3 with [math ex:B, math ex:B_1, math ex:C, math ex:C_1]");
}

#[test]
fn snapshot_sequence_state_patches() {
    let seq = SerializedComponent::new("sequence")
        .with_identifier("s")
        .with_attribute("from", copy_of("f", "n1"))
        .with_attribute("length", Value::Number(3.0));
    let mut doc = expanded(vec![number("n1", 3.0), seq]);
    let n1 = doc.lookup("n1").unwrap();
    doc.request_update(n1, "value", Value::Number(5.0)).unwrap();
    let report = doc.update().unwrap();
    // n1 #1, s #2, f #3, f's replica #4, entries #5..#7
    insta::assert_snapshot!(patch_lines(&report), @r"
    s: update #5 {value=5}
    s: update #6 {value=6}
    s: update #7 {value=7}
    ");
}

#[test]
fn snapshot_withhold_json() {
    let seq = SerializedComponent::new("sequence").with_identifier("s").with_attribute(
        "length",
        number("len", 4.0),
    );
    let mut doc = expanded(vec![seq]);
    let s = doc.lookup("s").unwrap();
    let len = doc.lookup("len").unwrap();
    doc.request_update(len, "value", Value::Number(2.0)).unwrap();
    let report = doc.update().unwrap();
    insta::assert_json_snapshot!(report.changes_for(s), @r#"
    [
      {
        "changeType": "changeReplacementsToWithhold",
        "replacementsToWithhold": 2
      }
    ]
    "#);
}
