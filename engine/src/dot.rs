// dot.rs — Graphviz DOT output for expanded documents
//
// Transforms a Document into DOT format suitable for rendering with `dot`.
// The structural tree is drawn top-down: children and attribute components
// with solid/dotted edges, composite replacements with blue edges (gray
// once withheld), and shadow links as dashed edges back to their sources.
//
// Preconditions: `doc` is materialized (expanded or not).
// Postconditions: returns a valid DOT string; output order is the
//                 document order, so it is deterministic.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt::Write;

use crate::document::{Attribute, Component, Document};
use crate::id::ComponentIdx;
use crate::registry;

/// Emit the document as a Graphviz DOT string.
pub fn emit_dot(doc: &Document) -> String {
    let mut buf = String::new();
    writeln!(buf, "digraph cexp {{").unwrap();
    writeln!(buf, "    rankdir=TB;").unwrap();
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();
    writeln!(buf).unwrap();

    let mut shadows = Vec::new();
    write_node(&mut buf, doc, doc.root(), &mut shadows);

    if !shadows.is_empty() {
        writeln!(buf).unwrap();
        writeln!(buf, "    // shadow links").unwrap();
    }
    for (replica, source, prop) in shadows {
        if !doc.contains(source) {
            continue;
        }
        let label = prop.map(|p| format!(", label=\"{p}\"")).unwrap_or_default();
        writeln!(
            buf,
            "    {} -> {} [style=dashed, color=gray40, constraint=false{label}];",
            node_id(replica),
            node_id(source)
        )
        .unwrap();
    }

    writeln!(buf, "}}").unwrap();
    buf
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Sanitize a label for use inside a quoted DOT string.
fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '"' | '\\' => '\'',
            '\n' | '\r' => ' ',
            c => c,
        })
        .collect()
}

fn node_id(idx: ComponentIdx) -> String {
    format!("n{}", idx.0)
}

fn node_label(doc: &Document, comp: &Component) -> String {
    let mut label = comp.component_type.clone();
    if let Some(uid) = &comp.unique_identifier {
        label.push(' ');
        label.push_str(uid);
    }
    if comp.composite.is_none() && registry::info(&comp.component_type).primary != "text" {
        if let Ok(v) = doc.state_value(comp.idx, "text") {
            label.push_str(" = ");
            label.push_str(&v.to_text());
        }
    }
    sanitize(&label)
}

fn node_attrs(doc: &Document, comp: &Component) -> String {
    let (shape, color) = if comp.component_type == "_error" {
        ("octagon", "lightpink")
    } else if comp.composite.is_some() {
        ("component", "lightyellow")
    } else if registry::info(&comp.component_type).primary == "text" {
        ("folder", "white")
    } else {
        ("box", "lightblue")
    };
    let label = node_label(doc, comp);
    format!("shape={shape}, style=filled, fillcolor={color}, label=\"{label}\"")
}

type ShadowEdge = (ComponentIdx, ComponentIdx, Option<String>);

fn write_node(buf: &mut String, doc: &Document, idx: ComponentIdx, shadows: &mut Vec<ShadowEdge>) {
    let Some(comp) = doc.get(idx) else {
        return;
    };
    writeln!(buf, "    {} [{}];", node_id(idx), node_attrs(doc, comp)).unwrap();
    if let Some(shadow) = &comp.shadow {
        shadows.push((idx, shadow.source, shadow.prop_variable.clone()));
    }

    for (name, attr) in &comp.attributes {
        if let Attribute::Component(c) = attr {
            write_node(buf, doc, *c, shadows);
            writeln!(
                buf,
                "    {} -> {} [style=dotted, label=\"{}\"];",
                node_id(idx),
                node_id(*c),
                sanitize(name)
            )
            .unwrap();
        }
    }
    for &child in &comp.children {
        if doc.contains(child) {
            write_node(buf, doc, child, shadows);
            writeln!(buf, "    {} -> {};", node_id(idx), node_id(child)).unwrap();
        }
    }
    if let Some(state) = &comp.composite {
        let active = state.active_replacements().len();
        for (i, &r) in state.replacements.iter().enumerate() {
            if !doc.contains(r) {
                continue;
            }
            write_node(buf, doc, r, shadows);
            let color = if i < active { "blue" } else { "gray70" };
            writeln!(
                buf,
                "    {} -> {} [color={color}, label=\"{i}\"];",
                node_id(idx),
                node_id(r)
            )
            .unwrap();
        }
    }
}
