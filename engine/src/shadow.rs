// shadow.rs — Shadow linkage and reference-cycle detection
//
// A linked replacement is a structural replica of its source in which every
// node carries a shadow record naming the node it mirrors. Reads of
// essential state on a replica forward to the source; writes forward the
// same way (see `state`). Unlinked replicas instead snapshot the source's
// current essential values into `state` and stay independent.
//
// Composite nodes inside a copied subtree are copied as definitions so
// they re-expand on their own; linked ones keep a shadow record as
// provenance.
//
// Preconditions: `source` is live.
// Postconditions: identifiers below the root are `{parent}/{child}`.
// Failure modes: subtrees deeper than `max_shadow_depth` →
//                `CircularDependency`.
// Side effects: none.

use std::collections::BTreeSet;

use crate::composite::CompositeKind;
use crate::document::{Attribute, Document};
use crate::error::{ExpandError, Result};
use crate::id::ComponentIdx;
use crate::registry;
use crate::serialized::{AttributeValue, SerializedComponent, ShadowRecord};
use crate::value::Value;

// ── Linked replicas ─────────────────────────────────────────────────────────

/// Replica of `source` whose every node shadows its counterpart.
pub fn serialize_linked(
    doc: &Document,
    source: ComponentIdx,
    composite: ComponentIdx,
    base: &str,
) -> Result<SerializedComponent> {
    linked(doc, source, composite, base, true, 0)
}

fn linked(
    doc: &Document,
    source: ComponentIdx,
    composite: ComponentIdx,
    id: &str,
    primary: bool,
    depth: usize,
) -> Result<SerializedComponent> {
    check_depth(doc, source, depth)?;
    let comp = doc.component(source)?;
    let record = ShadowRecord {
        source,
        prop_variable: None,
        composite,
        is_primary_shadow: primary,
    };
    let mut out = SerializedComponent::new(comp.component_type.as_str())
        .with_identifier(id)
        .with_shadow(&record);

    let is_composite = comp.composite.is_some();
    for (name, attr) in &comp.attributes {
        let value = match attr {
            Attribute::Primitive(v) => AttributeValue::Primitive(v.clone()),
            Attribute::Component(c) if is_composite => AttributeValue::Component(Box::new(
                with_identifier(doc.to_serialized(*c)?, &child_id(doc, id, *c)),
            )),
            Attribute::Component(c) => AttributeValue::Component(Box::new(linked(
                doc,
                *c,
                composite,
                &child_id(doc, id, *c),
                false,
                depth + 1,
            )?)),
        };
        out.attributes.insert(name.clone(), value);
    }
    for &child in &comp.children {
        out.children
            .push(linked(doc, child, composite, &child_id(doc, id, child), false, depth + 1)?);
    }
    Ok(out)
}

// ── Unlinked replicas ───────────────────────────────────────────────────────

/// Independent replica of `source` holding its current essential values.
pub fn serialize_unlinked(doc: &Document, source: ComponentIdx, base: &str) -> Result<SerializedComponent> {
    unlinked(doc, source, base, 0)
}

fn unlinked(doc: &Document, source: ComponentIdx, id: &str, depth: usize) -> Result<SerializedComponent> {
    check_depth(doc, source, depth)?;
    let comp = doc.component(source)?;
    if comp.composite.is_some() {
        let mut def = doc.to_serialized(source)?;
        def.downstream_dependencies.clear();
        return Ok(with_identifier(def, id));
    }

    let info = registry::info(&comp.component_type);
    let mut out = SerializedComponent::new(comp.component_type.as_str()).with_identifier(id);
    let mut vars: Vec<&str> = info.essential.to_vec();
    if info.primary != "text" && !vars.contains(&info.primary) {
        vars.push(info.primary);
    }
    for var in vars {
        match doc.state_value(source, var)? {
            Value::Absent => {}
            v => {
                out.state.insert(var.to_string(), v);
            }
        }
    }

    for (name, attr) in &comp.attributes {
        let value = match attr {
            Attribute::Primitive(v) => AttributeValue::Primitive(v.clone()),
            Attribute::Component(c) => {
                AttributeValue::Component(Box::new(unlinked(doc, *c, &child_id(doc, id, *c), depth + 1)?))
            }
        };
        out.attributes.insert(name.clone(), value);
    }
    for &child in &comp.children {
        out.children.push(unlinked(doc, child, &child_id(doc, id, child), depth + 1)?);
    }
    Ok(out)
}

fn child_id(doc: &Document, parent_id: &str, child: ComponentIdx) -> String {
    format!("{}/{}", parent_id, doc.identifier(child))
}

/// Rename the root of a definition, prefixing nested identifiers with it.
fn with_identifier(mut def: SerializedComponent, id: &str) -> SerializedComponent {
    fn prefix(node: &mut SerializedComponent, id: &str) {
        for attr in node.attributes.values_mut() {
            if let AttributeValue::Component(c) = attr {
                rename(c, id);
            }
        }
        for child in &mut node.children {
            rename(child, id);
        }
    }
    fn rename(node: &mut SerializedComponent, parent: &str) {
        let own = match &node.unique_identifier {
            Some(uid) => format!("{}/{}", parent, uid),
            None => format!("{}/_{}", parent, node.component_type),
        };
        node.unique_identifier = Some(own.clone());
        prefix(node, &own);
    }
    def.unique_identifier = Some(id.to_string());
    prefix(&mut def, id);
    def
}

fn check_depth(doc: &Document, source: ComponentIdx, depth: usize) -> Result<()> {
    if depth > doc.options().max_shadow_depth {
        return Err(ExpandError::CircularDependency {
            component: source,
            state_variable: "children".into(),
        });
    }
    Ok(())
}

// ── Cycle detection ─────────────────────────────────────────────────────────

/// Whether copying `target` into `composite` would make the composite
/// (transitively) contain a copy of itself.
///
/// The ancestor set of the composite is its parent chain plus, for every
/// ancestor that shadows something, the shadowed source and its own
/// ancestors. The target chain is followed through copies of copies.
/// Walks that exceed `max_shadow_depth` count as cycles.
pub fn detect_cycle(doc: &Document, composite: ComponentIdx, target: ComponentIdx) -> bool {
    if target == composite {
        return true;
    }
    let max = doc.options().max_shadow_depth;
    let Some(ancestors) = ancestors(doc, composite, max) else {
        return true;
    };
    if ancestors.contains(&target) {
        return true;
    }

    let mut current = target;
    for _ in 0..max {
        let Some(next) = copy_target(doc, current) else {
            return false;
        };
        if next == composite || ancestors.contains(&next) {
            return true;
        }
        current = next;
    }
    true
}

fn ancestors(doc: &Document, composite: ComponentIdx, max: usize) -> Option<BTreeSet<ComponentIdx>> {
    let mut set = BTreeSet::new();
    let mut work: Vec<(ComponentIdx, usize)> = doc
        .get(composite)
        .and_then(|c| c.parent)
        .map(|p| vec![(p, 0)])
        .unwrap_or_default();
    while let Some((c, hops)) = work.pop() {
        if !set.insert(c) {
            continue;
        }
        let Some(comp) = doc.get(c) else {
            continue;
        };
        if let Some(p) = comp.parent {
            work.push((p, hops));
        }
        if let Some(shadow) = comp.shadow.as_ref().filter(|s| doc.contains(s.source)) {
            if hops + 1 > max {
                return None;
            }
            work.push((shadow.source, hops + 1));
        }
    }
    Some(set)
}

/// The component a copy named by `idx` currently targets.
fn copy_target(doc: &Document, idx: ComponentIdx) -> Option<ComponentIdx> {
    let comp = doc.get(idx)?;
    if comp.composite.as_ref()?.kind != CompositeKind::Copy {
        return None;
    }
    match comp.attributes.get("target")? {
        Attribute::Primitive(Value::Text(name)) => doc.lookup(name.trim()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;

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

    fn doc(children: Vec<SerializedComponent>) -> Document {
        let mut root = SerializedComponent::new("document");
        root.children = children;
        Document::from_serialized(root, EngineOptions::default()).unwrap()
    }

    #[test]
    fn linked_replica_shadows_every_node() {
        let mut p = SerializedComponent::new("p").with_identifier("p1");
        p.children = vec![number("a", 1.0), number("b", 2.0)];
        let d = doc(vec![p]);
        let p1 = d.lookup("p1").unwrap();
        let ser = serialize_linked(&d, p1, ComponentIdx(9), "c:p1").unwrap();
        assert_eq!(ser.unique_identifier.as_deref(), Some("c:p1"));
        let root = ser.shadow_record().unwrap();
        assert!(root.is_primary_shadow);
        assert_eq!(root.source, p1);
        assert_eq!(ser.children.len(), 2);
        assert_eq!(ser.children[0].unique_identifier.as_deref(), Some("c:p1/a"));
        let child = ser.children[1].shadow_record().unwrap();
        assert!(!child.is_primary_shadow);
        assert_eq!(child.source, d.lookup("b").unwrap());
        assert!(ser.children[0].state.is_empty());
    }

    #[test]
    fn unlinked_replica_snapshots_values() {
        let d = doc(vec![number("a", 4.0)]);
        let a = d.lookup("a").unwrap();
        let ser = serialize_unlinked(&d, a, "c:a").unwrap();
        assert!(!ser.is_linked());
        assert_eq!(ser.state["value"], Value::Number(4.0));
    }

    #[test]
    fn nested_composites_are_copied_as_definitions() {
        let mut g = SerializedComponent::new("group").with_identifier("g");
        g.children = vec![number("n", 1.0), copy_of("inner", "n")];
        let d = doc(vec![g]);
        let g = d.lookup("g").unwrap();
        let ser = serialize_unlinked(&d, g, "c:g").unwrap();
        let inner = &ser.children[1];
        assert_eq!(inner.component_type, "copy");
        assert_eq!(inner.unique_identifier.as_deref(), Some("c:g/inner"));
        assert_eq!(inner.primitive_attribute("target"), Some(&Value::Text("n".into())));
    }

    #[test]
    fn self_and_ancestor_targets_are_cycles() {
        let mut g = SerializedComponent::new("group").with_identifier("g");
        g.children = vec![copy_of("c", "g")];
        let d = doc(vec![g, number("n", 1.0), copy_of("self", "self")]);
        let c = d.lookup("c").unwrap();
        assert!(detect_cycle(&d, c, d.lookup("g").unwrap()));
        assert!(!detect_cycle(&d, c, d.lookup("n").unwrap()));
        let s = d.lookup("self").unwrap();
        assert!(detect_cycle(&d, s, s));
    }

    #[test]
    fn copy_chains_are_followed() {
        // a copies b, b copies a.
        let d = doc(vec![copy_of("a", "b"), copy_of("b", "a"), copy_of("x", "a")]);
        let a = d.lookup("a").unwrap();
        let b = d.lookup("b").unwrap();
        assert!(detect_cycle(&d, a, b));
        let x = d.lookup("x").unwrap();
        // x → a → b → a never reaches x, but the chain never ends either.
        assert!(detect_cycle(&d, x, a));
    }
}
