// composite/copy.rs — <copy target="name" [prop] [link] [sourceIndex] ...>
//
// Replicates the named target. A composite target contributes its
// effective replacements as separate sources; anything else is a single
// source. With `prop`, each source is projected through that public
// variable instead of being replicated whole.
//
// Preconditions: the target (and anything it expands into) is expanded.
// Postconditions: one batch per selected source, in source order.
// Failure modes: none beyond evaluation errors; a missing target is a
//                warning with zero sources, a cycle a single error batch.
// Side effects: none.

use crate::array;
use crate::diag::{codes, Diagnostic};
use crate::document::{Document, ResolutionKind, ResolutionRequest};
use crate::error::Result;
use crate::id::{ComponentIdx, SourceIdentity};
use crate::registry::{self, AliasResolution};
use crate::shadow;
use crate::state::{Dependency, DependencySet};
use crate::value::Value;

use super::{
    bool_attribute, cycle_batch, index_attribute, pending_composites, project_prop,
    text_attribute, Batches, SourceBatch,
};

const ATTRIBUTES: &[&str] = &[
    "link",
    "prop",
    "propIndex",
    "sourceIndex",
    "assignNames",
    "createComponentOfType",
    "numComponents",
];

fn target(doc: &Document, idx: ComponentIdx) -> Result<Option<(String, Option<ComponentIdx>)>> {
    Ok(text_attribute(doc, idx, "target")?.map(|name| {
        let found = doc.lookup(&name);
        (name, found)
    }))
}

/// Components a target contributes as sources.
fn sources(doc: &Document, target: ComponentIdx) -> Vec<ComponentIdx> {
    match doc.get(target) {
        Some(c) if c.composite.is_some() => doc.effective_replacements(target),
        Some(_) => vec![target],
        None => Vec::new(),
    }
}

pub fn declared_dependencies(doc: &Document, idx: ComponentIdx) -> Result<DependencySet> {
    let mut deps: DependencySet = Vec::new();
    let target = target(doc, idx)?;
    if let Some((name, _)) = &target {
        deps.push(("target".into(), Dependency::Target { name: name.clone() }));
    }
    for &name in ATTRIBUTES {
        deps.push((name.into(), Dependency::Attribute { name: name.into() }));
    }

    let Some((_, Some(t))) = target else {
        return Ok(deps);
    };
    if doc.component(t)?.composite.is_some() {
        deps.push(("replacements".into(), Dependency::Replacements { composite: t }));
    }
    if let Some(prop) = text_attribute(doc, idx, "prop")? {
        for s in sources(doc, t) {
            if let Some(var) = array_var(doc, s, &prop)? {
                deps.push((
                    format!("size{}", s),
                    Dependency::ArraySize { component: s, var },
                ));
            }
        }
    }
    Ok(deps)
}

/// Name of the array variable `prop` projects through on `source`, if any.
pub(super) fn array_var(doc: &Document, source: ComponentIdx, prop: &str) -> Result<Option<String>> {
    let ctype = &doc.component(source)?.component_type;
    let Some(AliasResolution::Found(canonical)) =
        registry::public_case_insensitive_alias_substitutions(&[prop], ctype).pop()
    else {
        return Ok(None);
    };
    let var = array::VarRef::parse(&canonical).name;
    Ok(array::array_variable(ctype, &var).map(|_| var))
}

pub fn resolution_requests(doc: &Document, idx: ComponentIdx) -> Vec<ResolutionRequest> {
    let Ok(Some((_, Some(t)))) = target(doc, idx) else {
        return Vec::new();
    };
    if shadow::detect_cycle(doc, idx, t) {
        return Vec::new();
    }
    let mut requests: Vec<ResolutionRequest> = pending_composites(doc, &[t])
        .into_iter()
        .map(|c| ResolutionRequest {
            component: c,
            kind: ResolutionKind::RecalculateDownstreamComponents,
            state_variable: "replacements".into(),
            dependency: "target".into(),
        })
        .collect();
    if let Ok(Some(prop)) = text_attribute(doc, idx, "prop") {
        requests.extend(sources(doc, t).into_iter().map(|s| ResolutionRequest {
            component: s,
            kind: ResolutionKind::DetermineDependencies,
            state_variable: prop.clone(),
            dependency: "propSource".into(),
        }));
    }
    requests
}

pub fn batches(doc: &Document, idx: ComponentIdx, uid: &str) -> Result<Batches> {
    let mut out = Batches::default();
    let (name, found) = match target(doc, idx)? {
        Some(t) => t,
        None => {
            out.diagnostics.push(
                Diagnostic::warning(format!("<copy> {} has no target", uid))
                    .with_code(codes::W0303)
                    .at(idx),
            );
            return Ok(out);
        }
    };
    let Some(t) = found else {
        out.diagnostics.push(
            Diagnostic::warning(format!("target '{}' of <copy> {} names no component", name, uid))
                .with_code(codes::W0303)
                .at(idx),
        );
        return Ok(out);
    };
    if shadow::detect_cycle(doc, idx, t) {
        let message = format!("Circular dependency: <copy> {} refers to '{}'", uid, name);
        let batch = cycle_batch(idx, uid, SourceIdentity::Component(t), message, &mut out.diagnostics);
        out.sources.push(batch);
        return Ok(out);
    }

    let link = bool_attribute(doc, idx, "link", true)?;
    let prop = text_attribute(doc, idx, "prop")?;
    let prop_index = index_attribute(doc, idx, "propIndex", &mut out.diagnostics)?;
    let source_index = index_attribute(doc, idx, "sourceIndex", &mut out.diagnostics)?;

    let all = sources(doc, t);
    let selected: Vec<ComponentIdx> = if source_index.is_empty() {
        all
    } else {
        let mut picked = Vec::with_capacity(source_index.len());
        for i in source_index {
            match all.get(i) {
                Some(&s) => picked.push(s),
                None => out.diagnostics.push(
                    Diagnostic::warning(format!(
                        "sourceIndex {} is outside the {} sources of '{}'",
                        i + 1,
                        all.len(),
                        name
                    ))
                    .with_code(codes::W0304)
                    .at(idx),
                ),
            }
        }
        picked
    };

    for s in selected {
        let base = format!("{}:{}", uid, doc.identifier(s));
        let batch = match &prop {
            Some(p) => project_prop(doc, idx, s, &base, p, &prop_index, link, &mut out)?,
            None => {
                let replacement = if link {
                    shadow::serialize_linked(doc, s, idx, &base)?
                } else {
                    shadow::serialize_unlinked(doc, s, &base)?
                };
                let mut batch = SourceBatch::new(SourceIdentity::Component(s));
                batch.replacements.push(replacement);
                batch
            }
        };
        out.sources.push(batch);
    }

    assign_names(doc, idx, &mut out)?;
    Ok(out)
}

/// Override the root identifiers of the replacements, in order.
fn assign_names(doc: &Document, idx: ComponentIdx, out: &mut Batches) -> Result<()> {
    let names: Vec<String> = match doc.attribute_value(idx, "assignNames")? {
        Value::Absent => return Ok(()),
        Value::List(items) => items.iter().map(Value::to_text).collect(),
        other => other.to_text().split_whitespace().map(str::to_string).collect(),
    };
    let total: usize = out.sources.iter().map(|b| b.replacements.len()).sum();
    if names.len() > total {
        out.diagnostics.push(
            Diagnostic::warning(format!(
                "assignNames lists {} names for {} replacements",
                names.len(),
                total
            ))
            .with_code(codes::W0302)
            .at(idx),
        );
    }
    let mut names = names.into_iter();
    for batch in &mut out.sources {
        for r in &mut batch.replacements {
            match names.next() {
                Some(n) => r.unique_identifier = Some(n),
                None => return Ok(()),
            }
        }
    }
    Ok(())
}
