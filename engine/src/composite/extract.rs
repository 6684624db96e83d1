// composite/extract.rs — <extract prop="...">children</extract>
//
// Projects each effective child through `prop`: one replacement per child
// for scalar variables, one per addressed entry for array variables.

use crate::document::{Document, ResolutionKind, ResolutionRequest};
use crate::error::{ExpandError, Result};
use crate::id::ComponentIdx;
use crate::state::{Dependency, DependencySet};

use super::copy::array_var;
use super::{bool_attribute, index_attribute, pending_composites, project_prop, text_attribute, Batches};

const ATTRIBUTES: &[&str] = &["prop", "propIndex", "link", "createComponentOfType", "numComponents"];

pub fn declared_dependencies(doc: &Document, idx: ComponentIdx) -> Result<DependencySet> {
    let mut deps: DependencySet = vec![("children".into(), Dependency::Children)];
    for &name in ATTRIBUTES {
        deps.push((name.into(), Dependency::Attribute { name: name.into() }));
    }
    if let Some(prop) = text_attribute(doc, idx, "prop")? {
        for child in doc.effective_children(idx) {
            if let Some(var) = array_var(doc, child, &prop)? {
                deps.push((
                    format!("size{}", child),
                    Dependency::ArraySize { component: child, var },
                ));
            }
        }
    }
    Ok(deps)
}

pub fn resolution_requests(doc: &Document, idx: ComponentIdx) -> Vec<ResolutionRequest> {
    let Some(comp) = doc.get(idx) else {
        return Vec::new();
    };
    let mut requests: Vec<ResolutionRequest> = pending_composites(doc, &comp.children)
        .into_iter()
        .map(|c| ResolutionRequest {
            component: c,
            kind: ResolutionKind::RecalculateDownstreamComponents,
            state_variable: "children".into(),
            dependency: "children".into(),
        })
        .collect();
    requests.extend(doc.effective_children(idx).into_iter().map(|c| ResolutionRequest {
        component: c,
        kind: ResolutionKind::DetermineDependencies,
        state_variable: "prop".into(),
        dependency: "propSource".into(),
    }));
    requests
}

pub fn batches(doc: &Document, idx: ComponentIdx, uid: &str) -> Result<Batches> {
    let prop = text_attribute(doc, idx, "prop")?.ok_or_else(|| ExpandError::MissingAttribute {
        component_type: "extract".into(),
        attribute: "prop".into(),
    })?;
    let mut out = Batches::default();
    let link = bool_attribute(doc, idx, "link", true)?;
    let prop_index = index_attribute(doc, idx, "propIndex", &mut out.diagnostics)?;
    for child in doc.effective_children(idx) {
        let base = format!("{}:{}", uid, doc.identifier(child));
        let batch = project_prop(doc, idx, child, &base, &prop, &prop_index, link, &mut out)?;
        out.sources.push(batch);
    }
    Ok(out)
}
