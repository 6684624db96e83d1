// composite/shuffle.rs — <shuffle>children</shuffle>
//
// Linked replicas of the effective children in a permuted order. The
// permutation is drawn from the document's variant seed mixed with the
// shuffle's identifier, so it is stable across recomputations and
// differs between shuffles in one document.

use crate::document::{Document, ResolutionKind, ResolutionRequest};
use crate::error::Result;
use crate::id::{ComponentIdx, SourceIdentity};
use crate::rng;
use crate::shadow;
use crate::state::{Dependency, DependencySet};

use super::{pending_composites, Batches, SourceBatch};

pub fn declared_dependencies() -> DependencySet {
    vec![
        ("children".into(), Dependency::Children),
        (
            "variantSeed".into(),
            Dependency::External {
                name: "variantSeed".into(),
            },
        ),
        (
            "createComponentOfType".into(),
            Dependency::Attribute {
                name: "createComponentOfType".into(),
            },
        ),
        (
            "numComponents".into(),
            Dependency::Attribute {
                name: "numComponents".into(),
            },
        ),
    ]
}

pub fn resolution_requests(doc: &Document, idx: ComponentIdx) -> Vec<ResolutionRequest> {
    let Some(comp) = doc.get(idx) else {
        return Vec::new();
    };
    pending_composites(doc, &comp.children)
        .into_iter()
        .map(|c| ResolutionRequest {
            component: c,
            kind: ResolutionKind::RecalculateDownstreamComponents,
            state_variable: "children".into(),
            dependency: "children".into(),
        })
        .collect()
}

pub fn batches(doc: &Document, idx: ComponentIdx, uid: &str) -> Result<Batches> {
    let children = doc.effective_children(idx);
    let seed = format!("{}|{}", doc.options().variant_seed, uid);
    let mut out = Batches::default();
    for i in rng::permutation(&seed, children.len()) {
        let child = children[i];
        let base = format!("{}:{}", uid, doc.identifier(child));
        let mut batch = SourceBatch::new(SourceIdentity::Component(child));
        batch
            .replacements
            .push(shadow::serialize_linked(doc, child, idx, &base)?);
        out.sources.push(batch);
    }
    Ok(out)
}
