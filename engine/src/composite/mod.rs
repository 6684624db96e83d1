// composite/mod.rs — The composite contract and its shared flow
//
// Every composite kind supplies three things: its declared dependencies
// (what decides a recompute), its resolution requests (what must be
// expanded or determined before its values can be read), and its per-source
// replacement batches. Everything else is shared:
//
//   create_serialized_replacements  batches → identifiers → verification
//   calculate_replacement_changes   batches → diff against live slots
//                                   (or verification fallback) → patches
//
// Kinds form a closed set dispatched by `match`, resolved once per
// component type through the registry.
//
// Preconditions: resolution requests for the composite have been satisfied.
// Postconditions: `calculate` followed by applying its patches leaves the
//                 same type/shadow sequence `create` would produce.
// Failure modes: configuration errors (`InvalidAttributeCombination`,
//                `MissingAttribute`) and resolution errors propagate.
// Side effects: mutates only the workspace passed in.

pub mod copy;
pub mod extract;
pub mod sequence;
pub mod shuffle;

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::array::{self, ArraySize, VarRef};
use crate::diag::{codes, Diagnostic};
use crate::diff::{self, LiveSlot, ShrinkPolicy};
use crate::document::{Attribute, Document, ResolutionKind, ResolutionRequest};
use crate::error::Result;
use crate::id::{ComponentIdx, SourceIdentity, UsedIdentifiers};
use crate::patch::ReplacementChange;
use crate::registry::{self, AliasResolution};
use crate::serialized::{SerializedComponent, ShadowRecord};
use crate::state::DependencySet;
use crate::value::Value;
use crate::verify::{self, TypeConstraint, VerifyOutcome};

// ── Kinds and lifecycle ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CompositeKind {
    Copy,
    Extract,
    Sequence,
    Shuffle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CompositeStatus {
    Unexpanded,
    Expanded,
    /// A declared dependency changed; replacements are recomputed on the
    /// next settle. Further triggers while stale are coalesced.
    Stale,
}

/// Private, per-composite scratch state persisted across recomputations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workspace {
    /// Logical sources behind the materialized replacements, in order.
    pub sources: Vec<SourceRecord>,
    /// Every identifier the live replacements carry, across all sources
    /// and verification wrappers.
    pub identifiers: UsedIdentifiers,
    pub recomputations: usize,
    /// The live output is an `_error` placeholder, not per-source spans.
    pub errored: bool,
    /// The live output is placeholders synthesized by verification.
    pub synthesized: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    pub identity: SourceIdentity,
    pub prop_variables: Vec<String>,
    pub count: usize,
    /// Identifiers assigned within this source's replacement subtrees.
    pub identifiers: Vec<String>,
}

impl Workspace {
    pub fn total_replacements(&self) -> usize {
        self.sources.iter().map(|s| s.count).sum()
    }

    /// Release every identifier except those of the first `keep` sources.
    /// Called before sources from `keep` onwards are recreated.
    pub(crate) fn retain_identifiers(&mut self, keep: usize) {
        self.identifiers.clear();
        for record in self.sources.iter().take(keep) {
            for id in &record.identifiers {
                self.identifiers.register(id.clone());
            }
        }
    }

    /// Assign identifiers to a batch's replacements, unique across the
    /// whole composite.
    pub(crate) fn assign_fresh(&mut self, batch: &mut SourceBatch) {
        for r in &mut batch.replacements {
            r.assign_identifiers(&mut self.identifiers);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompositeState {
    pub kind: CompositeKind,
    pub status: CompositeStatus,
    /// Materialized replacements, withheld trailing entries included.
    pub replacements: Vec<ComponentIdx>,
    pub replacements_to_withhold: usize,
    pub workspace: Workspace,
    /// Declared-dependency values at the last expansion.
    pub snapshot: Option<BTreeMap<String, Value>>,
}

impl CompositeState {
    pub fn new(kind: CompositeKind) -> Self {
        Self {
            kind,
            status: CompositeStatus::Unexpanded,
            replacements: Vec::new(),
            replacements_to_withhold: 0,
            workspace: Workspace::default(),
            snapshot: None,
        }
    }

    /// Replacements not hidden by the withheld count.
    pub fn active_replacements(&self) -> &[ComponentIdx] {
        let n = self
            .replacements
            .len()
            .saturating_sub(self.replacements_to_withhold);
        &self.replacements[..n]
    }
}

// ── Batches ─────────────────────────────────────────────────────────────────

/// Replacements produced for one logical source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch {
    pub identity: SourceIdentity,
    /// Prop variables the replacements are bound to, one per replacement
    /// for prop projections; empty otherwise.
    pub prop_variables: Vec<String>,
    pub replacements: Vec<SerializedComponent>,
    /// Compare `state` of unlinked replacements and patch it in place.
    pub compare_state: bool,
}

impl SourceBatch {
    pub fn new(identity: SourceIdentity) -> Self {
        Self {
            identity,
            prop_variables: Vec::new(),
            replacements: Vec::new(),
            compare_state: false,
        }
    }

    pub fn record(&self) -> SourceRecord {
        SourceRecord {
            identity: self.identity.clone(),
            prop_variables: self.prop_variables.clone(),
            count: self.replacements.len(),
            identifiers: self
                .replacements
                .iter()
                .flat_map(|r| r.identifiers())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Batches {
    pub sources: Vec<SourceBatch>,
    pub diagnostics: Vec<Diagnostic>,
    /// Shadow for a lone placeholder when the addressed entry is absent.
    pub shadow_hint: Option<ShadowRecord>,
}

impl Batches {
    fn replacement_types(&self) -> Vec<&str> {
        self.sources
            .iter()
            .flat_map(|b| b.replacements.iter().map(|r| r.component_type.as_str()))
            .collect()
    }
}

/// Result of a full expansion.
#[derive(Debug, Clone)]
pub struct Expansion {
    pub replacements: Vec<SerializedComponent>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Result of an incremental recomputation.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub changes: Vec<ReplacementChange>,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Dispatch ────────────────────────────────────────────────────────────────

impl CompositeKind {
    pub fn name(self) -> &'static str {
        match self {
            CompositeKind::Copy => "copy",
            CompositeKind::Extract => "extract",
            CompositeKind::Sequence => "sequence",
            CompositeKind::Shuffle => "shuffle",
        }
    }

    /// Dependencies whose values decide whether replacements are recomputed.
    pub fn declared_dependencies(self, doc: &Document, idx: ComponentIdx) -> Result<DependencySet> {
        match self {
            CompositeKind::Copy => copy::declared_dependencies(doc, idx),
            CompositeKind::Extract => extract::declared_dependencies(doc, idx),
            CompositeKind::Sequence => Ok(sequence::declared_dependencies()),
            CompositeKind::Shuffle => Ok(shuffle::declared_dependencies()),
        }
    }

    /// Items that must be resolved before the composite can read its
    /// dependency values. Re-queried after each round of resolution.
    pub fn resolution_requests(self, doc: &Document, idx: ComponentIdx) -> Vec<ResolutionRequest> {
        let mut requests = attribute_requests(doc, idx);
        requests.extend(match self {
            CompositeKind::Copy => copy::resolution_requests(doc, idx),
            CompositeKind::Extract => extract::resolution_requests(doc, idx),
            CompositeKind::Sequence => Vec::new(),
            CompositeKind::Shuffle => shuffle::resolution_requests(doc, idx),
        });
        requests
    }

    pub fn shrink_policy(self) -> ShrinkPolicy {
        match self {
            CompositeKind::Sequence => ShrinkPolicy::Withhold,
            _ => ShrinkPolicy::Delete,
        }
    }

    fn batches(self, doc: &Document, idx: ComponentIdx, uid: &str) -> Result<Batches> {
        match self {
            CompositeKind::Copy => copy::batches(doc, idx, uid),
            CompositeKind::Extract => extract::batches(doc, idx, uid),
            CompositeKind::Sequence => sequence::batches(doc, idx, uid),
            CompositeKind::Shuffle => shuffle::batches(doc, idx, uid),
        }
    }
}

fn kind_of(doc: &Document, idx: ComponentIdx) -> Result<CompositeKind> {
    let comp = doc.component(idx)?;
    comp.composite
        .as_ref()
        .map(|c| c.kind)
        .ok_or_else(|| crate::error::ExpandError::resolution(idx, "replacements", "not a composite"))
}

/// Nested attribute composites must be expanded before their value is read.
fn attribute_requests(doc: &Document, idx: ComponentIdx) -> Vec<ResolutionRequest> {
    let Some(comp) = doc.get(idx) else {
        return Vec::new();
    };
    let mut requests = Vec::new();
    for (name, attr) in &comp.attributes {
        if let Attribute::Component(c) = attr {
            for pending in pending_composites(doc, &[*c]) {
                requests.push(ResolutionRequest {
                    component: pending,
                    kind: ResolutionKind::DetermineDependencies,
                    state_variable: name.clone(),
                    dependency: "attribute".into(),
                });
            }
        }
    }
    requests
}

/// Composites among `items` (or inside their replacements) that are not
/// currently expanded.
pub(crate) fn pending_composites(doc: &Document, items: &[ComponentIdx]) -> Vec<ComponentIdx> {
    let mut out = Vec::new();
    for &c in items {
        let Some(state) = doc.get(c).and_then(|comp| comp.composite.as_ref()) else {
            continue;
        };
        if state.status == CompositeStatus::Expanded {
            out.extend(pending_composites(doc, state.active_replacements()));
        } else {
            out.push(c);
        }
    }
    out
}

// ── Shared flow ─────────────────────────────────────────────────────────────

fn constraint(doc: &Document, idx: ComponentIdx) -> Result<TypeConstraint> {
    let comp = doc.component(idx)?;
    let create = doc.attribute_value(idx, "createComponentOfType")?;
    let num = doc.attribute_value(idx, "numComponents")?;
    TypeConstraint::from_values(&comp.component_type, &create, &num, doc.options())
}

/// Full, non-incremental computation of the replacement list.
pub fn create_serialized_replacements(
    doc: &Document,
    idx: ComponentIdx,
    ws: &mut Workspace,
) -> Result<Expansion> {
    let kind = kind_of(doc, idx)?;
    let uid = doc.identifier(idx);
    let constraint = constraint(doc, idx)?;
    let mut batches = kind.batches(doc, idx, &uid)?;

    ws.identifiers.clear();
    ws.sources.clear();
    for batch in &mut batches.sources {
        ws.assign_fresh(batch);
        ws.sources.push(batch.record());
    }

    let raw: Vec<SerializedComponent> = batches
        .sources
        .into_iter()
        .flat_map(|b| b.replacements)
        .collect();
    let verified = verify::verify_replacements(
        &constraint,
        raw,
        &uid,
        &mut ws.identifiers,
        batches.shadow_hint.as_ref(),
    );
    ws.synthesized = verified.outcome == VerifyOutcome::Synthesized;
    if matches!(verified.outcome, VerifyOutcome::Wrapped | VerifyOutcome::Synthesized) {
        // The output no longer lines up with per-source spans.
        ws.sources.clear();
    }

    debug!(
        composite = %idx,
        kind = kind.name(),
        sources = ws.sources.len(),
        replacements = verified.replacements.len(),
        outcome = ?verified.outcome,
        "created serialized replacements"
    );
    Ok(Expansion {
        replacements: verified.replacements,
        diagnostics: batches.diagnostics,
    })
}

/// Minimal patch from the live replacements to the current values.
pub fn calculate_replacement_changes(
    doc: &Document,
    idx: ComponentIdx,
    ws: &mut Workspace,
    live: &[LiveSlot],
    withheld: usize,
) -> Result<ChangeSet> {
    let kind = kind_of(doc, idx)?;
    let uid = doc.identifier(idx);
    let constraint = constraint(doc, idx)?;
    let batches = kind.batches(doc, idx, &uid)?;
    ws.recomputations += 1;

    let satisfied = verify::satisfied(&constraint, &batches.replacement_types());
    let changes = if constraint.is_active() && !satisfied {
        let Batches {
            sources,
            shadow_hint,
            ..
        } = batches.clone();
        let sourceless = ws.sources.is_empty() && sources.is_empty();
        ws.identifiers.clear();
        let mut raw = Vec::new();
        for mut batch in sources {
            ws.assign_fresh(&mut batch);
            raw.extend(batch.replacements);
        }
        let verified = verify::verify_replacements(
            &constraint,
            raw,
            &uid,
            &mut ws.identifiers,
            shadow_hint.as_ref(),
        );
        // Filler that already has the required shape stays as it is.
        let unchanged = sourceless
            && ws.synthesized
            && withheld == 0
            && same_shape(live, &verified.replacements);
        ws.sources.clear();
        ws.synthesized = verified.outcome == VerifyOutcome::Synthesized;
        if unchanged {
            Vec::new()
        } else {
            vec![ReplacementChange::Add {
                change_top_level_replacements: true,
                first_replacement_ind: 0,
                number_replacements_to_replace: live.len(),
                serialized_replacements: verified.replacements,
                replacements_to_withhold: (withheld > 0).then_some(0),
            }]
        }
    } else {
        ws.synthesized = false;
        diff::replacement_changes(ws, live, withheld, batches.sources.clone(), kind.shrink_policy())
    };

    debug!(
        composite = %idx,
        kind = kind.name(),
        sources = ws.sources.len(),
        changes = changes.len(),
        "calculated replacement changes"
    );
    Ok(ChangeSet {
        changes,
        diagnostics: batches.diagnostics,
    })
}

fn same_shape(live: &[LiveSlot], fresh: &[SerializedComponent]) -> bool {
    live.len() == fresh.len()
        && live.iter().zip(fresh).all(|(slot, r)| {
            slot.alive && slot.component_type == r.component_type && slot.shadow_target == r.shadow_target()
        })
}

// ── Helpers shared by kinds ─────────────────────────────────────────────────

/// The typed placeholder standing in for a failed expansion.
pub fn error_replacement(uid: &str, message: impl Into<String>) -> SerializedComponent {
    SerializedComponent::new("_error")
        .with_identifier(format!("{}:error", uid))
        .with_state("message", Value::Text(message.into()))
}

/// A batch holding the single cycle error for `identity`.
pub(crate) fn cycle_batch(
    idx: ComponentIdx,
    uid: &str,
    identity: SourceIdentity,
    message: String,
    diagnostics: &mut Vec<Diagnostic>,
) -> SourceBatch {
    diagnostics.push(
        Diagnostic::error(message.clone())
            .with_code(codes::E0201)
            .at(idx)
            .with_hint("check that no copy targets itself or one of its ancestors"),
    );
    let mut batch = SourceBatch::new(identity);
    batch.replacements.push(error_replacement(uid, message));
    batch
}

pub(crate) fn text_attribute(doc: &Document, idx: ComponentIdx, name: &str) -> Result<Option<String>> {
    Ok(match doc.attribute_value(idx, name)? {
        Value::Absent => None,
        Value::Text(t) if t.trim().is_empty() => None,
        Value::Text(t) => Some(t.trim().to_string()),
        other => Some(other.to_text()),
    })
}

pub(crate) fn bool_attribute(doc: &Document, idx: ComponentIdx, name: &str, default: bool) -> Result<bool> {
    Ok(doc.attribute_value(idx, name)?.as_bool().unwrap_or(default))
}

/// A 1-based index list (`propIndex="2"` or `[1, 3]`) as 0-based indices.
/// Entries below 1 are reported and dropped.
pub(crate) fn index_attribute(
    doc: &Document,
    idx: ComponentIdx,
    name: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<Vec<usize>> {
    let raw = doc.attribute_value(idx, name)?;
    let items: Vec<Value> = match raw {
        Value::Absent => return Ok(Vec::new()),
        Value::List(items) => items,
        Value::Text(t) => t.split_whitespace().map(|s| Value::Text(s.to_string())).collect(),
        other => vec![other],
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item.as_number() {
            Some(n) if n >= 1.0 && n.fract() == 0.0 => out.push(n as usize - 1),
            _ => diagnostics.push(
                Diagnostic::warning(format!("{} entry '{}' is not a positive integer", name, item.to_text()))
                    .with_code(codes::W0304)
                    .at(idx),
            ),
        }
    }
    Ok(out)
}

/// Project one source through `prop`: one replacement per addressed array
/// entry, or one for a scalar variable.
#[allow(clippy::too_many_arguments)]
pub(crate) fn project_prop(
    doc: &Document,
    composite: ComponentIdx,
    source: ComponentIdx,
    base: &str,
    prop: &str,
    prop_index: &[usize],
    link: bool,
    out: &mut Batches,
) -> Result<SourceBatch> {
    let source_type = doc.component(source)?.component_type.clone();
    let mut batch = SourceBatch::new(SourceIdentity::Component(source));

    let canonical = match registry::public_case_insensitive_alias_substitutions(&[prop], &source_type)
        .pop()
    {
        Some(AliasResolution::Found(c)) => c,
        _ => {
            out.diagnostics.push(
                Diagnostic::warning(format!(
                    "prop '{}' is not a public state variable of <{}>",
                    prop, source_type
                ))
                .with_code(codes::W0301)
                .at(composite),
            );
            return Ok(batch);
        }
    };
    let var = VarRef::parse(&canonical);

    let (entry_type, refs): (&str, Vec<VarRef>) =
        match array::array_variable(&source_type, &var.name) {
            Some(arr) => {
                let size = doc
                    .array_size(source, &var.name)?
                    .unwrap_or_else(|| ArraySize::one(0));
                let key: Vec<usize> = var.indices.iter().chain(prop_index).copied().collect();
                let refs: Vec<VarRef> = if key.len() > size.dims() {
                    Vec::new()
                } else {
                    size.keys()
                        .filter(|k| k.starts_with(&key))
                        .map(|k| VarRef::new(var.name.clone()).with_indices(&k))
                        .collect()
                };
                if refs.is_empty() && !key.is_empty() {
                    if !prop_index.is_empty() {
                        out.diagnostics.push(
                            Diagnostic::warning(format!(
                                "propIndex addresses no entry of '{}' on <{}>",
                                var.name, source_type
                            ))
                            .with_code(codes::W0304)
                            .at(composite),
                        );
                    }
                    if key.len() == size.dims() {
                        out.shadow_hint = Some(ShadowRecord {
                            source,
                            prop_variable: Some(VarRef::new(var.name.clone()).with_indices(&key).to_string()),
                            composite,
                            is_primary_shadow: true,
                        });
                    }
                }
                (arr.entry_type(), refs)
            }
            None => (registry::var_component_type(&source_type, &var.name), vec![var]),
        };

    for r in refs {
        let prop_variable = r.to_string();
        let replacement = if link {
            SerializedComponent::new(entry_type)
                .with_identifier(base)
                .with_shadow(&ShadowRecord {
                    source,
                    prop_variable: Some(prop_variable.clone()),
                    composite,
                    is_primary_shadow: true,
                })
        } else {
            let primary = registry::info(entry_type).primary;
            let value = doc.state_value(source, &prop_variable)?;
            SerializedComponent::new(entry_type)
                .with_identifier(base)
                .with_state(primary, registry::coerce_essential(entry_type, primary, value))
        };
        batch.prop_variables.push(prop_variable);
        batch.replacements.push(replacement);
    }
    Ok(batch)
}
