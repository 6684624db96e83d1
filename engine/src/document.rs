// document.rs — Component arena, expansion driver, and patch materializer
//
// Owns every materialized component in a flat arena indexed by
// `ComponentIdx`. Composites are expanded in document order (attributes by
// name, the composite itself, children, replacements); each expansion first
// satisfies the composite's resolution requests, expanding or recomputing
// whatever they name.
//
// `update` is the incremental path: composites whose declared-dependency
// values moved since their last expansion are marked stale, recomputed into
// patches, and the patches are materialized in place. This repeats until no
// composite is stale.
//
// Preconditions: none.
// Postconditions: after `expand`/`update` return `Ok`, every reachable
//                 composite is `Expanded`.
// Failure modes: unresolvable requests, destroyed targets, invalid patches,
//                and updates that never settle abort the call. Configuration
//                and cycle errors become `_error` replacements instead.
// Side effects: allocates arena slots; logs through `tracing`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::mem;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::composite::{
    self, ChangeSet, CompositeKind, CompositeState, CompositeStatus, Expansion, Workspace,
};
use crate::config::EngineOptions;
use crate::diag::{codes, Diagnostic};
use crate::diff::LiveSlot;
use crate::error::{ExpandError, Result};
use crate::id::{ComponentIdx, IdAllocator};
use crate::patch::{self, PatchEntry, ReplacementChange, ReplacementList};
use crate::registry;
use crate::serialized::{AttributeValue, SerializedComponent, ShadowRecord};
use crate::state::{self, WriteReport};
use crate::value::Value;

/// Bound on settle passes, independent of `max_update_rounds`, so that
/// runaway first-time expansion (composites producing composites) stops.
pub const MAX_EXPANSION_PASSES: usize = 256;

// ── Components ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Primitive(Value),
    /// A nested component owned by the attribute.
    Component(ComponentIdx),
}

#[derive(Debug, Clone)]
pub struct Component {
    pub idx: ComponentIdx,
    pub component_type: String,
    pub unique_identifier: Option<String>,
    pub attributes: BTreeMap<String, Attribute>,
    pub children: Vec<ComponentIdx>,
    pub parent: Option<ComponentIdx>,
    /// Stored essential values; shadows take precedence on read.
    pub essential: BTreeMap<String, Value>,
    pub shadow: Option<ShadowRecord>,
    pub composite: Option<CompositeState>,
}

// ── Resolution ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResolutionKind {
    DetermineDependencies,
    RecalculateDownstreamComponents,
}

/// One item a composite needs resolved before it can compute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResolutionRequest {
    pub component: ComponentIdx,
    pub kind: ResolutionKind,
    pub state_variable: String,
    pub dependency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Resolved,
    /// The item is a composite whose expansion is already in progress.
    Circular,
}

// ── Reports ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeChanges {
    pub composite: ComponentIdx,
    pub identifier: String,
    pub changes: Vec<ReplacementChange>,
}

/// Everything one `expand` or `update` call did.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionReport {
    pub changes: Vec<CompositeChanges>,
    pub diagnostics: Vec<Diagnostic>,
    pub expansions: usize,
    pub recomputations: usize,
    pub rounds: usize,
}

impl ExpansionReport {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    /// Patches emitted for one composite, concatenated across rounds.
    pub fn changes_for(&self, composite: ComponentIdx) -> Vec<&ReplacementChange> {
        self.changes
            .iter()
            .filter(|c| c.composite == composite)
            .flat_map(|c| c.changes.iter())
            .collect()
    }
}

// ── Document ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Document {
    slots: Vec<Option<Component>>,
    ids: IdAllocator,
    names: BTreeMap<String, ComponentIdx>,
    root: ComponentIdx,
    options: EngineOptions,
    in_progress: Vec<ComponentIdx>,
    report: ExpansionReport,
}

impl Document {
    pub fn from_serialized(root: SerializedComponent, options: EngineOptions) -> Result<Self> {
        if registry::is_composite(&root.component_type) {
            return Err(ExpandError::resolution(
                ComponentIdx(0),
                "replacements",
                format!("the document root cannot be a <{}>", root.component_type),
            ));
        }
        let mut doc = Self {
            slots: Vec::new(),
            ids: IdAllocator::new(),
            names: BTreeMap::new(),
            root: ComponentIdx(0),
            options,
            in_progress: Vec::new(),
            report: ExpansionReport::default(),
        };
        doc.root = doc.materialize(root, None);
        debug!(components = doc.ids.allocated(), "document materialized");
        Ok(doc)
    }

    pub fn from_json_str(text: &str, options: EngineOptions) -> Result<Self> {
        let root: SerializedComponent = serde_json::from_str(text)?;
        Self::from_serialized(root, options)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn root(&self) -> ComponentIdx {
        self.root
    }

    pub fn report(&self) -> &ExpansionReport {
        &self.report
    }

    pub fn get(&self, idx: ComponentIdx) -> Option<&Component> {
        self.slots.get(idx.0 as usize).and_then(Option::as_ref)
    }

    pub fn component(&self, idx: ComponentIdx) -> Result<&Component> {
        self.get(idx).ok_or(ExpandError::UnknownComponent(idx))
    }

    pub(crate) fn component_mut(&mut self, idx: ComponentIdx) -> Result<&mut Component> {
        self.slots
            .get_mut(idx.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(ExpandError::UnknownComponent(idx))
    }

    pub fn contains(&self, idx: ComponentIdx) -> bool {
        self.get(idx).is_some()
    }

    /// Live component registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<ComponentIdx> {
        self.names.get(name).copied().filter(|&c| self.contains(c))
    }

    /// The component's unique identifier, or a stable generated one.
    pub fn identifier(&self, idx: ComponentIdx) -> String {
        match self.get(idx) {
            Some(c) => match &c.unique_identifier {
                Some(uid) => uid.clone(),
                None => format!("_{}{}", c.component_type, idx.0),
            },
            None => format!("_{}", idx.0),
        }
    }

    /// Number of arena slots ever allocated.
    pub fn allocated(&self) -> u32 {
        self.ids.allocated()
    }

    // ── Composite accessors ─────────────────────────────────────────────

    fn composite_state(&self, idx: ComponentIdx) -> Result<&CompositeState> {
        self.component(idx)?
            .composite
            .as_ref()
            .ok_or_else(|| ExpandError::resolution(idx, "replacements", "not a composite"))
    }

    fn composite_state_mut(&mut self, idx: ComponentIdx) -> Result<&mut CompositeState> {
        self.component_mut(idx)?
            .composite
            .as_mut()
            .ok_or_else(|| ExpandError::resolution(idx, "replacements", "not a composite"))
    }

    /// All materialized replacements, withheld ones included.
    pub fn replacements(&self, idx: ComponentIdx) -> Result<&[ComponentIdx]> {
        Ok(&self.composite_state(idx)?.replacements)
    }

    pub fn replacements_to_withhold(&self, idx: ComponentIdx) -> Result<usize> {
        Ok(self.composite_state(idx)?.replacements_to_withhold)
    }

    pub fn composite_status(&self, idx: ComponentIdx) -> Result<CompositeStatus> {
        Ok(self.composite_state(idx)?.status)
    }

    pub fn workspace(&self, idx: ComponentIdx) -> Result<&Workspace> {
        Ok(&self.composite_state(idx)?.workspace)
    }

    /// Children as rendered: composites are replaced by their active
    /// replacements, unexpanded composites contribute nothing.
    pub fn effective_children(&self, idx: ComponentIdx) -> Vec<ComponentIdx> {
        let Some(comp) = self.get(idx) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(comp.children.len());
        for &child in &comp.children {
            match self.get(child) {
                Some(c) if c.composite.is_some() => out.extend(self.effective_replacements(child)),
                Some(_) => out.push(child),
                None => {}
            }
        }
        out
    }

    /// Active replacements of a composite, nested composites flattened.
    pub fn effective_replacements(&self, idx: ComponentIdx) -> Vec<ComponentIdx> {
        let Some(state) = self.get(idx).and_then(|c| c.composite.as_ref()) else {
            return Vec::new();
        };
        if state.status == CompositeStatus::Unexpanded {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(state.replacements.len());
        for &r in state.active_replacements() {
            match self.get(r) {
                Some(c) if c.composite.is_some() => out.extend(self.effective_replacements(r)),
                Some(_) => out.push(r),
                None => {}
            }
        }
        out
    }

    // ── State ───────────────────────────────────────────────────────────

    pub fn state_value(&self, idx: ComponentIdx, var: &str) -> Result<Value> {
        state::evaluate(self, idx, var, 0)
    }

    pub fn attribute_value(&self, idx: ComponentIdx, name: &str) -> Result<Value> {
        state::attribute_value(self, idx, name, 0)
    }

    pub fn array_size(&self, idx: ComponentIdx, var: &str) -> Result<Option<crate::array::ArraySize>> {
        state::array_size(self, idx, var, 0)
    }

    /// Write `value` to `var`, routing through shadows and array inverses.
    /// Composites pick the change up on the next `update`.
    pub fn request_update(&mut self, idx: ComponentIdx, var: &str, value: Value) -> Result<WriteReport> {
        let mut report = WriteReport::default();
        state::request_update(self, idx, var, value, 0, &mut report)?;
        debug!(
            component = %idx,
            state_variable = var,
            writes = report.writes.len(),
            skipped = report.skipped.len(),
            "state update requested"
        );
        Ok(report)
    }

    // ── Materialization ─────────────────────────────────────────────────

    fn materialize(&mut self, ser: SerializedComponent, parent: Option<ComponentIdx>) -> ComponentIdx {
        let idx = self.ids.alloc_component();
        self.slots.push(None);

        let SerializedComponent {
            component_type,
            attributes,
            children,
            unique_identifier,
            downstream_dependencies,
            state,
        } = ser;
        let info = registry::info(&component_type);
        let shadow = SerializedComponent {
            downstream_dependencies,
            ..SerializedComponent::new(component_type.as_str())
        }
        .shadow_record();

        let mut essential: BTreeMap<String, Value> = state
            .into_iter()
            .map(|(k, v)| {
                let v = registry::coerce_essential(&component_type, &k, v);
                (k, v)
            })
            .collect();

        if let Some(name) = &unique_identifier {
            match self.names.get(name) {
                Some(&other) if self.contains(other) => {
                    warn!(name = %name, kept = %other, ignored = %idx, "duplicate component name");
                }
                _ => {
                    self.names.insert(name.clone(), idx);
                }
            }
        }

        self.slots[idx.0 as usize] = Some(Component {
            idx,
            component_type: component_type.clone(),
            unique_identifier,
            attributes: BTreeMap::new(),
            children: Vec::new(),
            parent,
            essential: BTreeMap::new(),
            shadow,
            composite: info.composite.map(CompositeState::new),
        });

        let mut attrs = BTreeMap::new();
        for (name, attr) in attributes {
            match attr {
                AttributeValue::Primitive(v) if info.is_essential(&name) => {
                    if !essential.contains_key(&name) {
                        let v = registry::coerce_essential(&component_type, &name, v);
                        essential.insert(name, v);
                    }
                }
                AttributeValue::Primitive(v) => {
                    attrs.insert(name, Attribute::Primitive(v));
                }
                AttributeValue::Component(c) => {
                    let c = self.materialize(*c, Some(idx));
                    attrs.insert(name, Attribute::Component(c));
                }
            }
        }
        let kids: Vec<ComponentIdx> = children
            .into_iter()
            .map(|c| self.materialize(c, Some(idx)))
            .collect();

        if let Some(comp) = self.slots[idx.0 as usize].as_mut() {
            comp.attributes = attrs;
            comp.children = kids;
            comp.essential = essential;
        }
        trace!(component = %idx, component_type = %component_type, "materialized");
        idx
    }

    /// Remove `idx` and everything it owns from the arena.
    fn destroy(&mut self, idx: ComponentIdx) {
        let Some(comp) = self.slots.get_mut(idx.0 as usize).and_then(Option::take) else {
            return;
        };
        if let Some(name) = &comp.unique_identifier {
            if self.names.get(name) == Some(&idx) {
                self.names.remove(name);
            }
        }
        for attr in comp.attributes.values() {
            if let Attribute::Component(c) = attr {
                self.destroy(*c);
            }
        }
        for &child in &comp.children {
            self.destroy(child);
        }
        if let Some(state) = &comp.composite {
            for &r in &state.replacements {
                self.destroy(r);
            }
        }
        trace!(component = %idx, "destroyed");
    }

    /// Remove a component from the document. A deleted replacement leaves
    /// a dead slot behind and marks its composite stale, so the next update
    /// recreates it.
    pub fn delete_component(&mut self, idx: ComponentIdx) -> Result<()> {
        let parent = self.component(idx)?.parent.ok_or_else(|| {
            ExpandError::resolution(idx, "parent", "the document root cannot be deleted")
        })?;
        let parent_comp = self.component_mut(parent)?;
        let is_replacement = parent_comp
            .composite
            .as_ref()
            .is_some_and(|s| s.replacements.contains(&idx));
        match parent_comp.composite.as_mut() {
            Some(state) if is_replacement => state.status = CompositeStatus::Stale,
            _ => {
                parent_comp.children.retain(|&c| c != idx);
                parent_comp
                    .attributes
                    .retain(|_, a| *a != Attribute::Component(idx));
            }
        }
        self.destroy(idx);
        info!(component = %idx, parent = %parent, "component deleted");
        Ok(())
    }

    // ── Serialization ───────────────────────────────────────────────────

    /// Definition form: what a document author would write for this
    /// component. Composites are emitted unexpanded.
    pub fn to_serialized(&self, idx: ComponentIdx) -> Result<SerializedComponent> {
        let comp = self.component(idx)?;
        let mut out = SerializedComponent::new(comp.component_type.as_str());
        out.unique_identifier = comp.unique_identifier.clone();
        for (name, attr) in &comp.attributes {
            let value = match attr {
                Attribute::Primitive(v) => AttributeValue::Primitive(v.clone()),
                Attribute::Component(c) => AttributeValue::Component(Box::new(self.to_serialized(*c)?)),
            };
            out.attributes.insert(name.clone(), value);
        }
        for &child in &comp.children {
            out.children.push(self.to_serialized(child)?);
        }
        out.state = comp.essential.clone();
        if let Some(shadow) = &comp.shadow {
            out = out.with_shadow(shadow);
        }
        Ok(out)
    }

    /// Rendered form: composites replaced by their effective replacements
    /// and essential values evaluated through shadows.
    pub fn effective_serialized(&self, idx: ComponentIdx) -> Result<SerializedComponent> {
        let comp = self.component(idx)?;
        let mut out = SerializedComponent::new(comp.component_type.as_str());
        out.unique_identifier = comp.unique_identifier.clone();
        for (name, attr) in &comp.attributes {
            if let Attribute::Primitive(v) = attr {
                out.attributes.insert(name.clone(), AttributeValue::Primitive(v.clone()));
            }
        }
        for &var in registry::info(&comp.component_type).essential {
            out.state.insert(var.to_string(), self.state_value(idx, var)?);
        }
        if let Some(shadow) = &comp.shadow {
            out = out.with_shadow(shadow);
        }
        for child in self.effective_children(idx) {
            out.children.push(self.effective_serialized(child)?);
        }
        Ok(out)
    }

    /// Indented text rendering of the effective tree.
    pub fn effective_tree(&self) -> String {
        let mut buf = String::new();
        self.render(self.root, 0, &mut buf);
        buf
    }

    fn render(&self, idx: ComponentIdx, depth: usize, buf: &mut String) {
        let Some(comp) = self.get(idx) else {
            return;
        };
        write!(buf, "{:indent$}{}", "", comp.component_type, indent = depth * 2).unwrap();
        if let Some(uid) = &comp.unique_identifier {
            write!(buf, " {}", uid).unwrap();
        }
        if registry::info(&comp.component_type).primary != "text" {
            match self.state_value(idx, "text") {
                Ok(v) => write!(buf, " = {}", v.to_text()).unwrap(),
                Err(_) => buf.push_str(" = ?"),
            }
        }
        if let Some(shadow) = &comp.shadow {
            write!(buf, " <- {}", shadow.source).unwrap();
            if let Some(prop) = &shadow.prop_variable {
                write!(buf, ".{}", prop).unwrap();
            }
        }
        buf.push('\n');
        for child in self.effective_children(idx) {
            self.render(child, depth + 1, buf);
        }
    }

    // ── Dry runs ────────────────────────────────────────────────────────

    /// Full replacement list the composite would produce now, computed on a
    /// copy of its workspace.
    pub fn create_serialized_replacements(&self, idx: ComponentIdx) -> Result<Expansion> {
        let mut ws = self.workspace(idx)?.clone();
        composite::create_serialized_replacements(self, idx, &mut ws)
    }

    /// Patches a recompute would emit now, computed on a copy of the
    /// composite's workspace.
    pub fn calculate_replacement_changes(&self, idx: ComponentIdx) -> Result<ChangeSet> {
        let mut ws = self.workspace(idx)?.clone();
        let (live, withheld) = self.live_slots(idx)?;
        composite::calculate_replacement_changes(self, idx, &mut ws, &live, withheld)
    }

    pub(crate) fn live_slots(&self, idx: ComponentIdx) -> Result<(Vec<LiveSlot>, usize)> {
        let state = self.composite_state(idx)?;
        let live = state
            .replacements
            .iter()
            .map(|&r| match self.get(r) {
                Some(c) => LiveSlot {
                    component: r,
                    alive: true,
                    component_type: c.component_type.clone(),
                    shadow_target: c
                        .shadow
                        .as_ref()
                        .map(|s| (s.source, s.prop_variable.clone())),
                    state: c.essential.clone(),
                },
                None => LiveSlot::dead(r),
            })
            .collect();
        Ok((live, state.replacements_to_withhold))
    }

    // ── Expansion driver ────────────────────────────────────────────────

    /// Expand every composite in the document.
    pub fn expand(&mut self) -> Result<ExpansionReport> {
        self.settle("expand")
    }

    /// Recompute composites whose declared dependencies changed, until
    /// nothing is stale.
    pub fn update(&mut self) -> Result<ExpansionReport> {
        self.settle("update")
    }

    fn settle(&mut self, phase: &'static str) -> Result<ExpansionReport> {
        self.report = ExpansionReport::default();
        let mut update_rounds = 0usize;
        for _ in 0..MAX_EXPANSION_PASSES {
            self.mark_stale()?;
            let pending: Vec<(ComponentIdx, CompositeStatus)> = self
                .composites_in_order()
                .into_iter()
                .filter_map(|c| {
                    let status = self.composite_state(c).ok()?.status;
                    (status != CompositeStatus::Expanded).then_some((c, status))
                })
                .collect();
            if pending.is_empty() {
                info!(
                    phase,
                    rounds = self.report.rounds,
                    expansions = self.report.expansions,
                    recomputations = self.report.recomputations,
                    diagnostics = self.report.diagnostics.len(),
                    "document settled"
                );
                return Ok(self.report.clone());
            }
            if pending.iter().any(|(_, s)| *s == CompositeStatus::Stale) {
                update_rounds += 1;
                if update_rounds > self.options.max_update_rounds {
                    return Err(ExpandError::UpdateDidNotSettle {
                        rounds: self.options.max_update_rounds,
                    });
                }
            }
            self.report.rounds += 1;
            for (c, _) in pending {
                // Earlier work this pass may have resolved or destroyed it.
                let status = match self.composite_state(c) {
                    Ok(state) => state.status,
                    Err(_) => continue,
                };
                match status {
                    CompositeStatus::Unexpanded => self.expand_composite(c)?,
                    CompositeStatus::Stale => self.recompute_composite(c)?,
                    CompositeStatus::Expanded => {}
                }
            }
        }
        Err(ExpandError::UpdateDidNotSettle {
            rounds: MAX_EXPANSION_PASSES,
        })
    }

    /// Every live composite reachable from the root, in document order.
    pub fn composites(&self) -> Vec<ComponentIdx> {
        self.composites_in_order()
    }

    fn composites_in_order(&self) -> Vec<ComponentIdx> {
        let mut out = Vec::new();
        self.collect_composites(self.root, &mut out);
        out
    }

    fn collect_composites(&self, idx: ComponentIdx, out: &mut Vec<ComponentIdx>) {
        let Some(comp) = self.get(idx) else {
            return;
        };
        for attr in comp.attributes.values() {
            if let Attribute::Component(c) = attr {
                self.collect_composites(*c, out);
            }
        }
        if comp.composite.is_some() {
            out.push(idx);
        }
        for &child in &comp.children {
            self.collect_composites(child, out);
        }
        if let Some(state) = &comp.composite {
            for &r in state.active_replacements() {
                self.collect_composites(r, out);
            }
        }
    }

    /// Declared-dependency values of a composite; `None` when reading them
    /// runs into a cycle.
    fn snapshot(&self, idx: ComponentIdx) -> Result<Option<BTreeMap<String, Value>>> {
        let kind = self.composite_state(idx)?.kind;
        let values = kind
            .declared_dependencies(self, idx)
            .and_then(|set| state::dependency_values(self, idx, &set, 0));
        match values {
            Ok(v) => Ok(Some(v)),
            Err(ExpandError::CircularDependency { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn mark_stale(&mut self) -> Result<()> {
        for c in self.composites_in_order() {
            let state = self.composite_state(c)?;
            if state.status != CompositeStatus::Expanded {
                continue;
            }
            let previous = state.snapshot.clone();
            let current = self.snapshot(c)?;
            let same = match (&previous, &current) {
                (Some(a), Some(b)) => {
                    a.len() == b.len()
                        && a.iter().zip(b).all(|((ka, va), (kb, vb))| ka == kb && va.same_as(vb))
                }
                (None, None) => true,
                _ => false,
            };
            if !same {
                debug!(composite = %c, "declared dependencies changed; marking stale");
                self.composite_state_mut(c)?.status = CompositeStatus::Stale;
            }
        }
        Ok(())
    }

    fn run_resolution(&mut self, idx: ComponentIdx, kind: CompositeKind) -> Result<()> {
        let mut issued: BTreeSet<ResolutionRequest> = BTreeSet::new();
        let rounds = self.options.max_update_rounds;
        for _ in 0..=rounds {
            let fresh: Vec<ResolutionRequest> = kind
                .resolution_requests(self, idx)
                .into_iter()
                .filter(|r| !issued.contains(r))
                .collect();
            if fresh.is_empty() {
                return Ok(());
            }
            for request in fresh {
                trace!(composite = %idx, item = %request.component, kind = ?request.kind, "resolving");
                match self.resolve_item(&request)? {
                    ResolutionOutcome::Resolved => {}
                    ResolutionOutcome::Circular => {
                        return Err(ExpandError::CircularDependency {
                            component: idx,
                            state_variable: request.state_variable,
                        });
                    }
                }
                issued.insert(request);
            }
        }
        Err(ExpandError::UnresolvedRequests {
            component: idx,
            rounds,
        })
    }

    fn resolve_item(&mut self, request: &ResolutionRequest) -> Result<ResolutionOutcome> {
        let c = request.component;
        let Some(comp) = self.get(c) else {
            return Err(ExpandError::resolution(
                c,
                request.state_variable.as_str(),
                "component was destroyed",
            ));
        };
        let Some(status) = comp.composite.as_ref().map(|s| s.status) else {
            return Ok(ResolutionOutcome::Resolved);
        };
        if self.in_progress.contains(&c) {
            return Ok(ResolutionOutcome::Circular);
        }
        match status {
            CompositeStatus::Expanded => {}
            CompositeStatus::Unexpanded => self.expand_composite(c)?,
            CompositeStatus::Stale => self.recompute_composite(c)?,
        }
        Ok(ResolutionOutcome::Resolved)
    }

    fn expand_composite(&mut self, idx: ComponentIdx) -> Result<()> {
        self.in_progress.push(idx);
        let result = self.expand_inner(idx);
        self.in_progress.retain(|&c| c != idx);
        result
    }

    fn expand_inner(&mut self, idx: ComponentIdx) -> Result<()> {
        let kind = self.composite_state(idx)?.kind;
        let uid = self.identifier(idx);
        let resolved = self.run_resolution(idx, kind);
        let mut ws = mem::take(&mut self.composite_state_mut(idx)?.workspace);

        let outcome = resolved.and_then(|()| composite::create_serialized_replacements(self, idx, &mut ws));
        let (replacements, diagnostics) = match outcome {
            Ok(expansion) => {
                ws.errored = false;
                (expansion.replacements, expansion.diagnostics)
            }
            Err(e) if contained(&e) => {
                warn!(composite = %idx, error = %e, "expansion replaced by error placeholder");
                ws.sources.clear();
                ws.errored = true;
                (
                    vec![composite::error_replacement(&uid, e.to_string())],
                    vec![error_diagnostic(idx, &e)],
                )
            }
            Err(e) => {
                self.composite_state_mut(idx)?.workspace = ws;
                return Err(e);
            }
        };

        let new: Vec<ComponentIdx> = replacements
            .iter()
            .cloned()
            .map(|r| self.materialize(r, Some(idx)))
            .collect();
        debug!(composite = %idx, kind = kind.name(), replacements = new.len(), "expanded");
        {
            let state = self.composite_state_mut(idx)?;
            state.replacements = new;
            state.replacements_to_withhold = 0;
            state.workspace = ws;
            state.status = CompositeStatus::Expanded;
        }
        let snapshot = self.snapshot(idx)?;
        self.composite_state_mut(idx)?.snapshot = snapshot;

        self.report.expansions += 1;
        self.report.diagnostics.extend(diagnostics);
        self.report.changes.push(CompositeChanges {
            composite: idx,
            identifier: uid,
            changes: if replacements.is_empty() {
                Vec::new()
            } else {
                vec![ReplacementChange::add(0, 0, replacements)]
            },
        });
        Ok(())
    }

    fn recompute_composite(&mut self, idx: ComponentIdx) -> Result<()> {
        self.in_progress.push(idx);
        let result = self.recompute_inner(idx);
        self.in_progress.retain(|&c| c != idx);
        result
    }

    fn recompute_inner(&mut self, idx: ComponentIdx) -> Result<()> {
        let kind = self.composite_state(idx)?.kind;
        let uid = self.identifier(idx);
        let resolved = self.run_resolution(idx, kind);
        let (live, withheld) = self.live_slots(idx)?;
        let mut ws = mem::take(&mut self.composite_state_mut(idx)?.workspace);
        let backup = ws.clone();

        let outcome = resolved.and_then(|()| {
            if ws.errored {
                // Per-source spans are gone; start over from a full list.
                let expansion = composite::create_serialized_replacements(self, idx, &mut ws)?;
                ws.recomputations += 1;
                Ok(ChangeSet {
                    changes: vec![ReplacementChange::Add {
                        change_top_level_replacements: true,
                        first_replacement_ind: 0,
                        number_replacements_to_replace: live.len(),
                        serialized_replacements: expansion.replacements,
                        replacements_to_withhold: (withheld > 0).then_some(0),
                    }],
                    diagnostics: expansion.diagnostics,
                })
            } else {
                composite::calculate_replacement_changes(self, idx, &mut ws, &live, withheld)
            }
        });
        let change_set = match outcome {
            Ok(cs) => {
                ws.errored = false;
                cs
            }
            Err(e) if contained(&e) => {
                warn!(composite = %idx, error = %e, "recomputation replaced by error placeholder");
                let already = withheld == 0
                    && live.len() == 1
                    && live[0].alive
                    && live[0].component_type == "_error";
                ws.sources.clear();
                ws.errored = true;
                ws.recomputations += 1;
                ChangeSet {
                    changes: if already {
                        Vec::new()
                    } else {
                        vec![ReplacementChange::Add {
                            change_top_level_replacements: true,
                            first_replacement_ind: 0,
                            number_replacements_to_replace: live.len(),
                            serialized_replacements: vec![composite::error_replacement(&uid, e.to_string())],
                            replacements_to_withhold: (withheld > 0).then_some(0),
                        }]
                    },
                    diagnostics: vec![error_diagnostic(idx, &e)],
                }
            }
            Err(e) => {
                self.composite_state_mut(idx)?.workspace = backup;
                return Err(e);
            }
        };

        if let Err(e) = self.apply_to_arena(idx, &change_set.changes) {
            self.composite_state_mut(idx)?.workspace = backup;
            return Err(e);
        }
        {
            let state = self.composite_state_mut(idx)?;
            state.workspace = ws;
            state.status = CompositeStatus::Expanded;
        }
        let snapshot = self.snapshot(idx)?;
        self.composite_state_mut(idx)?.snapshot = snapshot;

        debug!(
            composite = %idx,
            kind = kind.name(),
            changes = change_set.changes.len(),
            "recomputed"
        );
        self.report.recomputations += 1;
        self.report.diagnostics.extend(change_set.diagnostics);
        self.report.changes.push(CompositeChanges {
            composite: idx,
            identifier: uid,
            changes: change_set.changes,
        });
        Ok(())
    }

    /// Materialize `changes` on the composite's replacement list. The whole
    /// list is validated against an in-memory mirror before anything moves.
    fn apply_to_arena(&mut self, idx: ComponentIdx, changes: &[ReplacementChange]) -> Result<()> {
        let state = self.composite_state(idx)?;
        let mut mirror = ReplacementList {
            entries: state
                .replacements
                .iter()
                .map(|&r| PatchEntry {
                    component: Some(r),
                    serialized: SerializedComponent::new(
                        self.get(r).map_or("", |c| c.component_type.as_str()),
                    ),
                })
                .collect(),
            withheld: state.replacements_to_withhold,
        };
        patch::apply_changes(&mut mirror, changes)?;

        for change in changes {
            trace!(composite = %idx, change = %change, "applying change");
            match change {
                ReplacementChange::Add {
                    first_replacement_ind,
                    number_replacements_to_replace,
                    serialized_replacements,
                    replacements_to_withhold,
                    ..
                } => {
                    let first = *first_replacement_ind;
                    let state = self.composite_state_mut(idx)?;
                    let end = (first + number_replacements_to_replace).min(state.replacements.len());
                    let removed: Vec<ComponentIdx> = state.replacements.drain(first..end).collect();
                    for r in removed {
                        self.destroy(r);
                    }
                    let new: Vec<ComponentIdx> = serialized_replacements
                        .iter()
                        .cloned()
                        .map(|s| self.materialize(s, Some(idx)))
                        .collect();
                    let state = self.composite_state_mut(idx)?;
                    state.replacements.splice(first..first, new);
                    if let Some(w) = replacements_to_withhold {
                        state.replacements_to_withhold = *w;
                    }
                }
                ReplacementChange::Delete {
                    first_replacement_ind,
                    number_replacements_to_delete,
                    replacements_to_withhold,
                    ..
                } => {
                    let first = *first_replacement_ind;
                    let state = self.composite_state_mut(idx)?;
                    let removed: Vec<ComponentIdx> = state
                        .replacements
                        .drain(first..first + number_replacements_to_delete)
                        .collect();
                    if let Some(w) = replacements_to_withhold {
                        state.replacements_to_withhold = *w;
                    }
                    for r in removed {
                        self.destroy(r);
                    }
                }
                ReplacementChange::ChangeReplacementsToWithhold {
                    replacements_to_withhold,
                } => {
                    self.composite_state_mut(idx)?.replacements_to_withhold = *replacements_to_withhold;
                }
                ReplacementChange::UpdateStateVariables {
                    component,
                    state_changes,
                } => {
                    let comp = self.component_mut(*component)?;
                    let ctype = comp.component_type.clone();
                    for (var, value) in state_changes {
                        comp.essential.insert(
                            var.clone(),
                            registry::coerce_essential(&ctype, var, value.clone()),
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

/// Errors that stay local to the composite that raised them.
fn contained(e: &ExpandError) -> bool {
    e.is_configuration() || matches!(e, ExpandError::CircularDependency { .. })
}

fn error_diagnostic(idx: ComponentIdx, e: &ExpandError) -> Diagnostic {
    let code = match e {
        ExpandError::InvalidAttributeCombination { .. } => Some(codes::E0101),
        ExpandError::MissingAttribute { .. } => Some(codes::E0102),
        ExpandError::CircularDependency { .. } => Some(codes::E0201),
        _ => None,
    };
    let mut d = Diagnostic::error(e.to_string()).at(idx);
    if let Some(code) = code {
        d = d.with_code(code);
    }
    if let Some(hint) = e.suggestion() {
        d = d.with_hint(hint);
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn materialization_order_is_depth_first() {
        let mut p = SerializedComponent::new("p").with_identifier("p1");
        p.children = vec![number("a", 1.0), number("b", 2.0)];
        let d = doc(vec![p, number("c", 3.0)]);
        assert_eq!(d.root(), ComponentIdx(0));
        assert_eq!(d.lookup("p1"), Some(ComponentIdx(1)));
        assert_eq!(d.lookup("a"), Some(ComponentIdx(2)));
        assert_eq!(d.lookup("c"), Some(ComponentIdx(4)));
        assert_eq!(d.component(ComponentIdx(2)).unwrap().parent, Some(ComponentIdx(1)));
    }

    #[test]
    fn essential_attributes_become_state() {
        let n = SerializedComponent::new("number")
            .with_identifier("n")
            .with_attribute("value", Value::Text("4".into()));
        let d = doc(vec![n]);
        let n = d.component(d.lookup("n").unwrap()).unwrap();
        assert!(n.attributes.is_empty());
        assert_eq!(n.essential["value"], Value::Number(4.0));
    }

    #[test]
    fn duplicate_names_keep_the_first() {
        let d = doc(vec![number("n", 1.0), number("n", 2.0)]);
        assert_eq!(d.lookup("n"), Some(ComponentIdx(1)));
    }

    #[test]
    fn composite_root_is_rejected() {
        assert!(Document::from_serialized(copy_of("c", "x"), EngineOptions::default()).is_err());
    }

    #[test]
    fn expand_materializes_linked_replacements() {
        let mut d = doc(vec![number("n1", 3.0), copy_of("c1", "n1")]);
        let report = d.expand().unwrap();
        let c1 = d.lookup("c1").unwrap();
        assert_eq!(d.composite_status(c1).unwrap(), CompositeStatus::Expanded);
        let reps = d.replacements(c1).unwrap().to_vec();
        assert_eq!(reps.len(), 1);
        let r = d.component(reps[0]).unwrap();
        assert_eq!(r.unique_identifier.as_deref(), Some("c1:n1"));
        assert_eq!(r.parent, Some(c1));
        assert_eq!(d.state_value(reps[0], "value").unwrap(), Value::Number(3.0));
        assert_eq!(report.expansions, 1);
        assert_eq!(d.lookup("c1:n1"), Some(reps[0]));
    }

    #[test]
    fn effective_tree_flattens_composites() {
        let mut d = doc(vec![number("n1", 3.0), copy_of("c1", "n1")]);
        d.expand().unwrap();
        assert_eq!(
            d.effective_tree(),
            "document\n  number n1 = 3\n  number c1:n1 = 3 <- #1\n"
        );
    }

    #[test]
    fn deleted_replacement_is_recreated() {
        let mut d = doc(vec![number("n1", 3.0), copy_of("c1", "n1")]);
        d.expand().unwrap();
        let c1 = d.lookup("c1").unwrap();
        let first = d.replacements(c1).unwrap()[0];
        d.delete_component(first).unwrap();
        assert!(!d.contains(first));
        assert_eq!(d.replacements(c1).unwrap(), &[first]);

        let changes = d.calculate_replacement_changes(c1).unwrap().changes;
        assert!(matches!(
            changes[0],
            ReplacementChange::Add { first_replacement_ind: 0, number_replacements_to_replace: 1, .. }
        ));
        assert_eq!(d.composite_status(c1).unwrap(), CompositeStatus::Stale);
        d.update().unwrap();
        let again = d.replacements(c1).unwrap()[0];
        assert_ne!(again, first);
        assert!(d.contains(again));
    }

    #[test]
    fn deleting_root_is_an_error() {
        let mut d = doc(vec![]);
        assert!(d.delete_component(d.root()).is_err());
    }

    #[test]
    fn expansion_report_serializes_camel_case() {
        let mut d = doc(vec![number("n1", 3.0), copy_of("c1", "n1")]);
        let report = d.expand().unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["expansions"], 1);
        assert_eq!(json["changes"][0]["identifier"], "c1");
        assert_eq!(json["changes"][0]["changes"][0]["changeType"], "add");
        assert!(!report.has_errors());
    }
}
