// state.rs — State-variable evaluation and inverse writes
//
// The general dependency engine is an external collaborator; this module is
// the minimal evaluator the replacement protocol needs. Forward reads are
// uncached and recursive:
//
//   linked shadow forwarding → array variable → derived variable
//     → essential value → attribute / registry default
//
// Inverse writes walk the same chain backwards: linked replacements forward
// to their source, array variables delegate per key (buffering fallback
// writes into one list write), essential variables are stored.
//
// Preconditions: `doc` is a materialized document.
// Postconditions: every read terminates; depth beyond `max_shadow_depth`
//                 yields `CircularDependency`.
// Failure modes: unknown component → `UnknownComponent`; depth bound.
// Side effects: `request_update` mutates essential values only.

use std::collections::BTreeMap;

use tracing::{trace, warn};

use crate::array::{self, ArrayStateVariable, InverseBuffer, InverseInstruction, VarRef};
use crate::document::{Attribute, Document};
use crate::error::{ExpandError, Result};
use crate::id::ComponentIdx;
use crate::registry;
use crate::value::Value;

// ── Dependencies ────────────────────────────────────────────────────────────

/// A reference from a state variable to something it reads. Variants
/// without an explicit component are relative to the owning component.
#[derive(Debug, Clone, PartialEq)]
pub enum Dependency {
    /// The owner's stored essential value, no shadow forwarding.
    Essential { var: String },
    /// Another state variable of the owner.
    Own { var: String },
    Attribute { name: String },
    /// A state variable of the owner's `index`-th effective child.
    Child { index: usize, var: String },
    ChildCount,
    /// Indices of the owner's effective children.
    Children,
    /// A variable of the component the owner shadows.
    Shadow { var: String },
    StateVariable { component: ComponentIdx, var: String },
    ArraySize { component: ComponentIdx, var: String },
    ArrayEntry {
        component: ComponentIdx,
        var: String,
        key: Vec<usize>,
    },
    /// Indices of a composite's effective replacements.
    Replacements { composite: ComponentIdx },
    /// The component a name currently resolves to.
    Target { name: String },
    /// A document-wide shared parameter such as `variantSeed`.
    External { name: String },
}

pub type DependencySet = Vec<(String, Dependency)>;
pub type DependencyValues = BTreeMap<String, Value>;

/// Writes performed (and skipped) by one `request_update` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    pub writes: Vec<(ComponentIdx, String)>,
    pub skipped: Vec<(ComponentIdx, String)>,
}

impl WriteReport {
    pub fn wrote_to(&self, component: ComponentIdx) -> usize {
        self.writes.iter().filter(|(c, _)| *c == component).count()
    }
}

fn check_depth(doc: &Document, idx: ComponentIdx, var: &str, depth: usize) -> Result<()> {
    if depth > doc.options().max_shadow_depth {
        return Err(ExpandError::CircularDependency {
            component: idx,
            state_variable: var.to_string(),
        });
    }
    Ok(())
}

// ── Forward evaluation ──────────────────────────────────────────────────────

/// Current value of `var` (optionally keyed, `xs[1]`) on `idx`.
pub(crate) fn evaluate(doc: &Document, idx: ComponentIdx, var: &str, depth: usize) -> Result<Value> {
    check_depth(doc, idx, var, depth)?;
    let comp = doc.component(idx)?;
    let info = registry::info(&comp.component_type);
    let vr = VarRef::parse(var);

    if let Some(shadow) = comp.shadow.as_ref().filter(|s| doc.contains(s.source)) {
        match &shadow.prop_variable {
            Some(prop) if vr.name == info.primary => {
                let target = VarRef::parse(prop).with_indices(&vr.indices);
                let v = evaluate(doc, shadow.source, &target.to_string(), depth + 1)?;
                return Ok(if vr.is_entry() {
                    v
                } else {
                    registry::coerce_essential(&comp.component_type, &vr.name, v)
                });
            }
            None if info.is_essential(&vr.name)
                && !array::handles_shadow_fallback(&comp.component_type, &vr.name) =>
            {
                return evaluate(doc, shadow.source, var, depth + 1);
            }
            _ => {}
        }
    }

    if let Some(arr) = array::array_variable(&comp.component_type, &vr.name) {
        return evaluate_array(doc, idx, arr, &vr.indices, depth);
    }

    if let Some(v) = derived(doc, idx, &vr.name, depth)? {
        return Ok(array::get_path(&v, &vr.indices));
    }

    if info.is_essential(&vr.name) {
        let v = match comp.essential.get(&vr.name) {
            Some(v) => registry::coerce_essential(&comp.component_type, &vr.name, v.clone()),
            None => registry::default_value(&comp.component_type, &vr.name),
        };
        return Ok(array::get_path(&v, &vr.indices));
    }

    if comp.attributes.contains_key(&vr.name) {
        let v = attribute_value(doc, idx, &vr.name, depth + 1)?;
        return Ok(array::get_path(&v, &vr.indices));
    }
    Ok(registry::default_value(&comp.component_type, &vr.name))
}

fn evaluate_array(
    doc: &Document,
    idx: ComponentIdx,
    arr: &dyn ArrayStateVariable,
    indices: &[usize],
    depth: usize,
) -> Result<Value> {
    let globals = dependency_values(doc, idx, &arr.global_dependencies(), depth + 1)?;
    let size = arr.size(&globals);
    let entry = |key: &[usize]| -> Result<Value> {
        let deps = dependency_values(doc, idx, &arr.dependencies_for_key(key, &globals), depth + 1)?;
        Ok(arr.value_for_key(key, &globals, &deps))
    };

    if indices.len() == size.dims() {
        return match size.flatten(indices) {
            Some(_) => entry(indices),
            None => Ok(Value::Absent),
        };
    }
    if indices.len() > size.dims() {
        return Ok(Value::Absent);
    }
    // Whole array (or a leading slice of it), nested one list per dimension.
    nested(&size.0, indices, &entry)
}

fn nested(
    dims: &[usize],
    prefix: &[usize],
    entry: &dyn Fn(&[usize]) -> Result<Value>,
) -> Result<Value> {
    let level = prefix.len();
    if level == dims.len() {
        return entry(prefix);
    }
    if prefix.iter().zip(dims).any(|(i, d)| i >= d) {
        return Ok(Value::Absent);
    }
    let mut items = Vec::with_capacity(dims[level]);
    let mut key = prefix.to_vec();
    for i in 0..dims[level] {
        key.push(i);
        items.push(nested(dims, &key, entry)?);
        key.pop();
    }
    Ok(Value::List(items))
}

/// Size of the array variable `var` on `idx`, following linked shadows.
pub(crate) fn array_size(
    doc: &Document,
    idx: ComponentIdx,
    var: &str,
    depth: usize,
) -> Result<Option<array::ArraySize>> {
    check_depth(doc, idx, var, depth)?;
    let comp = doc.component(idx)?;
    let info = registry::info(&comp.component_type);
    if let Some(shadow) = comp.shadow.as_ref().filter(|s| doc.contains(s.source)) {
        match &shadow.prop_variable {
            Some(prop) if var == info.primary => {
                return array_size(doc, shadow.source, &VarRef::parse(prop).name, depth + 1);
            }
            None if info.is_essential(var)
                && !array::handles_shadow_fallback(&comp.component_type, var) =>
            {
                return array_size(doc, shadow.source, var, depth + 1);
            }
            _ => {}
        }
    }
    match array::array_variable(&comp.component_type, var) {
        Some(arr) => {
            let globals = dependency_values(doc, idx, &arr.global_dependencies(), depth + 1)?;
            Ok(Some(arr.size(&globals)))
        }
        None => Ok(None),
    }
}

fn derived(doc: &Document, idx: ComponentIdx, name: &str, depth: usize) -> Result<Option<Value>> {
    let comp = doc.component(idx)?;
    let ctype = comp.component_type.as_str();
    let info = registry::info(ctype);
    let v = match (ctype, name) {
        (_, "text") if comp.composite.is_some() => {
            Value::Text(join_texts(doc, &doc.effective_replacements(idx), depth)?)
        }
        ("point", "text") => {
            let xs = evaluate(doc, idx, "xs", depth + 1)?;
            let parts: Vec<String> = xs.as_list().unwrap_or(&[]).iter().map(Value::to_text).collect();
            Value::Text(format!("({})", parts.join(", ")))
        }
        (_, "text") if info.primary != "text" => {
            Value::Text(evaluate(doc, idx, info.primary, depth + 1)?.to_text())
        }
        (_, "text") => Value::Text(join_texts(doc, &doc.effective_children(idx), depth)?),
        ("sequence", _) => match sequence_var(doc, idx, name, depth)? {
            Some(v) => v,
            None => return Ok(None),
        },
        _ => return Ok(None),
    };
    Ok(Some(v))
}

fn join_texts(doc: &Document, items: &[ComponentIdx], depth: usize) -> Result<String> {
    let mut parts = Vec::with_capacity(items.len());
    for &c in items {
        let t = evaluate(doc, c, "text", depth + 1)?.to_text();
        if !t.is_empty() {
            parts.push(t);
        }
    }
    Ok(parts.join(" "))
}

fn sequence_var(doc: &Document, idx: ComponentIdx, name: &str, depth: usize) -> Result<Option<Value>> {
    let attr = |n: &str| -> Result<Value> {
        if doc.component(idx)?.attributes.contains_key(n) {
            attribute_value(doc, idx, n, depth + 1)
        } else {
            Ok(Value::Absent)
        }
    };
    let kind = || -> Result<String> {
        Ok(match attr("type")? {
            Value::Text(t) if !t.is_empty() => t,
            _ => "number".to_string(),
        })
    };
    // Letters sequences accept `from`/`to` as letters.
    let position = |v: Value, kind: &str| -> Value {
        match (&v, kind) {
            (Value::Text(t), "letters") => match array::index_from_letters(t) {
                Some(n) => Value::Number(n as f64),
                None => Value::Number(f64::NAN),
            },
            (Value::Absent, _) => Value::Absent,
            (_, "math") => v,
            _ => Value::Number(v.as_number().unwrap_or(f64::NAN)),
        }
    };
    let v = match name {
        "type" => Value::Text(kind()?),
        "from" => {
            let k = kind()?;
            match position(attr("from")?, &k) {
                Value::Absent => Value::Number(1.0),
                v => v,
            }
        }
        "to" => position(attr("to")?, &kind()?),
        "step" => Value::Number(attr("step")?.as_number().unwrap_or(1.0)),
        "length" => {
            let requested = sequence_var(doc, idx, "requestedLength", depth)?
                .and_then(|v| v.as_number())
                .unwrap_or(0.0);
            Value::Number(requested.min(doc.options().max_sequence_length as f64))
        }
        // Before clamping to `max_sequence_length`.
        "requestedLength" => {
            if let Some(n) = attr("length")?.as_number() {
                Value::Number(if n.is_finite() && n > 0.0 { n.floor() } else { 0.0 })
            } else {
                let k = kind()?;
                let to = position(attr("to")?, &k);
                match to.as_number() {
                    Some(to) => {
                        let from = sequence_var(doc, idx, "from", depth)?
                            .and_then(|v| v.as_number())
                            .unwrap_or(f64::NAN);
                        let step = attr("step")?.as_number().unwrap_or(1.0);
                        let n = ((to - from) / step).floor() + 1.0;
                        Value::Number(if n.is_finite() && n > 0.0 { n } else { 0.0 })
                    }
                    None => Value::Number(doc.options().sequence_default_length as f64),
                }
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(v))
}

/// Value of attribute `name` on `owner`: the primitive itself, or the
/// primary value of a nested component (for a composite, that of its first
/// effective replacement).
pub(crate) fn attribute_value(doc: &Document, owner: ComponentIdx, name: &str, depth: usize) -> Result<Value> {
    check_depth(doc, owner, name, depth)?;
    match doc.component(owner)?.attributes.get(name) {
        None => Ok(Value::Absent),
        Some(Attribute::Primitive(v)) => Ok(v.clone()),
        Some(Attribute::Component(c)) => {
            let nested = doc.component(*c)?;
            let source = if nested.composite.is_some() {
                match doc.effective_replacements(*c).first() {
                    Some(&r) => r,
                    None => return Ok(Value::Absent),
                }
            } else {
                *c
            };
            let primary = registry::info(&doc.component(source)?.component_type).primary;
            evaluate(doc, source, primary, depth + 1)
        }
    }
}

pub(crate) fn dependency_value(doc: &Document, owner: ComponentIdx, dep: &Dependency, depth: usize) -> Result<Value> {
    let v = match dep {
        Dependency::Essential { var } => {
            let comp = doc.component(owner)?;
            match comp.essential.get(var) {
                Some(v) => registry::coerce_essential(&comp.component_type, var, v.clone()),
                None => registry::default_value(&comp.component_type, var),
            }
        }
        Dependency::Own { var } => evaluate(doc, owner, var, depth + 1)?,
        Dependency::Attribute { name } => attribute_value(doc, owner, name, depth + 1)?,
        Dependency::Child { index, var } => match doc.effective_children(owner).get(*index) {
            Some(&child) => evaluate(doc, child, var, depth + 1)?,
            None => Value::Absent,
        },
        Dependency::ChildCount => Value::Number(doc.effective_children(owner).len() as f64),
        Dependency::Children => index_list(&doc.effective_children(owner)),
        Dependency::Shadow { var } => match doc.component(owner)?.shadow.as_ref() {
            Some(s) if doc.contains(s.source) => evaluate(doc, s.source, var, depth + 1)?,
            _ => Value::Absent,
        },
        Dependency::StateVariable { component, var } if doc.contains(*component) => {
            evaluate(doc, *component, var, depth + 1)?
        }
        Dependency::ArraySize { component, var } if doc.contains(*component) => {
            match array_size(doc, *component, var, depth + 1)? {
                Some(size) => size.to_value(),
                None => Value::Absent,
            }
        }
        Dependency::ArrayEntry { component, var, key } if doc.contains(*component) => {
            let r = VarRef::new(var.clone()).with_indices(key);
            evaluate(doc, *component, &r.to_string(), depth + 1)?
        }
        Dependency::Replacements { composite } if doc.contains(*composite) => {
            index_list(&doc.effective_replacements(*composite))
        }
        Dependency::Target { name } => match doc.lookup(name) {
            Some(idx) => Value::Number(idx.0 as f64),
            None => Value::Absent,
        },
        Dependency::External { name } => match name.as_str() {
            "variantSeed" => Value::Text(doc.options().variant_seed.clone()),
            _ => Value::Absent,
        },
        _ => Value::Absent,
    };
    Ok(v)
}

pub(crate) fn dependency_values(
    doc: &Document,
    owner: ComponentIdx,
    set: &DependencySet,
    depth: usize,
) -> Result<DependencyValues> {
    set.iter()
        .map(|(name, dep)| Ok((name.clone(), dependency_value(doc, owner, dep, depth)?)))
        .collect()
}

fn index_list(items: &[ComponentIdx]) -> Value {
    Value::List(items.iter().map(|c| Value::Number(c.0 as f64)).collect())
}

// ── Inverse writes ──────────────────────────────────────────────────────────

/// Ask that `var` on `idx` take the value `desired`.
pub(crate) fn request_update(
    doc: &mut Document,
    idx: ComponentIdx,
    var: &str,
    desired: Value,
    depth: usize,
    report: &mut WriteReport,
) -> Result<()> {
    check_depth(doc, idx, var, depth)?;
    let (ctype, shadow) = {
        let comp = doc.component(idx)?;
        (comp.component_type.clone(), comp.shadow.clone())
    };
    let info = registry::info(&ctype);
    let vr = VarRef::parse(var);

    if let Some(shadow) = shadow.filter(|s| doc.contains(s.source)) {
        match &shadow.prop_variable {
            Some(prop) if vr.name == info.primary => {
                let target = VarRef::parse(prop).with_indices(&vr.indices);
                trace!(from = %idx, to = %shadow.source, var = %target, "forwarding write to shadow source");
                return request_update(doc, shadow.source, &target.to_string(), desired, depth + 1, report);
            }
            None if info.is_essential(&vr.name) && !array::handles_shadow_fallback(&ctype, &vr.name) => {
                trace!(from = %idx, to = %shadow.source, var, "forwarding write to shadow source");
                return request_update(doc, shadow.source, var, desired, depth + 1, report);
            }
            _ => {}
        }
    }

    if let Some(arr) = array::array_variable(&ctype, &vr.name) {
        return inverse_array(doc, idx, arr, &vr, desired, depth, report);
    }

    if info.is_essential(&vr.name) {
        store_essential(doc, idx, &vr, desired)?;
        report.writes.push((idx, vr.name.clone()));
        return Ok(());
    }

    let nested = match doc.component(idx)?.attributes.get(&vr.name) {
        Some(Attribute::Component(c)) => Some(*c),
        _ => None,
    };
    if let Some(c) = nested {
        let primary = registry::info(&doc.component(c)?.component_type).primary;
        return request_update(doc, c, primary, desired, depth + 1, report);
    }

    warn!(component = %idx, state_variable = var, "state variable is not invertible; write skipped");
    report.skipped.push((idx, var.to_string()));
    Ok(())
}

fn store_essential(doc: &mut Document, idx: ComponentIdx, vr: &VarRef, desired: Value) -> Result<()> {
    let comp = doc.component_mut(idx)?;
    let ctype = comp.component_type.clone();
    if vr.is_entry() {
        let current = comp
            .essential
            .get(&vr.name)
            .cloned()
            .unwrap_or_else(|| registry::default_value(&ctype, &vr.name));
        let mut updated = current;
        array::set_path(&mut updated, &vr.indices, desired);
        comp.essential
            .insert(vr.name.clone(), registry::coerce_essential(&ctype, &vr.name, updated));
    } else {
        comp.essential
            .insert(vr.name.clone(), registry::coerce_essential(&ctype, &vr.name, desired));
    }
    Ok(())
}

fn inverse_array(
    doc: &mut Document,
    idx: ComponentIdx,
    arr: &dyn ArrayStateVariable,
    vr: &VarRef,
    desired: Value,
    depth: usize,
    report: &mut WriteReport,
) -> Result<()> {
    let global_set = arr.global_dependencies();
    let globals = dependency_values(doc, idx, &global_set, depth + 1)?;
    let size = arr.size(&globals);

    // Pair each addressed key with its desired entry. Whole-array writes
    // may address keys past the current size; they grow the fallback list.
    let mut pairs: Vec<(Vec<usize>, Value)> = Vec::new();
    if vr.indices.len() == size.dims() {
        pairs.push((vr.indices.clone(), desired));
    } else if vr.indices.len() < size.dims() {
        collect_pairs(&vr.indices, size.dims(), desired, &mut pairs);
    }

    let mut buffer = InverseBuffer::default();
    for (key, value) in pairs {
        let key_set = arr.dependencies_for_key(&key, &globals);
        let deps = dependency_values(doc, idx, &key_set, depth + 1)?;
        match arr.inverse_for_key(&key, value, &globals, &deps) {
            Some(InverseInstruction::Set { dependency, value }) => {
                match key_set.iter().find(|(n, _)| *n == dependency) {
                    Some((_, dep)) => write_dependency(doc, idx, dep, value, depth + 1, report)?,
                    None => report.skipped.push((idx, format!("{}", VarRef::new(vr.name.clone()).with_indices(&key)))),
                }
            }
            Some(InverseInstruction::Buffer { dependency, path, value }) => {
                buffer.push(dependency, path, value);
            }
            None => {
                let key_ref = VarRef::new(vr.name.clone()).with_indices(&key);
                warn!(component = %idx, state_variable = %key_ref, "array entry is not invertible; write skipped");
                report.skipped.push((idx, key_ref.to_string()));
            }
        }
    }

    for (name, merged) in buffer.commit(&globals) {
        if let Some((_, dep)) = global_set.iter().find(|(n, _)| *n == name) {
            write_dependency(doc, idx, dep, merged, depth + 1, report)?;
        }
    }
    Ok(())
}

fn collect_pairs(prefix: &[usize], dims: usize, desired: Value, out: &mut Vec<(Vec<usize>, Value)>) {
    if prefix.len() == dims {
        out.push((prefix.to_vec(), desired));
        return;
    }
    if let Value::List(items) = desired {
        for (i, item) in items.into_iter().enumerate() {
            let mut key = prefix.to_vec();
            key.push(i);
            collect_pairs(&key, dims, item, out);
        }
    }
}

/// Route a write addressed to `dep` (relative to `owner`) to its target.
fn write_dependency(
    doc: &mut Document,
    owner: ComponentIdx,
    dep: &Dependency,
    value: Value,
    depth: usize,
    report: &mut WriteReport,
) -> Result<()> {
    match dep {
        Dependency::Essential { var } => {
            store_essential(doc, owner, &VarRef::new(var.clone()), value)?;
            report.writes.push((owner, var.clone()));
            Ok(())
        }
        Dependency::Own { var } => request_update(doc, owner, var, value, depth, report),
        Dependency::Attribute { name } => request_update(doc, owner, name, value, depth, report),
        Dependency::Child { index, var } => match doc.effective_children(owner).get(*index) {
            Some(&child) => request_update(doc, child, var, value, depth, report),
            None => {
                report.skipped.push((owner, var.clone()));
                Ok(())
            }
        },
        Dependency::Shadow { var } => {
            let source = doc.component(owner)?.shadow.as_ref().map(|s| s.source);
            match source.filter(|s| doc.contains(*s)) {
                Some(source) => request_update(doc, source, var, value, depth, report),
                None => {
                    report.skipped.push((owner, var.clone()));
                    Ok(())
                }
            }
        }
        Dependency::StateVariable { component, var } => {
            request_update(doc, *component, var, value, depth, report)
        }
        Dependency::ArrayEntry { component, var, key } => {
            let r = VarRef::new(var.clone()).with_indices(key);
            request_update(doc, *component, &r.to_string(), value, depth, report)
        }
        other => {
            warn!(component = %owner, dependency = ?other, "dependency is not invertible; write skipped");
            report.skipped.push((owner, format!("{:?}", other)));
            Ok(())
        }
    }
}
