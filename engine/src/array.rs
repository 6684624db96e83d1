// array.rs — Array-valued state variables
//
// An array state variable is "N independent tiny state variables, computed
// lazily and batched by key". Each implementation declares a global
// dependency set (shared by every key), computes its size from those global
// values, and may declare extra dependencies per key. Keys are index tuples
// enumerated by flattening the size tuple in row-major order.
//
// Inverse writes either target a per-key dependency directly or are
// buffered against a global list dependency; buffered edits are merged and
// committed as one write per dependency by the caller.
//
// Preconditions: dependency values are supplied by the state evaluator.
// Postconditions: keys beyond the current size read as `Absent`.
// Failure modes: none (pure functions of dependency values).
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;

use crate::state::{Dependency, DependencySet, DependencyValues};
use crate::value::{MathExpr, Value};

// ── Variable references ─────────────────────────────────────────────────────

/// A state variable name plus an optional array key, e.g. `entries[0][2]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VarRef {
    pub name: String,
    pub indices: Vec<usize>,
}

impl VarRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indices: Vec::new(),
        }
    }

    /// Parse `name[i][j]...`. Malformed suffixes are kept as part of the name.
    pub fn parse(text: &str) -> Self {
        let Some(open) = text.find('[') else {
            return Self::new(text);
        };
        let (name, mut rest) = text.split_at(open);
        let mut indices = Vec::new();
        while let Some(stripped) = rest.strip_prefix('[') {
            let Some(close) = stripped.find(']') else {
                return Self::new(text);
            };
            match stripped[..close].trim().parse::<usize>() {
                Ok(i) => indices.push(i),
                Err(_) => return Self::new(text),
            }
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return Self::new(text);
        }
        Self {
            name: name.to_string(),
            indices,
        }
    }

    pub fn with_indices(&self, more: &[usize]) -> Self {
        let mut indices = self.indices.clone();
        indices.extend_from_slice(more);
        Self {
            name: self.name.clone(),
            indices,
        }
    }

    pub fn is_entry(&self) -> bool {
        !self.indices.is_empty()
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for i in &self.indices {
            write!(f, "[{}]", i)?;
        }
        Ok(())
    }
}

// ── Size and keys ───────────────────────────────────────────────────────────

/// Extent of an array variable, one entry per dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArraySize(pub Vec<usize>);

impl ArraySize {
    pub fn one(n: usize) -> Self {
        ArraySize(vec![n])
    }

    pub fn dims(&self) -> usize {
        self.0.len()
    }

    /// Number of keys.
    pub fn total(&self) -> usize {
        if self.0.is_empty() {
            return 0;
        }
        self.0.iter().product()
    }

    /// Row-major flat position of `key`, or `None` if out of range.
    pub fn flatten(&self, key: &[usize]) -> Option<usize> {
        if key.len() != self.0.len() {
            return None;
        }
        let mut flat = 0usize;
        for (i, dim) in key.iter().zip(&self.0) {
            if i >= dim {
                return None;
            }
            flat = flat * dim + i;
        }
        Some(flat)
    }

    pub fn unflatten(&self, mut flat: usize) -> Vec<usize> {
        let mut key = vec![0; self.0.len()];
        for (slot, dim) in key.iter_mut().zip(&self.0).rev() {
            if *dim == 0 {
                return key;
            }
            *slot = flat % dim;
            flat /= dim;
        }
        key
    }

    /// All keys in flattened order.
    pub fn keys(&self) -> impl Iterator<Item = Vec<usize>> + '_ {
        (0..self.total()).map(|flat| self.unflatten(flat))
    }

    pub fn to_value(&self) -> Value {
        Value::List(self.0.iter().map(|&n| Value::Number(n as f64)).collect())
    }
}

// ── Inverse instructions ────────────────────────────────────────────────────

/// What an inverse write for one key asks the evaluator to do.
#[derive(Debug, Clone, PartialEq)]
pub enum InverseInstruction {
    /// Write `value` to the named per-key dependency.
    Set { dependency: String, value: Value },
    /// Merge `value` into the named global list dependency at `path`.
    Buffer {
        dependency: String,
        path: Vec<usize>,
        value: Value,
    },
}

/// Buffered list edits, keyed by global dependency name.
#[derive(Debug, Default)]
pub struct InverseBuffer {
    pending: BTreeMap<String, Vec<(Vec<usize>, Value)>>,
}

impl InverseBuffer {
    pub fn push(&mut self, dependency: String, path: Vec<usize>, value: Value) {
        self.pending.entry(dependency).or_default().push((path, value));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Merge every buffered edit into its base value; one result per
    /// dependency.
    pub fn commit(self, globals: &DependencyValues) -> Vec<(String, Value)> {
        self.pending
            .into_iter()
            .map(|(name, edits)| {
                let mut merged = globals.get(&name).cloned().unwrap_or(Value::Absent);
                for (path, value) in edits {
                    set_path(&mut merged, &path, value);
                }
                (name, merged)
            })
            .collect()
    }
}

/// Set `target[path...] = value`, growing lists with `Absent` as needed.
pub fn set_path(target: &mut Value, path: &[usize], value: Value) {
    let Some((&first, rest)) = path.split_first() else {
        *target = value;
        return;
    };
    if !matches!(target, Value::List(_)) {
        *target = Value::List(Vec::new());
    }
    if let Value::List(items) = target {
        if items.len() <= first {
            items.resize(first + 1, Value::Absent);
        }
        set_path(&mut items[first], rest, value);
    }
}

/// Read `value[path...]`, `Absent` when any step is missing.
pub fn get_path(value: &Value, path: &[usize]) -> Value {
    match path.split_first() {
        None => value.clone(),
        Some((&first, rest)) => get_path(&value.entry(first), rest),
    }
}

// ── The contract ────────────────────────────────────────────────────────────

pub trait ArrayStateVariable: Sync {
    /// Component type of one entry when projected into its own replacement.
    fn entry_type(&self) -> &'static str;

    /// Dependencies shared by every key (and by `size`).
    fn global_dependencies(&self) -> DependencySet;

    fn size(&self, globals: &DependencyValues) -> ArraySize;

    fn dependencies_for_key(&self, _key: &[usize], _globals: &DependencyValues) -> DependencySet {
        Vec::new()
    }

    fn value_for_key(
        &self,
        key: &[usize],
        globals: &DependencyValues,
        deps: &DependencyValues,
    ) -> Value;

    /// `None` means the entry cannot be written.
    fn inverse_for_key(
        &self,
        _key: &[usize],
        _desired: Value,
        _globals: &DependencyValues,
        _deps: &DependencyValues,
    ) -> Option<InverseInstruction> {
        None
    }
}

fn as_math(v: Value) -> Value {
    match v {
        Value::Absent => Value::Absent,
        Value::Math(m) => Value::Math(m),
        Value::Number(n) => Value::Math(MathExpr::from_number(n)),
        Value::Text(t) => Value::Math(MathExpr::parse(&t)),
        other => Value::Math(MathExpr::parse(&other.to_text())),
    }
}

fn as_number(v: &Value) -> Value {
    match v {
        Value::Absent => Value::Absent,
        other => Value::Number(other.as_number().unwrap_or(f64::NAN)),
    }
}

fn list_len(v: &Value) -> usize {
    v.as_list().map_or(0, |l| l.len())
}

// ── point.xs ────────────────────────────────────────────────────────────────

pub struct PointCoords;

impl ArrayStateVariable for PointCoords {
    fn entry_type(&self) -> &'static str {
        "math"
    }

    fn global_dependencies(&self) -> DependencySet {
        vec![("xs".into(), Dependency::Essential { var: "xs".into() })]
    }

    fn size(&self, globals: &DependencyValues) -> ArraySize {
        ArraySize::one(globals.get("xs").map_or(0, list_len))
    }

    fn value_for_key(&self, key: &[usize], globals: &DependencyValues, _: &DependencyValues) -> Value {
        let xs = globals.get("xs").cloned().unwrap_or_default();
        as_math(get_path(&xs, key))
    }

    fn inverse_for_key(
        &self,
        key: &[usize],
        desired: Value,
        _: &DependencyValues,
        _: &DependencyValues,
    ) -> Option<InverseInstruction> {
        Some(InverseInstruction::Buffer {
            dependency: "xs".into(),
            path: key.to_vec(),
            value: as_math(desired),
        })
    }
}

// ── numberList.numbers ──────────────────────────────────────────────────────

/// Entries come from number children where present; keys past the last
/// child fall back to the shadowed list, then to the stored list.
pub struct NumberListEntries;

impl NumberListEntries {
    fn child_count(globals: &DependencyValues) -> usize {
        globals
            .get("childCount")
            .and_then(Value::as_number)
            .map_or(0, |n| n as usize)
    }

    fn fallback_name(globals: &DependencyValues) -> &'static str {
        match globals.get("shadowNumbers") {
            Some(Value::List(_)) => "shadowNumbers",
            _ => "numbers",
        }
    }
}

impl ArrayStateVariable for NumberListEntries {
    fn entry_type(&self) -> &'static str {
        "number"
    }

    fn global_dependencies(&self) -> DependencySet {
        vec![
            ("childCount".into(), Dependency::ChildCount),
            (
                "shadowNumbers".into(),
                Dependency::Shadow {
                    var: "numbers".into(),
                },
            ),
            (
                "numbers".into(),
                Dependency::Essential {
                    var: "numbers".into(),
                },
            ),
        ]
    }

    fn size(&self, globals: &DependencyValues) -> ArraySize {
        let fallback = globals
            .get(Self::fallback_name(globals))
            .map_or(0, list_len);
        ArraySize::one(Self::child_count(globals).max(fallback))
    }

    fn dependencies_for_key(&self, key: &[usize], globals: &DependencyValues) -> DependencySet {
        match key.first() {
            Some(&k) if k < Self::child_count(globals) => vec![(
                "entry".into(),
                Dependency::Child {
                    index: k,
                    var: "value".into(),
                },
            )],
            _ => Vec::new(),
        }
    }

    fn value_for_key(&self, key: &[usize], globals: &DependencyValues, deps: &DependencyValues) -> Value {
        if let Some(v) = deps.get("entry") {
            return as_number(v);
        }
        let fallback = globals
            .get(Self::fallback_name(globals))
            .cloned()
            .unwrap_or_default();
        as_number(&get_path(&fallback, key))
    }

    fn inverse_for_key(
        &self,
        key: &[usize],
        desired: Value,
        globals: &DependencyValues,
        deps: &DependencyValues,
    ) -> Option<InverseInstruction> {
        let value = as_number(&desired);
        if deps.contains_key("entry") {
            return Some(InverseInstruction::Set {
                dependency: "entry".into(),
                value,
            });
        }
        Some(InverseInstruction::Buffer {
            dependency: Self::fallback_name(globals).into(),
            path: key.to_vec(),
            value,
        })
    }
}

// ── matrix.entries ──────────────────────────────────────────────────────────

pub struct MatrixEntries;

impl ArrayStateVariable for MatrixEntries {
    fn entry_type(&self) -> &'static str {
        "math"
    }

    fn global_dependencies(&self) -> DependencySet {
        vec![(
            "entries".into(),
            Dependency::Essential {
                var: "entries".into(),
            },
        )]
    }

    fn size(&self, globals: &DependencyValues) -> ArraySize {
        let rows = globals
            .get("entries")
            .and_then(Value::as_list)
            .unwrap_or(&[]);
        let cols = rows.iter().map(list_len).max().unwrap_or(0);
        ArraySize(vec![rows.len(), cols])
    }

    fn value_for_key(&self, key: &[usize], globals: &DependencyValues, _: &DependencyValues) -> Value {
        let entries = globals.get("entries").cloned().unwrap_or_default();
        as_math(get_path(&entries, key))
    }

    fn inverse_for_key(
        &self,
        key: &[usize],
        desired: Value,
        _: &DependencyValues,
        _: &DependencyValues,
    ) -> Option<InverseInstruction> {
        Some(InverseInstruction::Buffer {
            dependency: "entries".into(),
            path: key.to_vec(),
            value: as_math(desired),
        })
    }
}

// ── sequence.values ─────────────────────────────────────────────────────────

/// `from + step * k` for `k in 0..length`, rendered per sequence type.
pub struct SequenceValues;

impl ArrayStateVariable for SequenceValues {
    fn entry_type(&self) -> &'static str {
        "number"
    }

    fn global_dependencies(&self) -> DependencySet {
        ["from", "step", "length", "type"]
            .iter()
            .map(|v| (v.to_string(), Dependency::Own { var: v.to_string() }))
            .collect()
    }

    fn size(&self, globals: &DependencyValues) -> ArraySize {
        let n = globals
            .get("length")
            .and_then(Value::as_number)
            .filter(|n| n.is_finite() && *n > 0.0)
            .map_or(0, |n| n as usize);
        ArraySize::one(n)
    }

    fn value_for_key(&self, key: &[usize], globals: &DependencyValues, _: &DependencyValues) -> Value {
        let k = key.first().copied().unwrap_or(0) as f64;
        let step = globals
            .get("step")
            .and_then(Value::as_number)
            .unwrap_or(1.0);
        let from = globals.get("from").cloned().unwrap_or(Value::Number(1.0));
        let kind = globals
            .get("type")
            .and_then(Value::as_text)
            .unwrap_or("number");
        sequence_entry(kind, &from, step, k)
    }
}

/// Entry `k` of a sequence of the given type.
pub fn sequence_entry(kind: &str, from: &Value, step: f64, k: f64) -> Value {
    match kind {
        "letters" => {
            let start = from.as_number().unwrap_or(1.0);
            let n = start + step * k;
            if n >= 1.0 {
                Value::Text(letters_from_index(n as usize))
            } else {
                Value::Text(String::new())
            }
        }
        "math" => match from.as_number() {
            Some(start) => Value::Math(MathExpr::from_number(start + step * k)),
            None if k == 0.0 => as_math(from.clone()),
            None => Value::Math(MathExpr::parse(&format!(
                "{} + {}",
                from.to_text(),
                crate::value::format_number(step * k)
            ))),
        },
        _ => Value::Number(from.as_number().unwrap_or(f64::NAN) + step * k),
    }
}

/// 1 → `a`, 26 → `z`, 27 → `aa`.
pub fn letters_from_index(mut n: usize) -> String {
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'a' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Inverse of [`letters_from_index`]; `None` for non-letter text.
pub fn index_from_letters(text: &str) -> Option<usize> {
    let lower = text.trim().to_ascii_lowercase();
    if lower.is_empty() || !lower.bytes().all(|b| b.is_ascii_lowercase()) {
        return None;
    }
    Some(
        lower
            .bytes()
            .fold(0usize, |acc, b| acc * 26 + (b - b'a') as usize + 1),
    )
}

// ── Lookup ──────────────────────────────────────────────────────────────────

static POINT_XS: PointCoords = PointCoords;
static NUMBER_LIST_NUMBERS: NumberListEntries = NumberListEntries;
static MATRIX_ENTRIES: MatrixEntries = MatrixEntries;
static SEQUENCE_VALUES: SequenceValues = SequenceValues;

/// The array implementation behind `component_type.var`, if any.
pub fn array_variable(component_type: &str, var: &str) -> Option<&'static dyn ArrayStateVariable> {
    match (component_type, var) {
        ("point", "xs") => Some(&POINT_XS),
        ("numberList", "numbers") => Some(&NUMBER_LIST_NUMBERS),
        ("matrix", "entries") => Some(&MATRIX_ENTRIES),
        ("sequence", "values") => Some(&SEQUENCE_VALUES),
        _ => None,
    }
}

/// Whether `var` handles shadow fallback itself instead of being forwarded
/// wholesale to a shadowed source.
pub fn handles_shadow_fallback(component_type: &str, var: &str) -> bool {
    matches!((component_type, var), ("numberList", "numbers"))
}
