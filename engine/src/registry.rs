// registry.rs — Component type metadata
//
// A static table describing every component type the engine knows: whether
// it is a composite, its primary and essential state variables, its array
// variables, and its public (case-insensitive) state-variable aliases.
// Types not in the table are plain containers.
//
// Preconditions: none.
// Postconditions: lookups are pure and resolved once per component type.
// Failure modes: none; unknown types fall back to the container entry.
// Side effects: none.

use crate::composite::CompositeKind;
use crate::value::{MathExpr, Value};

// ── Data types ──────────────────────────────────────────────────────────────

/// Metadata for one component type.
#[derive(Debug)]
pub struct ComponentTypeInfo {
    pub name: &'static str,
    pub composite: Option<CompositeKind>,
    /// Variable that defines the component's value; prop-projected
    /// replacements shadow into this variable.
    pub primary: &'static str,
    /// Persisted, user-settable variables (copied by unlinked copies and
    /// forwarded by linked ones).
    pub essential: &'static [&'static str],
    /// Array-valued variables.
    pub arrays: &'static [&'static str],
    /// Public names, lowercase alias → canonical variable reference.
    pub aliases: &'static [(&'static str, &'static str)],
}

impl ComponentTypeInfo {
    pub fn is_composite(&self) -> bool {
        self.composite.is_some()
    }

    pub fn is_essential(&self, var: &str) -> bool {
        self.essential.contains(&var)
    }

    pub fn is_array(&self, var: &str) -> bool {
        self.arrays.contains(&var)
    }
}

/// Result of resolving a requested prop name against a target type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasResolution {
    Found(String),
    NotFound,
}

// ── Table ───────────────────────────────────────────────────────────────────

const LEAF_ALIASES: &[(&str, &str)] = &[("value", "value"), ("text", "text")];

static CONTAINER: ComponentTypeInfo = ComponentTypeInfo {
    name: "group",
    composite: None,
    primary: "text",
    essential: &[],
    arrays: &[],
    aliases: &[("text", "text")],
};

static TYPES: &[ComponentTypeInfo] = &[
    ComponentTypeInfo {
        name: "document",
        composite: None,
        primary: "text",
        essential: &[],
        arrays: &[],
        aliases: &[("text", "text")],
    },
    ComponentTypeInfo {
        name: "p",
        composite: None,
        primary: "text",
        essential: &[],
        arrays: &[],
        aliases: &[("text", "text")],
    },
    ComponentTypeInfo {
        name: "group",
        composite: None,
        primary: "text",
        essential: &[],
        arrays: &[],
        aliases: &[("text", "text")],
    },
    ComponentTypeInfo {
        name: "number",
        composite: None,
        primary: "value",
        essential: &["value"],
        arrays: &[],
        aliases: LEAF_ALIASES,
    },
    ComponentTypeInfo {
        name: "text",
        composite: None,
        primary: "value",
        essential: &["value"],
        arrays: &[],
        aliases: &[("value", "value"), ("text", "value")],
    },
    ComponentTypeInfo {
        name: "boolean",
        composite: None,
        primary: "value",
        essential: &["value"],
        arrays: &[],
        aliases: LEAF_ALIASES,
    },
    ComponentTypeInfo {
        name: "math",
        composite: None,
        primary: "value",
        essential: &["value"],
        arrays: &[],
        aliases: LEAF_ALIASES,
    },
    ComponentTypeInfo {
        name: "point",
        composite: None,
        primary: "xs",
        essential: &["xs"],
        arrays: &["xs"],
        aliases: &[
            ("xs", "xs"),
            ("coords", "xs"),
            ("x", "xs[0]"),
            ("y", "xs[1]"),
            ("z", "xs[2]"),
            ("text", "text"),
        ],
    },
    ComponentTypeInfo {
        name: "numberList",
        composite: None,
        primary: "numbers",
        essential: &["numbers"],
        arrays: &["numbers"],
        aliases: &[("numbers", "numbers"), ("text", "text")],
    },
    ComponentTypeInfo {
        name: "matrix",
        composite: None,
        primary: "entries",
        essential: &["entries"],
        arrays: &["entries"],
        aliases: &[("entries", "entries"), ("text", "text")],
    },
    ComponentTypeInfo {
        name: "_error",
        composite: None,
        primary: "message",
        essential: &["message"],
        arrays: &[],
        aliases: &[("message", "message"), ("text", "message")],
    },
    ComponentTypeInfo {
        name: "copy",
        composite: Some(CompositeKind::Copy),
        primary: "text",
        essential: &[],
        arrays: &[],
        aliases: &[],
    },
    ComponentTypeInfo {
        name: "extract",
        composite: Some(CompositeKind::Extract),
        primary: "text",
        essential: &[],
        arrays: &[],
        aliases: &[],
    },
    ComponentTypeInfo {
        name: "sequence",
        composite: Some(CompositeKind::Sequence),
        primary: "values",
        essential: &[],
        arrays: &["values"],
        aliases: &[
            ("values", "values"),
            ("length", "length"),
            ("from", "from"),
            ("step", "step"),
        ],
    },
    ComponentTypeInfo {
        name: "shuffle",
        composite: Some(CompositeKind::Shuffle),
        primary: "text",
        essential: &[],
        arrays: &[],
        aliases: &[],
    },
];

// ── Lookups ─────────────────────────────────────────────────────────────────

/// Metadata for a known component type.
pub fn lookup(component_type: &str) -> Option<&'static ComponentTypeInfo> {
    TYPES.iter().find(|t| t.name == component_type)
}

/// Metadata for any component type; unknown types behave as containers.
pub fn info(component_type: &str) -> &'static ComponentTypeInfo {
    lookup(component_type).unwrap_or(&CONTAINER)
}

pub fn is_composite(component_type: &str) -> bool {
    info(component_type).is_composite()
}

pub fn composite_kind(component_type: &str) -> Option<CompositeKind> {
    info(component_type).composite
}

/// Resolve requested prop names case-insensitively to canonical variable
/// references of `target_type`.
pub fn public_case_insensitive_alias_substitutions(
    names: &[&str],
    target_type: &str,
) -> Vec<AliasResolution> {
    let aliases = info(target_type).aliases;
    names
        .iter()
        .map(|name| {
            let lower = name.to_ascii_lowercase();
            aliases
                .iter()
                .find(|(alias, _)| alias.to_ascii_lowercase() == lower)
                .map(|(_, canonical)| AliasResolution::Found((*canonical).to_string()))
                .unwrap_or(AliasResolution::NotFound)
        })
        .collect()
}

/// Value a variable has when nothing has been stored for it.
pub fn default_value(component_type: &str, var: &str) -> Value {
    match (component_type, var) {
        ("number", "value") => Value::Number(f64::NAN),
        ("text", "value") => Value::Text(String::new()),
        ("boolean", "value") => Value::Boolean(false),
        ("math", "value") => Value::Math(MathExpr::from_number(0.0)),
        ("_error", "message") => Value::Text(String::new()),
        (_, "text") => Value::Text(String::new()),
        (_, v) if info(component_type).is_array(v) => Value::List(Vec::new()),
        _ => Value::Absent,
    }
}

/// Component type that represents a scalar variable when it is projected
/// into its own replacement (`prop="text"` on a number yields a `text`).
pub fn var_component_type(component_type: &str, var: &str) -> &'static str {
    match (component_type, var) {
        (_, "text") | (_, "message") => "text",
        ("number", "value") | ("sequence", "length") | ("sequence", "from")
        | ("sequence", "step") => "number",
        ("boolean", "value") => "boolean",
        ("math", "value") => "math",
        ("text", "value") => "text",
        _ => "text",
    }
}

/// Coerce a raw value into the shape `component_type` stores for `var`.
pub fn coerce_essential(component_type: &str, var: &str, value: Value) -> Value {
    match (component_type, var) {
        ("number", "value") => match value.as_number() {
            Some(n) => Value::Number(n),
            None => Value::Number(f64::NAN),
        },
        ("boolean", "value") => Value::Boolean(value.as_bool().unwrap_or(false)),
        ("math", "value") => match value {
            Value::Math(m) => Value::Math(m),
            Value::Number(n) => Value::Math(MathExpr::from_number(n)),
            Value::Text(t) => Value::Math(MathExpr::parse(&t)),
            other => other,
        },
        ("text", "value") | ("_error", "message") => match value {
            Value::Text(t) => Value::Text(t),
            Value::Absent => Value::Text(String::new()),
            other => Value::Text(other.to_text()),
        },
        _ => value,
    }
}
