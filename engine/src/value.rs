// value.rs — State values and the opaque math expression type
//
// `Value` is what state variables hold and what flows through shadows and
// inverse writes. `MathExpr` is treated as opaque: the engine only clones
// it, compares it structurally, and asks whether it is a numeric constant.
//
// Preconditions: none.
// Postconditions: serialization is untagged; `Absent` maps to JSON `null`.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Math expressions ───────────────────────────────────────────────────────

/// An immutable symbolic expression, stored in whitespace-normalized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MathExpr {
    math: String,
}

impl MathExpr {
    pub fn parse(text: &str) -> Self {
        let math = text.split_whitespace().collect::<Vec<_>>().join(" ");
        Self { math }
    }

    pub fn from_number(n: f64) -> Self {
        Self {
            math: format_number(n),
        }
    }

    /// The expression's numeric value, if it is a plain constant.
    pub fn as_constant(&self) -> Option<f64> {
        self.math.parse::<f64>().ok()
    }

    pub fn is_constant(&self) -> bool {
        self.as_constant().is_some()
    }

    pub fn as_str(&self) -> &str {
        &self.math
    }
}

impl fmt::Display for MathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.math)
    }
}

// ── Values ─────────────────────────────────────────────────────────────────

/// The value of a state variable, attribute, or array entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Absent,
    Boolean(bool),
    Number(f64),
    Text(String),
    Math(MathExpr),
    List(Vec<Value>),
}

impl Value {
    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    /// Numeric view: numbers, constant math, numeric text, and booleans.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Math(m) => m.as_constant(),
            Value::Text(t) => t.trim().parse::<f64>().ok(),
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Text(t) => match t.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Entry `i` of a list value; `Absent` when out of range or not a list.
    pub fn entry(&self, i: usize) -> Value {
        self.as_list()
            .and_then(|items| items.get(i))
            .cloned()
            .unwrap_or(Value::Absent)
    }

    /// Human-readable rendering used by `text` state variables.
    pub fn to_text(&self) -> String {
        match self {
            Value::Absent => String::new(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Text(t) => t.clone(),
            Value::Math(m) => m.to_string(),
            Value::List(items) => items
                .iter()
                .map(Value::to_text)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    /// Structural equality that treats two NaNs as equal, so that an unset
    /// number does not look like a change on every comparison.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            }
            _ => self == other,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(t: &str) -> Self {
        Value::Text(t.to_string())
    }
}

impl From<MathExpr> for Value {
    fn from(m: MathExpr) -> Self {
        Value::Math(m)
    }
}

/// Format a number without a trailing `.0` for integral values.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn math_is_whitespace_normalized() {
        assert_eq!(MathExpr::parse("  x +   1 "), MathExpr::parse("x + 1"));
        assert_eq!(MathExpr::parse("x + 1").to_string(), "x + 1");
    }

    #[test]
    fn math_constant_query() {
        assert_eq!(MathExpr::from_number(3.0).as_constant(), Some(3.0));
        assert!(!MathExpr::parse("2x").is_constant());
    }

    #[test]
    fn numeric_views() {
        assert_eq!(Value::Number(2.5).as_number(), Some(2.5));
        assert_eq!(Value::Text(" 4 ".into()).as_number(), Some(4.0));
        assert_eq!(Value::Math(MathExpr::parse("7")).as_number(), Some(7.0));
        assert_eq!(Value::Text("abc".into()).as_number(), None);
    }

    #[test]
    fn text_rendering() {
        assert_eq!(Value::Number(3.0).to_text(), "3");
        assert_eq!(Value::Number(0.5).to_text(), "0.5");
        assert_eq!(
            Value::List(vec![Value::Number(1.0), Value::Math(MathExpr::parse("y"))]).to_text(),
            "1, y"
        );
        assert_eq!(Value::Absent.to_text(), "");
    }

    #[test]
    fn nan_compares_same() {
        assert!(Value::Number(f64::NAN).same_as(&Value::Number(f64::NAN)));
        assert!(!Value::Number(1.0).same_as(&Value::Number(2.0)));
    }

    #[test]
    fn untagged_json_roundtrip_shapes() {
        let v: Value = serde_json::from_str(r#"[1, "a", true, null, {"math": "x"}]"#).unwrap();
        assert_eq!(
            v,
            Value::List(vec![
                Value::Number(1.0),
                Value::Text("a".into()),
                Value::Boolean(true),
                Value::Absent,
                Value::Math(MathExpr::parse("x")),
            ])
        );
        assert_eq!(serde_json::to_string(&Value::Absent).unwrap(), "null");
    }
}
