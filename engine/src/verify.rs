// verify.rs — Type and count verification of replacement lists
//
// A composite may promise `createComponentOfType` and `numComponents`. When
// its raw replacements do not honor the promise, the list is repaired:
//
//   1. matches already           → unchanged
//   2. lone composite             → stamped with the constraint, it will
//                                   verify its own output
//   3. right count, wrong types   → each wrapped in the requested type
//   4. otherwise                  → replaced by placeholders of the type
//
// A composite producing nothing under the must-have-replacement policy
// receives one placeholder of the default type.
//
// Preconditions: `raw` already carries unique identifiers.
// Postconditions: the result satisfies the constraint (modulo stamped
//                 composites, which verify when they expand).
// Failure modes: `from_values` rejects `numComponents` without a type.
// Side effects: registers wrapper/placeholder identifiers in `used`.

use tracing::debug;

use crate::config::EngineOptions;
use crate::error::{ExpandError, Result};
use crate::id::{assign_unique_identifier, UsedIdentifiers};
use crate::registry;
use crate::serialized::{SerializedComponent, ShadowRecord};
use crate::value::Value;

/// The type/count promise a composite makes about its replacements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeConstraint {
    pub component_type: Option<String>,
    pub num_components: Option<usize>,
    pub must_have_replacement: bool,
    pub default_type: String,
}

impl TypeConstraint {
    pub fn from_values(
        composite_type: &str,
        create: &Value,
        num: &Value,
        options: &EngineOptions,
    ) -> Result<Self> {
        let component_type = match create {
            Value::Absent => None,
            Value::Text(t) if t.trim().is_empty() => None,
            other => Some(other.to_text().trim().to_string()),
        };
        let num_components = match num {
            Value::Absent => None,
            other => match other.as_number() {
                Some(n) if n >= 0.0 && n.fract() == 0.0 => Some(n as usize),
                _ => {
                    return Err(ExpandError::InvalidAttributeCombination {
                        component_type: composite_type.to_string(),
                        message: format!(
                            "numComponents must be a non-negative integer, got '{}'",
                            other.to_text()
                        ),
                    })
                }
            },
        };
        if num_components.is_some() && component_type.is_none() {
            return Err(ExpandError::InvalidAttributeCombination {
                component_type: composite_type.to_string(),
                message: "numComponents requires createComponentOfType".into(),
            });
        }
        let num_components = match (&component_type, num_components) {
            (Some(_), None) => Some(1),
            (_, n) => n,
        };
        Ok(Self {
            component_type,
            num_components,
            must_have_replacement: options.composites_must_have_replacement,
            default_type: options.default_replacement_type.clone(),
        })
    }

    /// Whether verification can change anything at all.
    pub fn is_active(&self) -> bool {
        self.component_type.is_some() || self.must_have_replacement
    }
}

/// Whether a replacement list with these types honors `c`.
pub fn satisfied(c: &TypeConstraint, types: &[&str]) -> bool {
    if let Some(t) = &c.component_type {
        let n = c.num_components.unwrap_or(1);
        return types.len() == n && types.iter().all(|x| x == t);
    }
    !(c.must_have_replacement && types.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    PassThrough,
    Stamped,
    Wrapped,
    Synthesized,
}

#[derive(Debug, Clone)]
pub struct Verified {
    pub replacements: Vec<SerializedComponent>,
    pub outcome: VerifyOutcome,
}

pub fn verify_replacements(
    c: &TypeConstraint,
    mut raw: Vec<SerializedComponent>,
    uid: &str,
    used: &mut UsedIdentifiers,
    hint: Option<&ShadowRecord>,
) -> Verified {
    let types: Vec<&str> = raw.iter().map(|r| r.component_type.as_str()).collect();
    if satisfied(c, &types) {
        return Verified {
            replacements: raw,
            outcome: VerifyOutcome::PassThrough,
        };
    }

    if let Some(t) = &c.component_type {
        if raw.len() == 1 && registry::is_composite(&raw[0].component_type) {
            let single = &mut raw[0];
            debug!(uid, component_type = %t, "stamping constraint onto nested composite");
            single
                .attributes
                .insert("createComponentOfType".into(), Value::Text(t.clone()).into());
            if let Some(n) = c.num_components {
                single
                    .attributes
                    .insert("numComponents".into(), Value::Number(n as f64).into());
            }
            return Verified {
                replacements: raw,
                outcome: VerifyOutcome::Stamped,
            };
        }
    }

    if let Some(t) = &c.component_type {
        if c.num_components == Some(raw.len()) && !raw.is_empty() {
            debug!(uid, component_type = %t, count = raw.len(), "wrapping replacements");
            let wrapped = raw
                .into_iter()
                .map(|r| {
                    SerializedComponent::new(t.clone())
                        .with_identifier(assign_unique_identifier(&format!("{}:wrap", uid), used))
                        .with_child(r)
                })
                .collect();
            return Verified {
                replacements: wrapped,
                outcome: VerifyOutcome::Wrapped,
            };
        }
    }

    let (t, n) = match &c.component_type {
        Some(t) => (t.clone(), c.num_components.unwrap_or(1)),
        None => (c.default_type.clone(), 1),
    };
    debug!(uid, component_type = %t, count = n, "synthesizing placeholders");
    let replacements = (0..n)
        .map(|_| {
            let placeholder = SerializedComponent::new(t.clone())
                .with_identifier(assign_unique_identifier(&format!("{}:placeholder", uid), used));
            match hint {
                Some(h) if n == 1 => placeholder.with_shadow(h),
                _ => placeholder,
            }
        })
        .collect();
    Verified {
        replacements,
        outcome: VerifyOutcome::Synthesized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ComponentIdx;

    fn constraint(t: Option<&str>, n: Option<usize>) -> TypeConstraint {
        TypeConstraint {
            component_type: t.map(str::to_string),
            num_components: n,
            must_have_replacement: false,
            default_type: "text".into(),
        }
    }

    fn leaf(t: &str) -> SerializedComponent {
        SerializedComponent::new(t).with_identifier("c:x")
    }

    #[test]
    fn num_components_needs_a_type() {
        let opts = EngineOptions::default();
        let err = TypeConstraint::from_values("copy", &Value::Absent, &Value::Number(2.0), &opts);
        assert!(matches!(err, Err(ExpandError::InvalidAttributeCombination { .. })));
        let err = TypeConstraint::from_values("copy", &Value::Text("math".into()), &Value::Number(1.5), &opts);
        assert!(err.is_err());
        let ok = TypeConstraint::from_values("copy", &Value::Text("math".into()), &Value::Absent, &opts).unwrap();
        assert_eq!(ok.num_components, Some(1));
        assert!(ok.is_active());
    }

    #[test]
    fn matching_list_passes_through() {
        let v = verify_replacements(
            &constraint(Some("math"), Some(2)),
            vec![leaf("math"), leaf("math")],
            "c",
            &mut UsedIdentifiers::new(),
            None,
        );
        assert_eq!(v.outcome, VerifyOutcome::PassThrough);
        assert_eq!(v.replacements.len(), 2);
    }

    #[test]
    fn lone_composite_is_stamped() {
        let v = verify_replacements(
            &constraint(Some("math"), Some(3)),
            vec![leaf("sequence")],
            "c",
            &mut UsedIdentifiers::new(),
            None,
        );
        assert_eq!(v.outcome, VerifyOutcome::Stamped);
        let r = &v.replacements[0];
        assert_eq!(r.primitive_attribute("createComponentOfType"), Some(&Value::Text("math".into())));
        assert_eq!(r.primitive_attribute("numComponents"), Some(&Value::Number(3.0)));
    }

    #[test]
    fn right_count_is_wrapped() {
        let v = verify_replacements(
            &constraint(Some("math"), Some(2)),
            vec![leaf("number"), leaf("text")],
            "c",
            &mut UsedIdentifiers::new(),
            None,
        );
        assert_eq!(v.outcome, VerifyOutcome::Wrapped);
        assert!(v.replacements.iter().all(|r| r.component_type == "math" && r.children.len() == 1));
        assert_eq!(v.replacements[0].unique_identifier.as_deref(), Some("c:wrap"));
        assert_eq!(v.replacements[1].unique_identifier.as_deref(), Some("c:wrap_1"));
    }

    #[test]
    fn wrong_count_is_synthesized() {
        let v = verify_replacements(
            &constraint(Some("math"), Some(2)),
            vec![leaf("number")],
            "c",
            &mut UsedIdentifiers::new(),
            None,
        );
        assert_eq!(v.outcome, VerifyOutcome::Synthesized);
        assert_eq!(v.replacements.len(), 2);
        assert!(v.replacements.iter().all(|r| r.component_type == "math" && !r.is_linked()));
    }

    #[test]
    fn empty_output_gets_default_under_policy() {
        let mut c = constraint(None, None);
        c.must_have_replacement = true;
        assert!(c.is_active());
        let hint = ShadowRecord {
            source: ComponentIdx(2),
            prop_variable: Some("xs[1]".into()),
            composite: ComponentIdx(5),
            is_primary_shadow: true,
        };
        let v = verify_replacements(&c, vec![], "c", &mut UsedIdentifiers::new(), Some(&hint));
        assert_eq!(v.outcome, VerifyOutcome::Synthesized);
        assert_eq!(v.replacements.len(), 1);
        assert_eq!(v.replacements[0].component_type, "text");
        assert_eq!(v.replacements[0].shadow_record(), Some(hint));
    }

    #[test]
    fn inactive_constraint_accepts_anything() {
        let c = constraint(None, None);
        assert!(!c.is_active());
        assert!(satisfied(&c, &[]));
        assert!(satisfied(&c, &["number", "text"]));
    }
}
