// serialized.rs — Serialized component trees
//
// The shape in which documents are loaded and in which composites describe
// their replacements:
//
//   { componentType, attributes, children, uniqueIdentifier,
//     downstreamDependencies?, state? }
//
// `downstreamDependencies` is keyed by the shadowed source's component id;
// a replacement carrying one is linked to that source. `state` holds
// essential values for unlinked replacements and leaf inputs.
//
// Preconditions: none.
// Postconditions: JSON shape matches the patch consumer's wire format.
// Failure modes: deserialization errors surface as serde errors.
// Side effects: none.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::{assign_unique_identifier, ComponentIdx, UsedIdentifiers};
use crate::value::Value;

// ── Shadow records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DependencyType {
    ReferenceShadow,
}

/// Wire form of a shadow link, stored under the source's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamDependency {
    pub dependency_type: DependencyType,
    pub composite_id: ComponentIdx,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prop_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_primary_shadow: Option<bool>,
}

/// A replacement's live link back to the component it shadows.
///
/// With `prop_variable` set, the replacement's primary variable mirrors that
/// one variable of the source. Without it, every essential variable of the
/// replacement mirrors the same-named variable of the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowRecord {
    pub source: ComponentIdx,
    pub prop_variable: Option<String>,
    pub composite: ComponentIdx,
    pub is_primary_shadow: bool,
}

impl ShadowRecord {
    pub fn to_downstream(&self) -> (ComponentIdx, DownstreamDependency) {
        (
            self.source,
            DownstreamDependency {
                dependency_type: DependencyType::ReferenceShadow,
                composite_id: self.composite,
                prop_variable: self.prop_variable.clone(),
                is_primary_shadow: Some(self.is_primary_shadow),
            },
        )
    }
}

// ── Attributes ──────────────────────────────────────────────────────────────

/// An attribute is either a primitive value or a nested component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Component(Box<SerializedComponent>),
    Primitive(Value),
}

impl AttributeValue {
    pub fn as_primitive(&self) -> Option<&Value> {
        match self {
            AttributeValue::Primitive(v) => Some(v),
            AttributeValue::Component(_) => None,
        }
    }
}

impl From<Value> for AttributeValue {
    fn from(v: Value) -> Self {
        AttributeValue::Primitive(v)
    }
}

impl From<SerializedComponent> for AttributeValue {
    fn from(c: SerializedComponent) -> Self {
        AttributeValue::Component(Box::new(c))
    }
}

// ── Serialized component ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedComponent {
    pub component_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SerializedComponent>,
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub unique_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub downstream_dependencies: BTreeMap<ComponentIdx, Vec<DownstreamDependency>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state: BTreeMap<String, Value>,
}

impl SerializedComponent {
    pub fn new(component_type: impl Into<String>) -> Self {
        Self {
            component_type: component_type.into(),
            attributes: BTreeMap::new(),
            children: Vec::new(),
            unique_identifier: None,
            downstream_dependencies: BTreeMap::new(),
            state: BTreeMap::new(),
        }
    }

    pub fn with_identifier(mut self, id: impl Into<String>) -> Self {
        self.unique_identifier = Some(id.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_state(mut self, var: impl Into<String>, value: Value) -> Self {
        self.state.insert(var.into(), value);
        self
    }

    pub fn with_child(mut self, child: SerializedComponent) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_shadow(mut self, record: &ShadowRecord) -> Self {
        let (source, dep) = record.to_downstream();
        self.downstream_dependencies.insert(source, vec![dep]);
        self
    }

    /// The shadow link this replacement carries, if any.
    pub fn shadow_record(&self) -> Option<ShadowRecord> {
        let (source, deps) = self.downstream_dependencies.iter().next()?;
        let dep = deps
            .iter()
            .find(|d| d.dependency_type == DependencyType::ReferenceShadow)?;
        Some(ShadowRecord {
            source: *source,
            prop_variable: dep.prop_variable.clone(),
            composite: dep.composite_id,
            is_primary_shadow: dep.is_primary_shadow.unwrap_or(false),
        })
    }

    pub fn is_linked(&self) -> bool {
        self.shadow_record().is_some()
    }

    /// `(source, prop)` of the shadow link, used to compare replacements.
    pub fn shadow_target(&self) -> Option<(ComponentIdx, Option<String>)> {
        self.shadow_record().map(|r| (r.source, r.prop_variable))
    }

    pub fn primitive_attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).and_then(AttributeValue::as_primitive)
    }

    /// Replace every identifier in this subtree (treated as a base) by a
    /// collision-free one drawn from `used`.
    pub fn assign_identifiers(&mut self, used: &mut UsedIdentifiers) {
        if let Some(base) = self.unique_identifier.take() {
            self.unique_identifier = Some(assign_unique_identifier(&base, used));
        }
        for attr in self.attributes.values_mut() {
            if let AttributeValue::Component(c) = attr {
                c.assign_identifiers(used);
            }
        }
        for child in &mut self.children {
            child.assign_identifiers(used);
        }
    }

    /// Every identifier in this subtree, in assignment order.
    pub fn identifiers(&self) -> Vec<String> {
        let mut out: Vec<String> = self.unique_identifier.iter().cloned().collect();
        for attr in self.attributes.values() {
            if let AttributeValue::Component(c) = attr {
                out.extend(c.identifiers());
            }
        }
        for child in &self.children {
            out.extend(child.identifiers());
        }
        out
    }

    /// Number of nodes in this subtree, attribute components included.
    pub fn node_count(&self) -> usize {
        let attrs: usize = self
            .attributes
            .values()
            .map(|a| match a {
                AttributeValue::Component(c) => c.node_count(),
                AttributeValue::Primitive(_) => 0,
            })
            .sum();
        1 + attrs + self.children.iter().map(|c| c.node_count()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::MathExpr;

    #[test]
    fn shadow_record_roundtrips_through_downstream() {
        let record = ShadowRecord {
            source: ComponentIdx(4),
            prop_variable: Some("xs[1]".into()),
            composite: ComponentIdx(9),
            is_primary_shadow: true,
        };
        let ser = SerializedComponent::new("math").with_shadow(&record);
        assert_eq!(ser.shadow_record(), Some(record));
        assert!(ser.is_linked());
        assert_eq!(
            ser.shadow_target(),
            Some((ComponentIdx(4), Some("xs[1]".to_string())))
        );
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let record = ShadowRecord {
            source: ComponentIdx(2),
            prop_variable: None,
            composite: ComponentIdx(5),
            is_primary_shadow: true,
        };
        let ser = SerializedComponent::new("number")
            .with_identifier("c:n")
            .with_shadow(&record);
        let json = serde_json::to_value(&ser).unwrap();
        assert_eq!(json["componentType"], "number");
        assert_eq!(json["uniqueIdentifier"], "c:n");
        let dep = &json["downstreamDependencies"]["2"][0];
        assert_eq!(dep["dependencyType"], "referenceShadow");
        assert_eq!(dep["compositeId"], 5);
        assert_eq!(dep["isPrimaryShadow"], true);
        assert!(json.get("children").is_none());
    }

    #[test]
    fn identifiers_are_made_unique_per_scope() {
        let mut a = SerializedComponent::new("group")
            .with_identifier("c:g")
            .with_child(SerializedComponent::new("number").with_identifier("c:g/n"));
        let mut b = a.clone();
        let mut used = UsedIdentifiers::new();
        a.assign_identifiers(&mut used);
        b.assign_identifiers(&mut used);
        assert_eq!(a.unique_identifier.as_deref(), Some("c:g"));
        assert_eq!(b.unique_identifier.as_deref(), Some("c:g_1"));
        assert_eq!(b.children[0].unique_identifier.as_deref(), Some("c:g/n_1"));
    }

    #[test]
    fn documents_accept_name_and_nested_attributes() {
        let json = r#"{
            "componentType": "sequence",
            "name": "s1",
            "attributes": {
                "from": {"componentType": "copy", "attributes": {"target": "n1"}},
                "length": 3,
                "slope": {"math": "2x"}
            }
        }"#;
        let ser: SerializedComponent = serde_json::from_str(json).unwrap();
        assert_eq!(ser.unique_identifier.as_deref(), Some("s1"));
        assert!(matches!(ser.attributes["from"], AttributeValue::Component(_)));
        assert_eq!(ser.primitive_attribute("length"), Some(&Value::Number(3.0)));
        assert_eq!(
            ser.primitive_attribute("slope"),
            Some(&Value::Math(MathExpr::parse("2x")))
        );
        assert_eq!(ser.node_count(), 2);
    }
}
