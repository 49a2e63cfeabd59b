//! Property values and driver record values
//!
//! [`PropertyValue`] is the closed set of kinds the server accepts as a
//! node or relationship property. [`coerce`] is the single gate every
//! caller-supplied property goes through before it is persisted.
//!
//! [`Value`] is the richer set of kinds a query can return.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number};
use std::collections::BTreeMap;

// ============================================================================
// Property values
// ============================================================================

/// A value the server can store as a property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    BoolList(Vec<bool>),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    StringList(Vec<String>),
}

/// Outcome of running a JSON value through the property gate
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    /// Stored as-is
    Native(PropertyValue),
    /// Stored as a compact JSON string
    Encoded(PropertyValue),
    /// Not persisted (nulls, nested maps)
    Dropped,
}

impl Coerced {
    pub fn into_value(self) -> Option<PropertyValue> {
        match self {
            Self::Native(v) | Self::Encoded(v) => Some(v),
            Self::Dropped => None,
        }
    }
}

/// Coerce a JSON value into a storable property.
///
/// Primitives pass through. Homogeneous arrays of primitives become typed
/// lists (integers widen to floats when mixed with floats). Any other array
/// is JSON-encoded into a string. Nested maps and nulls are dropped.
pub fn coerce(value: &serde_json::Value) -> Coerced {
    use serde_json::Value as J;

    match value {
        J::Null => Coerced::Dropped,
        J::Bool(b) => Coerced::Native(PropertyValue::Bool(*b)),
        J::Number(n) => match number_to_property(n) {
            Some(v) => Coerced::Native(v),
            None => Coerced::Dropped,
        },
        J::String(s) => Coerced::Native(PropertyValue::String(s.clone())),
        J::Object(_) => Coerced::Dropped,
        J::Array(items) => match homogeneous_list(items) {
            Some(list) => Coerced::Native(list),
            None => Coerced::Encoded(PropertyValue::String(value.to_string())),
        },
    }
}

fn number_to_property(n: &Number) -> Option<PropertyValue> {
    if let Some(i) = n.as_i64() {
        Some(PropertyValue::Int(i))
    } else if let Some(u) = n.as_u64() {
        // u64 beyond i64::MAX cannot be represented as a server integer
        Some(PropertyValue::Float(u as f64))
    } else {
        n.as_f64().map(PropertyValue::Float)
    }
}

fn homogeneous_list(items: &[serde_json::Value]) -> Option<PropertyValue> {
    use serde_json::Value as J;

    if items.is_empty() {
        return Some(PropertyValue::StringList(Vec::new()));
    }

    if items.iter().all(|v| v.is_boolean()) {
        return Some(PropertyValue::BoolList(
            items.iter().filter_map(|v| v.as_bool()).collect(),
        ));
    }
    if items.iter().all(|v| v.is_string()) {
        return Some(PropertyValue::StringList(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ));
    }
    if items.iter().all(|v| v.is_i64()) {
        return Some(PropertyValue::IntList(
            items.iter().filter_map(|v| v.as_i64()).collect(),
        ));
    }
    if items.iter().all(|v| matches!(v, J::Number(_))) {
        return Some(PropertyValue::FloatList(
            items.iter().filter_map(|v| v.as_f64()).collect(),
        ));
    }
    None
}

impl PropertyValue {
    /// JSON rendering of the stored value
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl From<PropertyValue> for Value {
    fn from(value: PropertyValue) -> Self {
        match value {
            PropertyValue::Bool(b) => Value::Bool(b),
            PropertyValue::Int(i) => Value::Int(i),
            PropertyValue::Float(f) => Value::Float(f),
            PropertyValue::String(s) => Value::String(s),
            PropertyValue::BoolList(l) => Value::List(l.into_iter().map(Value::Bool).collect()),
            PropertyValue::IntList(l) => Value::List(l.into_iter().map(Value::Int).collect()),
            PropertyValue::FloatList(l) => Value::List(l.into_iter().map(Value::Float).collect()),
            PropertyValue::StringList(l) => {
                Value::List(l.into_iter().map(Value::String).collect())
            }
        }
    }
}

// ============================================================================
// Record values
// ============================================================================

/// A node as returned by the server
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeValue {
    pub element_id: String,
    pub labels: Vec<String>,
    pub properties: BTreeMap<String, Value>,
}

/// A relationship as returned by the server
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelationshipValue {
    pub element_id: String,
    pub rel_type: String,
    pub start_element_id: String,
    pub end_element_id: String,
    pub properties: BTreeMap<String, Value>,
}

/// A path as returned by the server
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PathValue {
    pub nodes: Vec<NodeValue>,
    pub relationships: Vec<RelationshipValue>,
}

/// Any value a Cypher query can produce or take as a parameter
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Node(NodeValue),
    Relationship(RelationshipValue),
    Path(PathValue),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Strings of a list value, skipping non-string items
    pub fn as_strings(&self) -> Vec<String> {
        self.as_list()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Convert to JSON. Graph values render as maps.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;

        match self {
            Self::Null => J::Null,
            Self::Bool(b) => J::Bool(*b),
            Self::Int(i) => J::from(*i),
            Self::Float(f) => Number::from_f64(*f).map(J::Number).unwrap_or(J::Null),
            Self::String(s) => J::String(s.clone()),
            Self::List(l) => J::Array(l.iter().map(Value::to_json).collect()),
            Self::Map(m) => J::Object(map_to_json(m)),
            Self::Node(n) => {
                let mut obj = Map::new();
                obj.insert("element_id".into(), J::String(n.element_id.clone()));
                obj.insert(
                    "labels".into(),
                    J::Array(n.labels.iter().cloned().map(J::String).collect()),
                );
                obj.insert("properties".into(), J::Object(map_to_json(&n.properties)));
                J::Object(obj)
            }
            Self::Relationship(r) => {
                let mut obj = Map::new();
                obj.insert("element_id".into(), J::String(r.element_id.clone()));
                obj.insert("type".into(), J::String(r.rel_type.clone()));
                obj.insert(
                    "start_element_id".into(),
                    J::String(r.start_element_id.clone()),
                );
                obj.insert("end_element_id".into(), J::String(r.end_element_id.clone()));
                obj.insert("properties".into(), J::Object(map_to_json(&r.properties)));
                J::Object(obj)
            }
            Self::Path(p) => {
                let mut obj = Map::new();
                obj.insert(
                    "nodes".into(),
                    J::Array(
                        p.nodes
                            .iter()
                            .map(|n| Value::Node(n.clone()).to_json())
                            .collect(),
                    ),
                );
                obj.insert(
                    "relationships".into(),
                    J::Array(
                        p.relationships
                            .iter()
                            .map(|r| Value::Relationship(r.clone()).to_json())
                            .collect(),
                    ),
                );
                J::Object(obj)
            }
        }
    }

    /// Convert a JSON value into a query parameter without the property gate.
    ///
    /// Parameters may be nested maps, unlike stored properties.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value as J;

        match value {
            J::Null => Self::Null,
            J::Bool(b) => Self::Bool(*b),
            J::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or(Self::Null),
            J::String(s) => Self::String(s.clone()),
            J::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            J::Object(obj) => Self::Map(
                obj.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Convert a property map into a JSON object
pub fn map_to_json(map: &BTreeMap<String, Value>) -> Map<String, serde_json::Value> {
    map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Self::String(s.clone())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Self::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Self::Null)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self::Map(map)
    }
}
