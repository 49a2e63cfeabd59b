//! Knowledge graph records
//!
//! Entities and relationships as the caller sees them, plus the
//! conversion to and from the flat property maps the server stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::value::{coerce, Coerced, NodeValue, PropertyValue, RelationshipValue, Value};

/// Property keys owned by the store rather than by the caller
pub const NODE_RESERVED_KEYS: &[&str] = &[
    "id",
    "description",
    "confidence",
    "importance",
    "embedding",
    "embeddings",
    "created_at",
    "updated_at",
    "version",
];

pub const RELATIONSHIP_RESERVED_KEYS: &[&str] = &[
    "id",
    "type",
    "description",
    "confidence",
    "weight",
    "embedding",
    "created_at",
    "updated_at",
    "version",
];

/// Keys removed from records when metadata is not requested
pub const METADATA_KEYS: &[&str] = &["created_at", "updated_at", "version"];

// ============================================================================
// Graph validation
// ============================================================================

/// Check a logical graph name against `[A-Za-z0-9_-]+`
pub fn is_valid_graph_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// How logical graphs are partitioned on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// One database per logical graph
    SeparateDatabase,
    /// One shared database, graphs told apart by a prefix label
    LabelBased,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SeparateDatabase => write!(f, "separate_database"),
            Self::LabelBased => write!(f, "label_based"),
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// An entity (node) in a logical graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Business identifier, unique within the graph
    pub id: String,

    /// Server-internal element id (set on records read back)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,

    /// Labels; the first one is the entity type
    #[serde(default)]
    pub labels: Vec<String>,

    /// Caller properties
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Extraction confidence in [0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// Named embeddings (e.g. per model)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<BTreeMap<String, Vec<f32>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub version: i64,
}

impl Node {
    /// Create a new entity with a business id and type label
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            labels: vec![entity_type.into()],
            ..Default::default()
        }
    }

    /// Add a property value
    pub fn with_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Add a label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// The `name` property, used for deduplication
    pub fn name(&self) -> Option<&str> {
        self.properties.get("name").and_then(|v| v.as_str())
    }

    /// Entity type: the `entity_type` property, else the first label
    pub fn entity_type(&self) -> Option<&str> {
        self.properties
            .get("entity_type")
            .and_then(|v| v.as_str())
            .or_else(|| self.labels.first().map(String::as_str))
    }

    /// String array property (skips non-string items)
    pub fn string_list(&self, key: &str) -> Vec<String> {
        match self.properties.get(key) {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Flatten into the property map written to the server.
    ///
    /// Caller properties go through the property gate; reserved keys in the
    /// caller map are ignored in favour of the typed fields.
    pub fn to_properties(&self, now: DateTime<Utc>) -> BTreeMap<String, PropertyValue> {
        let mut props = gate_properties(&self.properties, NODE_RESERVED_KEYS);

        props.insert("id".into(), PropertyValue::String(self.id.clone()));
        if let Some(description) = &self.description {
            props.insert(
                "description".into(),
                PropertyValue::String(description.clone()),
            );
        }
        if let Some(confidence) = self.confidence {
            props.insert(
                "confidence".into(),
                PropertyValue::Float(confidence.clamp(0.0, 1.0)),
            );
        }
        if let Some(importance) = self.importance {
            props.insert("importance".into(), PropertyValue::Float(importance));
        }
        if let Some(embedding) = &self.embedding {
            props.insert("embedding".into(), float_list(embedding));
        }
        if let Some(embeddings) = &self.embeddings {
            // maps are not storable, keep them as compact JSON
            if let Ok(encoded) = serde_json::to_string(embeddings) {
                props.insert("embeddings".into(), PropertyValue::String(encoded));
            }
        }
        insert_timestamps(&mut props, self.created_at, self.updated_at, now);
        props.insert("version".into(), PropertyValue::Int(self.version.max(1)));
        props
    }

    /// Rebuild an entity from a stored node
    pub fn from_value(node: &NodeValue) -> Self {
        let props = &node.properties;
        let id = props
            .get("id")
            .and_then(value_to_id)
            .unwrap_or_else(|| node.element_id.clone());

        Self {
            id,
            element_id: Some(node.element_id.clone()).filter(|e| !e.is_empty()),
            labels: node.labels.clone(),
            properties: caller_properties(props, NODE_RESERVED_KEYS),
            description: props
                .get("description")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            confidence: props.get("confidence").and_then(Value::as_f64),
            importance: props.get("importance").and_then(Value::as_f64),
            embedding: props.get("embedding").and_then(value_to_floats),
            embeddings: props
                .get("embeddings")
                .and_then(|v| v.as_str())
                .and_then(|s| serde_json::from_str(s).ok()),
            created_at: props.get("created_at").and_then(value_to_timestamp),
            updated_at: props.get("updated_at").and_then(value_to_timestamp),
            version: props.get("version").and_then(Value::as_i64).unwrap_or(0),
        }
    }

    /// Drop timestamps and version
    pub fn strip_metadata(&mut self) {
        self.created_at = None;
        self.updated_at = None;
        self.version = 0;
        for key in METADATA_KEYS {
            self.properties.remove(*key);
        }
    }
}

// ============================================================================
// Relationships
// ============================================================================

/// A directed relationship between two entities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Business identifier; derived as `<start>_<type>_<end>` when empty
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,

    /// Relationship type
    #[serde(rename = "type")]
    pub rel_type: String,

    /// Business id of the start entity
    pub start_node: String,

    /// Business id of the end entity
    pub end_node: String,

    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub version: i64,
}

impl Relationship {
    pub fn new(
        start_node: impl Into<String>,
        rel_type: impl Into<String>,
        end_node: impl Into<String>,
    ) -> Self {
        Self {
            rel_type: rel_type.into(),
            start_node: start_node.into(),
            end_node: end_node.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// The business id, derived from the endpoints when unset
    pub fn effective_id(&self) -> String {
        if self.id.is_empty() {
            format!("{}_{}_{}", self.start_node, self.rel_type, self.end_node)
        } else {
            self.id.clone()
        }
    }

    /// Flatten into the property map written to the server.
    ///
    /// The type is kept as a `type` property so it survives the
    /// generic relationship type used in database mode.
    pub fn to_properties(&self, now: DateTime<Utc>) -> BTreeMap<String, PropertyValue> {
        let mut props = gate_properties(&self.properties, RELATIONSHIP_RESERVED_KEYS);

        props.insert("id".into(), PropertyValue::String(self.effective_id()));
        props.insert("type".into(), PropertyValue::String(self.rel_type.clone()));
        if let Some(description) = &self.description {
            props.insert(
                "description".into(),
                PropertyValue::String(description.clone()),
            );
        }
        if let Some(confidence) = self.confidence {
            props.insert(
                "confidence".into(),
                PropertyValue::Float(confidence.clamp(0.0, 1.0)),
            );
        }
        if let Some(weight) = self.weight {
            props.insert("weight".into(), PropertyValue::Float(weight));
        }
        if let Some(embedding) = &self.embedding {
            props.insert("embedding".into(), float_list(embedding));
        }
        insert_timestamps(&mut props, self.created_at, self.updated_at, now);
        props.insert("version".into(), PropertyValue::Int(self.version.max(1)));
        props
    }

    /// Rebuild a relationship from a stored value and endpoint business ids
    pub fn from_value(rel: &RelationshipValue, start_node: String, end_node: String) -> Self {
        let props = &rel.properties;
        let rel_type = props
            .get("type")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| rel.rel_type.clone());

        Self {
            id: props
                .get("id")
                .and_then(value_to_id)
                .unwrap_or_else(|| rel.element_id.clone()),
            element_id: Some(rel.element_id.clone()).filter(|e| !e.is_empty()),
            rel_type,
            start_node,
            end_node,
            properties: caller_properties(props, RELATIONSHIP_RESERVED_KEYS),
            description: props
                .get("description")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            confidence: props.get("confidence").and_then(Value::as_f64),
            weight: props.get("weight").and_then(Value::as_f64),
            embedding: props.get("embedding").and_then(value_to_floats),
            created_at: props.get("created_at").and_then(value_to_timestamp),
            updated_at: props.get("updated_at").and_then(value_to_timestamp),
            version: props.get("version").and_then(Value::as_i64).unwrap_or(0),
        }
    }

    /// Drop timestamps and version
    pub fn strip_metadata(&mut self) {
        self.created_at = None;
        self.updated_at = None;
        self.version = 0;
        for key in METADATA_KEYS {
            self.properties.remove(*key);
        }
    }
}

/// A path through the graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphPath {
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
    pub length: usize,
}

// ============================================================================
// Graph-level records
// ============================================================================

/// Summary of a logical graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphInfo {
    pub name: String,
    pub node_count: u64,
    pub relationship_count: u64,
    pub storage_mode: StorageMode,
    /// Database holding the graph
    pub database: String,
    /// Partition label (label mode only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_label: Option<String>,
}

/// A detected community
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: String,
    pub level: u32,
    pub members: Vec<String>,
    pub size: usize,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub algorithm: String,
}

/// Outcome of a delete call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSummary {
    pub deleted: u64,
}

// ============================================================================
// Property helpers
// ============================================================================

fn gate_properties(
    properties: &BTreeMap<String, serde_json::Value>,
    reserved: &[&str],
) -> BTreeMap<String, PropertyValue> {
    properties
        .iter()
        .filter(|(key, _)| !reserved.contains(&key.as_str()))
        .filter_map(|(key, value)| match coerce(value) {
            Coerced::Native(v) | Coerced::Encoded(v) => Some((key.clone(), v)),
            Coerced::Dropped => {
                tracing::debug!("Dropping unsupported property '{}'", key);
                None
            }
        })
        .collect()
}

fn caller_properties(
    props: &BTreeMap<String, Value>,
    reserved: &[&str],
) -> BTreeMap<String, serde_json::Value> {
    props
        .iter()
        .filter(|(key, _)| !reserved.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.to_json()))
        .collect()
}

fn float_list(values: &[f32]) -> PropertyValue {
    PropertyValue::FloatList(values.iter().map(|v| f64::from(*v)).collect())
}

fn insert_timestamps(
    props: &mut BTreeMap<String, PropertyValue>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) {
    let created = created_at.unwrap_or(now);
    let updated = updated_at.unwrap_or(now);
    props.insert("created_at".into(), PropertyValue::Int(created.timestamp()));
    props.insert("updated_at".into(), PropertyValue::Int(updated.timestamp()));
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

fn value_to_floats(value: &Value) -> Option<Vec<f32>> {
    value
        .as_list()
        .map(|items| items.iter().filter_map(Value::as_f64).map(|f| f as f32).collect())
}

/// Timestamps are stored as epoch seconds; RFC 3339 strings are accepted too
fn value_to_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Int(secs) => DateTime::from_timestamp(*secs, 0),
        Value::Float(secs) => DateTime::from_timestamp(*secs as i64, 0),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}
