//! Schema descriptor records

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type tag used when the server does not report one
pub const MIXED_TYPE: &str = "mixed";

/// A property observed on a label or relationship type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    /// Inferred type, `mixed` when unknown
    #[serde(rename = "type")]
    pub type_name: String,
    pub count: u64,
    pub nullable: bool,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: MIXED_TYPE.to_string(),
            count: 0,
            nullable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub constraint_type: String,
    pub labels: Vec<String>,
    pub properties: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub index_type: String,
    pub labels: Vec<String>,
    pub properties: Vec<String>,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaStatistics {
    pub node_count: u64,
    pub relationship_count: u64,
    pub label_counts: BTreeMap<String, u64>,
}

/// What a graph holds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSchema {
    pub node_labels: Vec<String>,
    pub relationship_types: Vec<String>,
    pub node_properties: BTreeMap<String, Vec<PropertyDescriptor>>,
    pub relationship_properties: BTreeMap<String, Vec<PropertyDescriptor>>,
    pub constraints: Vec<ConstraintInfo>,
    pub indexes: Vec<IndexInfo>,
    pub statistics: SchemaStatistics,
}

impl GraphSchema {
    /// Keep only constraints and indexes touching a label with `prefix`
    pub fn retain_prefixed(&mut self, prefix: &str) {
        self.constraints
            .retain(|c| c.labels.iter().any(|l| l.starts_with(prefix)));
        self.indexes
            .retain(|i| i.labels.iter().any(|l| l.starts_with(prefix)));
    }

    /// Remove a property from every descriptor list
    pub fn exclude_property(&mut self, property: &str) {
        for props in self
            .node_properties
            .values_mut()
            .chain(self.relationship_properties.values_mut())
        {
            props.retain(|p| p.name != property);
        }
    }
}
