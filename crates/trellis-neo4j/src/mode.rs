//! Storage mode policy
//!
//! A [`GraphScope`] is resolved once per call from the graph name and the
//! configured mode; storage components ask it for database names, label
//! patterns and write labels instead of branching on a flag.

use std::time::Duration;
use trellis_core::{DriverConfig, StorageMode, Value};

use crate::cypher::escape;

/// Database holding administration commands
pub const SYSTEM_DATABASE: &str = "system";

/// Relationship type stored in database mode; the caller type lives in `r.type`
pub const GENERIC_RELATIONSHIP_TYPE: &str = "GRAPH_RELATIONSHIP";

/// Mode settings captured at connect time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModePolicy {
    pub separate_database: bool,
    pub default_database: String,
    pub label_prefix: String,
    pub namespace_property: String,
    pub availability_timeout: Duration,
}

impl ModePolicy {
    pub fn new(driver: &DriverConfig, separate_database: bool) -> Self {
        Self {
            separate_database,
            default_database: driver.default_database().to_string(),
            label_prefix: driver.label_prefix().to_string(),
            namespace_property: driver.namespace_property().to_string(),
            availability_timeout: driver.availability_timeout(),
        }
    }

    pub fn storage_mode(&self) -> StorageMode {
        if self.separate_database {
            StorageMode::SeparateDatabase
        } else {
            StorageMode::LabelBased
        }
    }

    /// `<prefix><graph>`
    pub fn graph_label(&self, graph: &str) -> String {
        format!("{}{}", self.label_prefix, graph)
    }

    /// Resolve the scope of a (validated) graph name
    pub fn scope(&self, graph: &str) -> GraphScope {
        if self.separate_database {
            GraphScope::Database {
                graph: graph.to_string(),
            }
        } else {
            GraphScope::Label {
                graph: graph.to_string(),
                database: self.default_database.clone(),
                label: self.graph_label(graph),
                prefix: self.label_prefix.clone(),
                namespace_property: self.namespace_property.clone(),
            }
        }
    }
}

/// Where a logical graph lives and how its nodes are recognized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphScope {
    /// The graph is a database of the same name
    Database { graph: String },
    /// The graph is the set of nodes carrying `label` in a shared database
    Label {
        graph: String,
        database: String,
        label: String,
        prefix: String,
        namespace_property: String,
    },
}

impl GraphScope {
    pub fn graph(&self) -> &str {
        match self {
            Self::Database { graph } | Self::Label { graph, .. } => graph,
        }
    }

    pub fn database(&self) -> &str {
        match self {
            Self::Database { graph } => graph,
            Self::Label { database, .. } => database,
        }
    }

    pub fn graph_label(&self) -> Option<&str> {
        match self {
            Self::Database { .. } => None,
            Self::Label { label, .. } => Some(label),
        }
    }

    pub fn storage_mode(&self) -> StorageMode {
        match self {
            Self::Database { .. } => StorageMode::SeparateDatabase,
            Self::Label { .. } => StorageMode::LabelBased,
        }
    }

    /// Whether a freshly created graph must be polled until online
    pub fn needs_availability_wait(&self) -> bool {
        matches!(self, Self::Database { .. })
    }

    /// `(var:`label`)` in label mode, `(var)` otherwise
    pub fn node_pattern(&self, var: &str) -> String {
        match self.graph_label() {
            Some(label) => format!("({var}:{})", escape(label)),
            None => format!("({var})"),
        }
    }

    /// Node pattern also matching a business id parameter
    pub fn node_pattern_by_id(&self, var: &str, param: &str) -> String {
        match self.graph_label() {
            Some(label) => format!("({var}:{} {{id: ${param}}})", escape(label)),
            None => format!("({var} {{id: ${param}}})"),
        }
    }

    /// Labels to write, with the partition label appended in label mode
    pub fn write_labels(&self, labels: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(labels.len() + 1);
        for label in labels {
            if !label.is_empty() && !out.contains(label) {
                out.push(label.clone());
            }
        }
        if let Some(label) = self.graph_label() {
            if !out.iter().any(|l| l == label) {
                out.push(label.to_string());
            }
        }
        out
    }

    /// Caller-visible labels: partition labels removed
    pub fn visible_labels(&self, labels: &[String]) -> Vec<String> {
        match self {
            Self::Database { .. } => labels.to_vec(),
            Self::Label { prefix, .. } => labels
                .iter()
                .filter(|l| !l.starts_with(prefix.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// Stored relationship type for a caller type
    pub fn relationship_type<'a>(&self, rel_type: &'a str) -> &'a str {
        match self {
            Self::Database { .. } => GENERIC_RELATIONSHIP_TYPE,
            Self::Label { .. } => rel_type,
        }
    }

    /// Parameters every caller query can reference in label mode
    pub fn query_parameters(&self) -> Vec<(String, Value)> {
        match self {
            Self::Database { .. } => Vec::new(),
            Self::Label { graph, label, .. } => vec![
                ("__graph_label".to_string(), Value::from(label.as_str())),
                ("__graph_namespace".to_string(), Value::from(graph.as_str())),
            ],
        }
    }

    pub fn namespace_property(&self) -> Option<&str> {
        match self {
            Self::Database { .. } => None,
            Self::Label {
                namespace_property, ..
            } => Some(namespace_property),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(separate: bool) -> ModePolicy {
        ModePolicy::new(&DriverConfig::default(), separate)
    }

    #[test]
    fn test_database_scope() {
        let scope = policy(true).scope("A");
        assert_eq!(scope.database(), "A");
        assert_eq!(scope.graph_label(), None);
        assert_eq!(scope.node_pattern("n"), "(n)");
        assert_eq!(scope.relationship_type("KNOWS"), GENERIC_RELATIONSHIP_TYPE);
        assert!(scope.needs_availability_wait());
        assert!(scope.query_parameters().is_empty());
    }

    #[test]
    fn test_label_scope() {
        let scope = policy(false).scope("A");
        assert_eq!(scope.database(), "neo4j");
        assert_eq!(scope.graph_label(), Some("__Graph_A"));
        assert_eq!(scope.node_pattern("n"), "(n:`__Graph_A`)");
        assert_eq!(scope.node_pattern_by_id("a", "start"), "(a:`__Graph_A` {id: $start})");
        assert_eq!(scope.relationship_type("KNOWS"), "KNOWS");
        assert!(!scope.needs_availability_wait());
    }

    #[test]
    fn test_write_and_visible_labels() {
        let scope = policy(false).scope("A");
        let labels = vec!["T".to_string(), "T".to_string(), String::new()];
        assert_eq!(scope.write_labels(&labels), vec!["T", "__Graph_A"]);
        assert_eq!(
            scope.visible_labels(&["T".to_string(), "__Graph_A".to_string()]),
            vec!["T"]
        );
    }

    #[test]
    fn test_query_parameters() {
        let params = policy(false).scope("A").query_parameters();
        assert_eq!(params[0], ("__graph_label".to_string(), Value::from("__Graph_A")));
        assert_eq!(params[1], ("__graph_namespace".to_string(), Value::from("A")));
    }
}
