//! Backup envelope (JSON format v1) and run summaries

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::StorageMode;
use crate::options::BackupFormat;

/// First two bytes of a gzip stream
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Header line naming the source graph in Cypher backups
pub const CYPHER_HEADER_PREFIX: &str = "// Neo4j Graph Backup - ";

/// Business ids are usually strings, integers are accepted on restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BackupId {
    Int(i64),
    String(String),
}

impl BackupId {
    pub fn into_string(self) -> String {
        match self {
            Self::Int(i) => i.to_string(),
            Self::String(s) => s,
        }
    }
}

impl From<String> for BackupId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupNode {
    pub id: BackupId,
    #[serde(default)]
    pub element_id: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRelationship {
    pub id: BackupId,
    #[serde(default)]
    pub element_id: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// Element id of the start node
    #[serde(default)]
    pub start_node: String,
    /// Element id of the end node
    #[serde(default)]
    pub end_node: String,
    #[serde(default)]
    pub start_business_id: String,
    #[serde(default)]
    pub end_business_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub storage_type: StorageMode,
    pub node_count: u64,
    pub relationship_count: u64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Whole-graph JSON backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEnvelope {
    pub format: BackupFormat,
    pub graph_name: String,
    pub metadata: BackupMetadata,
    #[serde(default)]
    pub nodes: Vec<BackupNode>,
    #[serde(default)]
    pub relationships: Vec<BackupRelationship>,
}

/// What a backup wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub graph_name: String,
    pub format: BackupFormat,
    pub compressed: bool,
    pub node_count: u64,
    pub relationship_count: u64,
    pub bytes_written: u64,
}

/// What a restore applied
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub graph_name: String,
    /// Graph the backup was taken from, when known
    pub source_graph: Option<String>,
    pub nodes_restored: u64,
    pub relationships_restored: u64,
    /// Cypher statements executed
    pub statements_executed: u64,
}

/// Graph name from the header of a Cypher backup
pub fn cypher_source_graph(script: &str) -> Option<String> {
    script
        .lines()
        .map(str::trim)
        .take_while(|line| line.is_empty() || line.starts_with("//"))
        .find_map(|line| line.strip_prefix(CYPHER_HEADER_PREFIX))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}
