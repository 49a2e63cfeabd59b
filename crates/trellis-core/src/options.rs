//! Per-operation option records
//!
//! Every option struct derives `Default` so callers can fill in only what
//! they need with struct-update syntax.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::StoreError;
use crate::model::{Node, Relationship};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_NODE_LIMIT: usize = 1000;
pub const DEFAULT_MAX_DEPTH: u32 = 10;

/// Property equality filter
pub type PropertyFilter = BTreeMap<String, serde_json::Value>;

/// Timeout in seconds, zero meaning none
pub fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn effective_batch(batch_size: usize) -> usize {
    if batch_size == 0 {
        DEFAULT_BATCH_SIZE
    } else {
        batch_size
    }
}

// ============================================================================
// Graphs
// ============================================================================

/// Target of a graph-level call: create, drop or schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphOptions {
    pub graph_name: String,
    pub timeout_secs: u64,
}

impl GraphOptions {
    pub fn new(graph_name: impl Into<String>) -> Self {
        Self {
            graph_name: graph_name.into(),
            timeout_secs: 0,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

impl From<&str> for GraphOptions {
    fn from(graph_name: &str) -> Self {
        Self::new(graph_name)
    }
}

impl From<&String> for GraphOptions {
    fn from(graph_name: &String) -> Self {
        Self::new(graph_name.as_str())
    }
}

impl From<String> for GraphOptions {
    fn from(graph_name: String) -> Self {
        Self::new(graph_name)
    }
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AddNodesOptions {
    pub graph_name: String,
    pub nodes: Vec<Node>,
    pub upsert: bool,
    /// Nodes per write transaction (0 = 100)
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl AddNodesOptions {
    pub fn new(graph_name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            graph_name: graph_name.into(),
            nodes,
            ..Default::default()
        }
    }

    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn batch(&self) -> usize {
        effective_batch(self.batch_size)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetNodesOptions {
    pub graph_name: String,
    pub ids: Vec<String>,
    /// Match nodes carrying any of these labels
    pub labels: Vec<String>,
    pub filter: PropertyFilter,
    /// Defaults to true
    pub include_properties: Option<bool>,
    /// Defaults to true
    pub include_metadata: Option<bool>,
    /// Restrict returned property keys
    pub fields: Vec<String>,
    /// Defaults to 1000
    pub limit: Option<usize>,
    pub timeout_secs: u64,
}

impl GetNodesOptions {
    pub fn new(graph_name: impl Into<String>) -> Self {
        Self {
            graph_name: graph_name.into(),
            ..Default::default()
        }
    }

    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_NODE_LIMIT)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteNodesOptions {
    pub graph_name: String,
    pub ids: Vec<String>,
    pub filter: PropertyFilter,
    pub dry_run: bool,
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl DeleteNodesOptions {
    pub fn batch(&self) -> usize {
        effective_batch(self.batch_size)
    }
}

// ============================================================================
// Relationships
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AddRelationshipsOptions {
    pub graph_name: String,
    pub relationships: Vec<Relationship>,
    pub upsert: bool,
    /// Create missing endpoints as bare nodes
    pub create_nodes: bool,
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl AddRelationshipsOptions {
    pub fn new(graph_name: impl Into<String>, relationships: Vec<Relationship>) -> Self {
        Self {
            graph_name: graph_name.into(),
            relationships,
            ..Default::default()
        }
    }

    pub fn batch(&self) -> usize {
        effective_batch(self.batch_size)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetRelationshipsOptions {
    pub graph_name: String,
    pub ids: Vec<String>,
    /// Endpoint business ids, interpreted through `direction`
    pub node_ids: Vec<String>,
    pub direction: Direction,
    pub types: Vec<String>,
    pub filter: PropertyFilter,
    pub include_properties: Option<bool>,
    pub include_metadata: Option<bool>,
    pub fields: Vec<String>,
    pub limit: Option<usize>,
    pub timeout_secs: u64,
}

impl GetRelationshipsOptions {
    pub fn new(graph_name: impl Into<String>) -> Self {
        Self {
            graph_name: graph_name.into(),
            ..Default::default()
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_NODE_LIMIT)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteRelationshipsOptions {
    pub graph_name: String,
    pub ids: Vec<String>,
    pub filter: PropertyFilter,
    pub dry_run: bool,
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl DeleteRelationshipsOptions {
    pub fn batch(&self) -> usize {
        effective_batch(self.batch_size)
    }
}

/// Direction of an edge relative to a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[serde(alias = "IN")]
    Incoming,
    #[serde(alias = "OUT")]
    Outgoing,
    #[default]
    Both,
}

impl FromStr for Direction {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "IN" | "INCOMING" => Ok(Self::Incoming),
            "OUT" | "OUTGOING" => Ok(Self::Outgoing),
            "" | "BOTH" => Ok(Self::Both),
            other => Err(StoreError::Precondition(format!(
                "unknown direction '{other}'"
            ))),
        }
    }
}

// ============================================================================
// Queries
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    #[default]
    Cypher,
    Traversal,
    Path,
    Analytics,
    Custom,
}

impl FromStr for QueryType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cypher" => Ok(Self::Cypher),
            "traversal" => Ok(Self::Traversal),
            "path" => Ok(Self::Path),
            "analytics" => Ok(Self::Analytics),
            "custom" => Ok(Self::Custom),
            other => Err(StoreError::Unsupported(format!("query type '{other}'"))),
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cypher => "cypher",
            Self::Traversal => "traversal",
            Self::Path => "path",
            Self::Analytics => "analytics",
            Self::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Which parts of the result the caller wants parsed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnType {
    Nodes,
    Relationships,
    Paths,
    #[default]
    All,
    Empty,
}

impl ReturnType {
    pub fn wants_nodes(self) -> bool {
        matches!(self, Self::Nodes | Self::All)
    }

    pub fn wants_relationships(self) -> bool {
        matches!(self, Self::Relationships | Self::All)
    }

    pub fn wants_paths(self) -> bool {
        matches!(self, Self::Paths | Self::All)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalOptions {
    /// Business id of the start node; all nodes when absent
    pub start_node: Option<String>,
    pub direction: Direction,
    pub min_depth: u32,
    /// Defaults to 10
    pub max_depth: u32,
    pub relationship_types: Vec<String>,
    pub node_filters: PropertyFilter,
    pub relationship_filters: PropertyFilter,
    /// Return whole paths instead of (start, r, end) triples
    pub return_paths: bool,
    pub limit: Option<usize>,
}

impl TraversalOptions {
    /// Read traversal settings from a query parameter map
    pub fn from_parameters(params: &BTreeMap<String, serde_json::Value>) -> Self {
        let str_param = |key: &str| params.get(key).and_then(|v| v.as_str());
        let u32_param = |key: &str| {
            params
                .get(key)
                .and_then(|v| v.as_u64())
                .map(|v| v.min(u64::from(u32::MAX)) as u32)
        };
        let filter_param = |key: &str| -> PropertyFilter {
            match params.get(key) {
                Some(serde_json::Value::Object(map)) => {
                    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                }
                _ => PropertyFilter::new(),
            }
        };

        Self {
            start_node: str_param("start_node").map(str::to_string),
            direction: str_param("direction")
                .and_then(|d| d.parse().ok())
                .unwrap_or_default(),
            min_depth: u32_param("min_depth").unwrap_or(0),
            max_depth: u32_param("max_depth").unwrap_or(DEFAULT_MAX_DEPTH),
            relationship_types: match params.get("relationship_types") {
                Some(serde_json::Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                Some(serde_json::Value::String(single)) => vec![single.clone()],
                _ => Vec::new(),
            },
            node_filters: filter_param("node_filters"),
            relationship_filters: filter_param("relationship_filters"),
            return_paths: params
                .get("return_paths")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            limit: params
                .get("limit")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
        }
    }

    pub fn max_depth(&self) -> u32 {
        if self.max_depth == 0 {
            DEFAULT_MAX_DEPTH
        } else {
            self.max_depth
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub graph_name: String,
    pub query_type: QueryType,
    /// Cypher text for `cypher` and `custom` queries
    pub query: String,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub return_type: ReturnType,
    /// Explicit routing; auto-detected when unset
    pub read_only: Option<bool>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    pub timeout_secs: u64,
    pub traversal: Option<TraversalOptions>,
}

impl QueryOptions {
    pub fn cypher(graph_name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            graph_name: graph_name.into(),
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }
}

// ============================================================================
// Communities
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunityAlgorithm {
    #[default]
    Leiden,
    Louvain,
    LabelPropagation,
}

impl FromStr for CommunityAlgorithm {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "leiden" => Ok(Self::Leiden),
            "louvain" => Ok(Self::Louvain),
            "label_propagation" | "labelpropagation" | "lpa" => Ok(Self::LabelPropagation),
            other => Err(StoreError::Unsupported(format!(
                "community algorithm '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for CommunityAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Leiden => "leiden",
            Self::Louvain => "louvain",
            Self::LabelPropagation => "label_propagation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityOptions {
    pub graph_name: String,
    pub algorithm: CommunityAlgorithm,
    /// max_iterations, resolution, tolerance, ...
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub timeout_secs: u64,
}

// ============================================================================
// Indexes
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexTarget {
    #[default]
    Node,
    Relationship,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexType {
    #[default]
    #[serde(alias = "RANGE")]
    Btree,
    Fulltext,
    Vector,
}

impl IndexType {
    pub fn as_lower(self) -> &'static str {
        match self {
            Self::Btree => "btree",
            Self::Fulltext => "fulltext",
            Self::Vector => "vector",
        }
    }
}

impl FromStr for IndexType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "" | "BTREE" | "RANGE" => Ok(Self::Btree),
            "FULLTEXT" => Ok(Self::Fulltext),
            "VECTOR" => Ok(Self::Vector),
            other => Err(StoreError::Unsupported(format!("index type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateIndexOptions {
    pub graph_name: String,
    pub target: IndexTarget,
    /// First label (or relationship type) anchors the index
    pub labels: Vec<String>,
    pub properties: Vec<String>,
    pub index_type: IndexType,
    pub name: Option<String>,
    pub if_not_exists: bool,
    /// Vector settings: `dimension`, `similarity`
    pub config: BTreeMap<String, serde_json::Value>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DropIndexOptions {
    pub graph_name: String,
    pub name: String,
    pub if_exists: bool,
    pub timeout_secs: u64,
}

// ============================================================================
// Backup / restore
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFormat {
    #[default]
    Json,
    Cypher,
}

impl FromStr for BackupFormat {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "json" => Ok(Self::Json),
            "cypher" => Ok(Self::Cypher),
            other => Err(StoreError::Unsupported(format!("backup format '{other}'"))),
        }
    }
}

impl std::fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Cypher => f.write_str("cypher"),
        }
    }
}

/// Cypher WHERE fragments restricting what gets backed up
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupFilter {
    /// Applied to `n`
    pub nodes: Option<String>,
    /// Applied to `r`
    pub relationships: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupOptions {
    pub graph_name: String,
    pub format: BackupFormat,
    pub compress: bool,
    pub filter: BackupFilter,
    /// Extra metadata copied into the envelope
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    pub graph_name: String,
    /// Drop and recreate an existing graph
    pub force: bool,
    /// Create the graph when missing
    pub create_graph: bool,
    /// Auto-detected when unset
    pub format: Option<BackupFormat>,
    pub timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direction_parsing() {
        assert_eq!("in".parse::<Direction>().unwrap(), Direction::Incoming);
        assert_eq!("OUTGOING".parse::<Direction>().unwrap(), Direction::Outgoing);
        assert_eq!("".parse::<Direction>().unwrap(), Direction::Both);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_direction_serde_aliases() {
        let d: Direction = serde_json::from_value(json!("IN")).unwrap();
        assert_eq!(d, Direction::Incoming);
        assert_eq!(serde_json::to_value(Direction::Both).unwrap(), json!("BOTH"));
    }

    #[test]
    fn test_unknown_query_type_is_unsupported() {
        let err = "gremlin".parse::<QueryType>().unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
    }

    #[test]
    fn test_defaults() {
        let opts = AddNodesOptions::new("g", vec![]);
        assert_eq!(opts.batch(), 100);
        assert_eq!(GetNodesOptions::new("g").limit(), 1000);
        assert_eq!(IndexType::default().as_lower(), "btree");
        assert_eq!(timeout_from_secs(0), None);
        assert_eq!(timeout_from_secs(2), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_traversal_from_parameters() {
        let params: BTreeMap<String, serde_json::Value> = [
            ("start_node".to_string(), json!("n1")),
            ("direction".to_string(), json!("OUTGOING")),
            ("max_depth".to_string(), json!(3)),
            ("relationship_types".to_string(), json!(["KNOWS", "LIKES"])),
            ("node_filters".to_string(), json!({"status": "active"})),
        ]
        .into_iter()
        .collect();

        let t = TraversalOptions::from_parameters(&params);
        assert_eq!(t.start_node.as_deref(), Some("n1"));
        assert_eq!(t.direction, Direction::Outgoing);
        assert_eq!(t.max_depth(), 3);
        assert_eq!(t.relationship_types, vec!["KNOWS", "LIKES"]);
        assert_eq!(t.node_filters["status"], json!("active"));
        assert!(!t.return_paths);
    }

    #[test]
    fn test_traversal_defaults_from_empty_parameters() {
        let t = TraversalOptions::from_parameters(&BTreeMap::new());
        assert_eq!(t.direction, Direction::Both);
        assert_eq!(t.max_depth(), DEFAULT_MAX_DEPTH);
    }

    #[test]
    fn test_index_type_range_alias() {
        let t: IndexType = serde_json::from_value(json!("RANGE")).unwrap();
        assert_eq!(t, IndexType::Btree);
        assert_eq!("fulltext".parse::<IndexType>().unwrap(), IndexType::Fulltext);
    }
}
