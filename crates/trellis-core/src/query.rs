//! Query results

use serde::{Deserialize, Serialize};

use crate::model::{GraphPath, Node, Relationship};
use crate::options::QueryType;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySummary {
    pub query_type: QueryType,
    pub record_count: usize,
    pub read_only: bool,
    pub execution_time_ms: u64,
}

/// Parsed output of a query call
///
/// `records` always holds every row as JSON; graph values found in the
/// rows are additionally parsed into `nodes`, `relationships` and `paths`
/// according to the requested return type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
    pub paths: Vec<GraphPath>,
    pub records: Vec<serde_json::Map<String, serde_json::Value>>,
    pub summary: QuerySummary,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
