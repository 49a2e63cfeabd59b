//! Query engine
//!
//! Compiles each query type to a single statement, runs it in a managed
//! transaction on the graph's database and turns the records into
//! entities, relationships and paths.
//!
//! Author: hephaex@gmail.com

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use trellis_core::options::DEFAULT_NODE_LIMIT;
use trellis_core::value::{NodeValue, PathValue, RelationshipValue};
use trellis_core::{
    Direction, GraphPath, Node, QueryOptions, QueryResult, QuerySummary, QueryType, Relationship,
    Result, ReturnType, StoreError, TraversalOptions, Value,
};

use crate::adapter::{with_timeout, Neo4jStore};
use crate::cypher::{escape, Conditions};
use crate::driver::{AccessMode, Record, Statement};
use crate::graphs::ensure_graph_exists;
use crate::mode::GraphScope;
use crate::nodes::node_from_value;

/// Leading clauses of a query that may run in a read transaction
const READ_PREFIXES: &[&str] = &["MATCH", "OPTIONAL", "RETURN", "WITH", "UNWIND", "CALL"];

/// Clauses that make a query a write
const WRITE_CLAUSES: &str = r"(?i)\b(CREATE|MERGE|DELETE|SET|REMOVE)\b";

/// A statement ready to run, with its routing
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub statement: Statement,
    pub mode: AccessMode,
}

impl CompiledQuery {
    fn read(statement: Statement) -> Self {
        Self {
            statement,
            mode: AccessMode::Read,
        }
    }
}

impl Neo4jStore {
    pub async fn query(&self, opts: QueryOptions) -> Result<QueryResult> {
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;
        let context = format!("{} query on graph '{}'", opts.query_type, opts.graph_name);

        with_timeout("query", opts.timeout_secs, async {
            ensure_graph_exists(&session, &scope).await?;
            let compiled = compile(&scope, &opts)?;
            let read_only = compiled.mode == AccessMode::Read;

            let started = Instant::now();
            let mut records = session
                .run_one(scope.database(), compiled.mode, compiled.statement, "execute")
                .await
                .map_err(|e| e.with_context(&context))?;
            let execution_time_ms = started.elapsed().as_millis() as u64;

            if matches!(opts.query_type, QueryType::Cypher | QueryType::Custom) {
                records = page(records, opts.skip, opts.limit);
            }

            let mut result = parse_records(&records, &scope, opts.return_type);
            result.summary = QuerySummary {
                query_type: opts.query_type,
                record_count: records.len(),
                read_only,
                execution_time_ms,
            };
            tracing::debug!(
                "{} returned {} records in {}ms",
                context,
                records.len(),
                execution_time_ms
            );
            Ok(result)
        })
        .await
    }
}

// ============================================================================
// Compilation
// ============================================================================

/// Compile a query for a graph scope
pub fn compile(scope: &GraphScope, opts: &QueryOptions) -> Result<CompiledQuery> {
    match opts.query_type {
        QueryType::Cypher | QueryType::Custom => compile_cypher(scope, opts),
        QueryType::Traversal => {
            let traversal = match &opts.traversal {
                Some(t) => t.clone(),
                None => TraversalOptions::from_parameters(&opts.parameters),
            };
            Ok(CompiledQuery::read(compile_traversal(
                scope,
                &traversal,
                opts.limit,
            )))
        }
        QueryType::Path => compile_path(scope, &opts.parameters).map(CompiledQuery::read),
        QueryType::Analytics => Ok(CompiledQuery::read(compile_analytics(
            scope,
            &opts.parameters,
            opts.limit,
        ))),
    }
}

fn compile_cypher(scope: &GraphScope, opts: &QueryOptions) -> Result<CompiledQuery> {
    if opts.query.trim().is_empty() {
        return Err(StoreError::Precondition(format!(
            "{} query text is empty",
            opts.query_type
        )));
    }

    // An explicit flag only picks routing; the server rejects writes in a read transaction
    let mode = match opts.read_only {
        Some(true) => AccessMode::Read,
        Some(false) => AccessMode::Write,
        None if is_read_query(&opts.query) => AccessMode::Read,
        None => AccessMode::Write,
    };

    let statement = Statement::new(opts.query.clone())
        .params(scope.query_parameters())
        .params(
            opts.parameters
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v))),
        );
    Ok(CompiledQuery { statement, mode })
}

/// Whether a query can run in a read transaction
pub fn is_read_query(query: &str) -> bool {
    let first: String = query
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    READ_PREFIXES.contains(&first.to_uppercase().as_str()) && !has_write_clause(query)
}

fn has_write_clause(query: &str) -> bool {
    if let Ok(re) = Regex::new(WRITE_CLAUSES) {
        re.is_match(query)
    } else {
        true
    }
}

fn arrow(direction: Direction, inner: &str) -> String {
    match direction {
        Direction::Outgoing => format!("-[{inner}]->"),
        Direction::Incoming => format!("<-[{inner}]-"),
        Direction::Both => format!("-[{inner}]-"),
    }
}

/// Variable-length expansion from a start entity
pub fn compile_traversal(
    scope: &GraphScope,
    traversal: &TraversalOptions,
    limit: Option<usize>,
) -> Statement {
    let min_depth = traversal.min_depth.max(1);
    let max_depth = traversal.max_depth().max(min_depth);

    let mut conditions = Conditions::new();
    if let Some(start) = &traversal.start_node {
        conditions.push("source.id = $start_node");
        conditions.param("start_node", start.as_str());
    }
    if !traversal.relationship_types.is_empty() {
        conditions
            .push("all(rel IN relationships(p) WHERE coalesce(rel.type, type(rel)) IN $rel_types)");
        conditions.param("rel_types", traversal.relationship_types.clone());
    }
    for (i, (key, value)) in traversal.relationship_filters.iter().enumerate() {
        let param = format!("rf{i}");
        conditions.push(format!(
            "all(rel IN relationships(p) WHERE rel.{} = ${param})",
            escape(key)
        ));
        conditions.param(param, Value::from_json(value));
    }
    conditions.equals("target", "nf", &traversal.node_filters);
    if let Some(label) = scope.graph_label() {
        conditions.push(format!("all(x IN nodes(p) WHERE x:{})", escape(label)));
    }

    let returns = if traversal.return_paths {
        "RETURN p"
    } else {
        "RETURN source, relationships(p) AS relationships, target"
    };
    let limit = traversal.limit.or(limit).unwrap_or(DEFAULT_NODE_LIMIT);

    let where_clause = conditions.where_clause();
    Statement::new(format!(
        "MATCH p = {}{}{}{} {} LIMIT $limit",
        scope.node_pattern("source"),
        arrow(traversal.direction, &format!("*{min_depth}..{max_depth}")),
        scope.node_pattern("target"),
        where_clause,
        returns
    ))
    .params(conditions.into_params())
    .param("limit", limit)
}

/// Shortest path between two entities, ignoring direction
pub fn compile_path(
    scope: &GraphScope,
    parameters: &BTreeMap<String, serde_json::Value>,
) -> Result<Statement> {
    let param = |key: &str| {
        parameters
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                StoreError::Precondition(format!("path query requires a '{key}' parameter"))
            })
    };
    let start = param("start_node")?;
    let end = param("end_node")?;
    let hops = match parameters
        .get("max_depth")
        .and_then(|v| v.as_u64())
        .filter(|d| *d > 0)
    {
        Some(max_depth) => format!("*..{max_depth}"),
        None => "*".to_string(),
    };

    let scoped = match scope.graph_label() {
        Some(label) => format!(" WHERE all(x IN nodes(p) WHERE x:{})", escape(label)),
        None => String::new(),
    };
    Ok(Statement::new(format!(
        "MATCH {}, {} MATCH p = shortestPath((source)-[{hops}]-(target)){scoped} RETURN p",
        scope.node_pattern_by_id("source", "start_node"),
        scope.node_pattern_by_id("target", "end_node"),
    ))
    .param("start_node", start)
    .param("end_node", end))
}

/// Degree-based approximations of common centrality measures
pub fn compile_analytics(
    scope: &GraphScope,
    parameters: &BTreeMap<String, serde_json::Value>,
    limit: Option<usize>,
) -> Statement {
    let n = scope.node_pattern("n");
    let m = scope.node_pattern("m");
    let algorithm = parameters
        .get("algorithm")
        .and_then(|v| v.as_str())
        .unwrap_or("degree")
        .to_lowercase();

    let body = match algorithm.as_str() {
        "pagerank" => format!(
            "MATCH {n} OPTIONAL MATCH {m}-[r]->(n) WITH n, count(r) AS incoming \
             RETURN n AS node, n.id AS id, toFloat(incoming) AS score"
        ),
        "betweenness" => format!(
            "MATCH {n} OPTIONAL MATCH (a)-->(n)-->(b) WHERE a <> b \
             WITH n, count(a) AS bridges RETURN n AS node, n.id AS id, toFloat(bridges) AS score"
        ),
        "closeness" => format!(
            "MATCH {n} OPTIONAL MATCH (n)-[*1..2]-{m} WHERE m <> n \
             WITH n, count(DISTINCT m) AS reach RETURN n AS node, n.id AS id, toFloat(reach) AS score"
        ),
        other => {
            if other != "degree" {
                tracing::warn!("Unknown analytics algorithm '{}', using degree", other);
            }
            format!(
                "MATCH {n} OPTIONAL MATCH (n)-[r]-{m} WITH n, count(r) AS degree \
                 RETURN n AS node, n.id AS id, toFloat(degree) AS score"
            )
        }
    };

    Statement::new(format!("{body} ORDER BY score DESC LIMIT $limit"))
        .param("limit", limit.unwrap_or(DEFAULT_NODE_LIMIT))
}

fn page(records: Vec<Record>, skip: Option<usize>, limit: Option<usize>) -> Vec<Record> {
    records
        .into_iter()
        .skip(skip.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

// ============================================================================
// Result parsing
// ============================================================================

#[derive(Default)]
struct Collected {
    nodes: Vec<NodeValue>,
    relationships: Vec<RelationshipValue>,
    paths: Vec<PathValue>,
}

impl Collected {
    fn visit(&mut self, value: &Value) {
        match value {
            Value::Node(node) => self.add_node(node),
            Value::Relationship(rel) => self.add_relationship(rel),
            Value::Path(path) => {
                for node in &path.nodes {
                    self.add_node(node);
                }
                for rel in &path.relationships {
                    self.add_relationship(rel);
                }
                self.paths.push(path.clone());
            }
            Value::List(items) => items.iter().for_each(|v| self.visit(v)),
            Value::Map(map) => map.values().for_each(|v| self.visit(v)),
            _ => {}
        }
    }

    fn add_node(&mut self, node: &NodeValue) {
        if !self.nodes.iter().any(|n| n.element_id == node.element_id) {
            self.nodes.push(node.clone());
        }
    }

    fn add_relationship(&mut self, rel: &RelationshipValue) {
        if !self
            .relationships
            .iter()
            .any(|r| r.element_id == rel.element_id)
        {
            self.relationships.push(rel.clone());
        }
    }
}

/// Business ids of every node seen, keyed by element id
fn business_ids(nodes: &[NodeValue]) -> HashMap<&str, String> {
    nodes
        .iter()
        .filter_map(|n| {
            n.properties
                .get("id")
                .and_then(Value::as_str)
                .map(|id| (n.element_id.as_str(), id.to_string()))
        })
        .collect()
}

fn resolve_relationship(rel: &RelationshipValue, ids: &HashMap<&str, String>) -> Relationship {
    let endpoint = |element_id: &str| {
        ids.get(element_id)
            .cloned()
            .unwrap_or_else(|| element_id.to_string())
    };
    Relationship::from_value(
        rel,
        endpoint(&rel.start_element_id),
        endpoint(&rel.end_element_id),
    )
}

/// Turn records into a query result, keeping what the return type asks for
pub fn parse_records(records: &[Record], scope: &GraphScope, return_type: ReturnType) -> QueryResult {
    if return_type == ReturnType::Empty {
        return QueryResult::default();
    }

    let mut collected = Collected::default();
    for record in records {
        for (_, value) in record.iter() {
            collected.visit(value);
        }
    }
    let ids = business_ids(&collected.nodes);

    let mut result = QueryResult {
        records: records.iter().map(Record::to_json).collect(),
        ..Default::default()
    };
    if return_type.wants_nodes() {
        result.nodes = collected
            .nodes
            .iter()
            .map(|n| node_from_value(n, scope))
            .collect::<Vec<Node>>();
    }
    if return_type.wants_relationships() {
        result.relationships = collected
            .relationships
            .iter()
            .map(|r| resolve_relationship(r, &ids))
            .collect();
    }
    if return_type.wants_paths() {
        result.paths = collected
            .paths
            .iter()
            .map(|p| GraphPath {
                nodes: p.nodes.iter().map(|n| node_from_value(n, scope)).collect(),
                relationships: p
                    .relationships
                    .iter()
                    .map(|r| resolve_relationship(r, &ids))
                    .collect(),
                length: p.relationships.len(),
            })
            .collect();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected_store, ScriptedBackend};
    use std::sync::Arc;
    use trellis_core::ErrorKind;

    fn label_scope() -> GraphScope {
        GraphScope::Label {
            graph: "A".into(),
            database: "neo4j".into(),
            label: "__Graph_A".into(),
            prefix: "__Graph_".into(),
            namespace_property: "__graph_namespace".into(),
        }
    }

    fn node(element_id: &str, id: &str) -> NodeValue {
        NodeValue {
            element_id: element_id.into(),
            labels: vec!["Person".into(), "__Graph_A".into()],
            properties: BTreeMap::from([("id".to_string(), Value::from(id))]),
        }
    }

    fn knows(element_id: &str, from: &str, to: &str) -> RelationshipValue {
        RelationshipValue {
            element_id: element_id.into(),
            rel_type: "KNOWS".into(),
            start_element_id: from.into(),
            end_element_id: to.into(),
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn test_read_detection() {
        assert!(is_read_query("MATCH (n) RETURN n"));
        assert!(is_read_query("  optional match (n) return n"));
        assert!(is_read_query("CALL db.labels()"));
        assert!(!is_read_query("MATCH (n) SET n.x = 1"));
        assert!(!is_read_query("MATCH (n) DETACH DELETE n"));
        assert!(!is_read_query("CREATE (n)"));
        // whole words only
        assert!(is_read_query("MATCH (n) WHERE n.created_at > 0 RETURN n.settings"));
    }

    #[test]
    fn test_cypher_routing() {
        let scope = label_scope();
        let opts = QueryOptions::cypher("A", "MATCH (n:`__Graph_A`) RETURN n")
            .with_parameter("x", 1);
        let compiled = compile(&scope, &opts).unwrap();
        assert_eq!(compiled.mode, AccessMode::Read);
        assert_eq!(
            compiled.statement.params["__graph_label"],
            Value::from("__Graph_A")
        );
        assert_eq!(compiled.statement.params["__graph_namespace"], Value::from("A"));
        assert_eq!(compiled.statement.params["x"], Value::Int(1));

        let write = compile(&scope, &QueryOptions::cypher("A", "MERGE (n {id: 'x'})")).unwrap();
        assert_eq!(write.mode, AccessMode::Write);

        let forced = compile(&scope, &QueryOptions::cypher("A", "MATCH (n) RETURN n").read_only(false))
            .unwrap();
        assert_eq!(forced.mode, AccessMode::Write);

        let routed = compile(&scope, &QueryOptions::cypher("A", "CREATE (n)").read_only(true))
            .unwrap();
        assert_eq!(routed.mode, AccessMode::Read);
    }

    #[test]
    fn test_read_only_flag_is_not_second_guessed() {
        let opts = QueryOptions::cypher("A", "MATCH (n) WHERE n.status = 'delete' RETURN n")
            .read_only(true);
        let compiled = compile(&label_scope(), &opts).unwrap();
        assert_eq!(compiled.mode, AccessMode::Read);
        assert_eq!(
            compiled.statement.text,
            "MATCH (n) WHERE n.status = 'delete' RETURN n"
        );
    }

    #[test]
    fn test_traversal_statement() {
        let traversal = TraversalOptions {
            start_node: Some("n1".into()),
            direction: Direction::Outgoing,
            max_depth: 3,
            relationship_types: vec!["KNOWS".into()],
            node_filters: [("status".to_string(), serde_json::json!("active"))]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let statement = compile_traversal(&label_scope(), &traversal, None);
        assert_eq!(
            statement.text,
            "MATCH p = (source:`__Graph_A`)-[*1..3]->(target:`__Graph_A`) \
             WHERE source.id = $start_node \
             AND all(rel IN relationships(p) WHERE coalesce(rel.type, type(rel)) IN $rel_types) \
             AND target.`status` = $nf0 \
             AND all(x IN nodes(p) WHERE x:`__Graph_A`) \
             RETURN source, relationships(p) AS relationships, target LIMIT $limit"
        );
        assert_eq!(statement.params["start_node"], Value::from("n1"));
        assert_eq!(statement.params["limit"], Value::Int(1000));
    }

    #[test]
    fn test_traversal_defaults() {
        let scope = GraphScope::Database { graph: "A".into() };
        let statement = compile_traversal(
            &scope,
            &TraversalOptions {
                return_paths: true,
                ..Default::default()
            },
            Some(5),
        );
        assert_eq!(
            statement.text,
            "MATCH p = (source)-[*1..10]-(target) RETURN p LIMIT $limit"
        );
        assert_eq!(statement.params["limit"], Value::Int(5));
    }

    #[test]
    fn test_path_requires_endpoints() {
        let scope = label_scope();
        let mut params = BTreeMap::new();
        params.insert("start_node".to_string(), serde_json::json!("n1"));
        assert_eq!(
            compile_path(&scope, &params).unwrap_err().kind(),
            ErrorKind::Precondition
        );

        params.insert("end_node".to_string(), serde_json::json!("n2"));
        let statement = compile_path(&scope, &params).unwrap();
        assert!(statement.text.starts_with(
            "MATCH (source:`__Graph_A` {id: $start_node}), (target:`__Graph_A` {id: $end_node}) \
             MATCH p = shortestPath((source)-[*]-(target))"
        ));
        assert!(statement.text.ends_with("WHERE all(x IN nodes(p) WHERE x:`__Graph_A`) RETURN p"));
    }

    #[test]
    fn test_path_depth_bound_is_optional() {
        let scope = GraphScope::Database { graph: "A".into() };
        let mut params = BTreeMap::from([
            ("start_node".to_string(), serde_json::json!("n1")),
            ("end_node".to_string(), serde_json::json!("n2")),
        ]);
        assert!(compile_path(&scope, &params)
            .unwrap()
            .text
            .ends_with("MATCH p = shortestPath((source)-[*]-(target)) RETURN p"));

        params.insert("max_depth".to_string(), serde_json::json!(25));
        assert!(compile_path(&scope, &params)
            .unwrap()
            .text
            .ends_with("MATCH p = shortestPath((source)-[*..25]-(target)) RETURN p"));
    }

    #[test]
    fn test_unknown_analytics_falls_back_to_degree() {
        let scope = GraphScope::Database { graph: "A".into() };
        let params = BTreeMap::from([("algorithm".to_string(), serde_json::json!("eigenvector"))]);
        let statement = compile_analytics(&scope, &params, Some(10));
        assert!(statement.text.contains("count(r) AS degree"));
        assert!(statement.text.ends_with("ORDER BY score DESC LIMIT $limit"));

        let params = BTreeMap::from([("algorithm".to_string(), serde_json::json!("PageRank"))]);
        assert!(compile_analytics(&scope, &params, None)
            .text
            .contains("AS incoming"));
    }

    #[test]
    fn test_parse_records_resolves_business_ids() {
        let path = PathValue {
            nodes: vec![node("4:x:1", "n1"), node("4:x:2", "n2")],
            relationships: vec![knows("5:x:1", "4:x:1", "4:x:2")],
        };
        let records = vec![
            Record::from_pairs([("p", Value::Path(path))]),
            Record::from_pairs([("n", Value::Node(node("4:x:1", "n1")))]),
        ];

        let result = parse_records(&records, &label_scope(), ReturnType::All);
        assert_eq!(result.nodes.len(), 2);
        assert_eq!(result.nodes[0].labels, vec!["Person"]);
        assert_eq!(result.relationships.len(), 1);
        assert_eq!(result.relationships[0].start_node, "n1");
        assert_eq!(result.relationships[0].end_node, "n2");
        assert_eq!(result.paths[0].length, 1);
        assert_eq!(result.records.len(), 2);

        let nodes_only = parse_records(&records, &label_scope(), ReturnType::Nodes);
        assert!(nodes_only.relationships.is_empty());
        assert!(nodes_only.paths.is_empty());
        assert!(parse_records(&records, &label_scope(), ReturnType::Empty).records.is_empty());
    }

    #[tokio::test]
    async fn test_query_on_missing_graph() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = connected_store(backend, false).await;
        let err = store
            .query(QueryOptions::cypher("A", "MATCH (n) RETURN n"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::GraphNotFound(_)));
    }

    #[tokio::test]
    async fn test_query_runs_in_read_transaction() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .on("LIMIT 1 RETURN count(n) > 0", vec![Record::from_pairs([("exists", true)])])
                .on(
                    "RETURN n.name AS name",
                    vec![
                        Record::from_pairs([("name", "a")]),
                        Record::from_pairs([("name", "b")]),
                        Record::from_pairs([("name", "c")]),
                    ],
                ),
        );
        let store = connected_store(backend.clone(), false).await;

        let opts = QueryOptions {
            skip: Some(1),
            limit: Some(1),
            ..QueryOptions::cypher("A", "MATCH (n:`__Graph_A`) RETURN n.name AS name")
        };
        let result = store.query(opts).await.unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0]["name"], serde_json::json!("b"));
        assert!(result.summary.read_only);
        assert_eq!(result.summary.query_type, QueryType::Cypher);

        let executed = &backend.matching("RETURN n.name AS name")[0];
        assert_eq!(executed.mode, AccessMode::Read);
        assert_eq!(executed.database, "neo4j");
    }

    #[tokio::test]
    async fn test_query_errors_carry_context() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .on("LIMIT 1 RETURN count(n) > 0", vec![Record::from_pairs([("exists", true)])])
                .fail("RETURN x", "Variable `x` not defined"),
        );
        let store = connected_store(backend, false).await;
        let err = store
            .query(QueryOptions::cypher("A", "MATCH (n) RETURN x"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cypher query on graph 'A': execute: Variable `x` not defined"
        );
    }
}
