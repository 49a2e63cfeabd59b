//! Node store

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use trellis_core::value::NodeValue;
use trellis_core::{
    AddNodesOptions, DeleteNodesOptions, DeleteSummary, GetNodesOptions, Node, Result, StoreError,
    Value,
};

use crate::adapter::{with_timeout, Neo4jStore, Session};
use crate::cypher::{label_expr, merge_set, Conditions};
use crate::driver::{AccessMode, Record, Statement};
use crate::graphs::ensure_writable;
use crate::mode::GraphScope;

impl Neo4jStore {
    /// Insert or upsert entities, returning their ids in input order
    pub async fn add_nodes(&self, opts: AddNodesOptions) -> Result<Vec<String>> {
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;
        if let Some(position) = opts.nodes.iter().position(|n| n.id.is_empty()) {
            return Err(StoreError::Precondition(format!(
                "node at position {position} has no id"
            )));
        }
        if opts.nodes.is_empty() {
            return Ok(Vec::new());
        }

        with_timeout("add nodes", opts.timeout_secs, async {
            ensure_writable(&session, &scope).await?;
            write_nodes(&session, &scope, &opts.nodes, opts.upsert, opts.batch()).await
        })
        .await
    }

    pub async fn get_nodes(&self, opts: GetNodesOptions) -> Result<Vec<Node>> {
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;

        let mut conditions = Conditions::new();
        conditions.ids("n", "ids", &opts.ids);
        conditions.any_label("n", "labels", &opts.labels);
        conditions.equals("n", "f", &opts.filter);
        let where_clause = conditions.where_clause();

        let statement = Statement::new(format!(
            "MATCH {}{} RETURN elementId(n) AS element_id, labels(n) AS labels, \
             properties(n) AS properties LIMIT $limit",
            scope.node_pattern("n"),
            where_clause
        ))
        .params(conditions.into_params())
        .param("limit", opts.limit());

        let records = with_timeout("get nodes", opts.timeout_secs, async {
            match session
                .run_one(scope.database(), AccessMode::Read, statement, "get nodes")
                .await
            {
                Err(StoreError::GraphNotFound(_)) => Ok(Vec::new()),
                other => other,
            }
        })
        .await?;

        let include_properties = opts.include_properties.unwrap_or(true);
        let include_metadata = opts.include_metadata.unwrap_or(true);
        Ok(records
            .iter()
            .map(|record| {
                let mut node = parse_node(record, &scope);
                if !include_properties {
                    node.properties.clear();
                } else if !opts.fields.is_empty() {
                    node.properties.retain(|key, _| opts.fields.contains(key));
                }
                if !include_metadata {
                    node.strip_metadata();
                }
                node
            })
            .collect())
    }

    /// Delete matching entities and their relationships
    pub async fn delete_nodes(&self, opts: DeleteNodesOptions) -> Result<DeleteSummary> {
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;
        if opts.ids.is_empty() && opts.filter.is_empty() {
            return Err(StoreError::UnsafeDelete(format!(
                "delete nodes needs ids or a filter; refusing to delete every node of graph '{}'",
                opts.graph_name
            )));
        }

        let mut conditions = Conditions::new();
        conditions.ids("n", "ids", &opts.ids);
        conditions.equals("n", "f", &opts.filter);
        let matcher = format!("MATCH {}{}", scope.node_pattern("n"), conditions.where_clause());
        let params = conditions.into_params();
        let batch = opts.batch() as i64;

        with_timeout("delete nodes", opts.timeout_secs, async {
            let matched = session
                .run_count(
                    scope.database(),
                    Statement::new(format!("{matcher} RETURN count(n) AS count"))
                        .params(params.clone()),
                    "count",
                    "count nodes to delete",
                )
                .await?;
            if opts.dry_run {
                return Err(StoreError::DryRun { matched });
            }
            if matched == 0 {
                return Ok(DeleteSummary::default());
            }

            let text = format!(
                "{matcher} WITH n LIMIT $batch DETACH DELETE n RETURN count(n) AS deleted"
            );
            let mut deleted = 0u64;
            loop {
                let count = session
                    .run_one(
                        scope.database(),
                        AccessMode::Write,
                        Statement::new(text.clone())
                            .params(params.clone())
                            .param("batch", batch),
                        "delete nodes",
                    )
                    .await?
                    .first()
                    .and_then(|r| r.get_i64("deleted"))
                    .unwrap_or(0);
                deleted += count.max(0) as u64;
                tracing::debug!("Deleted {} nodes from graph '{}'", deleted, scope.graph());
                if count < batch {
                    break;
                }
            }
            Ok(DeleteSummary { deleted })
        })
        .await
    }
}

/// Write entities in batches, one managed write transaction per batch.
///
/// Within a batch, entities are grouped by label set so each group becomes
/// one UNWIND statement.
pub(crate) async fn write_nodes(
    session: &Session,
    scope: &GraphScope,
    nodes: &[Node],
    upsert: bool,
    batch_size: usize,
) -> Result<Vec<String>> {
    let now = Utc::now();
    let mut ids = Vec::with_capacity(nodes.len());

    for (index, chunk) in nodes.chunks(batch_size.max(1)).enumerate() {
        let start = index * batch_size.max(1);
        let end = start + chunk.len();

        let mut groups: Vec<(Vec<String>, Vec<Value>)> = Vec::new();
        for node in chunk {
            let labels = scope.write_labels(&node.labels);
            let row = node_row(node, now);
            match groups.iter_mut().find(|(l, _)| *l == labels) {
                Some((_, rows)) => rows.push(row),
                None => groups.push((labels, vec![row])),
            }
        }

        let statements = groups
            .into_iter()
            .map(|(labels, rows)| {
                let write = if upsert {
                    format!(
                        "MERGE (n{} {{id: row.id}}) {}",
                        label_expr(&labels),
                        merge_set("n", "+=")
                    )
                } else {
                    format!(
                        "CREATE (n{} {{id: row.id}}) SET n += row.properties",
                        label_expr(&labels)
                    )
                };
                Statement::new(format!("UNWIND $rows AS row {write}")).param("rows", rows)
            })
            .collect();

        session
            .run(scope.database(), AccessMode::Write, statements, "add nodes")
            .await
            .map_err(|e| e.with_context(&format!("batch {start}..{end}")))?;
        tracing::debug!(
            "Wrote nodes {}..{} to graph '{}'",
            start,
            end,
            scope.graph()
        );
        ids.extend(chunk.iter().map(|n| n.id.clone()));
    }

    Ok(ids)
}

fn node_row(node: &Node, now: DateTime<Utc>) -> Value {
    let properties: BTreeMap<String, Value> = node
        .to_properties(now)
        .into_iter()
        .map(|(k, v)| (k, Value::from(v)))
        .collect();
    Value::Map(BTreeMap::from([
        ("id".to_string(), Value::from(node.id.as_str())),
        ("properties".to_string(), Value::Map(properties)),
    ]))
}

/// Build an entity from an `element_id, labels, properties` record
pub(crate) fn parse_node(record: &Record, scope: &GraphScope) -> Node {
    let value = NodeValue {
        element_id: record.get_str("element_id").unwrap_or_default().to_string(),
        labels: record.get_strings("labels"),
        properties: record.get_map("properties").cloned().unwrap_or_default(),
    };
    node_from_value(&value, scope)
}

/// Caller view of a stored node: partition label and namespace hidden
pub(crate) fn node_from_value(value: &NodeValue, scope: &GraphScope) -> Node {
    let mut node = Node::from_value(value);
    node.labels = scope.visible_labels(&node.labels);
    if let Some(namespace) = scope.namespace_property() {
        node.properties.remove(namespace);
    }
    node
}

/// Fetch entities by business id, in no particular order
pub(crate) async fn fetch_nodes_by_ids(
    session: &Session,
    scope: &GraphScope,
    ids: &[String],
) -> Result<Vec<Node>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let records = session
        .run_one(
            scope.database(),
            AccessMode::Read,
            Statement::new(format!(
                "MATCH {} WHERE n.id IN $ids RETURN elementId(n) AS element_id, \
                 labels(n) AS labels, properties(n) AS properties",
                scope.node_pattern("n")
            ))
            .param("ids", ids.to_vec()),
            "fetch nodes",
        )
        .await?;
    Ok(records.iter().map(|r| parse_node(r, scope)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected_store, ExecutedStatement, ScriptedBackend};
    use std::sync::Arc;
    use trellis_core::ErrorKind;

    fn stored_node(element_id: &str, id: &str, labels: &[&str]) -> Record {
        let mut record = Record::new();
        record.push("element_id", element_id);
        record.push("labels", labels.to_vec());
        record.push(
            "properties",
            Value::Map(BTreeMap::from([
                ("id".to_string(), Value::from(id)),
                ("name".to_string(), Value::from("Paris")),
                ("version".to_string(), Value::from(2i64)),
                ("updated_at".to_string(), Value::from(1_714_564_800i64)),
            ])),
        );
        record
    }

    fn row_ids(statement: &ExecutedStatement) -> Vec<String> {
        statement.params["rows"]
            .as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(|row| row.as_map()?.get("id")?.as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_add_nodes_batches_and_labels() {
        // (batch size, statements): the Person node gets its own group
        for (batch_size, statements) in [(1, 5), (3, 3), (5, 2), (100, 2)] {
            let backend = Arc::new(ScriptedBackend::new());
            let store = connected_store(backend.clone(), false).await;
            backend.clear_log();

            let mut nodes: Vec<Node> = (1..=4)
                .map(|i| Node::new(format!("n{i}"), "City"))
                .collect();
            nodes.push(Node::new("n5", "Person"));
            let ids = store
                .add_nodes(
                    AddNodesOptions::new("A", nodes)
                        .upsert()
                        .with_batch_size(batch_size),
                )
                .await
                .unwrap();
            assert_eq!(ids, vec!["n1", "n2", "n3", "n4", "n5"], "batch {batch_size}");

            let writes: Vec<_> = backend
                .executed()
                .into_iter()
                .filter(|s| s.text.starts_with("UNWIND"))
                .collect();
            assert_eq!(writes.len(), statements, "batch {batch_size}");
            assert!(writes.iter().all(|s| s.mode == AccessMode::Write));
            let written: Vec<String> = writes.iter().flat_map(row_ids).collect();
            assert_eq!(written, ids, "batch {batch_size}");
            assert!(writes[0]
                .text
                .starts_with("UNWIND $rows AS row MERGE (n:`City`:`__Graph_A` {id: row.id})"));
            assert!(writes
                .last()
                .unwrap()
                .text
                .contains("MERGE (n:`Person`:`__Graph_A` {id: row.id})"));
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_creation_time_and_bumps_version() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = connected_store(backend.clone(), false).await;

        store
            .add_nodes(AddNodesOptions::new("A", vec![Node::new("n1", "City")]).upsert())
            .await
            .unwrap();
        let write = &backend.matching("UNWIND $rows AS row MERGE")[0];
        assert_eq!(
            write.text,
            "UNWIND $rows AS row MERGE (n:`City`:`__Graph_A` {id: row.id}) \
             WITH n, row, n.created_at AS created, n.version AS version \
             SET n += row.properties, \
             n.created_at = coalesce(created, row.properties.created_at), \
             n.version = coalesce(version + 1, row.properties.version)"
        );

        store
            .add_nodes(AddNodesOptions::new("A", vec![Node::new("n2", "City")]))
            .await
            .unwrap();
        let create = &backend.matching("UNWIND $rows AS row CREATE")[0];
        assert!(create.text.ends_with("SET n += row.properties"));
        assert!(!create.text.contains("coalesce"));
    }

    #[tokio::test]
    async fn test_add_nodes_creates_label_graph_on_demand() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = connected_store(backend.clone(), false).await;

        store
            .add_nodes(AddNodesOptions::new("A", vec![Node::new("n1", "City")]))
            .await
            .unwrap();
        assert_eq!(backend.matching("CREATE CONSTRAINT").len(), 1);
        assert!(backend.matching("UNWIND")[0].text.contains("CREATE (n:`City`:`__Graph_A`"));
    }

    #[tokio::test]
    async fn test_add_nodes_requires_database() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = connected_store(backend.clone(), true).await;

        let err = store
            .add_nodes(AddNodesOptions::new("A", vec![Node::new("n1", "City")]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::GraphNotFound(_)));
        assert!(backend.matching("UNWIND").is_empty());
    }

    #[tokio::test]
    async fn test_add_nodes_rejects_missing_id() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = connected_store(backend, false).await;
        let err = store
            .add_nodes(AddNodesOptions::new("A", vec![Node::new("", "City")]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn test_failed_batch_reports_range() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .on("LIMIT 1 RETURN count(n) > 0", vec![Record::from_pairs([("exists", true)])])
                .fail("UNWIND", "Invalid input"),
        );
        let store = connected_store(backend, false).await;
        let err = store
            .add_nodes(AddNodesOptions::new("A", vec![Node::new("n1", "City")]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "batch 0..1: add nodes: Invalid input");
    }

    #[tokio::test]
    async fn test_get_nodes_strips_partition_labels() {
        let backend = Arc::new(ScriptedBackend::new().on(
            "RETURN elementId(n)",
            vec![stored_node("4:x:1", "n1", &["City", "__Graph_A"])],
        ));
        let store = connected_store(backend.clone(), false).await;

        let opts = GetNodesOptions::new("A").with_ids(["n1"]).with_filter("name", "Paris");
        let nodes = store.get_nodes(opts).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "n1");
        assert_eq!(nodes[0].labels, vec!["City"]);
        assert_eq!(nodes[0].element_id.as_deref(), Some("4:x:1"));
        assert_eq!(nodes[0].version, 2);

        let query = &backend.matching("RETURN elementId(n)")[0];
        assert!(query
            .text
            .starts_with("MATCH (n:`__Graph_A`) WHERE n.id IN $ids AND n.`name` = $f0"));
        assert_eq!(query.params["limit"], Value::Int(1000));
    }

    #[tokio::test]
    async fn test_get_nodes_projection_and_metadata() {
        let backend = Arc::new(ScriptedBackend::new().on(
            "RETURN elementId(n)",
            vec![stored_node("4:x:1", "n1", &["City"])],
        ));
        let store = connected_store(backend, true).await;

        let opts = GetNodesOptions {
            include_metadata: Some(false),
            fields: vec!["id".into()],
            ..GetNodesOptions::new("A")
        };
        let nodes = store.get_nodes(opts).await.unwrap();
        assert!(nodes[0].properties.is_empty());
        assert_eq!(nodes[0].version, 0);
        assert!(nodes[0].updated_at.is_none());
    }

    #[tokio::test]
    async fn test_get_nodes_on_missing_database_is_empty() {
        let backend = Arc::new(
            ScriptedBackend::new().fail("RETURN elementId(n)", "Database `A` does not exist."),
        );
        let store = connected_store(backend, true).await;
        assert!(store.get_nodes(GetNodesOptions::new("A")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_nodes_requires_selector() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = connected_store(backend.clone(), false).await;
        let before = backend.executed().len();

        let err = store
            .delete_nodes(DeleteNodesOptions {
                graph_name: "A".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Safety);
        assert_eq!(backend.executed().len(), before);
    }

    #[tokio::test]
    async fn test_delete_nodes_dry_run() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .on("RETURN count(n) AS count", vec![Record::from_pairs([("count", 2i64)])]),
        );
        let store = connected_store(backend.clone(), false).await;

        let err = store
            .delete_nodes(DeleteNodesOptions {
                graph_name: "A".into(),
                filter: [("status".to_string(), serde_json::json!("inactive"))]
                    .into_iter()
                    .collect(),
                dry_run: true,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DryRun { matched: 2 }));
        assert!(backend.matching("DETACH DELETE").is_empty());
    }

    #[tokio::test]
    async fn test_delete_nodes_in_batches() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .on("RETURN count(n) AS count", vec![Record::from_pairs([("count", 3i64)])])
                .on_once("DETACH DELETE", vec![Record::from_pairs([("deleted", 2i64)])])
                .on_once("DETACH DELETE", vec![Record::from_pairs([("deleted", 1i64)])]),
        );
        let store = connected_store(backend.clone(), false).await;

        let summary = store
            .delete_nodes(DeleteNodesOptions {
                graph_name: "A".into(),
                ids: vec!["a".into(), "b".into(), "c".into()],
                batch_size: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(summary.deleted, 3);

        let deletes = backend.matching("DETACH DELETE");
        assert_eq!(deletes.len(), 2);
        assert!(deletes[0].text.starts_with("MATCH (n:`__Graph_A`) WHERE n.id IN $ids"));
        assert_eq!(deletes[0].params["batch"], Value::Int(2));
    }
}
