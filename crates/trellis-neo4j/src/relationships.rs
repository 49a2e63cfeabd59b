//! Relationship store
//!
//! Relationships are addressed by the business ids of their endpoints. The
//! caller's type always travels as the `type` property; the stored type is
//! generic in database mode.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use trellis_core::value::RelationshipValue;
use trellis_core::{
    AddRelationshipsOptions, DeleteRelationshipsOptions, DeleteSummary, Direction,
    GetRelationshipsOptions, Relationship, Result, StoreError, Value,
};

use crate::adapter::{with_timeout, Neo4jStore, Session};
use crate::cypher::{escape, merge_set, Conditions};
use crate::driver::{AccessMode, Record, Statement};
use crate::graphs::ensure_writable;
use crate::mode::GraphScope;

/// Columns every relationship read returns
const RETURN_COLUMNS: &str = "elementId(r) AS element_id, type(r) AS stored_type, \
     properties(r) AS properties, a.id AS start_id, b.id AS end_id, \
     elementId(a) AS start_element_id, elementId(b) AS end_element_id";

impl Neo4jStore {
    /// Insert or upsert relationships, returning their ids in input order
    pub async fn add_relationships(&self, opts: AddRelationshipsOptions) -> Result<Vec<String>> {
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;
        validate_relationships(&opts.relationships)?;
        if opts.relationships.is_empty() {
            return Ok(Vec::new());
        }

        with_timeout("add relationships", opts.timeout_secs, async {
            ensure_writable(&session, &scope).await?;
            if !opts.create_nodes {
                require_endpoints(&session, &scope, &opts.relationships).await?;
            }
            write_relationships(
                &session,
                &scope,
                &opts.relationships,
                opts.upsert,
                opts.create_nodes,
                opts.batch(),
            )
            .await
        })
        .await
    }

    pub async fn get_relationships(
        &self,
        opts: GetRelationshipsOptions,
    ) -> Result<Vec<Relationship>> {
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;

        let mut conditions = Conditions::new();
        conditions.ids("r", "ids", &opts.ids);
        if !opts.types.is_empty() {
            conditions.push("coalesce(r.type, type(r)) IN $types");
            conditions.param("types", opts.types.clone());
        }
        if !opts.node_ids.is_empty() {
            conditions.push(match opts.direction {
                Direction::Outgoing => "a.id IN $node_ids",
                Direction::Incoming => "b.id IN $node_ids",
                Direction::Both => "(a.id IN $node_ids OR b.id IN $node_ids)",
            });
            conditions.param("node_ids", opts.node_ids.clone());
        }
        conditions.equals("r", "f", &opts.filter);

        let statement = Statement::new(format!(
            "MATCH {}-[r]->{}{} RETURN {} LIMIT $limit",
            scope.node_pattern("a"),
            scope.node_pattern("b"),
            conditions.where_clause(),
            RETURN_COLUMNS
        ))
        .params(conditions.into_params())
        .param("limit", opts.limit());

        let records = with_timeout("get relationships", opts.timeout_secs, async {
            match session
                .run_one(scope.database(), AccessMode::Read, statement, "get relationships")
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
                let mut rel = parse_relationship(record);
                if !include_properties {
                    rel.properties.clear();
                } else if !opts.fields.is_empty() {
                    rel.properties.retain(|key, _| opts.fields.contains(key));
                }
                if !include_metadata {
                    rel.strip_metadata();
                }
                rel
            })
            .collect())
    }

    /// Delete matching relationships; endpoints are left in place
    pub async fn delete_relationships(
        &self,
        opts: DeleteRelationshipsOptions,
    ) -> Result<DeleteSummary> {
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;
        if opts.ids.is_empty() && opts.filter.is_empty() {
            return Err(StoreError::UnsafeDelete(format!(
                "delete relationships needs ids or a filter; refusing to delete every relationship of graph '{}'",
                opts.graph_name
            )));
        }

        let mut conditions = Conditions::new();
        conditions.ids("r", "ids", &opts.ids);
        conditions.equals("r", "f", &opts.filter);
        let matcher = format!(
            "MATCH {}-[r]->{}{}",
            scope.node_pattern("a"),
            scope.node_pattern("b"),
            conditions.where_clause()
        );
        let params = conditions.into_params();
        let batch = opts.batch() as i64;

        with_timeout("delete relationships", opts.timeout_secs, async {
            let matched = session
                .run_count(
                    scope.database(),
                    Statement::new(format!("{matcher} RETURN count(r) AS count"))
                        .params(params.clone()),
                    "count",
                    "count relationships to delete",
                )
                .await?;
            if opts.dry_run {
                return Err(StoreError::DryRun { matched });
            }

            let text = format!("{matcher} WITH r LIMIT $batch DELETE r RETURN count(r) AS deleted");
            let mut deleted = 0u64;
            while deleted < matched {
                let count = session
                    .run_one(
                        scope.database(),
                        AccessMode::Write,
                        Statement::new(text.clone())
                            .params(params.clone())
                            .param("batch", batch),
                        "delete relationships",
                    )
                    .await?
                    .first()
                    .and_then(|r| r.get_i64("deleted"))
                    .unwrap_or(0);
                deleted += count.max(0) as u64;
                if count < batch {
                    break;
                }
            }
            tracing::debug!(
                "Deleted {} relationships from graph '{}'",
                deleted,
                scope.graph()
            );
            Ok(DeleteSummary { deleted })
        })
        .await
    }
}

fn validate_relationships(relationships: &[Relationship]) -> Result<()> {
    for (position, rel) in relationships.iter().enumerate() {
        if rel.rel_type.is_empty() {
            return Err(StoreError::Precondition(format!(
                "relationship at position {position} has no type"
            )));
        }
        if rel.start_node.is_empty() || rel.end_node.is_empty() {
            return Err(StoreError::Precondition(format!(
                "relationship at position {position} needs both start and end node ids"
            )));
        }
    }
    Ok(())
}

/// Fail with `NotFound` when an endpoint is missing from the graph
async fn require_endpoints(
    session: &Session,
    scope: &GraphScope,
    relationships: &[Relationship],
) -> Result<()> {
    let mut wanted: Vec<String> = Vec::new();
    for rel in relationships {
        for id in [&rel.start_node, &rel.end_node] {
            if !wanted.contains(id) {
                wanted.push(id.clone());
            }
        }
    }

    let records = session
        .run_one(
            scope.database(),
            AccessMode::Read,
            Statement::new(format!(
                "MATCH {} WHERE n.id IN $ids RETURN DISTINCT n.id AS id",
                scope.node_pattern("n")
            ))
            .param("ids", wanted.clone()),
            "check relationship endpoints",
        )
        .await?;
    let found: Vec<&str> = records.iter().filter_map(|r| r.get_str("id")).collect();
    let missing: Vec<&str> = wanted
        .iter()
        .map(String::as_str)
        .filter(|id| !found.contains(id))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(StoreError::NotFound(format!(
            "nodes {} not found in graph '{}'",
            missing.join(", "),
            scope.graph()
        )))
    }
}

/// Write relationships in batches, one UNWIND statement per stored type
pub(crate) async fn write_relationships(
    session: &Session,
    scope: &GraphScope,
    relationships: &[Relationship],
    upsert: bool,
    create_nodes: bool,
    batch_size: usize,
) -> Result<Vec<String>> {
    let now = Utc::now();
    let batch_size = batch_size.max(1);
    let mut ids = Vec::with_capacity(relationships.len());

    for (index, chunk) in relationships.chunks(batch_size).enumerate() {
        let start = index * batch_size;
        let end = start + chunk.len();

        let mut groups: Vec<(&str, Vec<Value>)> = Vec::new();
        for rel in chunk {
            let stored_type = scope.relationship_type(&rel.rel_type);
            let row = relationship_row(rel, now);
            match groups.iter_mut().find(|(t, _)| *t == stored_type) {
                Some((_, rows)) => rows.push(row),
                None => groups.push((stored_type, vec![row])),
            }
        }

        let statements = groups
            .into_iter()
            .map(|(stored_type, rows)| {
                Statement::new(relationship_template(scope, stored_type, upsert, create_nodes))
                    .param("rows", rows)
            })
            .collect();

        session
            .run(
                scope.database(),
                AccessMode::Write,
                statements,
                "add relationships",
            )
            .await
            .map_err(|e| e.with_context(&format!("batch {start}..{end}")))?;
        tracing::debug!(
            "Wrote relationships {}..{} to graph '{}'",
            start,
            end,
            scope.graph()
        );
        ids.extend(chunk.iter().map(Relationship::effective_id));
    }

    Ok(ids)
}

fn relationship_template(
    scope: &GraphScope,
    stored_type: &str,
    upsert: bool,
    create_nodes: bool,
) -> String {
    let endpoint = if create_nodes { "MERGE" } else { "MATCH" };
    let relationship = if upsert {
        format!(
            "MERGE (a)-[r:{} {{id: row.id}}]->(b) {}",
            escape(stored_type),
            merge_set("r", "=")
        )
    } else {
        format!(
            "CREATE (a)-[r:{}]->(b) SET r = row.properties",
            escape(stored_type)
        )
    };
    format!(
        "UNWIND $rows AS row {endpoint} {} {endpoint} {} {relationship}",
        endpoint_pattern(scope, "a", "start"),
        endpoint_pattern(scope, "b", "end"),
    )
}

fn endpoint_pattern(scope: &GraphScope, var: &str, field: &str) -> String {
    match scope.graph_label() {
        Some(label) => format!("({var}:{} {{id: row.{field}}})", escape(label)),
        None => format!("({var} {{id: row.{field}}})"),
    }
}

fn relationship_row(rel: &Relationship, now: DateTime<Utc>) -> Value {
    let properties: BTreeMap<String, Value> = rel
        .to_properties(now)
        .into_iter()
        .map(|(k, v)| (k, Value::from(v)))
        .collect();
    Value::Map(BTreeMap::from([
        ("id".to_string(), Value::from(rel.effective_id())),
        ("start".to_string(), Value::from(rel.start_node.as_str())),
        ("end".to_string(), Value::from(rel.end_node.as_str())),
        ("properties".to_string(), Value::Map(properties)),
    ]))
}

/// Build a relationship from a record with the relationship read columns.
///
/// Endpoints are reported by business id, falling back to element ids for
/// nodes written without one.
pub(crate) fn parse_relationship(record: &Record) -> Relationship {
    let start_element_id = record.get_str("start_element_id").unwrap_or_default();
    let end_element_id = record.get_str("end_element_id").unwrap_or_default();
    let value = RelationshipValue {
        element_id: record.get_str("element_id").unwrap_or_default().to_string(),
        rel_type: record.get_str("stored_type").unwrap_or_default().to_string(),
        start_element_id: start_element_id.to_string(),
        end_element_id: end_element_id.to_string(),
        properties: record.get_map("properties").cloned().unwrap_or_default(),
    };
    let start = record.get_str("start_id").unwrap_or(start_element_id);
    let end = record.get_str("end_id").unwrap_or(end_element_id);
    Relationship::from_value(&value, start.to_string(), end.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected_store, ScriptedBackend};
    use std::sync::Arc;
    use trellis_core::ErrorKind;

    fn exists() -> Record {
        Record::from_pairs([("exists", true)])
    }

    fn stored_relationship() -> Record {
        let mut record = Record::new();
        record.push("element_id", "5:x:9");
        record.push("stored_type", "GRAPH_RELATIONSHIP");
        record.push(
            "properties",
            Value::Map(BTreeMap::from([
                ("id".to_string(), Value::from("r1")),
                ("type".to_string(), Value::from("KNOWS")),
                ("since".to_string(), Value::from(2020i64)),
            ])),
        );
        record.push("start_id", "n1");
        record.push("end_id", Value::Null);
        record.push("start_element_id", "4:x:1");
        record.push("end_element_id", "4:x:2");
        record
    }

    #[test]
    fn test_template_per_mode() {
        let label_scope = GraphScope::Label {
            graph: "A".into(),
            database: "neo4j".into(),
            label: "__Graph_A".into(),
            prefix: "__Graph_".into(),
            namespace_property: "__graph_namespace".into(),
        };
        assert_eq!(
            relationship_template(&label_scope, "KNOWS", true, false),
            "UNWIND $rows AS row MATCH (a:`__Graph_A` {id: row.start}) \
             MATCH (b:`__Graph_A` {id: row.end}) \
             MERGE (a)-[r:`KNOWS` {id: row.id}]->(b) \
             WITH r, row, r.created_at AS created, r.version AS version \
             SET r = row.properties, \
             r.created_at = coalesce(created, row.properties.created_at), \
             r.version = coalesce(version + 1, row.properties.version)"
        );

        let db_scope = GraphScope::Database { graph: "A".into() };
        assert_eq!(
            relationship_template(&db_scope, "GRAPH_RELATIONSHIP", false, true),
            "UNWIND $rows AS row MERGE (a {id: row.start}) MERGE (b {id: row.end}) \
             CREATE (a)-[r:`GRAPH_RELATIONSHIP`]->(b) SET r = row.properties"
        );
    }

    #[tokio::test]
    async fn test_add_relationships_database_mode() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .on("WHERE name = $name", vec![Record::from_pairs([("name", "A")])])
                .on(
                    "RETURN DISTINCT n.id AS id",
                    vec![
                        Record::from_pairs([("id", "n1")]),
                        Record::from_pairs([("id", "n2")]),
                    ],
                ),
        );
        let store = connected_store(backend.clone(), true).await;

        let ids = store
            .add_relationships(AddRelationshipsOptions::new(
                "A",
                vec![Relationship::new("n1", "KNOWS", "n2").with_property("since", 2020)],
            ))
            .await
            .unwrap();
        assert_eq!(ids, vec!["n1_KNOWS_n2"]);

        let write = &backend.matching("UNWIND")[0];
        assert_eq!(write.database, "A");
        assert!(write.text.contains("CREATE (a)-[r:`GRAPH_RELATIONSHIP`]->(b)"));
        let rows = write.params["rows"].as_list().unwrap();
        let props = rows[0].as_map().unwrap()["properties"].as_map().unwrap();
        assert_eq!(props["type"], Value::from("KNOWS"));
        assert_eq!(props["since"], Value::Int(2020));
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_not_found() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .on("LIMIT 1 RETURN count(n) > 0", vec![exists()])
                .on("RETURN DISTINCT n.id AS id", vec![Record::from_pairs([("id", "n1")])]),
        );
        let store = connected_store(backend.clone(), false).await;

        let err = store
            .add_relationships(AddRelationshipsOptions::new(
                "A",
                vec![Relationship::new("n1", "KNOWS", "ghost")],
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("ghost"));
        assert!(backend.matching("UNWIND").is_empty());
    }

    #[tokio::test]
    async fn test_create_nodes_skips_endpoint_check() {
        let backend = Arc::new(
            ScriptedBackend::new().on("LIMIT 1 RETURN count(n) > 0", vec![exists()]),
        );
        let store = connected_store(backend.clone(), false).await;

        let opts = AddRelationshipsOptions {
            create_nodes: true,
            upsert: true,
            ..AddRelationshipsOptions::new(
                "A",
                vec![Relationship::new("n1", "KNOWS", "n2").with_id("r1")],
            )
        };
        assert_eq!(store.add_relationships(opts).await.unwrap(), vec!["r1"]);
        assert!(backend.matching("RETURN DISTINCT n.id").is_empty());
        let write = &backend.matching("UNWIND")[0];
        assert!(write.text.contains("MERGE (a:`__Graph_A` {id: row.start})"));
        assert!(write.text.contains("MERGE (a)-[r:`KNOWS` {id: row.id}]->(b)"));
    }

    #[tokio::test]
    async fn test_add_relationships_validates_input() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = connected_store(backend, false).await;
        let err = store
            .add_relationships(AddRelationshipsOptions::new(
                "A",
                vec![Relationship::new("n1", "", "n2")],
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn test_get_relationships_direction_and_types() {
        let backend = Arc::new(
            ScriptedBackend::new().on("RETURN elementId(r)", vec![stored_relationship()]),
        );
        let store = connected_store(backend.clone(), true).await;

        let opts = GetRelationshipsOptions {
            node_ids: vec!["n1".into()],
            direction: Direction::Outgoing,
            types: vec!["KNOWS".into()],
            ..GetRelationshipsOptions::new("A")
        };
        let rels = store.get_relationships(opts).await.unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].id, "r1");
        assert_eq!(rels[0].rel_type, "KNOWS");
        assert_eq!(rels[0].start_node, "n1");
        assert_eq!(rels[0].end_node, "4:x:2");
        assert_eq!(rels[0].properties["since"], serde_json::json!(2020));

        let query = &backend.matching("RETURN elementId(r)")[0];
        assert!(query.text.starts_with(
            "MATCH (a)-[r]->(b) WHERE coalesce(r.type, type(r)) IN $types AND a.id IN $node_ids"
        ));
    }

    #[tokio::test]
    async fn test_delete_relationships() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .on("RETURN count(r) AS count", vec![Record::from_pairs([("count", 1i64)])])
                .on("DELETE r RETURN", vec![Record::from_pairs([("deleted", 1i64)])]),
        );
        let store = connected_store(backend.clone(), false).await;

        let unsafe_err = store
            .delete_relationships(DeleteRelationshipsOptions {
                graph_name: "A".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(unsafe_err.kind(), ErrorKind::Safety);

        let summary = store
            .delete_relationships(DeleteRelationshipsOptions {
                graph_name: "A".into(),
                ids: vec!["r1".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(summary.deleted, 1);
        let delete = &backend.matching("DELETE r RETURN")[0];
        assert!(delete.text.contains("WITH r LIMIT $batch DELETE r"));
        assert!(!delete.text.contains("DETACH"));
    }
}
