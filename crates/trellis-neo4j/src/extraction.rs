//! Saving extraction results
//!
//! Candidates are deduplicated against the graph by `(name, entity type)`.
//! A match absorbs the candidate's source arrays; anything else is created.
//! Relationship endpoints are then rewritten to the surviving ids.
//!
//! Author: hephaex@gmail.com

use chrono::Utc;
use std::collections::HashMap;
use trellis_core::extraction::merge_sources;
use trellis_core::{
    ExtractionResult, Node, Relationship, Result, SaveResponse, DEFAULT_BATCH_SIZE,
};
use uuid::Uuid;

use crate::adapter::{Neo4jStore, Session};
use crate::driver::{AccessMode, Statement};
use crate::graphs::ensure_writable;
use crate::mode::GraphScope;
use crate::nodes::{fetch_nodes_by_ids, parse_node, write_nodes};
use crate::relationships::write_relationships;

/// Properties holding provenance arrays
const SOURCE_KEYS: [&str; 2] = ["source_documents", "source_chunks"];

impl Neo4jStore {
    pub async fn save_extraction_results(
        &self,
        graph_name: &str,
        results: Vec<ExtractionResult>,
    ) -> Result<SaveResponse> {
        if results.is_empty() {
            return Ok(SaveResponse::default());
        }
        let session = self.session().await?;
        let scope = session.scope(graph_name)?;
        ensure_writable(&session, &scope).await?;

        let total = results.len();
        let mut response = SaveResponse::default();
        for (index, result) in results.into_iter().enumerate() {
            match save_result(&session, &scope, result).await {
                Ok((nodes, relationships)) => {
                    response.nodes.extend(nodes);
                    response.relationships.extend(relationships);
                }
                Err(err) => {
                    tracing::warn!("Extraction result {} not saved: {}", index, err);
                    response.errors.push(format!("result {index}: {err}"));
                }
            }
        }

        tracing::info!(
            "Saved {} of {} extraction results to graph '{}' ({} entities, {} relationships)",
            total - response.errors.len(),
            total,
            graph_name,
            response.nodes.len(),
            response.relationships.len()
        );
        Ok(response)
    }
}

/// Candidates of one result, split by what happens to them
#[derive(Default)]
struct Plan {
    /// candidate id -> canonical id
    mapping: HashMap<String, String>,
    /// (name, type) -> canonical id
    seen: HashMap<(String, String), String>,
    updates: Vec<Node>,
    creates: Vec<Node>,
    kept: Vec<String>,
}

impl Plan {
    fn pending_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.updates
            .iter_mut()
            .chain(self.creates.iter_mut())
            .find(|n| n.id == id)
    }
}

async fn save_result(
    session: &Session,
    scope: &GraphScope,
    result: ExtractionResult,
) -> Result<(Vec<Node>, Vec<Relationship>)> {
    let now = Utc::now();
    let mut plan = Plan::default();

    for mut candidate in result.nodes {
        if candidate.id.is_empty() {
            candidate.id = Uuid::new_v4().to_string();
        }
        if let Some(document) = &result.source_document {
            let merged = merge_sources(
                &candidate.string_list(SOURCE_KEYS[0]),
                std::slice::from_ref(document),
            );
            set_sources(&mut candidate, SOURCE_KEYS[0], merged);
        }

        let key = dedup_key(&candidate);
        if let Some(canonical) = key.as_ref().and_then(|k| plan.seen.get(k)).cloned() {
            if let Some(pending) = plan.pending_mut(&canonical) {
                absorb_sources(pending, &candidate);
            }
            plan.mapping.insert(candidate.id, canonical);
            continue;
        }

        let existing = match &key {
            Some((name, entity_type)) => find_existing(session, scope, name, entity_type).await?,
            None => None,
        };
        let canonical = match existing {
            Some(mut entity) => {
                absorb_sources(&mut entity, &candidate);
                entity.updated_at = Some(now);
                entity.version += 1;
                let id = entity.id.clone();
                plan.updates.push(entity);
                id
            }
            None => {
                let id = candidate.id.clone();
                plan.creates.push(candidate.clone());
                id
            }
        };
        if let Some(key) = key {
            plan.seen.insert(key, canonical.clone());
        }
        if !plan.kept.contains(&canonical) {
            plan.kept.push(canonical.clone());
        }
        plan.mapping.insert(candidate.id, canonical);
    }

    if !plan.updates.is_empty() {
        write_nodes(session, scope, &plan.updates, true, DEFAULT_BATCH_SIZE).await?;
    }
    if !plan.creates.is_empty() {
        write_nodes(session, scope, &plan.creates, false, DEFAULT_BATCH_SIZE).await?;
    }

    let mut nodes = fetch_nodes_by_ids(session, scope, &plan.kept).await?;
    nodes.sort_by_key(|n| plan.kept.iter().position(|id| *id == n.id));

    let relationships: Vec<Relationship> = result
        .relationships
        .into_iter()
        .map(|mut rel| {
            if let Some(start) = plan.mapping.get(&rel.start_node) {
                rel.start_node = start.clone();
            }
            if let Some(end) = plan.mapping.get(&rel.end_node) {
                rel.end_node = end.clone();
            }
            rel
        })
        .collect();
    if !relationships.is_empty() {
        write_relationships(session, scope, &relationships, true, false, DEFAULT_BATCH_SIZE)
            .await?;
    }

    tracing::debug!(
        "Extraction result: {} new, {} merged, {} relationships",
        plan.creates.len(),
        plan.updates.len(),
        relationships.len()
    );
    Ok((nodes, relationships))
}

fn dedup_key(node: &Node) -> Option<(String, String)> {
    match (node.name(), node.entity_type()) {
        (Some(name), Some(entity_type)) if !name.is_empty() => {
            Some((name.to_string(), entity_type.to_string()))
        }
        _ => None,
    }
}

async fn find_existing(
    session: &Session,
    scope: &GraphScope,
    name: &str,
    entity_type: &str,
) -> Result<Option<Node>> {
    let records = session
        .run_one(
            scope.database(),
            AccessMode::Read,
            Statement::new(format!(
                "MATCH {} WHERE n.name = $name AND (n.entity_type = $type OR $type IN labels(n)) \
                 RETURN elementId(n) AS element_id, labels(n) AS labels, \
                 properties(n) AS properties LIMIT 1",
                scope.node_pattern("n")
            ))
            .param("name", name)
            .param("type", entity_type),
            "find entity",
        )
        .await?;
    Ok(records.first().map(|r| parse_node(r, scope)))
}

fn absorb_sources(target: &mut Node, incoming: &Node) {
    for key in SOURCE_KEYS {
        let merged = merge_sources(&target.string_list(key), &incoming.string_list(key));
        set_sources(target, key, merged);
    }
}

fn set_sources(node: &mut Node, key: &str, sources: Vec<String>) {
    if !sources.is_empty() {
        node.properties
            .insert(key.to_string(), serde_json::Value::from(sources));
    }
}
