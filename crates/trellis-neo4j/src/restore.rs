//! Graph restore
//!
//! Accepts either backup format, gzip-compressed or not, and replays it into
//! a target graph which may differ from the source graph.

use flate2::read::GzDecoder;
use regex::Regex;
use std::collections::HashMap;
use std::io::{ErrorKind as IoErrorKind, Read};
use trellis_core::backup::{cypher_source_graph, BackupEnvelope, GZIP_MAGIC};
use trellis_core::value::NodeValue;
use trellis_core::{
    BackupFormat, Node, Relationship, RestoreOptions, RestoreSummary, Result, StoreError, Value,
    DEFAULT_BATCH_SIZE,
};

use crate::adapter::{with_timeout, Neo4jStore, Session};
use crate::cypher::escape;
use crate::driver::{AccessMode, Statement};
use crate::graphs::{create_graph_in, drop_graph_in, graph_exists_in};
use crate::mode::GraphScope;
use crate::nodes::write_nodes;
use crate::relationships::write_relationships;

impl Neo4jStore {
    /// Restore a backup read from `reader` into `opts.graph_name`
    pub async fn restore(
        &self,
        reader: &mut (dyn Read + Send),
        opts: RestoreOptions,
    ) -> Result<RestoreSummary> {
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;
        let payload = read_payload(reader)?;
        let format = opts.format.unwrap_or_else(|| detect_format(&payload));

        let _permit = self.critical.enter("restore").await?;
        let summary = with_timeout("restore", opts.timeout_secs, async {
            prepare_target(&session, &scope, &opts).await?;
            match format {
                BackupFormat::Json => restore_json(&session, &scope, &payload).await,
                BackupFormat::Cypher => restore_cypher(&session, &scope, &payload).await,
            }
        })
        .await?;

        tracing::info!(
            "Restored graph '{}' from {} backup of '{}' ({} nodes, {} relationships)",
            summary.graph_name,
            format,
            summary.source_graph.as_deref().unwrap_or("unknown"),
            summary.nodes_restored,
            summary.relationships_restored
        );
        Ok(summary)
    }
}

/// Read the whole backup, decompressing when it starts with the gzip magic
fn read_payload(reader: &mut (dyn Read + Send)) -> Result<String> {
    let mut head = [0u8; 2];
    let mut filled = 0;
    while filled < head.len() {
        match reader.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == IoErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    if filled == 0 {
        return Err(StoreError::InvalidBackup("backup is empty".to_string()));
    }

    let stream = (&head[..filled]).chain(reader);
    let mut payload = String::new();
    let read = if head[..filled] == GZIP_MAGIC {
        GzDecoder::new(stream).read_to_string(&mut payload)
    } else {
        let mut stream = stream;
        stream.read_to_string(&mut payload)
    };
    match read {
        Ok(_) => {}
        Err(err)
            if matches!(
                err.kind(),
                IoErrorKind::InvalidData | IoErrorKind::InvalidInput | IoErrorKind::UnexpectedEof
            ) =>
        {
            return Err(StoreError::InvalidBackup(err.to_string()))
        }
        Err(err) => return Err(err.into()),
    }

    if payload.trim().is_empty() {
        return Err(StoreError::InvalidBackup("backup is empty".to_string()));
    }
    Ok(payload)
}

/// JSON when the payload opens with an object, Cypher otherwise
pub fn detect_format(payload: &str) -> BackupFormat {
    if payload.trim_start().starts_with('{') {
        BackupFormat::Json
    } else {
        BackupFormat::Cypher
    }
}

async fn prepare_target(session: &Session, scope: &GraphScope, opts: &RestoreOptions) -> Result<()> {
    let exists = graph_exists_in(session, scope).await?;
    match (exists, opts.force, opts.create_graph) {
        (true, false, _) => Err(StoreError::GraphAlreadyExists(scope.graph().to_string())),
        (true, true, _) => {
            tracing::warn!("Replacing graph '{}' from backup", scope.graph());
            drop_graph_in(session, scope).await?;
            create_graph_in(session, scope).await
        }
        (false, _, true) => create_graph_in(session, scope).await,
        (false, _, false) if scope.needs_availability_wait() => {
            Err(StoreError::GraphNotFound(scope.graph().to_string()))
        }
        (false, _, false) => Ok(()),
    }
}

async fn restore_json(session: &Session, scope: &GraphScope, payload: &str) -> Result<RestoreSummary> {
    let envelope: BackupEnvelope = serde_json::from_str(payload)?;
    let prefix = session.policy.label_prefix.as_str();
    let namespace = session.policy.namespace_property.as_str();

    let mut business_ids: HashMap<String, String> = HashMap::with_capacity(envelope.nodes.len());
    let mut nodes = Vec::with_capacity(envelope.nodes.len());
    for backup in envelope.nodes {
        let value = NodeValue {
            element_id: backup.element_id.clone(),
            labels: backup
                .labels
                .into_iter()
                .filter(|l| !l.starts_with(prefix))
                .collect(),
            properties: backup
                .properties
                .iter()
                .filter(|(k, _)| k.as_str() != namespace)
                .map(|(k, v)| (k.clone(), Value::from_json(v)))
                .collect(),
        };
        let mut node = Node::from_value(&value);
        node.id = backup.id.into_string();
        node.element_id = None;
        if !backup.element_id.is_empty() {
            business_ids.insert(backup.element_id, node.id.clone());
        }
        nodes.push(node);
    }

    let relationships: Vec<Relationship> = envelope
        .relationships
        .into_iter()
        .map(|backup| {
            let endpoint = |business: String, element: &str| {
                if !business.is_empty() {
                    business
                } else {
                    business_ids
                        .get(element)
                        .cloned()
                        .unwrap_or_else(|| element.to_string())
                }
            };
            let start = endpoint(backup.start_business_id, &backup.start_node);
            let end = endpoint(backup.end_business_id, &backup.end_node);
            let value = trellis_core::value::RelationshipValue {
                element_id: backup.element_id,
                rel_type: backup.rel_type,
                start_element_id: backup.start_node,
                end_element_id: backup.end_node,
                properties: backup
                    .properties
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            };
            let mut rel = Relationship::from_value(&value, start, end);
            rel.id = backup.id.into_string();
            rel.element_id = None;
            rel
        })
        .collect();

    write_nodes(session, scope, &nodes, true, DEFAULT_BATCH_SIZE).await?;
    write_relationships(session, scope, &relationships, true, false, DEFAULT_BATCH_SIZE).await?;

    Ok(RestoreSummary {
        graph_name: scope.graph().to_string(),
        source_graph: Some(envelope.graph_name),
        nodes_restored: nodes.len() as u64,
        relationships_restored: relationships.len() as u64,
        statements_executed: 0,
    })
}

async fn restore_cypher(
    session: &Session,
    scope: &GraphScope,
    payload: &str,
) -> Result<RestoreSummary> {
    let source = cypher_source_graph(payload);
    let script = match &source {
        Some(source) => retarget(payload, &session.policy.graph_label(source), scope),
        None => payload.to_string(),
    };
    let from_database_mode = payload
        .lines()
        .take_while(|l| l.trim().is_empty() || l.trim_start().starts_with("//"))
        .any(|l| l.trim() == "// Storage Type: separate_database");

    let mut summary = RestoreSummary {
        graph_name: scope.graph().to_string(),
        source_graph: source,
        ..Default::default()
    };
    for line in script.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let mut text = line.trim_end_matches(';').to_string();
        if from_database_mode {
            if let Some(label) = scope.graph_label() {
                text = adopt_into_label(&text, label);
            }
        }

        session
            .run_one(
                scope.database(),
                AccessMode::Write,
                Statement::new(text.as_str()),
                "restore",
            )
            .await
            .map_err(|e| e.with_context(&format!("statement `{text}`")))?;

        summary.statements_executed += 1;
        if text.starts_with("CREATE (") {
            summary.nodes_restored += 1;
        } else if text.starts_with("MATCH") && text.contains("CREATE (a)-") {
            summary.relationships_restored += 1;
        }
    }
    Ok(summary)
}

/// Point a script at the target graph's label, or drop the source label
/// when restoring into database mode.
pub fn retarget(script: &str, source_label: &str, scope: &GraphScope) -> String {
    match scope.graph_label() {
        Some(target) if target == source_label => script.to_string(),
        Some(target) => {
            let pattern = format!(
                r"(^|[^A-Za-z0-9_-]){}([^A-Za-z0-9_-]|$)",
                regex::escape(source_label)
            );
            match Regex::new(&format!("(?m){pattern}")) {
                Ok(re) => re
                    .replace_all(script, format!("${{1}}{target}${{2}}").as_str())
                    .into_owned(),
                Err(_) => script.to_string(),
            }
        }
        None => {
            let pattern = format!(
                r":(?:`{0}`|{0}\b)",
                regex::escape(source_label)
            );
            match Regex::new(&pattern) {
                Ok(re) => re.replace_all(script, "").into_owned(),
                Err(_) => script.to_string(),
            }
        }
    }
}

/// Scope a statement from a database-mode backup to a label graph
fn adopt_into_label(statement: &str, label: &str) -> String {
    let label = escape(label);
    if let Some(rest) = statement.strip_prefix("CREATE (") {
        format!("CREATE (:{label}{rest}")
    } else if let Some(rest) = statement.strip_prefix("MATCH (a), (b)") {
        format!("MATCH (a:{label}), (b:{label}){rest}")
    } else {
        statement.to_string()
    }
}
