//! Graph backup
//!
//! A backup is either the JSON envelope or a replayable Cypher script with
//! one statement per line. Either can be gzip-compressed.

use chrono::{DateTime, SecondsFormat, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::Write;
use trellis_core::backup::{
    BackupEnvelope, BackupId, BackupMetadata, BackupNode, BackupRelationship, CYPHER_HEADER_PREFIX,
};
use trellis_core::value::map_to_json;
use trellis_core::{BackupFilter, BackupFormat, BackupOptions, BackupSummary, Result};

use crate::adapter::{with_timeout, Neo4jStore, Session};
use crate::cypher::{escape, label_expr, literal, string_literal};
use crate::driver::{AccessMode, Record, Statement};
use crate::graphs::ensure_graph_exists;
use crate::mode::GraphScope;

/// Everything read from the graph for one backup
#[derive(Debug, Default)]
pub(crate) struct Snapshot {
    pub nodes: Vec<BackupNode>,
    pub relationships: Vec<BackupRelationship>,
    /// Stored relationship types, parallel to `relationships`
    pub stored_types: Vec<String>,
}

impl Neo4jStore {
    /// Write a backup of a graph to `writer`
    pub async fn backup(
        &self,
        writer: &mut (dyn Write + Send),
        opts: BackupOptions,
    ) -> Result<BackupSummary> {
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;
        ensure_graph_exists(&session, &scope).await?;

        let _permit = self.critical.enter("backup").await?;
        let snapshot = with_timeout(
            "backup",
            opts.timeout_secs,
            collect(&session, &scope, &opts.filter),
        )
        .await?;

        let exported_at = Utc::now();
        let mut counter = CountingWriter::new(writer);
        if opts.compress {
            let mut encoder = GzEncoder::new(&mut counter, Compression::default());
            emit(&mut encoder, &scope, &snapshot, &opts, exported_at)?;
            encoder.finish()?;
        } else {
            emit(&mut counter, &scope, &snapshot, &opts, exported_at)?;
        }
        counter.flush()?;

        let summary = BackupSummary {
            graph_name: opts.graph_name.clone(),
            format: opts.format,
            compressed: opts.compress,
            node_count: snapshot.nodes.len() as u64,
            relationship_count: snapshot.relationships.len() as u64,
            bytes_written: counter.bytes,
        };
        tracing::info!(
            "Backed up graph '{}' as {} ({} nodes, {} relationships, {} bytes)",
            summary.graph_name,
            summary.format,
            summary.node_count,
            summary.relationship_count,
            summary.bytes_written
        );
        Ok(summary)
    }
}

fn filter_clause(fragment: &Option<String>) -> String {
    match fragment.as_deref().map(str::trim) {
        Some(f) if !f.is_empty() => format!(" WHERE {f}"),
        _ => String::new(),
    }
}

pub(crate) async fn collect(
    session: &Session,
    scope: &GraphScope,
    filter: &BackupFilter,
) -> Result<Snapshot> {
    let node_records = session
        .run_one(
            scope.database(),
            AccessMode::Read,
            Statement::new(format!(
                "MATCH {}{} RETURN elementId(n) AS element_id, n.id AS id, labels(n) AS labels, \
                 properties(n) AS properties ORDER BY element_id",
                scope.node_pattern("n"),
                filter_clause(&filter.nodes)
            )),
            "backup nodes",
        )
        .await?;

    let relationship_records = session
        .run_one(
            scope.database(),
            AccessMode::Read,
            Statement::new(format!(
                "MATCH {}-[r]->{}{} RETURN elementId(r) AS element_id, r.id AS id, \
                 coalesce(r.type, type(r)) AS type, type(r) AS stored_type, \
                 properties(r) AS properties, elementId(a) AS start_element_id, \
                 elementId(b) AS end_element_id, a.id AS start_id, b.id AS end_id \
                 ORDER BY element_id",
                scope.node_pattern("a"),
                scope.node_pattern("b"),
                filter_clause(&filter.relationships)
            )),
            "backup relationships",
        )
        .await?;

    let mut snapshot = Snapshot {
        nodes: node_records.iter().map(backup_node).collect(),
        ..Default::default()
    };
    for record in &relationship_records {
        let (relationship, stored_type) = backup_relationship(record);
        snapshot.relationships.push(relationship);
        snapshot.stored_types.push(stored_type);
    }
    Ok(snapshot)
}

fn record_id(record: &Record, key: &str, fallback: &str) -> String {
    match record.get(key) {
        Some(trellis_core::Value::String(s)) if !s.is_empty() => s.clone(),
        Some(trellis_core::Value::Int(i)) => i.to_string(),
        _ => fallback.to_string(),
    }
}

fn backup_node(record: &Record) -> BackupNode {
    let element_id = record.get_str("element_id").unwrap_or_default().to_string();
    BackupNode {
        id: BackupId::String(record_id(record, "id", &element_id)),
        labels: record.get_strings("labels"),
        properties: record.get_map("properties").map(map_to_json).unwrap_or_default(),
        element_id,
    }
}

fn backup_relationship(record: &Record) -> (BackupRelationship, String) {
    let element_id = record.get_str("element_id").unwrap_or_default().to_string();
    let stored_type = record.get_str("stored_type").unwrap_or_default().to_string();
    let relationship = BackupRelationship {
        id: BackupId::String(record_id(record, "id", &element_id)),
        rel_type: record
            .get_str("type")
            .map(str::to_string)
            .unwrap_or_else(|| stored_type.clone()),
        properties: record.get_map("properties").map(map_to_json).unwrap_or_default(),
        start_node: record.get_str("start_element_id").unwrap_or_default().to_string(),
        end_node: record.get_str("end_element_id").unwrap_or_default().to_string(),
        start_business_id: record_id(record, "start_id", ""),
        end_business_id: record_id(record, "end_id", ""),
        element_id,
    };
    (relationship, stored_type)
}

fn emit(
    out: &mut dyn Write,
    scope: &GraphScope,
    snapshot: &Snapshot,
    opts: &BackupOptions,
    exported_at: DateTime<Utc>,
) -> Result<()> {
    match opts.format {
        BackupFormat::Json => {
            let envelope = envelope(scope, snapshot, opts, exported_at);
            serde_json::to_writer(&mut *out, &envelope)?;
            Ok(())
        }
        BackupFormat::Cypher => {
            write_cypher(out, scope, snapshot, exported_at)?;
            Ok(())
        }
    }
}

fn envelope(
    scope: &GraphScope,
    snapshot: &Snapshot,
    opts: &BackupOptions,
    exported_at: DateTime<Utc>,
) -> BackupEnvelope {
    let mut extra: BTreeMap<String, serde_json::Value> = opts.metadata.clone();
    extra.insert(
        "export_timestamp".to_string(),
        serde_json::Value::from(exported_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    if let Some(label) = scope.graph_label() {
        extra.insert("graph_label".to_string(), serde_json::Value::from(label));
    }

    BackupEnvelope {
        format: BackupFormat::Json,
        graph_name: scope.graph().to_string(),
        metadata: BackupMetadata {
            storage_type: scope.storage_mode(),
            node_count: snapshot.nodes.len() as u64,
            relationship_count: snapshot.relationships.len() as u64,
            extra,
        },
        nodes: snapshot.nodes.clone(),
        relationships: snapshot.relationships.clone(),
    }
}

/// Header comments followed by node CREATE lines, then relationship lines
pub(crate) fn write_cypher(
    out: &mut dyn Write,
    scope: &GraphScope,
    snapshot: &Snapshot,
    exported_at: DateTime<Utc>,
) -> std::io::Result<()> {
    writeln!(out, "{}{}", CYPHER_HEADER_PREFIX, scope.graph())?;
    writeln!(out, "// Storage Type: {}", scope.storage_mode())?;
    writeln!(
        out,
        "// Generated by trellis-neo4j at {}",
        exported_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )?;
    writeln!(
        out,
        "// Nodes: {}, Relationships: {}",
        snapshot.nodes.len(),
        snapshot.relationships.len()
    )?;
    writeln!(out)?;

    for node in &snapshot.nodes {
        let labels = scope.write_labels(&node.labels);
        writeln!(
            out,
            "CREATE ({} {})",
            label_expr(&labels),
            literal(&serde_json::Value::Object(node.properties.clone()))
        )?;
    }

    let (a, b) = (scope.node_pattern("a"), scope.node_pattern("b"));
    for (rel, stored_type) in snapshot.relationships.iter().zip(&snapshot.stored_types) {
        let condition = if !rel.start_business_id.is_empty() && !rel.end_business_id.is_empty() {
            format!(
                "a.id = {} AND b.id = {}",
                string_literal(&rel.start_business_id),
                string_literal(&rel.end_business_id)
            )
        } else {
            format!(
                "elementId(a) = {} AND elementId(b) = {}",
                string_literal(&rel.start_node),
                string_literal(&rel.end_node)
            )
        };
        writeln!(
            out,
            "MATCH {a}, {b} WHERE {condition} CREATE (a)-[:{} {}]->(b)",
            escape(stored_type),
            literal(&serde_json::Value::Object(rel.properties.clone()))
        )?;
    }
    Ok(())
}

/// Counts bytes on their way to the caller's writer
struct CountingWriter<W: Write> {
    inner: W,
    bytes: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, bytes: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected_store, ScriptedBackend};
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::Arc;
    use trellis_core::backup::GZIP_MAGIC;
    use trellis_core::{StorageMode, StoreError, Value};

    fn node_record(element_id: &str, id: &str) -> Record {
        let mut record = Record::new();
        record.push("element_id", element_id);
        record.push("id", id);
        record.push("labels", vec!["Person", "__Graph_A"]);
        record.push(
            "properties",
            Value::Map(BTreeMap::from([
                ("id".to_string(), Value::from(id)),
                ("name".to_string(), Value::from("Ada's")),
            ])),
        );
        record
    }

    fn relationship_record() -> Record {
        let mut record = Record::new();
        record.push("element_id", "5:x:1");
        record.push("id", "r1");
        record.push("type", "KNOWS");
        record.push("stored_type", "KNOWS");
        record.push(
            "properties",
            Value::Map(BTreeMap::from([
                ("id".to_string(), Value::from("r1")),
                ("type".to_string(), Value::from("KNOWS")),
            ])),
        );
        record.push("start_element_id", "4:x:1");
        record.push("end_element_id", "4:x:2");
        record.push("start_id", "n1");
        record.push("end_id", "n2");
        record
    }

    fn scripted() -> Arc<ScriptedBackend> {
        Arc::new(
            ScriptedBackend::new()
                .on("LIMIT 1 RETURN count(n) > 0", vec![Record::from_pairs([("exists", true)])])
                .on(
                    "labels(n) AS labels, properties(n) AS properties ORDER BY",
                    vec![node_record("4:x:1", "n1"), node_record("4:x:2", "n2")],
                )
                .on("type(r) AS stored_type", vec![relationship_record()]),
        )
    }

    #[tokio::test]
    async fn test_json_backup() {
        let backend = scripted();
        let store = connected_store(backend.clone(), false).await;

        let mut out = Vec::new();
        let mut opts = BackupOptions {
            graph_name: "A".into(),
            ..Default::default()
        };
        opts.metadata.insert("reason".into(), serde_json::json!("nightly"));
        let summary = store.backup(&mut out, opts).await.unwrap();
        assert_eq!(summary.node_count, 2);
        assert_eq!(summary.relationship_count, 1);
        assert_eq!(summary.bytes_written, out.len() as u64);

        let envelope: BackupEnvelope = serde_json::from_slice(&out).unwrap();
        assert_eq!(envelope.graph_name, "A");
        assert_eq!(envelope.metadata.storage_type, StorageMode::LabelBased);
        assert_eq!(envelope.metadata.extra["graph_label"], serde_json::json!("__Graph_A"));
        assert_eq!(envelope.metadata.extra["reason"], serde_json::json!("nightly"));
        assert!(envelope.metadata.extra.contains_key("export_timestamp"));
        assert_eq!(envelope.relationships[0].start_business_id, "n1");
        assert_eq!(envelope.relationships[0].rel_type, "KNOWS");
        assert!(store.critical.is_free());
    }

    #[tokio::test]
    async fn test_cypher_backup_lines() {
        let backend = scripted();
        let store = connected_store(backend, false).await;

        let mut out = Vec::new();
        store
            .backup(
                &mut out,
                BackupOptions {
                    graph_name: "A".into(),
                    format: BackupFormat::Cypher,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let script = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "// Neo4j Graph Backup - A");
        assert_eq!(lines[1], "// Storage Type: label_based");
        assert!(lines[2].starts_with("// Generated by trellis-neo4j at "));
        assert_eq!(
            lines[5],
            r"CREATE (:`Person`:`__Graph_A` {`id`: 'n1', `name`: 'Ada\'s'})"
        );
        assert_eq!(
            lines[7],
            "MATCH (a:`__Graph_A`), (b:`__Graph_A`) WHERE a.id = 'n1' AND b.id = 'n2' \
             CREATE (a)-[:`KNOWS` {`id`: 'r1', `type`: 'KNOWS'}]->(b)"
        );
    }

    #[tokio::test]
    async fn test_compressed_backup_and_filter() {
        let backend = scripted();
        let store = connected_store(backend.clone(), false).await;

        let mut out = Vec::new();
        let summary = store
            .backup(
                &mut out,
                BackupOptions {
                    graph_name: "A".into(),
                    compress: true,
                    filter: BackupFilter {
                        nodes: Some("n.name <> 'x'".into()),
                        relationships: None,
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(summary.compressed);
        assert_eq!(out[..2], GZIP_MAGIC);

        let mut json = String::new();
        GzDecoder::new(&out[..]).read_to_string(&mut json).unwrap();
        assert!(json.starts_with('{'));

        let nodes = &backend.matching("labels(n) AS labels, properties(n)")[0];
        assert!(nodes.text.contains("WHERE n.name <> 'x' RETURN"));
    }

    #[tokio::test]
    async fn test_backup_of_missing_graph() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = connected_store(backend, true).await;
        let mut out = Vec::new();
        let err = store
            .backup(
                &mut out,
                BackupOptions {
                    graph_name: "A".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::GraphNotFound(_)));
        assert!(out.is_empty());
    }
}
