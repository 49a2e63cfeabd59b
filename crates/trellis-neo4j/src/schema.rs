//! Schema introspection
//!
//! Database mode asks the server's schema procedures first and infers from
//! the data when they are missing. Label mode always infers, restricted to
//! the graph label.

use std::collections::BTreeMap;
use trellis_core::schema::{
    ConstraintInfo, IndexInfo, PropertyDescriptor, SchemaStatistics, MIXED_TYPE,
};
use trellis_core::{GraphOptions, GraphSchema, Result, Value};

use crate::adapter::{with_timeout, Neo4jStore, Session};
use crate::driver::{AccessMode, Record, Statement};
use crate::graphs::{count_graph, ensure_graph_exists};
use crate::mode::GraphScope;

const NODE_TYPE_PROPERTIES: &str = "CALL db.schema.nodeTypeProperties() \
     YIELD nodeLabels, propertyName, propertyTypes, mandatory \
     RETURN nodeLabels, propertyName, propertyTypes, mandatory";

impl Neo4jStore {
    pub async fn get_schema(&self, opts: impl Into<GraphOptions>) -> Result<GraphSchema> {
        let opts = opts.into();
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;
        with_timeout(
            "get schema",
            opts.timeout_secs,
            collect_schema(&session, &scope),
        )
        .await
    }
}

async fn collect_schema(session: &Session, scope: &GraphScope) -> Result<GraphSchema> {
    ensure_graph_exists(session, scope).await?;

    let label_counts = label_counts(session, scope).await?;
    let node_labels = match scope {
        GraphScope::Database { .. } => procedure_labels(session, scope)
            .await
            .unwrap_or_else(|| label_counts.keys().cloned().collect()),
        GraphScope::Label { .. } => label_counts.keys().cloned().collect(),
    };

    let node_properties = match scope {
        GraphScope::Database { .. } => procedure_node_properties(session, scope).await,
        GraphScope::Label { .. } => None,
    };
    let node_properties = match node_properties {
        Some(properties) => properties,
        None => infer_node_properties(session, scope, &label_counts).await?,
    };

    let type_counts = relationship_type_counts(session, scope).await?;
    let relationship_properties =
        infer_relationship_properties(session, scope, &type_counts).await?;
    let (node_count, relationship_count) = count_graph(session, scope).await?;

    let mut schema = GraphSchema {
        node_labels,
        relationship_types: type_counts.keys().cloned().collect(),
        node_properties,
        relationship_properties,
        constraints: constraints(session, scope).await,
        indexes: indexes(session, scope).await,
        statistics: SchemaStatistics {
            node_count,
            relationship_count,
            label_counts,
        },
    };

    if let GraphScope::Label {
        prefix,
        namespace_property,
        ..
    } = scope
    {
        schema.retain_prefixed(prefix);
        schema.exclude_property(namespace_property);
    }
    Ok(schema)
}

/// `WITH label WHERE NOT label STARTS WITH $prefix` in label mode
fn hide_partition_labels(scope: &GraphScope) -> &'static str {
    match scope {
        GraphScope::Database { .. } => "",
        GraphScope::Label { .. } => " WITH n, label WHERE NOT label STARTS WITH $prefix",
    }
}

fn prefix_param(scope: &GraphScope) -> Vec<(String, Value)> {
    match scope {
        GraphScope::Database { .. } => Vec::new(),
        GraphScope::Label { prefix, .. } => vec![("prefix".to_string(), Value::from(prefix))],
    }
}

async fn label_counts(session: &Session, scope: &GraphScope) -> Result<BTreeMap<String, u64>> {
    let records = session
        .run_one(
            scope.database(),
            AccessMode::Read,
            Statement::new(format!(
                "MATCH {} UNWIND labels(n) AS label{} RETURN label, count(*) AS count ORDER BY label",
                scope.node_pattern("n"),
                hide_partition_labels(scope)
            ))
            .params(prefix_param(scope)),
            "schema labels",
        )
        .await?;
    Ok(records
        .iter()
        .filter_map(|r| Some((r.get_str("label")?.to_string(), r.get_i64("count")?.max(0) as u64)))
        .collect())
}

async fn procedure_labels(session: &Session, scope: &GraphScope) -> Option<Vec<String>> {
    match session
        .backend
        .run_transaction(
            scope.database(),
            AccessMode::Read,
            vec![Statement::new("CALL db.labels() YIELD label RETURN label ORDER BY label")],
        )
        .await
    {
        Ok(mut results) => Some(
            results
                .pop()
                .unwrap_or_default()
                .iter()
                .filter_map(|r| r.get_str("label").map(str::to_string))
                .collect(),
        ),
        Err(err) => {
            tracing::warn!("db.labels unavailable, inferring labels: {}", err);
            None
        }
    }
}

async fn procedure_node_properties(
    session: &Session,
    scope: &GraphScope,
) -> Option<BTreeMap<String, Vec<PropertyDescriptor>>> {
    let records = match session
        .backend
        .run_transaction(
            scope.database(),
            AccessMode::Read,
            vec![Statement::new(NODE_TYPE_PROPERTIES)],
        )
        .await
    {
        Ok(mut results) => results.pop().unwrap_or_default(),
        Err(err) => {
            tracing::warn!("db.schema.nodeTypeProperties unavailable, inferring: {}", err);
            return None;
        }
    };

    let mut properties: BTreeMap<String, Vec<PropertyDescriptor>> = BTreeMap::new();
    for record in &records {
        let Some(name) = record.get_str("propertyName") else {
            continue;
        };
        let types = record.get_strings("propertyTypes");
        let mandatory = record.get_bool("mandatory").unwrap_or(false);
        for label in record.get_strings("nodeLabels") {
            properties.entry(label).or_default().push(PropertyDescriptor {
                name: name.to_string(),
                type_name: if types.len() == 1 {
                    types[0].clone()
                } else {
                    MIXED_TYPE.to_string()
                },
                count: 0,
                nullable: !mandatory,
            });
        }
    }
    Some(properties)
}

async fn infer_node_properties(
    session: &Session,
    scope: &GraphScope,
    label_counts: &BTreeMap<String, u64>,
) -> Result<BTreeMap<String, Vec<PropertyDescriptor>>> {
    let records = session
        .run_one(
            scope.database(),
            AccessMode::Read,
            Statement::new(format!(
                "MATCH {} UNWIND labels(n) AS label{} UNWIND keys(n) AS key \
                 RETURN label AS owner, key, count(*) AS count, collect(n[key])[0] AS sample \
                 ORDER BY owner, key",
                scope.node_pattern("n"),
                hide_partition_labels(scope)
            ))
            .params(prefix_param(scope)),
            "schema node properties",
        )
        .await?;
    Ok(describe_properties(&records, label_counts))
}

async fn relationship_type_counts(
    session: &Session,
    scope: &GraphScope,
) -> Result<BTreeMap<String, u64>> {
    let records = session
        .run_one(
            scope.database(),
            AccessMode::Read,
            Statement::new(format!(
                "MATCH {}-[r]->{} RETURN coalesce(r.type, type(r)) AS type, count(r) AS count \
                 ORDER BY type",
                scope.node_pattern("a"),
                scope.node_pattern("b")
            )),
            "schema relationship types",
        )
        .await?;
    Ok(records
        .iter()
        .filter_map(|r| Some((r.get_str("type")?.to_string(), r.get_i64("count")?.max(0) as u64)))
        .collect())
}

async fn infer_relationship_properties(
    session: &Session,
    scope: &GraphScope,
    type_counts: &BTreeMap<String, u64>,
) -> Result<BTreeMap<String, Vec<PropertyDescriptor>>> {
    let records = session
        .run_one(
            scope.database(),
            AccessMode::Read,
            Statement::new(format!(
                "MATCH {}-[r]->{} WITH r, coalesce(r.type, type(r)) AS owner \
                 UNWIND keys(r) AS key \
                 RETURN owner, key, count(*) AS count, collect(r[key])[0] AS sample \
                 ORDER BY owner, key",
                scope.node_pattern("a"),
                scope.node_pattern("b")
            )),
            "schema relationship properties",
        )
        .await?;
    Ok(describe_properties(&records, type_counts))
}

/// Descriptors from `owner, key, count, sample` records
fn describe_properties(
    records: &[Record],
    owner_counts: &BTreeMap<String, u64>,
) -> BTreeMap<String, Vec<PropertyDescriptor>> {
    let mut properties: BTreeMap<String, Vec<PropertyDescriptor>> = BTreeMap::new();
    for record in records {
        let (Some(owner), Some(key)) = (record.get_str("owner"), record.get_str("key")) else {
            continue;
        };
        let count = record.get_i64("count").unwrap_or(0).max(0) as u64;
        let total = owner_counts.get(owner).copied().unwrap_or(count);
        properties
            .entry(owner.to_string())
            .or_default()
            .push(PropertyDescriptor {
                name: key.to_string(),
                type_name: type_name(record.get("sample")).to_string(),
                count,
                nullable: count < total,
            });
    }
    properties
}

fn type_name(sample: Option<&Value>) -> &'static str {
    match sample {
        Some(Value::Bool(_)) => "Boolean",
        Some(Value::Int(_)) => "Long",
        Some(Value::Float(_)) => "Double",
        Some(Value::String(_)) => "String",
        Some(Value::List(items)) => match items.first() {
            Some(Value::Bool(_)) => "BooleanArray",
            Some(Value::Int(_)) => "LongArray",
            Some(Value::Float(_)) => "DoubleArray",
            Some(Value::String(_)) => "StringArray",
            _ => "List",
        },
        _ => MIXED_TYPE,
    }
}

async fn constraints(session: &Session, scope: &GraphScope) -> Vec<ConstraintInfo> {
    let statement = Statement::new(
        "SHOW CONSTRAINTS YIELD name, type, labelsOrTypes, properties \
         RETURN name, type, labelsOrTypes, properties",
    );
    match session
        .backend
        .run_transaction(scope.database(), AccessMode::AutoCommit, vec![statement])
        .await
    {
        Ok(mut results) => results
            .pop()
            .unwrap_or_default()
            .iter()
            .map(|r| ConstraintInfo {
                name: r.get_str("name").unwrap_or_default().to_string(),
                constraint_type: r.get_str("type").unwrap_or_default().to_string(),
                labels: r.get_strings("labelsOrTypes"),
                properties: r.get_strings("properties"),
            })
            .collect(),
        Err(err) => {
            tracing::warn!("Could not list constraints: {}", err);
            Vec::new()
        }
    }
}

async fn indexes(session: &Session, scope: &GraphScope) -> Vec<IndexInfo> {
    let statement = Statement::new(
        "SHOW INDEXES YIELD name, type, labelsOrTypes, properties, state \
         RETURN name, type, labelsOrTypes, properties, state",
    );
    match session
        .backend
        .run_transaction(scope.database(), AccessMode::AutoCommit, vec![statement])
        .await
    {
        Ok(mut results) => results
            .pop()
            .unwrap_or_default()
            .iter()
            .map(|r| IndexInfo {
                name: r.get_str("name").unwrap_or_default().to_string(),
                index_type: r.get_str("type").unwrap_or_default().to_string(),
                labels: r.get_strings("labelsOrTypes"),
                properties: r.get_strings("properties"),
                state: r.get_str("state").unwrap_or_default().to_string(),
            })
            .collect(),
        Err(err) => {
            tracing::warn!("Could not list indexes: {}", err);
            Vec::new()
        }
    }
}
