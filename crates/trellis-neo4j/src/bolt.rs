//! [`CypherBackend`] over the Bolt protocol, using `neo4rs`

use async_trait::async_trait;
use neo4rs::{
    BoltBoolean, BoltFloat, BoltInteger, BoltList, BoltMap, BoltNull, BoltString, BoltType,
    ConfigBuilder, Graph, Query, Row, Txn,
};
use std::collections::{BTreeMap, HashMap};
use trellis_core::value::{NodeValue, PathValue, RelationshipValue};
use trellis_core::{Credentials, DriverConfig, Value};

use crate::driver::{AccessMode, CypherBackend, DriverError, Record, Statement};

/// Pooled Bolt connection
pub struct BoltBackend {
    graph: Graph,
}

impl BoltBackend {
    /// Build the connection pool
    pub async fn connect(
        credentials: &Credentials,
        driver: &DriverConfig,
    ) -> Result<Self, DriverError> {
        let config = ConfigBuilder::default()
            .uri(credentials.uri.as_str())
            .user(credentials.username.as_str())
            .password(credentials.password.as_str())
            .db(driver.default_database())
            .fetch_size(driver.fetch_size.max(1))
            .max_connections(driver.max_connections.max(1))
            .build()
            .map_err(driver_error)?;

        let graph = Graph::connect(config).await.map_err(driver_error)?;
        tracing::debug!("Bolt pool ready for {}", credentials.uri);
        Ok(Self { graph })
    }

    async fn run_managed(
        &self,
        database: &str,
        commit: bool,
        statements: Vec<Statement>,
    ) -> Result<Vec<Vec<Record>>, DriverError> {
        let mut txn = self
            .graph
            .start_txn_on(database)
            .await
            .map_err(driver_error)?;

        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            match run_in_txn(&mut txn, statement).await {
                Ok(rows) => results.push(rows),
                Err(err) => {
                    if let Err(rollback) = txn.rollback().await {
                        tracing::warn!("Rollback after failed statement failed: {}", rollback);
                    }
                    return Err(err);
                }
            }
        }

        if commit {
            txn.commit().await.map_err(driver_error)?;
        } else {
            txn.rollback().await.map_err(driver_error)?;
        }
        Ok(results)
    }

    async fn run_auto_commit(
        &self,
        database: &str,
        statements: Vec<Statement>,
    ) -> Result<Vec<Vec<Record>>, DriverError> {
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            let mut stream = self
                .graph
                .execute_on(database, to_query(statement))
                .await
                .map_err(driver_error)?;
            let mut rows = Vec::new();
            while let Some(row) = stream.next().await.map_err(driver_error)? {
                rows.push(row_to_record(&row)?);
            }
            results.push(rows);
        }
        Ok(results)
    }
}

#[async_trait]
impl CypherBackend for BoltBackend {
    async fn run_transaction(
        &self,
        database: &str,
        mode: AccessMode,
        statements: Vec<Statement>,
    ) -> Result<Vec<Vec<Record>>, DriverError> {
        match mode {
            AccessMode::Read => self.run_managed(database, false, statements).await,
            AccessMode::Write => self.run_managed(database, true, statements).await,
            AccessMode::AutoCommit => self.run_auto_commit(database, statements).await,
        }
    }

    async fn close(&self) -> Result<(), DriverError> {
        // pooled connections are released when the graph is dropped
        Ok(())
    }
}

async fn run_in_txn(txn: &mut Txn, statement: Statement) -> Result<Vec<Record>, DriverError> {
    let mut stream = txn.execute(to_query(statement)).await.map_err(driver_error)?;
    let mut rows = Vec::new();
    while let Some(row) = stream.next(txn.handle()).await.map_err(driver_error)? {
        rows.push(row_to_record(&row)?);
    }
    Ok(rows)
}

fn to_query(statement: Statement) -> Query {
    statement
        .params
        .iter()
        .fold(neo4rs::query(&statement.text), |q, (key, value)| {
            q.param(key, to_bolt(value))
        })
}

fn row_to_record(row: &Row) -> Result<Record, DriverError> {
    let columns: HashMap<String, BoltType> = row
        .to()
        .map_err(|e| DriverError::new(format!("decode row: {e}")))?;
    Ok(record_from_columns(columns))
}

/// Columns come back unordered; sort them so records are stable
fn record_from_columns(columns: HashMap<String, BoltType>) -> Record {
    let mut columns: Vec<_> = columns.into_iter().collect();
    columns.sort_by(|a, b| a.0.cmp(&b.0));

    let mut record = Record::new();
    for (key, value) in columns {
        record.push(key, from_bolt(value));
    }
    record
}

fn driver_error(err: neo4rs::Error) -> DriverError {
    let mut out = DriverError::new(err.to_string());
    match &err {
        neo4rs::Error::ConnectionError => out.transient = true,
        neo4rs::Error::Neo4j(inner) => {
            out.code = Some(inner.code().to_string());
            out.transient = inner.kind() == neo4rs::Neo4jErrorKind::Transient;
        }
        _ => {}
    }
    out
}

// ============================================================================
// Value conversion
// ============================================================================

fn to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => BoltType::Boolean(BoltBoolean::new(*b)),
        Value::Int(i) => BoltType::Integer(BoltInteger::new(*i)),
        Value::Float(f) => BoltType::Float(BoltFloat::new(*f)),
        Value::String(s) => BoltType::String(BoltString::new(s)),
        Value::List(items) => BoltType::List(BoltList {
            value: items.iter().map(to_bolt).collect(),
        }),
        Value::Map(map) => bolt_map(map),
        Value::Node(node) => bolt_map(&node.properties),
        Value::Relationship(rel) => bolt_map(&rel.properties),
        Value::Path(path) => BoltType::List(BoltList {
            value: path.nodes.iter().map(|n| bolt_map(&n.properties)).collect(),
        }),
    }
}

fn bolt_map(map: &BTreeMap<String, Value>) -> BoltType {
    BoltType::Map(BoltMap {
        value: map
            .iter()
            .map(|(k, v)| (BoltString::new(k), to_bolt(v)))
            .collect(),
    })
}

fn from_bolt(value: BoltType) -> Value {
    match value {
        BoltType::Null(_) => Value::Null,
        BoltType::Boolean(b) => Value::Bool(b.value),
        BoltType::Integer(i) => Value::Int(i.value),
        BoltType::Float(f) => Value::Float(f.value),
        BoltType::String(s) => Value::String(s.value),
        BoltType::List(list) => Value::List(list.value.into_iter().map(from_bolt).collect()),
        BoltType::Map(map) => Value::Map(properties(map.value)),
        BoltType::Node(node) => Value::Node(NodeValue {
            element_id: node.id.value.to_string(),
            labels: node
                .labels
                .value
                .into_iter()
                .filter_map(|l| match l {
                    BoltType::String(s) => Some(s.value),
                    _ => None,
                })
                .collect(),
            properties: properties(node.properties.value),
        }),
        BoltType::Relation(rel) => Value::Relationship(RelationshipValue {
            element_id: rel.id.value.to_string(),
            rel_type: rel.typ.value,
            start_element_id: rel.start_node_id.value.to_string(),
            end_element_id: rel.end_node_id.value.to_string(),
            properties: properties(rel.properties.value),
        }),
        BoltType::UnboundedRelation(rel) => Value::Relationship(RelationshipValue {
            element_id: rel.id.value.to_string(),
            rel_type: rel.typ.value,
            properties: properties(rel.properties.value),
            ..Default::default()
        }),
        BoltType::Path(path) => Value::Path(path_value(
            path.nodes.value,
            path.rels.value,
            path.indices.value,
        )),
        other => Value::String(format!("{other:?}")),
    }
}

fn properties(map: HashMap<BoltString, BoltType>) -> BTreeMap<String, Value> {
    map.into_iter()
        .map(|(k, v)| (k.value, from_bolt(v)))
        .collect()
}

/// Rebuild a path from its packed form.
///
/// `indices` alternates a 1-based relationship index (negative when
/// traversed backwards) and the index of the next node.
fn path_value(nodes: Vec<BoltType>, rels: Vec<BoltType>, indices: Vec<BoltType>) -> PathValue {
    let nodes: Vec<NodeValue> = nodes
        .into_iter()
        .filter_map(|n| match from_bolt(n) {
            Value::Node(node) => Some(node),
            _ => None,
        })
        .collect();
    let rels: Vec<RelationshipValue> = rels
        .into_iter()
        .filter_map(|r| match from_bolt(r) {
            Value::Relationship(rel) => Some(rel),
            _ => None,
        })
        .collect();
    let indices: Vec<i64> = indices
        .into_iter()
        .filter_map(|i| match i {
            BoltType::Integer(i) => Some(i.value),
            _ => None,
        })
        .collect();

    let mut path = PathValue {
        nodes: Vec::new(),
        relationships: Vec::new(),
    };
    let Some(first) = nodes.first() else {
        return path;
    };
    path.nodes.push(first.clone());

    let mut previous = first.element_id.clone();
    for pair in indices.chunks(2) {
        let [rel_index, node_index] = pair else { break };
        let rel_pos = rel_index.unsigned_abs() as usize;
        let (Some(rel), Some(next)) = (
            rel_pos.checked_sub(1).and_then(|i| rels.get(i)),
            usize::try_from(*node_index).ok().and_then(|i| nodes.get(i)),
        ) else {
            break;
        };

        let mut rel = rel.clone();
        if *rel_index > 0 {
            rel.start_element_id = previous.clone();
            rel.end_element_id = next.element_id.clone();
        } else {
            rel.start_element_id = next.element_id.clone();
            rel.end_element_id = previous.clone();
        }
        previous = next.element_id.clone();
        path.relationships.push(rel);
        path.nodes.push(next.clone());
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Int(-4),
            Value::Float(1.5),
            Value::from("x"),
            Value::from(vec![1i64, 2]),
        ] {
            assert_eq!(from_bolt(to_bolt(&value)), value);
        }
    }

    #[test]
    fn test_map_round_trip() {
        let map: BTreeMap<String, Value> =
            [("a".to_string(), Value::Int(1)), ("b".to_string(), Value::from("z"))]
                .into_iter()
                .collect();
        assert_eq!(from_bolt(to_bolt(&Value::Map(map.clone()))), Value::Map(map));
    }

    #[test]
    fn test_record_from_columns() {
        let columns = HashMap::from([
            ("name".to_string(), BoltType::String(BoltString::new("Ada"))),
            ("n".to_string(), bolt_node(7)),
            ("age".to_string(), BoltType::Integer(BoltInteger::new(36))),
        ]);
        let record = record_from_columns(columns);

        let keys: Vec<&str> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["age", "n", "name"]);
        assert_eq!(record.get_str("name"), Some("Ada"));
        assert_eq!(record.get_i64("age"), Some(36));
        let node = record.get_node("n").unwrap();
        assert_eq!(node.element_id, "7");
        assert_eq!(node.labels, vec!["T"]);
    }

    fn bolt_node(id: i64) -> BoltType {
        BoltType::Node(neo4rs::BoltNode {
            id: BoltInteger::new(id),
            labels: BoltList {
                value: vec![BoltType::String(BoltString::new("T"))],
            },
            properties: BoltMap {
                value: HashMap::new(),
            },
        })
    }

    fn bolt_rel(id: i64) -> BoltType {
        BoltType::UnboundedRelation(neo4rs::BoltUnboundedRelation {
            id: BoltInteger::new(id),
            typ: BoltString::new("R"),
            properties: BoltMap {
                value: HashMap::new(),
            },
        })
    }

    #[test]
    fn test_path_directions() {
        // (1)-[10]->(2)<-[11]-(3)
        let path = path_value(
            vec![bolt_node(1), bolt_node(2), bolt_node(3)],
            vec![bolt_rel(10), bolt_rel(11)],
            vec![
                BoltType::Integer(BoltInteger::new(1)),
                BoltType::Integer(BoltInteger::new(1)),
                BoltType::Integer(BoltInteger::new(-2)),
                BoltType::Integer(BoltInteger::new(2)),
            ],
        );
        assert_eq!(path.nodes.len(), 3);
        assert_eq!(path.relationships[0].start_element_id, "1");
        assert_eq!(path.relationships[0].end_element_id, "2");
        assert_eq!(path.relationships[1].start_element_id, "3");
        assert_eq!(path.relationships[1].end_element_id, "2");
    }
}
