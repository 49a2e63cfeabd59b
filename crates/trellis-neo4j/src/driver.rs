//! Driver seam
//!
//! The adapter talks to the server only through [`CypherBackend`]: a list of
//! statements goes in, one result set per statement comes out, all inside a
//! single managed transaction. Results are fully consumed before the
//! transaction finishes.

use async_trait::async_trait;
use std::collections::BTreeMap;
use trellis_core::value::{NodeValue, RelationshipValue};
use trellis_core::Value;

/// How a transaction is run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Managed transaction, rolled back once results are read
    Read,
    /// Managed transaction, committed
    Write,
    /// Implicit transaction, for administration commands
    AutoCommit,
}

/// Cypher text with its parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: BTreeMap<String, Value>,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: BTreeMap::new(),
        }
    }

    /// Bind a parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Bind every entry of a map
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.params.extend(params);
        self
    }
}

/// One result row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    columns: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            columns: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.columns.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_list(&self, key: &str) -> Option<&[Value]> {
        self.get(key).and_then(Value::as_list)
    }

    pub fn get_map(&self, key: &str) -> Option<&BTreeMap<String, Value>> {
        self.get(key).and_then(Value::as_map)
    }

    /// String items of a list column; empty when absent
    pub fn get_strings(&self, key: &str) -> Vec<String> {
        self.get(key).map(Value::as_strings).unwrap_or_default()
    }

    pub fn get_node(&self, key: &str) -> Option<&NodeValue> {
        match self.get(key) {
            Some(Value::Node(node)) => Some(node),
            _ => None,
        }
    }

    pub fn get_relationship(&self, key: &str) -> Option<&RelationshipValue> {
        match self.get(key) {
            Some(Value::Relationship(rel)) => Some(rel),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Render the row as a JSON object
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.columns
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}

/// Error reported by the driver or the server
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
    /// Server status code, when the server sent one
    pub code: Option<String>,
    /// Driver-level hint that a retry may succeed
    pub transient: bool,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            transient: false,
        }
    }

    /// Message and code, for substring classification
    pub fn full_text(&self) -> String {
        match &self.code {
            Some(code) => format!("{code}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

/// Connection to a Cypher server
#[async_trait]
pub trait CypherBackend: Send + Sync {
    /// Run statements in one transaction against `database`.
    ///
    /// Returns one record list per statement, in order. A failing statement
    /// aborts the transaction.
    async fn run_transaction(
        &self,
        database: &str,
        mode: AccessMode,
        statements: Vec<Statement>,
    ) -> Result<Vec<Vec<Record>>, DriverError>;

    /// Release pooled connections
    async fn close(&self) -> Result<(), DriverError>;
}
