//! Cypher text helpers

use trellis_core::options::PropertyFilter;
use trellis_core::Value;

/// Backtick-quote an identifier
pub fn escape(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

/// `:`A`:`B`` for a label set, empty for none
pub fn label_expr(labels: &[String]) -> String {
    labels.iter().map(|l| format!(":{}", escape(l))).collect()
}

/// Property assignment after a MERGE over `row`.
///
/// A matched element keeps its `created_at` and has its `version` bumped;
/// a new one takes both from the row.
pub fn merge_set(var: &str, assign: &str) -> String {
    format!(
        "WITH {var}, row, {var}.created_at AS created, {var}.version AS version \
         SET {var} {assign} row.properties, \
         {var}.created_at = coalesce(created, row.properties.created_at), \
         {var}.version = coalesce(version + 1, row.properties.version)"
    )
}

/// Quote a string as a Cypher literal
pub fn string_literal(value: &str) -> String {
    format!(
        "'{}'",
        value
            .replace('\\', "\\\\")
            .replace('\'', "\\'")
            .replace('\n', "\\n")
            .replace('\r', "\\r")
    )
}

/// Render a value as a Cypher literal (used for backup scripts)
pub fn literal(value: &serde_json::Value) -> String {
    use serde_json::Value as J;

    match value {
        J::Null => "null".to_string(),
        J::Bool(b) => b.to_string(),
        J::Number(n) => n.to_string(),
        J::String(s) => string_literal(s),
        J::Array(items) => format!(
            "[{}]",
            items.iter().map(literal).collect::<Vec<_>>().join(", ")
        ),
        J::Object(map) => format!(
            "{{{}}}",
            map.iter()
                .map(|(k, v)| format!("{}: {}", escape(k), literal(v)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// Accumulates WHERE conditions and their parameters
#[derive(Debug, Default)]
pub struct Conditions {
    clauses: Vec<String>,
    params: Vec<(String, Value)>,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, clause: impl Into<String>) {
        self.clauses.push(clause.into());
    }

    pub fn param(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.params.push((key.into(), value.into()));
    }

    /// `var.id IN $param`
    pub fn ids(&mut self, var: &str, param: &str, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        self.push(format!("{var}.id IN ${param}"));
        self.param(param, ids.to_vec());
    }

    /// Node carries at least one of the labels
    pub fn any_label(&mut self, var: &str, param: &str, labels: &[String]) {
        if labels.is_empty() {
            return;
        }
        self.push(format!("any(label IN labels({var}) WHERE label IN ${param})"));
        self.param(param, labels.to_vec());
    }

    /// Property equality for every filter entry
    pub fn equals(&mut self, var: &str, prefix: &str, filter: &PropertyFilter) {
        for (i, (key, value)) in filter.iter().enumerate() {
            let param = format!("{prefix}{i}");
            self.push(format!("{var}.{} = ${param}", escape(key)));
            self.param(param, Value::from_json(value));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// ` WHERE a AND b`, or an empty string
    pub fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn into_params(self) -> Vec<(String, Value)> {
        self.params
    }
}
