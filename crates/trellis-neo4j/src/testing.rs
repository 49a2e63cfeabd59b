//! In-process backend for tests
//!
//! [`ScriptedBackend`] records every statement it receives and answers from
//! an ordered list of rules: the first rule whose pattern occurs in the
//! statement text (and has uses left) decides the reply. Statements that
//! match no rule return no records.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use trellis_core::{StoreConfig, Value};

use crate::adapter::Neo4jStore;
use crate::driver::{AccessMode, CypherBackend, DriverError, Record, Statement};

/// A statement as the backend received it
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub database: String,
    pub mode: AccessMode,
    pub text: String,
    pub params: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
enum Reply {
    Rows(Vec<Record>),
    Error(DriverError),
    Stall(Duration),
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    reply: Reply,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
pub struct ScriptedBackend {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<ExecutedStatement>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(self, pattern: &str, reply: Reply, remaining: Option<usize>) -> Self {
        lock(&self.rules).push(Rule {
            pattern: pattern.to_string(),
            reply,
            remaining,
        });
        self
    }

    /// Answer every matching statement with `rows`
    pub fn on(self, pattern: &str, rows: Vec<Record>) -> Self {
        self.rule(pattern, Reply::Rows(rows), None)
    }

    /// Answer the next matching statement with `rows`
    pub fn on_once(self, pattern: &str, rows: Vec<Record>) -> Self {
        self.rule(pattern, Reply::Rows(rows), Some(1))
    }

    /// Fail every matching statement
    pub fn fail(self, pattern: &str, message: &str) -> Self {
        self.rule(pattern, Reply::Error(DriverError::new(message)), None)
    }

    /// Fail the next `times` matching statements
    pub fn fail_times(self, pattern: &str, message: &str, times: usize) -> Self {
        self.rule(pattern, Reply::Error(DriverError::new(message)), Some(times))
    }

    /// Hold every matching statement for `duration` before answering with no records
    pub fn stall(self, pattern: &str, duration: Duration) -> Self {
        self.rule(pattern, Reply::Stall(duration), None)
    }

    /// Everything executed so far, in order
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        lock(&self.log).clone()
    }

    pub fn texts(&self) -> Vec<String> {
        lock(&self.log).iter().map(|s| s.text.clone()).collect()
    }

    /// Executed statements whose text contains `pattern`
    pub fn matching(&self, pattern: &str) -> Vec<ExecutedStatement> {
        lock(&self.log)
            .iter()
            .filter(|s| s.text.contains(pattern))
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        lock(&self.log).clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn reply_for(&self, text: &str) -> Reply {
        let mut rules = lock(&self.rules);
        for rule in rules.iter_mut() {
            if rule.remaining == Some(0) || !text.contains(&rule.pattern) {
                continue;
            }
            if let Some(left) = rule.remaining.as_mut() {
                *left -= 1;
            }
            return rule.reply.clone();
        }
        Reply::Rows(Vec::new())
    }
}

#[async_trait]
impl CypherBackend for ScriptedBackend {
    async fn run_transaction(
        &self,
        database: &str,
        mode: AccessMode,
        statements: Vec<Statement>,
    ) -> Result<Vec<Vec<Record>>, DriverError> {
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            let reply = self.reply_for(&statement.text);
            lock(&self.log).push(ExecutedStatement {
                database: database.to_string(),
                mode,
                text: statement.text,
                params: statement.params,
            });
            match reply {
                Reply::Rows(rows) => results.push(rows),
                Reply::Error(err) => return Err(err),
                Reply::Stall(duration) => {
                    tokio::time::sleep(duration).await;
                    results.push(Vec::new());
                }
            }
        }
        Ok(results)
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Configuration used by [`connected_store`]
pub fn test_config(separate_database: bool) -> StoreConfig {
    let mut config = StoreConfig::new("bolt://localhost:7687", "password");
    config.driver_config.use_separate_database = separate_database;
    config.driver_config.availability_timeout_secs = 1;
    config
}

/// A store connected through `backend`
///
/// # Panics
///
/// Panics when the scripted connect fails.
pub async fn connected_store(backend: Arc<ScriptedBackend>, separate_database: bool) -> Neo4jStore {
    let store = Neo4jStore::new();
    let config = test_config(separate_database);
    if let Err(err) = store.connect_with_backend(backend, &config).await {
        panic!("scripted connect failed: {err}");
    }
    store
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rules_in_order_with_counts() {
        let backend = ScriptedBackend::new()
            .fail_times("RETURN 1", "database is unavailable", 1)
            .on("RETURN 1", vec![Record::from_pairs([("x", 1i64)])]);

        let first = backend
            .run_transaction("neo4j", AccessMode::Read, vec![Statement::new("RETURN 1")])
            .await;
        assert!(first.is_err());

        let second = backend
            .run_transaction("neo4j", AccessMode::Read, vec![Statement::new("RETURN 1")])
            .await
            .unwrap();
        assert_eq!(second[0][0].get_i64("x"), Some(1));

        let other = backend
            .run_transaction("neo4j", AccessMode::Write, vec![Statement::new("CREATE (n)")])
            .await
            .unwrap();
        assert!(other[0].is_empty());
        assert_eq!(backend.texts().len(), 3);
    }
}
