//! Graph lifecycle
//!
//! Database mode maps a graph onto a database and needs the system database
//! for every change. Label mode only touches the shared database.

use tokio::time::{sleep, Duration, Instant};
use trellis_core::{GraphInfo, GraphOptions, Result, StoreError};

use crate::adapter::{with_timeout, Neo4jStore, Session};
use crate::classify;
use crate::cypher::escape;
use crate::driver::{AccessMode, Statement};
use crate::mode::{GraphScope, SYSTEM_DATABASE};

/// Probe used while waiting for a new database
const AVAILABILITY_PROBE: &str = "RETURN 1 AS available";
const UNAVAILABLE_RETRY: Duration = Duration::from_millis(100);
const OTHER_RETRY: Duration = Duration::from_millis(50);
const DELETE_BATCH: i64 = 10_000;

impl Neo4jStore {
    pub async fn create_graph(&self, opts: impl Into<GraphOptions>) -> Result<()> {
        let opts = opts.into();
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;
        let _permit = self.critical.enter("create graph").await?;
        with_timeout(
            "create graph",
            opts.timeout_secs,
            create_graph_in(&session, &scope),
        )
        .await
    }

    pub async fn drop_graph(&self, opts: impl Into<GraphOptions>) -> Result<()> {
        let opts = opts.into();
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;
        let _permit = match &scope {
            GraphScope::Database { .. } => Some(self.critical.enter("drop graph").await?),
            GraphScope::Label { .. } => None,
        };
        with_timeout("drop graph", opts.timeout_secs, drop_graph_in(&session, &scope)).await
    }

    pub async fn graph_exists(&self, graph_name: &str) -> Result<bool> {
        let session = self.session().await?;
        let scope = session.scope(graph_name)?;
        graph_exists_in(&session, &scope).await
    }

    pub async fn list_graphs(&self) -> Result<Vec<String>> {
        let session = self.session().await?;
        if session.policy.separate_database {
            let records = session
                .run_one(
                    SYSTEM_DATABASE,
                    AccessMode::AutoCommit,
                    Statement::new("SHOW DATABASES YIELD name RETURN name"),
                    "list graphs",
                )
                .await?;
            let mut names: Vec<String> = Vec::with_capacity(records.len());
            for name in records.iter().filter_map(|r| r.get_str("name")) {
                // clustered servers report one row per member
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
            Ok(names)
        } else {
            let prefix = session.policy.label_prefix.clone();
            let records = session
                .run_one(
                    &session.policy.default_database,
                    AccessMode::Read,
                    Statement::new(
                        "CALL db.labels() YIELD label WHERE label STARTS WITH $prefix \
                         RETURN label ORDER BY label",
                    )
                    .param("prefix", prefix.as_str()),
                    "list graphs",
                )
                .await?;
            Ok(records
                .iter()
                .filter_map(|r| r.get_str("label"))
                .filter_map(|label| label.strip_prefix(prefix.as_str()))
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect())
        }
    }

    pub async fn describe_graph(&self, graph_name: &str) -> Result<GraphInfo> {
        let session = self.session().await?;
        let scope = session.scope(graph_name)?;
        if scope.needs_availability_wait() && !graph_exists_in(&session, &scope).await? {
            return Err(StoreError::GraphNotFound(graph_name.to_string()));
        }

        let (node_count, relationship_count) = count_graph(&session, &scope).await?;
        Ok(GraphInfo {
            name: graph_name.to_string(),
            node_count,
            relationship_count,
            storage_mode: scope.storage_mode(),
            database: scope.database().to_string(),
            graph_label: scope.graph_label().map(str::to_string),
        })
    }
}

/// Node and relationship counts of a graph
pub(crate) async fn count_graph(session: &Session, scope: &GraphScope) -> Result<(u64, u64)> {
    let nodes = session
        .run_count(
            scope.database(),
            Statement::new(format!(
                "MATCH {} RETURN count(n) AS count",
                scope.node_pattern("n")
            )),
            "count",
            "count nodes",
        )
        .await?;
    let relationships = session
        .run_count(
            scope.database(),
            Statement::new(format!(
                "MATCH {}-[r]->{} RETURN count(r) AS count",
                scope.node_pattern("a"),
                scope.node_pattern("b")
            )),
            "count",
            "count relationships",
        )
        .await?;
    Ok((nodes, relationships))
}

/// Create a graph; the caller holds the critical section where needed
pub(crate) async fn create_graph_in(session: &Session, scope: &GraphScope) -> Result<()> {
    match scope {
        GraphScope::Database { graph } => {
            session
                .backend
                .run_transaction(
                    SYSTEM_DATABASE,
                    AccessMode::AutoCommit,
                    vec![Statement::new(format!("CREATE DATABASE {}", escape(graph)))],
                )
                .await
                .map_err(|err| {
                    if classify::is_already_exists(&err) {
                        StoreError::GraphAlreadyExists(graph.clone())
                    } else {
                        classify::to_store_error("create graph", err)
                    }
                })?;
            tracing::info!("Created database '{}'", graph);
            wait_until_available(session, graph).await
        }
        GraphScope::Label {
            graph,
            database,
            label,
            namespace_property,
            ..
        } => {
            session
                .run(
                    database,
                    AccessMode::Read,
                    vec![Statement::new("RETURN 1")],
                    "create graph",
                )
                .await?;

            let statement = Statement::new(format!(
                "CREATE CONSTRAINT {} IF NOT EXISTS FOR (n:{}) REQUIRE n.{} IS UNIQUE",
                escape(&namespace_constraint(label)),
                escape(label),
                escape(namespace_property)
            ));
            if let Err(err) = session
                .backend
                .run_transaction(database, AccessMode::AutoCommit, vec![statement])
                .await
            {
                tracing::warn!("Namespace constraint for graph '{}' not created: {}", graph, err);
            }
            tracing::info!("Created graph '{}' (label {})", graph, label);
            Ok(())
        }
    }
}

/// Drop a graph; the caller holds the critical section where needed
pub(crate) async fn drop_graph_in(session: &Session, scope: &GraphScope) -> Result<()> {
    match scope {
        GraphScope::Database { graph } => {
            if graph == &session.policy.default_database || graph == SYSTEM_DATABASE {
                return Err(StoreError::Precondition(format!(
                    "refusing to drop the default database '{graph}'"
                )));
            }
            session
                .backend
                .run_transaction(
                    SYSTEM_DATABASE,
                    AccessMode::AutoCommit,
                    vec![Statement::new(format!("DROP DATABASE {}", escape(graph)))],
                )
                .await
                .map_err(|err| {
                    if classify::is_missing(&err) {
                        StoreError::GraphNotFound(graph.clone())
                    } else {
                        classify::to_store_error("drop graph", err)
                    }
                })?;
            tracing::info!("Dropped database '{}'", graph);
            Ok(())
        }
        GraphScope::Label {
            graph,
            database,
            label,
            ..
        } => {
            let relationships = delete_in_batches(
                session,
                database,
                format!(
                    "MATCH (:{})-[r]-() WITH DISTINCT r LIMIT $batch DELETE r RETURN count(r) AS deleted",
                    escape(label)
                ),
            )
            .await?;
            let nodes = delete_in_batches(
                session,
                database,
                format!(
                    "MATCH (n:{}) WITH n LIMIT $batch DETACH DELETE n RETURN count(n) AS deleted",
                    escape(label)
                ),
            )
            .await?;

            let statement = Statement::new(format!(
                "DROP CONSTRAINT {} IF EXISTS",
                escape(&namespace_constraint(label))
            ));
            if let Err(err) = session
                .backend
                .run_transaction(database, AccessMode::AutoCommit, vec![statement])
                .await
            {
                tracing::warn!("Namespace constraint for graph '{}' not dropped: {}", graph, err);
            }
            tracing::info!(
                "Dropped graph '{}' ({} nodes, {} relationships)",
                graph,
                nodes,
                relationships
            );
            Ok(())
        }
    }
}

async fn delete_in_batches(session: &Session, database: &str, text: String) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let deleted = session
            .run_one(
                database,
                AccessMode::Write,
                Statement::new(text.clone()).param("batch", DELETE_BATCH),
                "drop graph",
            )
            .await?
            .first()
            .and_then(|r| r.get_i64("deleted"))
            .unwrap_or(0);
        total += deleted.max(0) as u64;
        if deleted < DELETE_BATCH {
            return Ok(total);
        }
    }
}

pub(crate) async fn graph_exists_in(session: &Session, scope: &GraphScope) -> Result<bool> {
    match scope {
        GraphScope::Database { graph } => {
            let records = session
                .run_one(
                    SYSTEM_DATABASE,
                    AccessMode::AutoCommit,
                    Statement::new("SHOW DATABASES YIELD name WHERE name = $name RETURN name")
                        .param("name", graph.as_str()),
                    "graph exists",
                )
                .await?;
            Ok(!records.is_empty())
        }
        GraphScope::Label {
            database, label, ..
        } => {
            let records = session
                .run_one(
                    database,
                    AccessMode::Read,
                    Statement::new(format!(
                        "MATCH (n:{}) WITH n LIMIT 1 RETURN count(n) > 0 AS exists",
                        escape(label)
                    )),
                    "graph exists",
                )
                .await?;
            Ok(records
                .first()
                .and_then(|r| r.get_bool("exists"))
                .unwrap_or(false))
        }
    }
}

/// Fail with `GraphNotFound` unless the graph exists
pub(crate) async fn ensure_graph_exists(session: &Session, scope: &GraphScope) -> Result<()> {
    if graph_exists_in(session, scope).await? {
        Ok(())
    } else {
        Err(StoreError::GraphNotFound(scope.graph().to_string()))
    }
}

/// Make a graph ready for writes: label-mode graphs are created on demand,
/// databases must already exist.
pub(crate) async fn ensure_writable(session: &Session, scope: &GraphScope) -> Result<()> {
    if graph_exists_in(session, scope).await? {
        return Ok(());
    }
    match scope {
        GraphScope::Database { graph } => Err(StoreError::GraphNotFound(graph.clone())),
        GraphScope::Label { .. } => create_graph_in(session, scope).await,
    }
}

/// Poll a new database until it answers, surfacing the last error on timeout
pub(crate) async fn wait_until_available(session: &Session, database: &str) -> Result<()> {
    let deadline = Instant::now() + session.policy.availability_timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let err = match session
            .backend
            .run_transaction(
                database,
                AccessMode::Read,
                vec![Statement::new(AVAILABILITY_PROBE)],
            )
            .await
        {
            Ok(_) => {
                tracing::debug!("Database '{}' available after {} attempt(s)", database, attempts);
                return Ok(());
            }
            Err(err) => err,
        };

        let delay = if classify::is_unavailable(&err) {
            UNAVAILABLE_RETRY
        } else {
            OTHER_RETRY
        };
        if Instant::now() + delay > deadline {
            tracing::warn!(
                "Database '{}' not available after {} attempt(s): {}",
                database,
                attempts,
                err
            );
            return Err(classify::to_store_error(
                &format!("wait for database '{database}'"),
                err,
            ));
        }
        sleep(delay).await;
    }
}

fn namespace_constraint(label: &str) -> String {
    format!("{label}_namespace")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Record;
    use crate::testing::{connected_store, ScriptedBackend};
    use std::sync::Arc;
    use trellis_core::{ErrorKind, StorageMode};

    #[tokio::test]
    async fn test_create_database_waits_for_availability() {
        let backend = Arc::new(
            ScriptedBackend::new().fail_times(AVAILABILITY_PROBE, "database is unavailable", 2),
        );
        let store = connected_store(backend.clone(), true).await;
        backend.clear_log();

        store.create_graph("A").await.unwrap();

        let executed = backend.executed();
        assert_eq!(executed[0].database, "system");
        assert_eq!(executed[0].text, "CREATE DATABASE `A`");
        assert_eq!(backend.matching(AVAILABILITY_PROBE).len(), 3);
        assert!(store.critical.is_free());
    }

    #[tokio::test]
    async fn test_availability_timeout_surfaces_last_error() {
        let backend = Arc::new(
            ScriptedBackend::new().fail(AVAILABILITY_PROBE, "Unable to get a routing table for database 'A'"),
        );
        let store = connected_store(backend.clone(), true).await;

        let err = store.create_graph("A").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("routing table"));
        assert!(store.critical.is_free());
    }

    #[tokio::test]
    async fn test_create_existing_database() {
        let backend = Arc::new(
            ScriptedBackend::new().fail("CREATE DATABASE", "Database `A` already exists."),
        );
        let store = connected_store(backend, true).await;
        let err = store.create_graph("A").await.unwrap_err();
        assert!(matches!(err, StoreError::GraphAlreadyExists(ref g) if g == "A"));
    }

    #[tokio::test]
    async fn test_drop_database() {
        let backend = Arc::new(
            ScriptedBackend::new().fail("DROP DATABASE `B`", "Database 'B' does not exist."),
        );
        let store = connected_store(backend.clone(), true).await;

        store.drop_graph("A").await.unwrap();
        assert_eq!(backend.matching("DROP DATABASE `A`")[0].database, "system");

        let err = store.drop_graph("B").await.unwrap_err();
        assert!(matches!(err, StoreError::GraphNotFound(_)));

        let err = store.drop_graph("neo4j").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn test_graph_calls_honor_timeout() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .stall("CREATE DATABASE", Duration::from_secs(5))
                .stall("DROP DATABASE", Duration::from_secs(5)),
        );
        let store = connected_store(backend, true).await;

        let err = store
            .create_graph(GraphOptions::new("A").with_timeout(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Timeout { ref operation, seconds: 1 } if operation == "create graph"
        ));
        assert!(store.critical.is_free());

        let err = store
            .drop_graph(GraphOptions::new("A").with_timeout(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Timeout { ref operation, seconds: 1 } if operation == "drop graph"
        ));
        assert!(store.critical.is_free());
    }

    #[tokio::test]
    async fn test_label_mode_create_is_best_effort() {
        let backend = Arc::new(
            ScriptedBackend::new().fail("CREATE CONSTRAINT", "Neo.ClientError.Security.Forbidden"),
        );
        let store = connected_store(backend.clone(), false).await;

        store.create_graph("A").await.unwrap();
        let constraint = &backend.matching("CREATE CONSTRAINT")[0];
        assert_eq!(constraint.database, "neo4j");
        assert!(constraint
            .text
            .contains("FOR (n:`__Graph_A`) REQUIRE n.`__graph_namespace` IS UNIQUE"));
    }

    #[tokio::test]
    async fn test_label_mode_drop_deletes_relationships_then_nodes() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .on_once("DELETE r", vec![Record::from_pairs([("deleted", 3i64)])])
                .on_once("DETACH DELETE n", vec![Record::from_pairs([("deleted", 2i64)])]),
        );
        let store = connected_store(backend.clone(), false).await;
        backend.clear_log();

        store.drop_graph("A").await.unwrap();
        store.drop_graph("A").await.unwrap();

        let texts = backend.texts();
        assert!(texts[0].contains("DELETE r"));
        assert!(texts[1].contains("DETACH DELETE n"));
        assert!(texts[2].starts_with("DROP CONSTRAINT"));
    }

    #[tokio::test]
    async fn test_graph_exists_per_mode() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .on("WHERE name = $name", vec![Record::from_pairs([("name", "A")])])
                .on("LIMIT 1 RETURN count(n) > 0", vec![Record::from_pairs([("exists", true)])]),
        );
        let db_store = connected_store(backend.clone(), true).await;
        assert!(db_store.graph_exists("A").await.unwrap());

        let label_store = connected_store(backend.clone(), false).await;
        assert!(label_store.graph_exists("A").await.unwrap());
        let existence = backend.matching("LIMIT 1 RETURN count(n) > 0");
        assert!(existence[0].text.starts_with("MATCH (n:`__Graph_A`)"));
    }

    #[tokio::test]
    async fn test_list_graphs() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .on(
                    "SHOW DATABASES YIELD name RETURN name",
                    vec![
                        Record::from_pairs([("name", "neo4j")]),
                        Record::from_pairs([("name", "A")]),
                        Record::from_pairs([("name", "A")]),
                    ],
                )
                .on(
                    "CALL db.labels()",
                    vec![
                        Record::from_pairs([("label", "__Graph_A")]),
                        Record::from_pairs([("label", "__Graph_B")]),
                    ],
                ),
        );
        let db_store = connected_store(backend.clone(), true).await;
        assert_eq!(db_store.list_graphs().await.unwrap(), vec!["neo4j", "A"]);

        let label_store = connected_store(backend, false).await;
        assert_eq!(label_store.list_graphs().await.unwrap(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_describe_label_graph() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .on("RETURN count(n) AS count", vec![Record::from_pairs([("count", 4i64)])])
                .on("RETURN count(r) AS count", vec![Record::from_pairs([("count", 1i64)])]),
        );
        let store = connected_store(backend, false).await;
        let info = store.describe_graph("A").await.unwrap();
        assert_eq!(info.node_count, 4);
        assert_eq!(info.relationship_count, 1);
        assert_eq!(info.storage_mode, StorageMode::LabelBased);
        assert_eq!(info.database, "neo4j");
        assert_eq!(info.graph_label.as_deref(), Some("__Graph_A"));
    }

    #[tokio::test]
    async fn test_describe_missing_database() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = connected_store(backend, true).await;
        let err = store.describe_graph("A").await.unwrap_err();
        assert!(matches!(err, StoreError::GraphNotFound(_)));
    }
}
