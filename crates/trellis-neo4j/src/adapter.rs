//! Neo4j graph store
//!
//! Holds the driver handle and mode flags behind a reader/writer lock.
//! Every call snapshots them into a [`Session`] and releases the lock
//! before talking to the server.
//!
//! Author: hephaex@gmail.com

use async_trait::async_trait;
use std::future::Future;
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::sync::RwLock;
use trellis_core::options::timeout_from_secs;
use trellis_core::{
    is_valid_graph_name, AddNodesOptions, AddRelationshipsOptions, BackupOptions, BackupSummary,
    Community, CommunityOptions, CreateIndexOptions, DeleteNodesOptions,
    DeleteRelationshipsOptions, DeleteSummary, DropIndexOptions, ExtractionResult,
    GetNodesOptions, GetRelationshipsOptions, GraphInfo, GraphOptions, GraphSchema, GraphStore,
    Node, QueryOptions, QueryResult, Relationship, RestoreOptions, RestoreSummary, Result,
    SaveResponse, StorageMode, StoreConfig, StoreError,
};

use crate::bolt::BoltBackend;
use crate::classify;
use crate::community::{CommunityDetector, DegreeBucketDetector};
use crate::critical::CriticalSection;
use crate::driver::{AccessMode, CypherBackend, Record, Statement};
use crate::mode::{GraphScope, ModePolicy, SYSTEM_DATABASE};

/// Statement run by the edition probe; refused by Community servers
const EDITION_PROBE: &str = "SHOW DATABASES YIELD name LIMIT 1";

#[derive(Default)]
struct AdapterState {
    backend: Option<Arc<dyn CypherBackend>>,
    config: Option<StoreConfig>,
    policy: Option<ModePolicy>,
    is_enterprise: bool,
}

impl AdapterState {
    fn connected(&self) -> bool {
        self.backend.is_some()
    }
}

/// Per-call snapshot of the connection
#[derive(Clone)]
pub struct Session {
    pub(crate) backend: Arc<dyn CypherBackend>,
    pub(crate) policy: ModePolicy,
}

impl Session {
    /// Validate a graph name and resolve its scope
    pub fn scope(&self, graph: &str) -> Result<GraphScope> {
        validate_graph_name(graph)?;
        Ok(self.policy.scope(graph))
    }

    /// Run statements in one transaction
    pub async fn run(
        &self,
        database: &str,
        mode: AccessMode,
        statements: Vec<Statement>,
        context: &str,
    ) -> Result<Vec<Vec<Record>>> {
        if let Some(first) = statements.first() {
            tracing::debug!(
                "[{}] {:?} x{} on '{}': {}",
                context,
                mode,
                statements.len(),
                database,
                first.text
            );
        }

        self.backend
            .run_transaction(database, mode, statements)
            .await
            .map_err(|err| {
                if database != SYSTEM_DATABASE
                    && database != self.policy.default_database
                    && classify::is_database_missing(&err)
                {
                    StoreError::GraphNotFound(database.to_string())
                } else {
                    classify::to_store_error(context, err)
                }
            })
    }

    /// Run a single statement, returning its records
    pub async fn run_one(
        &self,
        database: &str,
        mode: AccessMode,
        statement: Statement,
        context: &str,
    ) -> Result<Vec<Record>> {
        let mut results = self.run(database, mode, vec![statement], context).await?;
        Ok(if results.is_empty() {
            Vec::new()
        } else {
            results.swap_remove(0)
        })
    }

    /// First integer column of the first record, zero when absent
    pub async fn run_count(
        &self,
        database: &str,
        statement: Statement,
        column: &str,
        context: &str,
    ) -> Result<u64> {
        let records = self
            .run_one(database, AccessMode::Read, statement, context)
            .await?;
        Ok(records
            .first()
            .and_then(|r| r.get_i64(column))
            .map(|c| c.max(0) as u64)
            .unwrap_or(0))
    }
}

/// Graph store backed by a Neo4j server
pub struct Neo4jStore {
    state: RwLock<AdapterState>,
    pub(crate) critical: CriticalSection,
    pub(crate) detector: Arc<dyn CommunityDetector>,
}

impl Default for Neo4jStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Neo4jStore {
    /// Create a store in the disconnected state
    pub fn new() -> Self {
        Self {
            state: RwLock::new(AdapterState::default()),
            critical: CriticalSection::new(),
            detector: Arc::new(DegreeBucketDetector),
        }
    }

    /// Replace the community detector
    pub fn with_community_detector(mut self, detector: Arc<dyn CommunityDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Connect over Bolt
    pub async fn connect(&self, config: &StoreConfig) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }
        if !config.store_type.is_empty() && !config.store_type.eq_ignore_ascii_case("neo4j") {
            return Err(StoreError::Config(format!(
                "unsupported store type '{}', expected 'neo4j'",
                config.store_type
            )));
        }

        let credentials = config.credentials()?;
        let backend = BoltBackend::connect(&credentials, &config.driver_config)
            .await
            .map_err(|e| StoreError::Config(format!("failed to create driver: {e}")))?;

        self.install(Arc::new(backend), config).await
    }

    /// Connect through an existing backend
    pub async fn connect_with_backend(
        &self,
        backend: Arc<dyn CypherBackend>,
        config: &StoreConfig,
    ) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }
        self.install(backend, config).await
    }

    async fn install(&self, backend: Arc<dyn CypherBackend>, config: &StoreConfig) -> Result<()> {
        let default_database = config.driver_config.default_database().to_string();

        if let Err(err) = backend
            .run_transaction(
                &default_database,
                AccessMode::Read,
                vec![Statement::new("RETURN 1")],
            )
            .await
        {
            close_quietly(backend.as_ref()).await;
            return Err(classify::to_store_error("verify connectivity", err));
        }

        let is_enterprise = match detect_enterprise(backend.as_ref()).await {
            Ok(flag) => flag,
            Err(err) => {
                close_quietly(backend.as_ref()).await;
                return Err(err);
            }
        };

        let separate = config.driver_config.use_separate_database;
        if separate && !is_enterprise {
            close_quietly(backend.as_ref()).await;
            return Err(StoreError::Config(
                "use_separate_database requires Neo4j Enterprise Edition (multi-database support)"
                    .to_string(),
            ));
        }

        let mut state = self.state.write().await;
        if state.connected() {
            // lost a race with a concurrent connect
            drop(state);
            close_quietly(backend.as_ref()).await;
            return Ok(());
        }

        let policy = ModePolicy::new(&config.driver_config, separate);
        tracing::info!(
            "Connected to Neo4j ({} edition, {} mode)",
            if is_enterprise { "enterprise" } else { "community" },
            policy.storage_mode()
        );
        *state = AdapterState {
            backend: Some(backend),
            config: Some(config.clone()),
            policy: Some(policy),
            is_enterprise,
        };
        Ok(())
    }

    /// Close the driver and clear all state
    pub async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let previous = std::mem::take(&mut *state);
        drop(state);

        if let Some(backend) = previous.backend {
            backend
                .close()
                .await
                .map_err(|e| classify::to_store_error("close driver", e))?;
            tracing::info!("Disconnected from Neo4j");
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connected()
    }

    pub async fn close(&self) -> Result<()> {
        self.disconnect().await
    }

    /// Whether the server reported Enterprise Edition at connect time
    pub async fn is_enterprise_edition(&self) -> bool {
        self.state.read().await.is_enterprise
    }

    pub async fn storage_mode(&self) -> Option<StorageMode> {
        self.state
            .read()
            .await
            .policy
            .as_ref()
            .map(ModePolicy::storage_mode)
    }

    /// Configuration the store was connected with
    pub async fn config(&self) -> Option<StoreConfig> {
        self.state.read().await.config.clone()
    }

    /// No-op read against the default database
    pub async fn ping(&self) -> Result<()> {
        let session = self.session().await?;
        let database = session.policy.default_database.clone();
        session
            .run(
                &database,
                AccessMode::Read,
                vec![Statement::new("RETURN 1")],
                "ping",
            )
            .await?;
        Ok(())
    }

    /// Snapshot the connection, failing when not connected
    pub(crate) async fn session(&self) -> Result<Session> {
        let state = self.state.read().await;
        match (&state.backend, &state.policy) {
            (Some(backend), Some(policy)) => Ok(Session {
                backend: Arc::clone(backend),
                policy: policy.clone(),
            }),
            _ => Err(StoreError::NotConnected),
        }
    }
}

async fn close_quietly(backend: &dyn CypherBackend) {
    if let Err(err) = backend.close().await {
        tracing::warn!("Failed to close driver: {}", err);
    }
}

async fn detect_enterprise(backend: &dyn CypherBackend) -> Result<bool> {
    match backend
        .run_transaction(
            SYSTEM_DATABASE,
            AccessMode::AutoCommit,
            vec![Statement::new(EDITION_PROBE)],
        )
        .await
    {
        Ok(_) => Ok(true),
        Err(err) if classify::is_not_supported(&err) => Ok(false),
        Err(err) => Err(classify::to_store_error("detect server edition", err)),
    }
}

pub(crate) fn validate_graph_name(graph: &str) -> Result<()> {
    if is_valid_graph_name(graph) {
        Ok(())
    } else {
        Err(StoreError::InvalidGraphName(graph.to_string()))
    }
}

/// Bound a future by a per-call timeout in seconds (0 = none)
pub(crate) async fn with_timeout<T, F>(operation: &str, seconds: u64, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout_from_secs(seconds) {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| StoreError::Timeout {
                operation: operation.to_string(),
                seconds,
            })?,
        None => fut.await,
    }
}

// ============================================================================
// GraphStore
// ============================================================================

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn connect(&self, config: &StoreConfig) -> Result<()> {
        Neo4jStore::connect(self, config).await
    }

    async fn disconnect(&self) -> Result<()> {
        Neo4jStore::disconnect(self).await
    }

    async fn is_connected(&self) -> bool {
        Neo4jStore::is_connected(self).await
    }

    async fn ping(&self) -> Result<()> {
        Neo4jStore::ping(self).await
    }

    async fn create_graph(&self, opts: GraphOptions) -> Result<()> {
        Neo4jStore::create_graph(self, opts).await
    }

    async fn drop_graph(&self, opts: GraphOptions) -> Result<()> {
        Neo4jStore::drop_graph(self, opts).await
    }

    async fn graph_exists(&self, graph_name: &str) -> Result<bool> {
        Neo4jStore::graph_exists(self, graph_name).await
    }

    async fn list_graphs(&self) -> Result<Vec<String>> {
        Neo4jStore::list_graphs(self).await
    }

    async fn describe_graph(&self, graph_name: &str) -> Result<GraphInfo> {
        Neo4jStore::describe_graph(self, graph_name).await
    }

    async fn add_nodes(&self, opts: AddNodesOptions) -> Result<Vec<String>> {
        Neo4jStore::add_nodes(self, opts).await
    }

    async fn get_nodes(&self, opts: GetNodesOptions) -> Result<Vec<Node>> {
        Neo4jStore::get_nodes(self, opts).await
    }

    async fn delete_nodes(&self, opts: DeleteNodesOptions) -> Result<DeleteSummary> {
        Neo4jStore::delete_nodes(self, opts).await
    }

    async fn add_relationships(&self, opts: AddRelationshipsOptions) -> Result<Vec<String>> {
        Neo4jStore::add_relationships(self, opts).await
    }

    async fn get_relationships(&self, opts: GetRelationshipsOptions) -> Result<Vec<Relationship>> {
        Neo4jStore::get_relationships(self, opts).await
    }

    async fn delete_relationships(
        &self,
        opts: DeleteRelationshipsOptions,
    ) -> Result<DeleteSummary> {
        Neo4jStore::delete_relationships(self, opts).await
    }

    async fn query(&self, opts: QueryOptions) -> Result<QueryResult> {
        Neo4jStore::query(self, opts).await
    }

    async fn communities(&self, opts: CommunityOptions) -> Result<Vec<Community>> {
        Neo4jStore::communities(self, opts).await
    }

    async fn get_schema(&self, opts: GraphOptions) -> Result<GraphSchema> {
        Neo4jStore::get_schema(self, opts).await
    }

    async fn create_index(&self, opts: CreateIndexOptions) -> Result<()> {
        Neo4jStore::create_index(self, opts).await
    }

    async fn drop_index(&self, opts: DropIndexOptions) -> Result<()> {
        Neo4jStore::drop_index(self, opts).await
    }

    async fn backup(
        &self,
        writer: &mut (dyn Write + Send),
        opts: BackupOptions,
    ) -> Result<BackupSummary> {
        Neo4jStore::backup(self, writer, opts).await
    }

    async fn restore(
        &self,
        reader: &mut (dyn Read + Send),
        opts: RestoreOptions,
    ) -> Result<RestoreSummary> {
        Neo4jStore::restore(self, reader, opts).await
    }

    async fn save_extraction_results(
        &self,
        graph_name: &str,
        results: Vec<ExtractionResult>,
    ) -> Result<SaveResponse> {
        Neo4jStore::save_extraction_results(self, graph_name, results).await
    }
}
