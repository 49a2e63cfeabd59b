//! The uniform GraphRAG storage interface

use async_trait::async_trait;
use std::io::{Read, Write};

use crate::backup::{BackupSummary, RestoreSummary};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::extraction::{ExtractionResult, SaveResponse};
use crate::model::{Community, DeleteSummary, GraphInfo, Node, Relationship};
use crate::options::{
    AddNodesOptions, AddRelationshipsOptions, BackupOptions, CommunityOptions,
    CreateIndexOptions, DeleteNodesOptions, DeleteRelationshipsOptions, DropIndexOptions,
    GetNodesOptions, GetRelationshipsOptions, GraphOptions, QueryOptions, RestoreOptions,
};
use crate::query::QueryResult;
use crate::schema::GraphSchema;

/// Graph storage backend
#[async_trait]
pub trait GraphStore: Send + Sync {
    // Lifecycle

    /// Connect using the given configuration; no-op when already connected
    async fn connect(&self, config: &StoreConfig) -> Result<()>;

    /// Release the driver; safe when not connected
    async fn disconnect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()> {
        self.disconnect().await
    }

    /// Cheap round trip to the server
    async fn ping(&self) -> Result<()>;

    // Graphs

    async fn create_graph(&self, opts: GraphOptions) -> Result<()>;

    async fn drop_graph(&self, opts: GraphOptions) -> Result<()>;

    async fn graph_exists(&self, graph_name: &str) -> Result<bool>;

    async fn list_graphs(&self) -> Result<Vec<String>>;

    async fn describe_graph(&self, graph_name: &str) -> Result<GraphInfo>;

    // Nodes and relationships

    /// Insert nodes, returning their ids in input order
    async fn add_nodes(&self, opts: AddNodesOptions) -> Result<Vec<String>>;

    async fn get_nodes(&self, opts: GetNodesOptions) -> Result<Vec<Node>>;

    async fn delete_nodes(&self, opts: DeleteNodesOptions) -> Result<DeleteSummary>;

    /// Insert relationships, returning their ids in input order
    async fn add_relationships(&self, opts: AddRelationshipsOptions) -> Result<Vec<String>>;

    async fn get_relationships(&self, opts: GetRelationshipsOptions) -> Result<Vec<Relationship>>;

    async fn delete_relationships(&self, opts: DeleteRelationshipsOptions)
        -> Result<DeleteSummary>;

    // Queries

    async fn query(&self, opts: QueryOptions) -> Result<QueryResult>;

    async fn communities(&self, opts: CommunityOptions) -> Result<Vec<Community>>;

    // Schema

    async fn get_schema(&self, opts: GraphOptions) -> Result<GraphSchema>;

    async fn create_index(&self, opts: CreateIndexOptions) -> Result<()>;

    async fn drop_index(&self, opts: DropIndexOptions) -> Result<()>;

    // Backup

    async fn backup(
        &self,
        writer: &mut (dyn Write + Send),
        opts: BackupOptions,
    ) -> Result<BackupSummary>;

    async fn restore(
        &self,
        reader: &mut (dyn Read + Send),
        opts: RestoreOptions,
    ) -> Result<RestoreSummary>;

    // Extraction

    /// Merge extraction candidates into the graph.
    ///
    /// Failures of single results are collected in the response rather
    /// than aborting the call.
    async fn save_extraction_results(
        &self,
        graph_name: &str,
        results: Vec<ExtractionResult>,
    ) -> Result<SaveResponse>;

    // Extension points

    async fn get_stats(&self, graph_name: &str) -> Result<serde_json::Value> {
        let _ = graph_name;
        Err(StoreError::Unsupported("graph statistics".to_string()))
    }

    async fn optimize(&self, graph_name: &str) -> Result<()> {
        let _ = graph_name;
        Err(StoreError::Unsupported("graph optimization".to_string()))
    }
}
