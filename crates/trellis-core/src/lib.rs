//! Trellis Core - Domain model for GraphRAG graph storage
//!
//! This crate defines what every storage backend shares:
//! - Entity, relationship, path and community records
//! - The property value gate and record value type
//! - Option and result records for each store operation
//! - The backup envelope
//! - Error types and configuration
//! - The `GraphStore` trait

pub mod backup;
pub mod config;
pub mod error;
pub mod extraction;
pub mod model;
pub mod options;
pub mod query;
pub mod schema;
pub mod store;
pub mod value;

pub use backup::{BackupEnvelope, BackupSummary, RestoreSummary};
pub use config::{ConfigError, Credentials, DriverConfig, StoreConfig};
pub use error::{ErrorKind, Result, StoreError};
pub use extraction::{ExtractionResult, SaveResponse};
pub use model::{
    is_valid_graph_name, Community, DeleteSummary, GraphInfo, GraphPath, Node, Relationship,
    StorageMode,
};
pub use options::*;
pub use query::{QueryResult, QuerySummary};
pub use schema::GraphSchema;
pub use store::GraphStore;
pub use value::{coerce, Coerced, PropertyValue, Value};
