//! Trellis Neo4j - GraphRAG storage on Neo4j
//!
//! Logical graphs live either in their own database (Enterprise
//! multi-database) or as labeled partitions of the default database.
//! The mode is chosen once per connection; every operation resolves a
//! [`GraphScope`] and lets it decide databases, labels and relationship
//! types.

pub mod adapter;
pub mod backup;
pub mod bolt;
pub mod classify;
pub mod community;
pub mod critical;
pub mod cypher;
pub mod driver;
pub mod extraction;
pub mod graphs;
pub mod index;
pub mod mode;
pub mod nodes;
pub mod query;
pub mod relationships;
pub mod restore;
pub mod schema;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use adapter::{Neo4jStore, Session};
pub use bolt::BoltBackend;
pub use community::{CommunityDetector, DegreeBucketDetector};
pub use driver::{AccessMode, CypherBackend, DriverError, Record, Statement};
pub use index::default_index_name;
pub use mode::{GraphScope, ModePolicy};
pub use query::CompiledQuery;
