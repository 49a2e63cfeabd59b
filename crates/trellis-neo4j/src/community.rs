//! Community detection
//!
//! [`DegreeBucketDetector`] groups entities by degree. It answers for every
//! algorithm name until a server-side detector is installed with
//! [`Neo4jStore::with_community_detector`].

use async_trait::async_trait;
use trellis_core::{Community, CommunityOptions, Result};

use crate::adapter::{with_timeout, Neo4jStore, Session};
use crate::driver::{AccessMode, Record, Statement};
use crate::mode::GraphScope;

/// Finds communities in one graph
#[async_trait]
pub trait CommunityDetector: Send + Sync {
    async fn detect(
        &self,
        session: &Session,
        scope: &GraphScope,
        opts: &CommunityOptions,
    ) -> Result<Vec<Community>>;
}

/// Degree ranges of the buckets, upper bound inclusive
const BUCKETS: &[(i64, &str)] = &[
    (0, "isolated"),
    (2, "peripheral"),
    (5, "connected"),
    (10, "well connected"),
    (i64::MAX, "hub"),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct DegreeBucketDetector;

impl DegreeBucketDetector {
    fn statement(scope: &GraphScope) -> Statement {
        Statement::new(format!(
            "MATCH {} OPTIONAL MATCH (n)-[r]-{} WITH n, count(r) AS degree \
             WITH n, CASE WHEN degree = 0 THEN 0 WHEN degree <= 2 THEN 1 \
             WHEN degree <= 5 THEN 2 WHEN degree <= 10 THEN 3 ELSE 4 END AS bucket \
             RETURN bucket, collect(coalesce(n.id, elementId(n))) AS members ORDER BY bucket",
            scope.node_pattern("n"),
            scope.node_pattern("m")
        ))
    }

    fn community(record: &Record, algorithm: &str) -> Option<Community> {
        let bucket = record.get_i64("bucket")?;
        let members = record.get_strings("members");
        if members.is_empty() {
            return None;
        }
        let (upper, name) = BUCKETS
            .get(bucket.clamp(0, BUCKETS.len() as i64 - 1) as usize)
            .copied()
            .unwrap_or((i64::MAX, "hub"));
        let range = match bucket {
            0 => "no relationships".to_string(),
            4 => "more than 10 relationships".to_string(),
            _ => format!("at most {upper} relationships"),
        };

        Some(Community {
            id: format!("{algorithm}_{bucket}"),
            level: 0,
            size: members.len(),
            title: format!("{} entities", capitalize(name)),
            summary: format!("{} entities with {}", members.len(), range),
            members,
            algorithm: algorithm.to_string(),
        })
    }
}

#[async_trait]
impl CommunityDetector for DegreeBucketDetector {
    async fn detect(
        &self,
        session: &Session,
        scope: &GraphScope,
        opts: &CommunityOptions,
    ) -> Result<Vec<Community>> {
        if !opts.parameters.is_empty() {
            tracing::debug!(
                "Degree buckets ignore {} parameter(s) for {}",
                opts.parameters.len(),
                opts.algorithm
            );
        }
        let algorithm = opts.algorithm.to_string();
        let records = session
            .run_one(
                scope.database(),
                AccessMode::Read,
                Self::statement(scope),
                "detect communities",
            )
            .await?;
        Ok(records
            .iter()
            .filter_map(|r| Self::community(r, &algorithm))
            .collect())
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl Neo4jStore {
    pub async fn communities(&self, opts: CommunityOptions) -> Result<Vec<Community>> {
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;
        let communities = with_timeout(
            "community detection",
            opts.timeout_secs,
            self.detector.detect(&session, &scope, &opts),
        )
        .await?;
        tracing::info!(
            "Found {} communities in graph '{}' ({})",
            communities.len(),
            opts.graph_name,
            opts.algorithm
        );
        Ok(communities)
    }
}
