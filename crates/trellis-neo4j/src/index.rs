//! Index management

use trellis_core::{
    CreateIndexOptions, DropIndexOptions, IndexTarget, IndexType, Result, StoreError,
};

use crate::adapter::{with_timeout, Neo4jStore};
use crate::classify;
use crate::cypher::{escape, literal};
use crate::driver::{AccessMode, DriverError, Statement};
use crate::mode::GraphScope;

const DEFAULT_VECTOR_DIMENSION: u64 = 1536;
const DEFAULT_VECTOR_SIMILARITY: &str = "cosine";

impl Neo4jStore {
    pub async fn create_index(&self, opts: CreateIndexOptions) -> Result<()> {
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;
        let (name, statement) = index_statement(&scope, &opts)?;

        let _permit = self.critical.enter("create index").await?;
        with_timeout("create index", opts.timeout_secs, async {
            match session
                .backend
                .run_transaction(scope.database(), AccessMode::AutoCommit, vec![statement])
                .await
            {
                Ok(_) => {
                    tracing::info!("Created index '{}' on graph '{}'", name, opts.graph_name);
                    Ok(())
                }
                Err(err) if classify::is_already_exists(&err) => {
                    if opts.if_not_exists {
                        tracing::debug!("Index '{}' already exists", name);
                        Ok(())
                    } else {
                        Err(StoreError::IndexAlreadyExists(name.clone()))
                    }
                }
                Err(err) => Err(admin_error(&scope, "create index", err)),
            }
        })
        .await
    }

    pub async fn drop_index(&self, opts: DropIndexOptions) -> Result<()> {
        let session = self.session().await?;
        let scope = session.scope(&opts.graph_name)?;
        if opts.name.trim().is_empty() {
            return Err(StoreError::Precondition(
                "drop index requires an index name".to_string(),
            ));
        }

        let mut text = format!("DROP INDEX {}", escape(&opts.name));
        if opts.if_exists {
            text.push_str(" IF EXISTS");
        }

        let _permit = self.critical.enter("drop index").await?;
        with_timeout("drop index", opts.timeout_secs, async {
            match session
                .backend
                .run_transaction(
                    scope.database(),
                    AccessMode::AutoCommit,
                    vec![Statement::new(text)],
                )
                .await
            {
                Ok(_) => {
                    tracing::info!("Dropped index '{}' on graph '{}'", opts.name, opts.graph_name);
                    Ok(())
                }
                Err(err) if classify::is_missing(&err) && opts.if_exists => Ok(()),
                Err(err) if classify::is_missing(&err) && !classify::is_database_missing(&err) => {
                    Err(StoreError::NotFound(format!("index '{}'", opts.name)))
                }
                Err(err) => Err(admin_error(&scope, "drop index", err)),
            }
        })
        .await
    }
}

fn admin_error(scope: &GraphScope, context: &str, err: DriverError) -> StoreError {
    if scope.needs_availability_wait() && classify::is_database_missing(&err) {
        StoreError::GraphNotFound(scope.graph().to_string())
    } else {
        classify::to_store_error(context, err)
    }
}

/// `idx_<graph>_<node|rel>_<label>_<props>_<type>`, restricted to `[A-Za-z0-9_]`
pub fn default_index_name(
    graph: &str,
    target: IndexTarget,
    label: &str,
    properties: &[String],
    index_type: IndexType,
) -> String {
    let target = match target {
        IndexTarget::Node => "node",
        IndexTarget::Relationship => "rel",
    };
    format!(
        "idx_{graph}_{target}_{label}_{}_{}",
        properties.join("_"),
        index_type.as_lower()
    )
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
    .collect()
}

/// Compile the CREATE statement, returning the index name with it
pub fn index_statement(scope: &GraphScope, opts: &CreateIndexOptions) -> Result<(String, Statement)> {
    if opts.properties.is_empty() || opts.properties.iter().any(|p| p.is_empty()) {
        return Err(StoreError::Precondition(
            "create index requires at least one property".to_string(),
        ));
    }
    if opts.index_type == IndexType::Vector && opts.properties.len() != 1 {
        return Err(StoreError::Precondition(
            "vector indexes take exactly one property".to_string(),
        ));
    }

    let caller_label = opts.labels.first().filter(|l| !l.is_empty());
    let (pattern, var) = match opts.target {
        IndexTarget::Node => {
            let anchor = match (scope.graph_label(), caller_label) {
                (Some(graph_label), _) => graph_label.to_string(),
                (None, Some(label)) => label.clone(),
                (None, None) => {
                    return Err(StoreError::Precondition(
                        "node index requires a label".to_string(),
                    ))
                }
            };
            (format!("(n:{})", escape(&anchor)), "n")
        }
        IndexTarget::Relationship => {
            let Some(rel_type) = caller_label else {
                return Err(StoreError::Precondition(
                    "relationship index requires a type".to_string(),
                ));
            };
            (
                format!("()-[r:{}]-()", escape(scope.relationship_type(rel_type))),
                "r",
            )
        }
    };

    let name = opts.name.clone().filter(|n| !n.is_empty()).unwrap_or_else(|| {
        let label = caller_label
            .map(String::as_str)
            .or(scope.graph_label())
            .unwrap_or("all");
        default_index_name(
            scope.graph(),
            opts.target,
            label,
            &opts.properties,
            opts.index_type,
        )
    });
    let if_not_exists = if opts.if_not_exists { " IF NOT EXISTS" } else { "" };
    let columns: Vec<String> = opts
        .properties
        .iter()
        .map(|p| format!("{var}.{}", escape(p)))
        .collect();

    let text = match opts.index_type {
        IndexType::Btree => format!(
            "CREATE INDEX {}{if_not_exists} FOR {pattern} ON ({})",
            escape(&name),
            columns.join(", ")
        ),
        IndexType::Fulltext => format!(
            "CREATE FULLTEXT INDEX {}{if_not_exists} FOR {pattern} ON EACH [{}]",
            escape(&name),
            columns.join(", ")
        ),
        IndexType::Vector => {
            let dimension = opts
                .config
                .get("dimension")
                .and_then(|v| v.as_u64())
                .unwrap_or(DEFAULT_VECTOR_DIMENSION);
            let similarity = opts
                .config
                .get("similarity")
                .and_then(|v| v.as_str())
                .unwrap_or(DEFAULT_VECTOR_SIMILARITY);
            format!(
                "CREATE VECTOR INDEX {}{if_not_exists} FOR {pattern} ON ({}) \
                 OPTIONS {{indexConfig: {{`vector.dimensions`: {dimension}, \
                 `vector.similarity_function`: {}}}}}",
                escape(&name),
                columns.join(", "),
                literal(&serde_json::Value::from(similarity))
            )
        }
    };
    Ok((name, Statement::new(text)))
}
