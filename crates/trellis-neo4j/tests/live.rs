//! Tests against a running Neo4j server.
//!
//! Run with `NEO4J_URL=bolt://localhost:7687 NEO4J_PASSWORD=... cargo test -- --ignored`.

use trellis_core::{
    AddNodesOptions, AddRelationshipsOptions, BackupFormat, BackupOptions, DeleteNodesOptions,
    ExtractionResult, GetNodesOptions, Node, QueryOptions, Relationship, RestoreOptions,
    StoreConfig, StoreError,
};
use trellis_neo4j::Neo4jStore;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn live_store() -> Option<Neo4jStore> {
    init_tracing();
    let config = StoreConfig::from_env().ok()?;
    if config.database_url.is_empty() {
        eprintln!("NEO4J_URL not set, skipping");
        return None;
    }
    let store = Neo4jStore::new();
    store.connect(&config).await.ok()?;
    Some(store)
}

fn graph_name(test: &str) -> String {
    format!("trellis_{}_{}", test, uuid::Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore]
async fn test_label_graph_lifecycle() {
    let Some(store) = live_store().await else {
        return;
    };
    let graph = graph_name("lifecycle");

    store.create_graph(&graph).await.unwrap();
    store
        .add_nodes(AddNodesOptions::new(
            &graph,
            vec![
                Node::new("n1", "Person").with_property("name", "Ada"),
                Node::new("n2", "Person").with_property("name", "Bob"),
            ],
        ))
        .await
        .unwrap();
    store
        .add_relationships(AddRelationshipsOptions::new(
            &graph,
            vec![Relationship::new("n1", "KNOWS", "n2")],
        ))
        .await
        .unwrap();

    assert!(store.graph_exists(&graph).await.unwrap());
    let info = store.describe_graph(&graph).await.unwrap();
    assert_eq!(info.node_count, 2);
    assert_eq!(info.relationship_count, 1);

    let nodes = store
        .get_nodes(GetNodesOptions::new(&graph).with_ids(["n1"]))
        .await
        .unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].labels, vec!["Person"]);

    let result = store
        .query(QueryOptions::cypher(&graph, "MATCH (n) RETURN count(n) AS total"))
        .await
        .unwrap();
    assert!(!result.records.is_empty());

    let err = store
        .delete_nodes(DeleteNodesOptions {
            graph_name: graph.clone(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UnsafeDelete(_)));

    store.drop_graph(&graph).await.unwrap();
    assert!(!store.graph_exists(&graph).await.unwrap());
    store.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_backup_restore_into_other_graph() {
    let Some(store) = live_store().await else {
        return;
    };
    let source = graph_name("source");
    let target = graph_name("target");

    store
        .save_extraction_results(
            &source,
            vec![ExtractionResult::new(
                vec![
                    Node::new("a", "City").with_property("name", "Paris"),
                    Node::new("b", "Country").with_property("name", "France"),
                ],
                vec![Relationship::new("a", "IN", "b")],
            )],
        )
        .await
        .unwrap();

    for format in [BackupFormat::Json, BackupFormat::Cypher] {
        let mut buffer = Vec::new();
        store
            .backup(
                &mut buffer,
                BackupOptions {
                    graph_name: source.clone(),
                    format,
                    compress: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut reader: &[u8] = &buffer;
        let summary = store
            .restore(
                &mut reader,
                RestoreOptions {
                    graph_name: target.clone(),
                    force: true,
                    create_graph: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(summary.source_graph.as_deref(), Some(source.as_str()));

        let info = store.describe_graph(&target).await.unwrap();
        assert_eq!(info.node_count, 2, "{format} restore");
        assert_eq!(info.relationship_count, 1, "{format} restore");
    }

    store.drop_graph(&source).await.unwrap();
    store.drop_graph(&target).await.unwrap();
    store.close().await.unwrap();
}
