//! End-to-end pipeline tests against the in-memory store.

use async_trait::async_trait;
use cosmos_reprovision::store::Operation;
use cosmos_reprovision::{
    Config, ContainerCopier, CopyOutcome, Document, MemoryStore, Orchestrator, ReprovisionError,
    Result, RunStatus, TransferEngine,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DATABASE: &str = "Microservices";

fn config(extra: &str) -> Config {
    let yaml = format!(
        r#"
store:
  endpoint: https://acct.documents.azure.com:443/
  key: c2VjcmV0LWtleQ==
migration:
  database: {}
  temp_throughput: 10000
  throughput_per_container: 100
{}"#,
        DATABASE, extra
    );
    Config::from_yaml(&yaml).unwrap()
}

fn documents(container: &str, count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| {
            let value = json!({
                "id": format!("{}-doc-{}", container, i),
                "customer": {"name": format!("customer {}", i), "tier": i % 3},
                "lines": [{"sku": "A-1", "qty": i}, {"sku": "B-2", "qty": null}],
                "active": i % 2 == 0
            });
            match value {
                serde_json::Value::Object(map) => map,
                _ => unreachable!(),
            }
        })
        .collect()
}

/// Seed the source database with `containers` containers keyed on `/id`.
fn seeded_store(containers: usize, docs_per_container: usize, page_size: usize) -> Arc<MemoryStore> {
    let store = MemoryStore::new().with_page_size(page_size);
    store.insert_database(DATABASE, 4000);
    for i in 0..containers {
        let name = format!("container-{}", i);
        store.insert_container(DATABASE, &name, "/id");
        store.insert_documents(DATABASE, &name, documents(&name, docs_per_container));
    }
    Arc::new(store)
}

/// Counts copy invocations on top of the real engine.
struct CountingCopier {
    engine: TransferEngine,
    copies: AtomicUsize,
}

#[async_trait]
impl ContainerCopier for CountingCopier {
    async fn copy(
        &self,
        source_database: &str,
        destination_database: &str,
        source_container: &str,
        destination_container: &str,
    ) -> Result<CopyOutcome> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        self.engine
            .copy(
                source_database,
                destination_database,
                source_container,
                destination_container,
            )
            .await
    }
}

fn orchestrator(store: &Arc<MemoryStore>, config: Config) -> (Orchestrator, Arc<CountingCopier>) {
    let copier = Arc::new(CountingCopier {
        engine: TransferEngine::new(store.clone(), config.transfer_config()),
        copies: AtomicUsize::new(0),
    });
    let orch = Orchestrator::new(config, store.clone(), copier.clone());
    (orch, copier)
}

fn sorted_by_id(mut docs: Vec<Document>) -> Vec<Document> {
    docs.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
    docs
}

// =============================================================================
// Call accounting
// =============================================================================

#[tokio::test]
async fn test_ten_containers_call_counts() {
    let store = seeded_store(10, 3, 100);
    let (orch, copier) = orchestrator(&store, config(""));

    orch.run().await.unwrap();

    let calls = store.calls();
    assert_eq!(calls.create_database, 2);
    assert_eq!(calls.create_container, 20);
    assert_eq!(calls.delete_database, 2);
    assert_eq!(calls.list_containers, 2);
    assert_eq!(calls.replace_throughput, 1);
    assert_eq!(copier.copies.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn test_operation_order() {
    let store = seeded_store(2, 1, 100);
    let (orch, _) = orchestrator(&store, config(""));

    let result = orch.run().await.unwrap();
    let temp = result.temp_database.clone();

    let ops = store.operations();
    let expected = vec![
        Operation::CreateDatabase {
            id: temp.clone(),
            throughput: 10000,
        },
        Operation::ListContainers {
            database: DATABASE.into(),
        },
        Operation::CreateContainer {
            database: temp.clone(),
            container: "container-0".into(),
        },
        Operation::CreateContainer {
            database: temp.clone(),
            container: "container-1".into(),
        },
        Operation::DeleteDatabase {
            id: DATABASE.into(),
        },
        Operation::CreateDatabase {
            id: DATABASE.into(),
            throughput: 10000,
        },
        Operation::ListContainers {
            database: temp.clone(),
        },
        Operation::CreateContainer {
            database: DATABASE.into(),
            container: "container-0".into(),
        },
        Operation::CreateContainer {
            database: DATABASE.into(),
            container: "container-1".into(),
        },
        Operation::DeleteDatabase { id: temp },
        Operation::ReplaceThroughput {
            database: DATABASE.into(),
            throughput: 500,
        },
    ];
    assert_eq!(ops, expected);
}

// =============================================================================
// Data and throughput
// =============================================================================

#[tokio::test]
async fn test_documents_survive_round_trip_without_system_properties() {
    let store = seeded_store(3, 25, 7);
    let (orch, _) = orchestrator(&store, config(""));

    let result = orch.run().await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.documents_submitted, 150);
    assert_eq!(result.documents_failed, 0);
    assert!(result.ensure_no_document_loss().is_ok());

    for i in 0..3 {
        let name = format!("container-{}", i);
        let copied = store.documents(DATABASE, &name).unwrap();
        assert_eq!(sorted_by_id(copied), sorted_by_id(documents(&name, 25)));
    }
}

#[tokio::test]
async fn test_final_throughput_and_temp_cleanup() {
    let store = seeded_store(10, 1, 100);
    let (orch, _) = orchestrator(&store, config(""));

    let result = orch.run().await.unwrap();

    assert_eq!(result.final_throughput, Some(1000));
    assert_eq!(store.database_throughput(DATABASE), Some(1000));
    assert_eq!(store.database_ids(), vec![DATABASE.to_string()]);
    assert_eq!(store.container_ids(DATABASE).len(), 10);
}

#[tokio::test]
async fn test_single_container_gets_minimum_throughput() {
    let store = seeded_store(1, 1, 100);
    let (orch, _) = orchestrator(&store, config(""));

    let result = orch.run().await.unwrap();
    assert_eq!(result.final_throughput, Some(500));
    assert_eq!(store.database_throughput(DATABASE), Some(500));
}

#[tokio::test]
async fn test_empty_container_is_recreated() {
    let store = seeded_store(1, 4, 100);
    store.insert_container(DATABASE, "empty", "/tenant");
    let (orch, _) = orchestrator(&store, config(""));

    let result = orch.run().await.unwrap();

    assert_eq!(result.documents_submitted, 8);
    assert_eq!(store.documents(DATABASE, "empty"), Some(Vec::new()));
    assert!(result
        .containers
        .iter()
        .any(|c| c.id == "empty" && c.partition_key_path == "/tenant"));
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_failed_write_is_reported_not_fatal() {
    let store = seeded_store(4, 5, 2);
    store.fail_writes_for("container-2-doc-3");
    let (orch, _) = orchestrator(&store, config(""));

    let result = orch.run().await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.source_to_temp.documents_failed, 1);
    assert_eq!(result.temp_to_final.documents_submitted, 19);
    assert_eq!(result.documents_failed, 1);
    assert_eq!(
        result.failed_documents[0].document_id.as_deref(),
        Some("container-2-doc-3")
    );
    assert_eq!(result.failed_documents[0].status, Some(429));
    assert_eq!(store.documents(DATABASE, "container-2").unwrap().len(), 4);

    let err = result.ensure_no_document_loss().unwrap_err();
    assert_eq!(err.exit_code(), 5);
}

#[tokio::test]
async fn test_read_failure_stops_before_delete() {
    let store = seeded_store(3, 2, 100);
    store.fail_reads_for(DATABASE, "container-1");
    let (orch, _) = orchestrator(&store, config(""));

    let err = orch.run().await.unwrap_err();

    assert!(matches!(err, ReprovisionError::Pagination { .. }));
    assert_eq!(store.calls().delete_database, 0);
    assert!(store.database_ids().contains(&DATABASE.to_string()));
    assert_eq!(store.documents(DATABASE, "container-0").unwrap().len(), 2);
}

#[tokio::test]
async fn test_resume_after_failure_completes_run() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let store = seeded_store(2, 3, 100);
    store.fail_writes_for("container-0-doc-0");
    store.fail_reads_for(DATABASE, "container-1");
    let (orch, _) = orchestrator(&store, config(""));
    assert!(orch
        .with_state_file(state_path.clone())
        .run()
        .await
        .is_err());

    store.clear_failures();
    let (orch, _) = orchestrator(&store, config(""));
    let result = orch
        .with_state_file(state_path)
        .resume()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.final_throughput, Some(500));
    assert_eq!(store.calls().create_database, 2);
    for name in ["container-0", "container-1"] {
        assert_eq!(store.documents(DATABASE, name).unwrap().len(), 3);
    }
}

#[tokio::test]
async fn test_resumed_copy_pass_reports_no_loss_when_all_documents_arrive() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let store = seeded_store(2, 3, 100);
    store.fail_writes_for("container-0-doc-0");
    store.fail_reads_for(DATABASE, "container-1");
    let (orch, _) = orchestrator(&store, config(""));
    assert!(orch
        .with_state_file(state_path.clone())
        .run()
        .await
        .is_err());

    // The interrupted attempt recorded the throttled write
    let saved = cosmos_reprovision::MigrationState::load(&state_path).unwrap();
    assert_eq!(saved.failed_documents.len(), 1);
    assert_eq!(saved.failed_documents[0].status, Some(429));

    store.clear_failures();
    let (orch, _) = orchestrator(&store, config(""));
    let result = orch
        .with_state_file(state_path)
        .resume()
        .unwrap()
        .run()
        .await
        .unwrap();

    // container-0-doc-1 and doc-2 were already in the temp database
    assert_eq!(result.source_to_temp.documents_submitted, 6);
    assert_eq!(result.source_to_temp.documents_succeeded, 6);
    assert_eq!(result.temp_to_final.documents_succeeded, 6);
    assert_eq!(result.documents_failed, 0);
    assert!(result.failed_documents.is_empty());
    assert!(result.ensure_no_document_loss().is_ok());
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_configured_write_cap_is_honoured() {
    let store = MemoryStore::new()
        .with_page_size(50)
        .with_write_delay(Duration::from_millis(5));
    store.insert_database(DATABASE, 4000);
    store.insert_container(DATABASE, "orders", "/id");
    store.insert_documents(DATABASE, "orders", documents("orders", 120));
    let store = Arc::new(store);

    let (orch, _) = orchestrator(&store, config("  max_concurrent_writes: 4\n"));
    let result = orch.run().await.unwrap();

    assert_eq!(result.documents_submitted, 240);
    assert_eq!(store.max_in_flight_writes(), 4);
}
