//! Container-to-container document transfer.
//!
//! The engine walks the source container's read feed one page at a time,
//! strips the store-injected fields from each document, and fans the page
//! out as concurrent inserts into the destination container. The next page
//! is only requested once every write of the current page has finished.

use crate::document::{strip_system_properties, Document};
use crate::error::Result;
use crate::store::{pages, DocumentStore, WriteFailure};
use async_trait::async_trait;
use futures::future::join_all;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

/// Transfer engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferConfig {
    /// Cap on writes in flight within one page. `None` writes the whole page at once.
    pub max_concurrent_writes: Option<usize>,

    /// Requested documents per page. `None` lets the store decide.
    pub page_size: Option<usize>,
}

/// What happened while copying one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyOutcome {
    /// Source container as `database/container`.
    pub source: String,

    /// Destination container as `database/container`.
    pub destination: String,

    /// Pages read from the source feed.
    pub pages: usize,

    /// Documents submitted for writing.
    pub submitted: usize,

    /// Documents the destination accepted.
    pub succeeded: usize,

    /// Every write the destination rejected.
    pub failures: Vec<WriteFailure>,
}

impl CopyOutcome {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Count 409 rejections as documents already present in the destination.
    ///
    /// Only valid when re-running an interrupted copy into a container this
    /// run created. Returns how many failures were reclassified.
    pub fn accept_conflicts(&mut self) -> usize {
        let before = self.failures.len();
        self.failures.retain(|f| f.status != Some(409));
        let present = before - self.failures.len();
        self.succeeded += present;
        present
    }
}

/// Copies the full contents of one container into another.
#[async_trait]
pub trait ContainerCopier: Send + Sync {
    /// Copy every document of `source_container` into `destination_container`.
    ///
    /// Per-document write failures are reported in the outcome, never as an
    /// error. Read failures abort the copy.
    async fn copy(
        &self,
        source_database: &str,
        destination_database: &str,
        source_container: &str,
        destination_container: &str,
    ) -> Result<CopyOutcome>;
}

/// Paged, concurrent document copier.
pub struct TransferEngine {
    store: Arc<dyn DocumentStore>,
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(store: Arc<dyn DocumentStore>, config: TransferConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Copy one container. See [`ContainerCopier::copy`].
    pub async fn copy(
        &self,
        source_database: &str,
        destination_database: &str,
        source_container: &str,
        destination_container: &str,
    ) -> Result<CopyOutcome> {
        let started = Instant::now();
        let mut outcome = CopyOutcome {
            source: format!("{}/{}", source_database, source_container),
            destination: format!("{}/{}", destination_database, destination_container),
            ..Default::default()
        };

        let mut feed = pages(
            self.store.as_ref(),
            source_database,
            source_container,
            self.config.page_size,
        );

        while let Some(mut page) = feed.try_next().await? {
            outcome.pages += 1;
            if page.is_empty() {
                continue;
            }

            for doc in page.iter_mut() {
                strip_system_properties(doc);
            }
            outcome.submitted += page.len();

            info!("creating {} in {}...", page.len(), outcome.destination);
            let results = self
                .write_page(destination_database, destination_container, page)
                .await;

            for result in results {
                match result {
                    Ok(()) => outcome.succeeded += 1,
                    Err(failure) => {
                        log_failure(&outcome.destination, &failure);
                        outcome.failures.push(failure);
                    }
                }
            }
            debug!(
                "{}: page {} done, {} submitted so far",
                outcome.source, outcome.pages, outcome.submitted
            );
        }

        info!(
            "finished copying {} to {}: {} submitted, {} failed in {:.2}s",
            outcome.source,
            outcome.destination,
            outcome.submitted,
            outcome.failed(),
            started.elapsed().as_secs_f64()
        );

        Ok(outcome)
    }

    /// Write every document of a page and wait for all of them.
    async fn write_page(
        &self,
        database_id: &str,
        container_id: &str,
        documents: Vec<Document>,
    ) -> Vec<std::result::Result<(), WriteFailure>> {
        let limit = self
            .config
            .max_concurrent_writes
            .unwrap_or(documents.len())
            .max(1);
        let permits = Semaphore::new(limit);

        let writes = documents.into_iter().map(|doc| {
            let permits = &permits;
            async move {
                // Never closed, so acquire only fails if that changes.
                let _permit = permits.acquire().await;
                self.store.write_document(database_id, container_id, doc).await
            }
        });

        join_all(writes).await
    }
}

#[async_trait]
impl ContainerCopier for TransferEngine {
    async fn copy(
        &self,
        source_database: &str,
        destination_database: &str,
        source_container: &str,
        destination_container: &str,
    ) -> Result<CopyOutcome> {
        TransferEngine::copy(
            self,
            source_database,
            destination_database,
            source_container,
            destination_container,
        )
        .await
    }
}

fn log_failure(destination: &str, failure: &WriteFailure) {
    let id = failure.document_id.as_deref().unwrap_or("<no id>");
    match failure.status {
        Some(status) => error!(
            "Error creating document {} in {}, status code {}: {}",
            id, destination, status, failure.reason
        ),
        None => error!(
            "Error creating document {} in {}: {}",
            id, destination, failure.reason
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SYSTEM_PROPERTIES;
    use crate::error::ReprovisionError;
    use crate::store::{DocumentPage, MemoryStore};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn docs(n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| {
                let mut d = Document::new();
                d.insert("id".into(), json!(format!("doc-{}", i)));
                d.insert("n".into(), json!(i));
                d.insert("nested".into(), json!({"tags": ["a", "b"], "ok": true}));
                d
            })
            .collect()
    }

    fn seeded(page_size: usize, count: usize) -> Arc<MemoryStore> {
        let store = MemoryStore::new().with_page_size(page_size);
        store.insert_database("src", 400);
        store.insert_database("dst", 400);
        store.insert_container("src", "items", "/id");
        store.insert_container("dst", "items", "/id");
        store.insert_documents("src", "items", docs(count));
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_copies_every_page_without_system_properties() {
        let store = seeded(3, 7);
        let engine = TransferEngine::new(store.clone(), TransferConfig::default());

        let outcome = engine.copy("src", "dst", "items", "items").await.unwrap();

        assert_eq!(outcome.pages, 3);
        assert_eq!(outcome.submitted, 7);
        assert_eq!(outcome.succeeded, 7);
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.source, "src/items");
        assert_eq!(outcome.destination, "dst/items");

        let copied = store.documents("dst", "items").unwrap();
        assert_eq!(copied.len(), 7);
        for doc in &copied {
            for field in SYSTEM_PROPERTIES {
                assert!(!doc.contains_key(field));
            }
        }
        assert_eq!(copied, docs(7));
    }

    #[tokio::test]
    async fn test_empty_container_submits_nothing() {
        let store = seeded(10, 0);
        let engine = TransferEngine::new(store.clone(), TransferConfig::default());

        let outcome = engine.copy("src", "dst", "items", "items").await.unwrap();

        assert_eq!(outcome.submitted, 0);
        assert_eq!(outcome.pages, 1);
        assert_eq!(store.calls().write_document, 0);
    }

    #[tokio::test]
    async fn test_failed_write_does_not_stop_page_or_copy() {
        let store = seeded(4, 10);
        store.fail_writes_for("doc-1");
        let engine = TransferEngine::new(store.clone(), TransferConfig::default());

        let outcome = engine.copy("src", "dst", "items", "items").await.unwrap();

        assert_eq!(outcome.submitted, 10);
        assert_eq!(outcome.succeeded, 9);
        assert_eq!(outcome.failed(), 1);
        assert_eq!(outcome.failures[0].document_id.as_deref(), Some("doc-1"));
        assert_eq!(outcome.failures[0].status, Some(429));
        assert_eq!(store.calls().write_document, 10);
        assert_eq!(store.calls().read_page, 3);
        assert_eq!(store.documents("dst", "items").unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_missing_destination_is_reported_per_document() {
        let store = seeded(5, 2);
        let engine = TransferEngine::new(store.clone(), TransferConfig::default());

        let outcome = engine.copy("src", "dst", "items", "absent").await.unwrap();

        assert_eq!(outcome.failed(), 2);
        assert!(outcome.failures.iter().all(|f| f.status == Some(404)));
    }

    #[tokio::test]
    async fn test_recopy_conflicts_can_be_accepted_as_present() {
        let store = seeded(4, 6);
        store.insert_documents("dst", "items", docs(3));
        store.fail_writes_for("doc-5");
        let engine = TransferEngine::new(store.clone(), TransferConfig::default());

        let mut outcome = engine.copy("src", "dst", "items", "items").await.unwrap();
        assert_eq!(outcome.failed(), 4);
        assert_eq!(outcome.succeeded, 2);

        assert_eq!(outcome.accept_conflicts(), 3);
        assert_eq!(outcome.succeeded, 5);
        assert_eq!(outcome.failed(), 1);
        assert_eq!(outcome.failures[0].status, Some(429));
    }

    #[tokio::test]
    async fn test_read_failure_aborts_copy() {
        let store = seeded(5, 5);
        store.fail_reads_for("src", "items");
        let engine = TransferEngine::new(store.clone(), TransferConfig::default());

        let err = engine.copy("src", "dst", "items", "items").await.unwrap_err();
        assert!(matches!(err, ReprovisionError::Pagination { .. }));
        assert_eq!(store.calls().write_document, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_writes_fan_out_across_whole_page() {
        let store = MemoryStore::new()
            .with_page_size(8)
            .with_write_delay(Duration::from_millis(10));
        store.insert_database("src", 400);
        store.insert_database("dst", 400);
        store.insert_container("src", "items", "/id");
        store.insert_container("dst", "items", "/id");
        store.insert_documents("src", "items", docs(16));
        let store = Arc::new(store);

        let engine = TransferEngine::new(store.clone(), TransferConfig::default());
        engine.copy("src", "dst", "items", "items").await.unwrap();

        assert_eq!(store.max_in_flight_writes(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_semaphore_caps_writes_in_flight() {
        let store = MemoryStore::new()
            .with_page_size(8)
            .with_write_delay(Duration::from_millis(10));
        store.insert_database("src", 400);
        store.insert_database("dst", 400);
        store.insert_container("src", "items", "/id");
        store.insert_container("dst", "items", "/id");
        store.insert_documents("src", "items", docs(16));
        let store = Arc::new(store);

        let engine = TransferEngine::new(
            store.clone(),
            TransferConfig {
                max_concurrent_writes: Some(3),
                page_size: None,
            },
        );
        let outcome = engine.copy("src", "dst", "items", "items").await.unwrap();

        assert_eq!(outcome.succeeded, 16);
        assert_eq!(store.max_in_flight_writes(), 3);
    }

    /// Records the interleaving of reads and writes around a memory store.
    struct Recording {
        inner: MemoryStore,
        events: Mutex<Vec<&'static str>>,
    }

    impl Recording {
        fn push(&self, event: &'static str) {
            self.events
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(event);
        }
    }

    #[async_trait]
    impl DocumentStore for Recording {
        async fn read_page(
            &self,
            database_id: &str,
            container_id: &str,
            continuation: Option<String>,
            page_size: Option<usize>,
        ) -> Result<DocumentPage> {
            self.push("read");
            self.inner
                .read_page(database_id, container_id, continuation, page_size)
                .await
        }

        async fn write_document(
            &self,
            database_id: &str,
            container_id: &str,
            document: Document,
        ) -> std::result::Result<(), WriteFailure> {
            let result = self
                .inner
                .write_document(database_id, container_id, document)
                .await;
            self.push("write");
            result
        }
    }

    #[tokio::test]
    async fn test_next_page_waits_for_previous_writes() {
        let inner = MemoryStore::new().with_page_size(2);
        inner.insert_database("src", 400);
        inner.insert_database("dst", 400);
        inner.insert_container("src", "items", "/id");
        inner.insert_container("dst", "items", "/id");
        inner.insert_documents("src", "items", docs(5));
        let store = Arc::new(Recording {
            inner,
            events: Mutex::new(Vec::new()),
        });

        let engine = TransferEngine::new(store.clone(), TransferConfig::default());
        engine.copy("src", "dst", "items", "items").await.unwrap();

        let events = store.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["read", "write", "write", "read", "write", "write", "read", "write"]
        );
    }
}
