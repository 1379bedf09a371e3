//! Document store collaborators.
//!
//! The re-provisioning core talks to the store through two traits:
//!
//! - [`ProvisioningService`]: database and container administration
//! - [`DocumentStore`]: paged document reads and single-document writes
//!
//! Two backends implement both:
//!
//! - [`CosmosClient`]: the account's REST API over HTTPS
//! - [`MemoryStore`]: a test-only in-process store with call accounting and
//!   failure injection
//!
//! The orchestrator and transfer engine hold `Arc<dyn ...>` handles and never
//! see the concrete type.

mod auth;
mod cosmos;
mod memory;

pub use auth::MasterKey;
pub use cosmos::CosmosClient;
pub use memory::{CallCounts, MemoryStore, Operation};

use crate::document::Document;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle to a database returned by the provisioning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHandle {
    /// Database id (its user-facing name).
    pub id: String,

    /// Throughput the database was created with, when known.
    pub throughput: Option<u32>,

    /// Store-assigned resource id, when known.
    pub resource_id: Option<String>,

    /// Store-assigned self link, when known.
    pub self_link: Option<String>,
}

impl DatabaseHandle {
    /// A handle that only knows the database id.
    ///
    /// Backends resolve the remaining fields on demand.
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            throughput: None,
            resource_id: None,
            self_link: None,
        }
    }
}

/// Shape of a container: enough to recreate it in another database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    /// Container id.
    pub id: String,

    /// Partition-key path, e.g. `/id`.
    pub partition_key_path: String,
}

impl ContainerDescriptor {
    pub fn new(id: impl Into<String>, partition_key_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            partition_key_path: partition_key_path.into(),
        }
    }
}

/// Throughput provisioning request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThroughputSpec {
    /// Fixed request units per second.
    Manual(u32),
}

impl ThroughputSpec {
    /// Request units per second to provision.
    pub fn request_units(&self) -> u32 {
        match self {
            ThroughputSpec::Manual(ru) => *ru,
        }
    }
}

impl fmt::Display for ThroughputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThroughputSpec::Manual(ru) => write!(f, "{}RUs", ru),
        }
    }
}

/// One page of a read feed.
#[derive(Debug, Clone, Default)]
pub struct DocumentPage {
    /// Documents in this page, in store order.
    pub documents: Vec<Document>,

    /// Opaque token for the next page; `None` when the feed is exhausted.
    pub continuation: Option<String>,
}

/// A single document write that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFailure {
    /// The document's `id`, if it had one.
    pub document_id: Option<String>,

    /// Status code returned by the store, if the request reached it.
    pub status: Option<u16>,

    /// Human-readable failure reason.
    pub reason: String,
}

impl WriteFailure {
    pub fn new(document_id: Option<String>, status: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            document_id,
            status,
            reason: reason.into(),
        }
    }
}

/// Store administration used by the orchestrator.
#[async_trait]
pub trait ProvisioningService: Send + Sync {
    /// Create the database if it does not exist and return a handle to it.
    ///
    /// Calling this for an existing id returns the existing database.
    async fn create_database(&self, id: &str, throughput: ThroughputSpec)
        -> Result<DatabaseHandle>;

    /// List every container in the database, following all result pages.
    async fn list_containers(&self, database_id: &str) -> Result<Vec<ContainerDescriptor>>;

    /// Create the container if it does not exist.
    async fn create_container(
        &self,
        database: &DatabaseHandle,
        container_id: &str,
        partition_key_path: &str,
    ) -> Result<()>;

    /// Delete a database and everything in it.
    async fn delete_database(&self, database_id: &str) -> Result<()>;

    /// Replace the database's shared throughput.
    async fn replace_throughput(
        &self,
        database: &DatabaseHandle,
        throughput: ThroughputSpec,
    ) -> Result<()>;

    /// Check that the account is reachable with the configured credentials.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

/// Document reads and writes used by the transfer engine.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read one page of every document in a container.
    ///
    /// `continuation` is the token from the previous page (`None` for the
    /// first page). `page_size` is a hint; the store decides the real size.
    async fn read_page(
        &self,
        database_id: &str,
        container_id: &str,
        continuation: Option<String>,
        page_size: Option<usize>,
    ) -> Result<DocumentPage>;

    /// Insert one document.
    ///
    /// Failures are returned as values; they are expected and recoverable.
    async fn write_document(
        &self,
        database_id: &str,
        container_id: &str,
        document: Document,
    ) -> std::result::Result<(), WriteFailure>;
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Lazily read every page of a container.
///
/// Each page is requested only when the stream is polled for it, so a
/// consumer that finishes with page N before polling again never causes
/// page N+1 to be fetched early.
pub fn pages<'a, S>(
    store: &'a S,
    database_id: &'a str,
    container_id: &'a str,
    page_size: Option<usize>,
) -> BoxStream<'a, Result<Vec<Document>>>
where
    S: DocumentStore + ?Sized,
{
    stream::try_unfold(Cursor::Start, move |cursor| async move {
        let continuation = match cursor {
            Cursor::Done => return Ok(None),
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
        };

        let page = store
            .read_page(database_id, container_id, continuation, page_size)
            .await?;

        let next = match page.continuation {
            Some(token) => Cursor::Next(token),
            None => Cursor::Done,
        };
        Ok(Some((page.documents, next)))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    fn docs(n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| {
                let mut d = Document::new();
                d.insert("id".into(), json!(format!("doc-{}", i)));
                d
            })
            .collect()
    }

    #[tokio::test]
    async fn test_pages_follow_continuations_to_the_end() {
        let store = MemoryStore::new().with_page_size(3);
        store.insert_database("db", 400);
        store.insert_container("db", "items", "/id");
        store.insert_documents("db", "items", docs(7));

        let sizes: Vec<usize> = pages(&store, "db", "items", None)
            .map_ok(|page| page.len())
            .try_collect()
            .await
            .unwrap();

        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(store.calls().read_page, 3);
    }

    #[tokio::test]
    async fn test_pages_are_requested_lazily() {
        let store = MemoryStore::new().with_page_size(2);
        store.insert_database("db", 400);
        store.insert_container("db", "items", "/id");
        store.insert_documents("db", "items", docs(6));

        let mut cursor = pages(&store, "db", "items", None);
        assert_eq!(store.calls().read_page, 0);

        let first = cursor.try_next().await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(store.calls().read_page, 1);
    }

    #[tokio::test]
    async fn test_empty_container_yields_one_empty_page() {
        let store = MemoryStore::new();
        store.insert_database("db", 400);
        store.insert_container("db", "empty", "/id");

        let all: Vec<Vec<Document>> = pages(&store, "db", "empty", None)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_empty());
    }

    #[tokio::test]
    async fn test_read_error_surfaces_through_stream() {
        let store = MemoryStore::new();
        store.insert_database("db", 400);

        let result: Result<Vec<Vec<Document>>> =
            pages(&store, "db", "missing", None).try_collect().await;
        assert!(result.is_err());
    }

    #[test]
    fn test_throughput_spec_display() {
        assert_eq!(ThroughputSpec::Manual(2000).to_string(), "2000RUs");
        assert_eq!(ThroughputSpec::Manual(400).request_units(), 400);
    }
}
