//! In-process store backend for tests.
//!
//! Keeps databases, containers and documents in memory and records every
//! call made against it, so tests can assert both on the resulting data and
//! on how it was produced. Nothing outside tests constructs it; the CLI
//! always talks to [`CosmosClient`](super::CosmosClient).

use super::{
    ContainerDescriptor, DatabaseHandle, DocumentPage, DocumentStore, ProvisioningService,
    ThroughputSpec, WriteFailure,
};
use crate::document::{document_id, Document};
use crate::error::{ReprovisionError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_PAGE_SIZE: usize = 100;

/// Number of calls made to each store operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create_database: usize,
    pub list_containers: usize,
    pub create_container: usize,
    pub delete_database: usize,
    pub replace_throughput: usize,
    pub read_page: usize,
    pub write_document: usize,
}

/// An administrative call, in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateDatabase { id: String, throughput: u32 },
    ListContainers { database: String },
    CreateContainer { database: String, container: String },
    DeleteDatabase { id: String },
    ReplaceThroughput { database: String, throughput: u32 },
}

struct Container {
    id: String,
    partition_key_path: String,
    documents: Vec<Document>,
}

struct Database {
    resource_id: String,
    throughput: u32,
    containers: Vec<Container>,
}

impl Database {
    fn container(&self, id: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.id == id)
    }

    fn container_mut(&mut self, id: &str) -> Option<&mut Container> {
        self.containers.iter_mut().find(|c| c.id == id)
    }
}

#[derive(Default)]
struct Inner {
    databases: BTreeMap<String, Database>,
    calls: CallCounts,
    operations: Vec<Operation>,
    failing_writes: HashSet<String>,
    failing_reads: HashSet<(String, String)>,
    next_resource: usize,
}

impl Inner {
    fn next_resource_id(&mut self) -> String {
        self.next_resource += 1;
        format!("rid{:06}", self.next_resource)
    }
}

/// Store that lives entirely in memory.
///
/// Test-only: failure injection, call counters and the write delay exist so
/// tests can drive the orchestrator and transfer engine without an account.
/// Data is lost when the value is dropped.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    page_size: usize,
    write_delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            page_size: DEFAULT_PAGE_SIZE,
            write_delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Largest page `read_page` will return, whatever the caller asks for.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Make every document write take at least `delay`.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a database. Does not count as a call.
    pub fn insert_database(&self, id: &str, throughput: u32) {
        let mut inner = self.lock();
        let resource_id = inner.next_resource_id();
        inner.databases.insert(
            id.to_string(),
            Database {
                resource_id,
                throughput,
                containers: Vec::new(),
            },
        );
    }

    /// Seed an empty container. The database must already exist.
    pub fn insert_container(&self, database_id: &str, container_id: &str, partition_key_path: &str) {
        let mut inner = self.lock();
        if let Some(db) = inner.databases.get_mut(database_id) {
            if db.container(container_id).is_none() {
                db.containers.push(Container {
                    id: container_id.to_string(),
                    partition_key_path: partition_key_path.to_string(),
                    documents: Vec::new(),
                });
            }
        }
    }

    /// Seed documents into an existing container.
    pub fn insert_documents(&self, database_id: &str, container_id: &str, documents: Vec<Document>) {
        let mut inner = self.lock();
        if let Some(container) = inner
            .databases
            .get_mut(database_id)
            .and_then(|db| db.container_mut(container_id))
        {
            container.documents.extend(documents);
        }
    }

    /// Reject every write of the document with this id with a 429.
    pub fn fail_writes_for(&self, document_id: &str) {
        self.lock().failing_writes.insert(document_id.to_string());
    }

    /// Fail every page read from this container.
    pub fn fail_reads_for(&self, database_id: &str, container_id: &str) {
        self.lock()
            .failing_reads
            .insert((database_id.to_string(), container_id.to_string()));
    }

    /// Drop every injected read and write failure.
    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.failing_writes.clear();
        inner.failing_reads.clear();
    }

    /// Documents stored in a container, as written.
    pub fn documents(&self, database_id: &str, container_id: &str) -> Option<Vec<Document>> {
        self.lock()
            .databases
            .get(database_id)
            .and_then(|db| db.container(container_id))
            .map(|c| c.documents.clone())
    }

    pub fn database_throughput(&self, database_id: &str) -> Option<u32> {
        self.lock().databases.get(database_id).map(|db| db.throughput)
    }

    pub fn database_ids(&self) -> Vec<String> {
        self.lock().databases.keys().cloned().collect()
    }

    pub fn container_ids(&self, database_id: &str) -> Vec<String> {
        self.lock()
            .databases
            .get(database_id)
            .map(|db| db.containers.iter().map(|c| c.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls.clone()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    /// Highest number of document writes observed running at once.
    pub fn max_in_flight_writes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn not_found(what: &str, context: String) -> ReprovisionError {
    ReprovisionError::store(404, format!("{} not found", what), context)
}

/// Copy of `doc` carrying the fields the store injects on every read.
fn with_system_properties(doc: &Document, resource_id: &str, index: usize) -> Document {
    let mut stamped = doc.clone();
    let rid = format!("{}.{}", resource_id, index);
    stamped.insert("_self".into(), json!(format!("dbs/{}/docs/{}/", resource_id, rid)));
    stamped.insert("_rid".into(), json!(rid));
    stamped.insert("_etag".into(), json!(format!("\"{:08x}\"", index)));
    stamped.insert("_attachments".into(), json!("attachments/"));
    stamped.insert("_ts".into(), json!(1_700_000_000u64 + index as u64));
    stamped
}

#[async_trait]
impl ProvisioningService for MemoryStore {
    async fn create_database(&self, id: &str, throughput: ThroughputSpec) -> Result<DatabaseHandle> {
        let mut inner = self.lock();
        inner.calls.create_database += 1;
        inner.operations.push(Operation::CreateDatabase {
            id: id.to_string(),
            throughput: throughput.request_units(),
        });

        if !inner.databases.contains_key(id) {
            let resource_id = inner.next_resource_id();
            inner.databases.insert(
                id.to_string(),
                Database {
                    resource_id,
                    throughput: throughput.request_units(),
                    containers: Vec::new(),
                },
            );
        }

        let db = inner
            .databases
            .get(id)
            .ok_or_else(|| not_found("database", format!("create database {}", id)))?;
        Ok(DatabaseHandle {
            id: id.to_string(),
            throughput: Some(db.throughput),
            resource_id: Some(db.resource_id.clone()),
            self_link: Some(format!("dbs/{}/", db.resource_id)),
        })
    }

    async fn list_containers(&self, database_id: &str) -> Result<Vec<ContainerDescriptor>> {
        let mut inner = self.lock();
        inner.calls.list_containers += 1;
        inner.operations.push(Operation::ListContainers {
            database: database_id.to_string(),
        });

        let db = inner.databases.get(database_id).ok_or_else(|| {
            not_found("database", format!("list containers in {}", database_id))
        })?;
        Ok(db
            .containers
            .iter()
            .map(|c| ContainerDescriptor::new(c.id.clone(), c.partition_key_path.clone()))
            .collect())
    }

    async fn create_container(
        &self,
        database: &DatabaseHandle,
        container_id: &str,
        partition_key_path: &str,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.create_container += 1;
        inner.operations.push(Operation::CreateContainer {
            database: database.id.clone(),
            container: container_id.to_string(),
        });

        let db = inner.databases.get_mut(&database.id).ok_or_else(|| {
            not_found(
                "database",
                format!("create container {} in {}", container_id, database.id),
            )
        })?;
        if db.container(container_id).is_none() {
            db.containers.push(Container {
                id: container_id.to_string(),
                partition_key_path: partition_key_path.to_string(),
                documents: Vec::new(),
            });
        }
        Ok(())
    }

    async fn delete_database(&self, database_id: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.delete_database += 1;
        inner.operations.push(Operation::DeleteDatabase {
            id: database_id.to_string(),
        });

        inner
            .databases
            .remove(database_id)
            .map(|_| ())
            .ok_or_else(|| not_found("database", format!("delete database {}", database_id)))
    }

    async fn replace_throughput(
        &self,
        database: &DatabaseHandle,
        throughput: ThroughputSpec,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.calls.replace_throughput += 1;
        inner.operations.push(Operation::ReplaceThroughput {
            database: database.id.clone(),
            throughput: throughput.request_units(),
        });

        let db = inner.databases.get_mut(&database.id).ok_or_else(|| {
            not_found("database", format!("replace throughput of {}", database.id))
        })?;
        db.throughput = throughput.request_units();
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn read_page(
        &self,
        database_id: &str,
        container_id: &str,
        continuation: Option<String>,
        page_size: Option<usize>,
    ) -> Result<DocumentPage> {
        let mut inner = self.lock();
        inner.calls.read_page += 1;

        let link = format!("dbs/{}/colls/{}", database_id, container_id);
        if inner
            .failing_reads
            .contains(&(database_id.to_string(), container_id.to_string()))
        {
            return Err(ReprovisionError::pagination(link, "injected read failure"));
        }

        let db = inner
            .databases
            .get(database_id)
            .ok_or_else(|| ReprovisionError::pagination(&link, "database not found"))?;
        let container = db
            .container(container_id)
            .ok_or_else(|| ReprovisionError::pagination(&link, "container not found"))?;

        let offset = match continuation {
            None => 0,
            Some(token) => token.parse::<usize>().map_err(|_| {
                ReprovisionError::pagination(&link, format!("invalid continuation {}", token))
            })?,
        };
        let size = page_size
            .map_or(self.page_size, |n| n.min(self.page_size))
            .max(1);
        let end = (offset + size).min(container.documents.len());
        let start = offset.min(end);

        let documents = container.documents[start..end]
            .iter()
            .enumerate()
            .map(|(i, doc)| with_system_properties(doc, &db.resource_id, start + i))
            .collect();
        let continuation = (end < container.documents.len()).then(|| end.to_string());

        Ok(DocumentPage {
            documents,
            continuation,
        })
    }

    async fn write_document(
        &self,
        database_id: &str,
        container_id: &str,
        document: Document,
    ) -> std::result::Result<(), WriteFailure> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }

        let result = self.insert(database_id, container_id, document);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl MemoryStore {
    fn insert(
        &self,
        database_id: &str,
        container_id: &str,
        document: Document,
    ) -> std::result::Result<(), WriteFailure> {
        let mut inner = self.lock();
        inner.calls.write_document += 1;

        let id = document_id(&document).map(str::to_owned);
        if let Some(ref id) = id {
            if inner.failing_writes.contains(id) {
                return Err(WriteFailure::new(
                    Some(id.clone()),
                    Some(429),
                    "Request rate is large",
                ));
            }
        }

        let container = match inner
            .databases
            .get_mut(database_id)
            .and_then(|db| db.container_mut(container_id))
        {
            Some(c) => c,
            None => {
                return Err(WriteFailure::new(
                    id,
                    Some(404),
                    format!("container {}/{} not found", database_id, container_id),
                ))
            }
        };

        if id.is_some()
            && container
                .documents
                .iter()
                .any(|d| document_id(d) == id.as_deref())
        {
            return Err(WriteFailure::new(
                id,
                Some(409),
                "Entity with the specified id already exists in the system.",
            ));
        }

        container.documents.push(document);
        Ok(())
    }
}
