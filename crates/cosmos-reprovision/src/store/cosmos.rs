//! REST backend for the document store account.

use super::auth::{http_date, MasterKey};
use super::{
    ContainerDescriptor, DatabaseHandle, DocumentPage, DocumentStore, ProvisioningService,
    ThroughputSpec, WriteFailure,
};
use crate::config::StoreConfig;
use crate::document::{document_id, partition_key_header, Document};
use crate::error::{ReprovisionError, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

const API_VERSION: &str = "2018-12-31";
const HEADER_CONTINUATION: &str = "x-ms-continuation";
const HEADER_MAX_ITEM_COUNT: &str = "x-ms-max-item-count";
const HEADER_OFFER_THROUGHPUT: &str = "x-ms-offer-throughput";
const HEADER_PARTITION_KEY: &str = "x-ms-documentdb-partitionkey";
const HEADER_IS_QUERY: &str = "x-ms-documentdb-isquery";

#[derive(Debug, Deserialize)]
struct DatabaseResource {
    id: String,
    #[serde(rename = "_rid")]
    rid: Option<String>,
    #[serde(rename = "_self")]
    self_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CollectionFeed {
    #[serde(rename = "DocumentCollections", default)]
    collections: Vec<CollectionResource>,
}

#[derive(Debug, Deserialize)]
struct CollectionResource {
    id: String,
    #[serde(rename = "partitionKey", default)]
    partition_key: Option<PartitionKeyDefinition>,
}

impl CollectionResource {
    fn partition_key_path(&self) -> String {
        self.partition_key
            .as_ref()
            .and_then(|pk| pk.paths.first().cloned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct PartitionKeyDefinition {
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DocumentFeed {
    #[serde(rename = "Documents", default)]
    documents: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct OfferFeed {
    #[serde(rename = "Offers", default)]
    offers: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

fn database_link(database_id: &str) -> String {
    format!("dbs/{}", database_id)
}

fn collection_link(database_id: &str, container_id: &str) -> String {
    format!("dbs/{}/colls/{}", database_id, container_id)
}

/// Percent-encode each segment of a resource link for use in a URL path.
fn encode_link(link: &str) -> String {
    link.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn continuation_of(response: &Response) -> Option<String> {
    response
        .headers()
        .get(HEADER_CONTINUATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Read a failed response into (status, message).
async fn failure_of(response: Response) -> (u16, String) {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(ErrorBody {
            code: Some(code),
            message,
        }) => format!("{}: {}", code, message.unwrap_or_default()),
        _ => text,
    };
    (status, message)
}

async fn expect_success(response: Response, context: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let (status, message) = failure_of(response).await;
    Err(ReprovisionError::store(status, message, context))
}

/// Client for the account's REST API.
///
/// One instance serves every administrative and data request of a run.
pub struct CosmosClient {
    http: reqwest::Client,
    endpoint: Url,
    key: MasterKey,
    /// Partition-key path per `db/container`, resolved on first write.
    partition_keys: RwLock<HashMap<String, String>>,
}

impl CosmosClient {
    /// Create a client from store configuration.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let mut endpoint = Url::parse(&config.endpoint).map_err(|e| {
            ReprovisionError::Config(format!("Invalid store endpoint {}: {}", config.endpoint, e))
        })?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        let http = reqwest::Client::builder().build()?;

        Ok(Self {
            http,
            endpoint,
            key: MasterKey::from_base64(&config.key)?,
            partition_keys: RwLock::new(HashMap::new()),
        })
    }

    /// Start a signed request.
    ///
    /// `resource_link` is the unencoded link used for signing; `path` is
    /// derived from it unless the caller addresses a feed below it.
    fn request(
        &self,
        method: Method,
        path: &str,
        resource_type: &str,
        resource_link: &str,
    ) -> Result<RequestBuilder> {
        let date = http_date(Utc::now());
        let token = self
            .key
            .authorization(method.as_str(), resource_type, resource_link, &date)?;
        let url = self.endpoint.join(path).map_err(|e| {
            ReprovisionError::Config(format!("Invalid request path {}: {}", path, e))
        })?;

        Ok(self
            .http
            .request(method, url)
            .header("authorization", token)
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION))
    }

    async fn read_database(&self, database_id: &str) -> Result<DatabaseHandle> {
        let link = database_link(database_id);
        let context = format!("read database {}", database_id);
        let response = self
            .request(Method::GET, &encode_link(&link), "dbs", &link)?
            .send()
            .await?;
        let resource: DatabaseResource = expect_success(response, &context).await?.json().await?;

        Ok(DatabaseHandle {
            id: resource.id,
            throughput: None,
            resource_id: resource.rid,
            self_link: resource.self_link,
        })
    }

    async fn read_container(
        &self,
        database_id: &str,
        container_id: &str,
    ) -> Result<ContainerDescriptor> {
        let link = collection_link(database_id, container_id);
        let context = format!("read container {}", link);
        let response = self
            .request(Method::GET, &encode_link(&link), "colls", &link)?
            .send()
            .await?;
        let resource: CollectionResource =
            expect_success(response, &context).await?.json().await?;

        Ok(ContainerDescriptor::new(
            resource.id.clone(),
            resource.partition_key_path(),
        ))
    }

    /// Partition-key path of a container, cached after the first lookup.
    async fn partition_key_path(&self, database_id: &str, container_id: &str) -> Result<String> {
        let cache_key = collection_link(database_id, container_id);
        if let Some(path) = self.partition_keys.read().await.get(&cache_key) {
            return Ok(path.clone());
        }

        let descriptor = self.read_container(database_id, container_id).await?;
        self.partition_keys
            .write()
            .await
            .insert(cache_key, descriptor.partition_key_path.clone());
        Ok(descriptor.partition_key_path)
    }

    async fn find_offer(&self, database_resource_id: &str) -> Result<Document> {
        let context = format!("query offer for {}", database_resource_id);
        let query = json!({
            "query": "SELECT * FROM root WHERE root.offerResourceId = @rid",
            "parameters": [{"name": "@rid", "value": database_resource_id}],
        });

        let response = self
            .request(Method::POST, "offers", "offers", "")?
            .header(CONTENT_TYPE, "application/query+json")
            .header(HEADER_IS_QUERY, "True")
            .body(serde_json::to_vec(&query)?)
            .send()
            .await?;
        let feed: OfferFeed = expect_success(response, &context).await?.json().await?;

        feed.offers.into_iter().next().ok_or_else(|| {
            ReprovisionError::store(
                StatusCode::NOT_FOUND.as_u16(),
                "database has no shared throughput offer",
                context,
            )
        })
    }
}

#[async_trait]
impl ProvisioningService for CosmosClient {
    async fn create_database(
        &self,
        id: &str,
        throughput: ThroughputSpec,
    ) -> Result<DatabaseHandle> {
        let context = format!("create database {}", id);
        let response = self
            .request(Method::POST, "dbs", "dbs", "")?
            .header(HEADER_OFFER_THROUGHPUT, throughput.request_units().to_string())
            .json(&json!({ "id": id }))
            .send()
            .await?;

        let handle = if response.status() == StatusCode::CONFLICT {
            debug!("Database {} already exists, reusing it", id);
            self.read_database(id).await?
        } else {
            let resource: DatabaseResource =
                expect_success(response, &context).await?.json().await?;
            DatabaseHandle {
                id: resource.id,
                throughput: Some(throughput.request_units()),
                resource_id: resource.rid,
                self_link: resource.self_link,
            }
        };

        info!("Created database {}, Throughput:{}", handle.id, throughput);
        Ok(handle)
    }

    async fn list_containers(&self, database_id: &str) -> Result<Vec<ContainerDescriptor>> {
        let link = database_link(database_id);
        let path = format!("{}/colls", encode_link(&link));
        let context = format!("list containers in {}", database_id);

        let mut containers = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self.request(Method::GET, &path, "colls", &link)?;
            if let Some(ref token) = continuation {
                request = request.header(HEADER_CONTINUATION, token);
            }

            let response = expect_success(request.send().await?, &context).await?;
            let next = continuation_of(&response);
            let feed: CollectionFeed = response.json().await?;

            for collection in feed.collections {
                let descriptor =
                    ContainerDescriptor::new(collection.id.clone(), collection.partition_key_path());
                info!(
                    "Container fetched : {}, partitionKey : {}",
                    descriptor.id, descriptor.partition_key_path
                );
                containers.push(descriptor);
            }

            match next {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        Ok(containers)
    }

    async fn create_container(
        &self,
        database: &DatabaseHandle,
        container_id: &str,
        partition_key_path: &str,
    ) -> Result<()> {
        let link = database_link(&database.id);
        let path = format!("{}/colls", encode_link(&link));
        let context = format!("create container {} in {}", container_id, database.id);

        let mut body = json!({ "id": container_id });
        if !partition_key_path.is_empty() {
            body["partitionKey"] = json!({ "paths": [partition_key_path], "kind": "Hash" });
        }

        let response = self
            .request(Method::POST, &path, "colls", &link)?
            .json(&body)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            debug!(
                "Container {} already exists in {}",
                container_id, database.id
            );
        } else {
            expect_success(response, &context).await?;
        }

        self.partition_keys.write().await.insert(
            collection_link(&database.id, container_id),
            partition_key_path.to_string(),
        );

        info!(
            "Created container:{} with partitionKey:{} in db:{}",
            container_id, partition_key_path, database.id
        );
        Ok(())
    }

    async fn delete_database(&self, database_id: &str) -> Result<()> {
        let link = database_link(database_id);
        let context = format!("delete database {}", database_id);
        let response = self
            .request(Method::DELETE, &encode_link(&link), "dbs", &link)?
            .send()
            .await?;
        expect_success(response, &context).await?;

        let prefix = format!("{}/", link);
        self.partition_keys
            .write()
            .await
            .retain(|key, _| !key.starts_with(&prefix));

        info!("Database {} deleted successfully.", database_id);
        Ok(())
    }

    async fn replace_throughput(
        &self,
        database: &DatabaseHandle,
        throughput: ThroughputSpec,
    ) -> Result<()> {
        let context = format!("replace throughput of {}", database.id);
        let resource_id = match database.resource_id {
            Some(ref rid) => rid.clone(),
            None => self.read_database(&database.id).await?.resource_id.ok_or_else(|| {
                ReprovisionError::store(
                    StatusCode::NOT_FOUND.as_u16(),
                    "database has no resource id",
                    context.clone(),
                )
            })?,
        };

        let mut offer = self.find_offer(&resource_id).await?;
        let offer_rid = offer
            .get("_rid")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                ReprovisionError::store(
                    StatusCode::NOT_FOUND.as_u16(),
                    "offer has no resource id",
                    context.clone(),
                )
            })?;

        match offer.get_mut("content").and_then(Value::as_object_mut) {
            Some(content) => {
                content.insert(
                    "offerThroughput".into(),
                    json!(throughput.request_units()),
                );
            }
            None => {
                offer.insert(
                    "content".into(),
                    json!({ "offerThroughput": throughput.request_units() }),
                );
            }
        }

        let response = self
            .request(
                Method::PUT,
                &format!("offers/{}", urlencoding::encode(&offer_rid)),
                "offers",
                &offer_rid.to_lowercase(),
            )?
            .json(&offer)
            .send()
            .await?;
        expect_success(response, &context).await?;

        info!("Database {} throughput set to {}", database.id, throughput);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .request(Method::GET, "dbs", "dbs", "")?
            .header(HEADER_MAX_ITEM_COUNT, "1")
            .send()
            .await?;
        expect_success(response, "list databases").await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "cosmos"
    }
}

#[async_trait]
impl DocumentStore for CosmosClient {
    async fn read_page(
        &self,
        database_id: &str,
        container_id: &str,
        continuation: Option<String>,
        page_size: Option<usize>,
    ) -> Result<DocumentPage> {
        let link = collection_link(database_id, container_id);
        let path = format!("{}/docs", encode_link(&link));

        let mut request = self.request(Method::GET, &path, "docs", &link)?;
        if let Some(size) = page_size {
            request = request.header(HEADER_MAX_ITEM_COUNT, size.to_string());
        }
        if let Some(ref token) = continuation {
            request = request.header(HEADER_CONTINUATION, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ReprovisionError::pagination(&link, e.to_string()))?;
        if !response.status().is_success() {
            let (status, message) = failure_of(response).await;
            return Err(ReprovisionError::pagination(
                &link,
                format!("{} {}", status, message),
            ));
        }

        let next = continuation_of(&response);
        let feed: DocumentFeed = response
            .json()
            .await
            .map_err(|e| ReprovisionError::pagination(&link, e.to_string()))?;

        Ok(DocumentPage {
            documents: feed.documents,
            continuation: next,
        })
    }

    async fn write_document(
        &self,
        database_id: &str,
        container_id: &str,
        document: Document,
    ) -> std::result::Result<(), WriteFailure> {
        let id = document_id(&document).map(str::to_owned);

        let pk_path = self
            .partition_key_path(database_id, container_id)
            .await
            .map_err(|e| WriteFailure::new(id.clone(), e.status(), e.to_string()))?;

        let link = collection_link(database_id, container_id);
        let path = format!("{}/docs", encode_link(&link));
        let mut request = self
            .request(Method::POST, &path, "docs", &link)
            .map_err(|e| WriteFailure::new(id.clone(), None, e.to_string()))?;
        if !pk_path.is_empty() {
            request = request.header(HEADER_PARTITION_KEY, partition_key_header(&document, &pk_path));
        }

        let response = request.json(&document).send().await.map_err(|e| {
            WriteFailure::new(id.clone(), e.status().map(|s| s.as_u16()), e.to_string())
        })?;

        if response.status().is_success() {
            Ok(())
        } else {
            let (status, message) = failure_of(response).await;
            Err(WriteFailure::new(id, Some(status), message))
        }
    }
}
