//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Store account connection settings.
    pub store: StoreConfig,

    /// Re-provisioning behavior.
    pub migration: MigrationConfig,
}

/// Store account configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Account endpoint, e.g. `https://myaccount.documents.azure.com:443/`.
    pub endpoint: String,

    /// Base64 master key for the account.
    pub key: String,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("endpoint", &self.endpoint)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Re-provisioning behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Name of the database whose shared throughput is being re-provisioned.
    pub database: String,

    /// Manual throughput (RU/s) for the temporary database and for the
    /// recreated database while data is copied back.
    pub temp_throughput: u32,

    /// Final throughput allotted per container (RU/s).
    pub throughput_per_container: u32,

    /// Floor for database-level shared throughput (default: 500).
    #[serde(default = "default_min_shared_throughput")]
    pub min_shared_throughput: u32,

    /// Cap on concurrent document writes within one page.
    /// Unset means one concurrent write per document in the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_writes: Option<usize>,

    /// Requested documents per page. Unset lets the store decide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
}

/// Minimum database-level throughput when more than one container shares it.
pub const DEFAULT_MIN_SHARED_THROUGHPUT: u32 = 500;

/// Lowest manual throughput the store accepts for a database.
pub const MIN_DATABASE_THROUGHPUT: u32 = 400;

fn default_min_shared_throughput() -> u32 {
    DEFAULT_MIN_SHARED_THROUGHPUT
}
