//! Configuration validation.

use super::{Config, MIN_DATABASE_THROUGHPUT};
use crate::error::{ReprovisionError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Store validation
    if config.store.endpoint.is_empty() {
        return Err(ReprovisionError::Config("store.endpoint is required".into()));
    }
    let endpoint = url::Url::parse(&config.store.endpoint).map_err(|e| {
        ReprovisionError::Config(format!("store.endpoint is not a valid URL: {}", e))
    })?;
    if endpoint.scheme() != "https" && endpoint.scheme() != "http" {
        return Err(ReprovisionError::Config(format!(
            "store.endpoint must be http or https, got '{}'",
            endpoint.scheme()
        )));
    }
    if config.store.key.is_empty() {
        return Err(ReprovisionError::Config("store.key is required".into()));
    }
    if STANDARD.decode(config.store.key.as_bytes()).is_err() {
        return Err(ReprovisionError::Config(
            "store.key must be a base64 master key".into(),
        ));
    }

    // Migration validation
    if config.migration.database.is_empty() {
        return Err(ReprovisionError::Config(
            "migration.database is required".into(),
        ));
    }
    if config.migration.temp_throughput < MIN_DATABASE_THROUGHPUT {
        return Err(ReprovisionError::Config(format!(
            "migration.temp_throughput must be at least {}, got {}",
            MIN_DATABASE_THROUGHPUT, config.migration.temp_throughput
        )));
    }
    if config.migration.throughput_per_container == 0 {
        return Err(ReprovisionError::Config(
            "migration.throughput_per_container must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.max_concurrent_writes {
        return Err(ReprovisionError::Config(
            "migration.max_concurrent_writes must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.page_size {
        return Err(ReprovisionError::Config(
            "migration.page_size must be at least 1".into(),
        ));
    }

    Ok(())
}
