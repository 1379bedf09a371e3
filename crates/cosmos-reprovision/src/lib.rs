//! # cosmos-reprovision
//!
//! Re-provision the shared throughput of a multi-container database.
//!
//! The store cannot change a database's shared throughput layout in place,
//! so this library moves the data out and back:
//!
//! - **Copy out** every container to a temporary database
//! - **Recreate** the source database at copy throughput
//! - **Copy back** every container and drop the temporary database
//! - **Apply** `max(minimum, containers * per_container)` RU/s
//!
//! Document writes run concurrently within each page of the read feed, and
//! rejected writes are collected rather than aborting the run. With a state
//! file, a failed run can be resumed from its last completed phase.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cosmos_reprovision::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> cosmos_reprovision::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::from_config(config)?;
//!     let result = orchestrator.run().await?;
//!     println!(
//!         "Copied {} documents, final throughput {:?}",
//!         result.documents_submitted, result.final_throughput
//!     );
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod orchestrator;
pub mod state;
pub mod store;
pub mod transfer;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, StoreConfig};
pub use document::Document;
pub use error::{ReprovisionError, Result};
pub use orchestrator::{compute_final_throughput, Orchestrator, ReprovisionPlan, ReprovisionResult};
pub use state::{MigrationState, Phase, RunStatus};
pub use store::{
    ContainerDescriptor, CosmosClient, DatabaseHandle, DocumentStore, MemoryStore,
    ProvisioningService, ThroughputSpec, WriteFailure,
};
pub use transfer::{ContainerCopier, CopyOutcome, TransferConfig, TransferEngine};
