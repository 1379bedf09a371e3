//! Re-provisioning orchestrator - main workflow coordinator.
//!
//! Drives the pipeline one phase at a time: copy every container out to a
//! temporary database, delete and recreate the source database, copy every
//! container back, drop the temporary database and apply the final shared
//! throughput. A phase only starts once the previous one has completed, and
//! a database is only deleted after the copy pass that empties it.

use crate::config::Config;
use crate::error::{ReprovisionError, Result};
use crate::state::{FailedDocument, MigrationState, PassSummary, Phase, RunStatus};
use crate::store::{
    ContainerDescriptor, CosmosClient, DatabaseHandle, ProvisioningService, ThroughputSpec,
};
use crate::transfer::{ContainerCopier, TransferEngine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Shared throughput for `container_count` containers at `per_container`
/// RU/s each, never below `minimum`.
pub fn compute_final_throughput(container_count: usize, per_container: u32, minimum: u32) -> u32 {
    let total = (container_count as u64).saturating_mul(per_container as u64);
    u32::try_from(total).unwrap_or(u32::MAX).max(minimum)
}

/// Re-provisioning orchestrator.
pub struct Orchestrator {
    config: Config,
    provisioning: Arc<dyn ProvisioningService>,
    copier: Arc<dyn ContainerCopier>,
    state_file: Option<PathBuf>,
    state: Option<MigrationState>,
}

/// Result of a re-provisioning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReprovisionResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: RunStatus,

    /// Database that was re-provisioned.
    pub database: String,

    /// Temporary database used during the run.
    pub temp_database: String,

    /// Containers in the re-provisioned database.
    pub containers: Vec<ContainerDescriptor>,

    /// Shared throughput applied at the end (RU/s).
    pub final_throughput: Option<u32>,

    /// Counters for the copy out to the temporary database.
    pub source_to_temp: PassSummary,

    /// Counters for the copy back into the recreated database.
    pub temp_to_final: PassSummary,

    /// Documents submitted across both passes.
    pub documents_submitted: usize,

    /// Documents rejected across both passes.
    pub documents_failed: usize,

    /// Sample of rejected documents.
    pub failed_documents: Vec<FailedDocument>,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Wall-clock duration of this invocation in seconds.
    pub duration_seconds: f64,
}

impl ReprovisionResult {
    fn from_state(state: &MigrationState, duration_seconds: f64) -> Self {
        Self {
            run_id: state.run_id.clone(),
            status: state.status,
            database: state.database.clone(),
            temp_database: state.temp_database.clone(),
            containers: state.temp_containers.clone(),
            final_throughput: state.final_throughput,
            source_to_temp: state.source_to_temp.clone(),
            temp_to_final: state.temp_to_final.clone(),
            documents_submitted: state.source_to_temp.documents_submitted
                + state.temp_to_final.documents_submitted,
            documents_failed: state.documents_failed(),
            failed_documents: state.failed_documents.clone(),
            started_at: state.started_at,
            completed_at: state.completed_at.unwrap_or_else(Utc::now),
            duration_seconds,
        }
    }

    /// Serialize the result as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Fail with [`ReprovisionError::DocumentLoss`] if any document write was rejected.
    pub fn ensure_no_document_loss(&self) -> Result<()> {
        if self.documents_failed > 0 {
            return Err(ReprovisionError::DocumentLoss {
                failed: self.documents_failed,
                submitted: self.documents_submitted,
            });
        }
        Ok(())
    }
}

/// What a run would do, computed without changing anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReprovisionPlan {
    pub database: String,
    pub backend: String,
    pub containers: Vec<ContainerDescriptor>,
    pub temp_throughput: u32,
    pub throughput_per_container: u32,
    pub final_throughput: u32,
}

impl ReprovisionPlan {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Orchestrator {
    /// Create an orchestrator over explicit collaborators.
    pub fn new(
        config: Config,
        provisioning: Arc<dyn ProvisioningService>,
        copier: Arc<dyn ContainerCopier>,
    ) -> Self {
        Self {
            config,
            provisioning,
            copier,
            state_file: None,
            state: None,
        }
    }

    /// Create an orchestrator talking to the configured account.
    ///
    /// Administration and document transfer share one client.
    pub fn from_config(config: Config) -> Result<Self> {
        let client = Arc::new(CosmosClient::new(&config.store)?);
        let engine = TransferEngine::new(client.clone(), config.transfer_config());
        Ok(Self::new(config, client, Arc::new(engine)))
    }

    /// Set the state file path for resume capability.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    /// Load existing state for resume.
    pub fn resume(mut self) -> Result<Self> {
        let path = self.state_file.as_ref().ok_or_else(|| {
            ReprovisionError::NotResumable("no state file configured".into())
        })?;
        if !path.exists() {
            return Err(ReprovisionError::NotResumable(format!(
                "state file {:?} does not exist",
                path
            )));
        }

        let mut state = MigrationState::load(path)?;
        state.validate_config(&self.config.hash())?;
        state.ensure_resumable()?;
        state.mark_resumed();

        info!(
            "Resuming run {} from state file {:?} (last completed phase: {})",
            state.run_id, path, state.phase
        );
        self.state = Some(state);
        Ok(self)
    }

    /// Check that the account is reachable.
    pub async fn health_check(&self) -> Result<()> {
        self.provisioning.health_check().await?;
        info!(
            "Health check passed ({} backend)",
            self.provisioning.backend_type()
        );
        Ok(())
    }

    /// List the source containers and compute the final throughput, without
    /// creating, copying or deleting anything.
    pub async fn plan(&self) -> Result<ReprovisionPlan> {
        let migration = &self.config.migration;
        let containers = self.provisioning.list_containers(&migration.database).await?;
        let final_throughput = compute_final_throughput(
            containers.len(),
            migration.throughput_per_container,
            migration.min_shared_throughput,
        );

        Ok(ReprovisionPlan {
            database: migration.database.clone(),
            backend: self.provisioning.backend_type().to_string(),
            containers,
            temp_throughput: migration.temp_throughput,
            throughput_per_container: migration.throughput_per_container,
            final_throughput,
        })
    }

    /// Run the pipeline to completion.
    pub async fn run(mut self) -> Result<ReprovisionResult> {
        let started = Instant::now();
        let mut state = match self.state.take() {
            Some(state) => state,
            None => MigrationState::new(
                uuid::Uuid::new_v4().to_string(),
                self.config.hash(),
                self.config.migration.database.clone(),
                uuid::Uuid::new_v4().to_string(),
            ),
        };

        info!(
            "Starting re-provisioning run {} for database {} (temp database {})",
            state.run_id, state.database, state.temp_database
        );

        if let Err(e) = self.execute(&mut state).await {
            state.mark_failed(&e.to_string());
            if let Err(save_err) = self.save_state(&mut state) {
                warn!("Failed to save state after error: {}", save_err);
            }
            return Err(e);
        }

        state.advance(Phase::Done);
        state.mark_completed();
        self.save_state(&mut state)?;

        let duration = started.elapsed().as_secs_f64();
        info!(
            "don't forget to check the database {} in the portal for manual validation",
            state.database
        );
        info!("total elapsed: {:.2}s", duration);

        Ok(ReprovisionResult::from_state(&state, duration))
    }

    async fn execute(&self, state: &mut MigrationState) -> Result<()> {
        let migration = &self.config.migration;
        let database = state.database.clone();
        let temp_database = state.temp_database.clone();
        let copy_throughput = ThroughputSpec::Manual(migration.temp_throughput);

        // Phase 1: temporary database
        let temp_handle = if state.reached(Phase::TempDbCreated) {
            DatabaseHandle::named(&temp_database)
        } else {
            info!("Phase 1: Creating temporary database {}", temp_database);
            let handle = self
                .provisioning
                .create_database(&temp_database, copy_throughput)
                .await?;
            self.complete(state, Phase::TempDbCreated)?;
            handle
        };

        // Phase 2: snapshot the source containers
        if !state.reached(Phase::SourceContainersListed) {
            info!("Phase 2: Listing containers in {}", database);
            state.source_containers = self.provisioning.list_containers(&database).await?;
            info!(
                "Found {} containers to re-provision",
                state.source_containers.len()
            );
            self.complete(state, Phase::SourceContainersListed)?;
        }

        // Phase 3: mirror them in the temporary database
        if !state.reached(Phase::TempContainersCreated) {
            info!("Phase 3: Creating containers in {}", temp_database);
            self.create_containers(&temp_handle, &state.source_containers)
                .await?;
            self.complete(state, Phase::TempContainersCreated)?;
        }

        // Phase 4: copy out
        if !state.reached(Phase::CopiedSourceToTemp) {
            info!("Phase 4: Copying {} to {}", database, temp_database);
            let containers = state.source_containers.clone();
            let summary = self
                .copy_pass(
                    state,
                    Phase::CopiedSourceToTemp,
                    &database,
                    &temp_database,
                    &containers,
                )
                .await?;
            state.source_to_temp = summary;
            self.complete(state, Phase::CopiedSourceToTemp)?;
        }

        // Phase 5: drop the source
        if !state.reached(Phase::SourceDbDeleted) {
            state.ensure_reached(
                Phase::CopiedSourceToTemp,
                &format!("delete database {}", database),
            )?;
            info!("Phase 5: Deleting database {}", database);
            self.provisioning.delete_database(&database).await?;
            self.complete(state, Phase::SourceDbDeleted)?;
        }

        // Phase 6: recreate it at copy throughput
        let final_handle = if state.reached(Phase::SourceDbRecreated) {
            DatabaseHandle::named(&database)
        } else {
            info!("Phase 6: Recreating database {}", database);
            let handle = self
                .provisioning
                .create_database(&database, copy_throughput)
                .await?;
            self.complete(state, Phase::SourceDbRecreated)?;
            handle
        };

        // Phase 7: snapshot the temporary containers
        if !state.reached(Phase::TempContainersListed) {
            info!("Phase 7: Listing containers in {}", temp_database);
            state.temp_containers = self.provisioning.list_containers(&temp_database).await?;
            if state.temp_containers.len() != state.source_containers.len() {
                warn!(
                    "{} holds {} containers but {} were listed in {}; continuing with the temporary database's containers",
                    temp_database,
                    state.temp_containers.len(),
                    state.source_containers.len(),
                    database
                );
            }
            self.complete(state, Phase::TempContainersListed)?;
        }

        // Phase 8: mirror them in the recreated database
        if !state.reached(Phase::FinalContainersCreated) {
            info!("Phase 8: Creating containers in {}", database);
            self.create_containers(&final_handle, &state.temp_containers)
                .await?;
            self.complete(state, Phase::FinalContainersCreated)?;
        }

        // Phase 9: copy back
        if !state.reached(Phase::CopiedTempToFinal) {
            info!("Phase 9: Copying {} to {}", temp_database, database);
            let containers = state.temp_containers.clone();
            let summary = self
                .copy_pass(
                    state,
                    Phase::CopiedTempToFinal,
                    &temp_database,
                    &database,
                    &containers,
                )
                .await?;
            state.temp_to_final = summary;
            self.complete(state, Phase::CopiedTempToFinal)?;
        }

        // Phase 10: drop the temporary database
        if !state.reached(Phase::TempDbDeleted) {
            state.ensure_reached(
                Phase::CopiedTempToFinal,
                &format!("delete database {}", temp_database),
            )?;
            info!("Phase 10: Deleting temporary database {}", temp_database);
            self.provisioning.delete_database(&temp_database).await?;
            self.complete(state, Phase::TempDbDeleted)?;
        }

        // Phase 11: final shared throughput
        if !state.reached(Phase::ThroughputApplied) {
            let throughput = compute_final_throughput(
                state.temp_containers.len(),
                migration.throughput_per_container,
                migration.min_shared_throughput,
            );
            info!(
                "Phase 11: Applying final throughput to {} ({} containers * {} = {}RUs)",
                database,
                state.temp_containers.len(),
                migration.throughput_per_container,
                throughput
            );
            self.provisioning
                .replace_throughput(&final_handle, ThroughputSpec::Manual(throughput))
                .await?;
            state.final_throughput = Some(throughput);
            self.complete(state, Phase::ThroughputApplied)?;
        }

        Ok(())
    }

    async fn create_containers(
        &self,
        database: &DatabaseHandle,
        containers: &[ContainerDescriptor],
    ) -> Result<()> {
        for container in containers {
            self.provisioning
                .create_container(database, &container.id, &container.partition_key_path)
                .await?;
        }
        Ok(())
    }

    /// Copy every container from `source` to `destination`.
    ///
    /// Both databases hold only what this run wrote, so when an interrupted
    /// pass is re-run a 409 means the earlier attempt already copied the
    /// document.
    async fn copy_pass(
        &self,
        state: &mut MigrationState,
        pass: Phase,
        source: &str,
        destination: &str,
        containers: &[ContainerDescriptor],
    ) -> Result<PassSummary> {
        let restarted = state.begin_pass(pass);
        self.save_state(state)?;
        if restarted {
            info!(
                "Re-running interrupted copy {} -> {}; existing documents count as copied",
                source, destination
            );
        }

        let mut summary = PassSummary::default();
        for container in containers {
            let mut outcome = self
                .copier
                .copy(source, destination, &container.id, &container.id)
                .await?;
            if restarted {
                let present = outcome.accept_conflicts();
                if present > 0 {
                    info!(
                        "{}: {} documents already present from the interrupted attempt",
                        outcome.destination, present
                    );
                }
            }
            summary.add(&outcome);
            state.record_failures(pass, &outcome);
        }
        Ok(summary)
    }

    fn complete(&self, state: &mut MigrationState, phase: Phase) -> Result<()> {
        state.advance(phase);
        self.save_state(state)
    }

    fn save_state(&self, state: &mut MigrationState) -> Result<()> {
        if let Some(ref path) = self.state_file {
            state.save(path)?;
        }
        Ok(())
    }
}
