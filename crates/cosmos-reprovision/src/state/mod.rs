//! File-based run state for resume capability.

use crate::error::{ReprovisionError, Result};
use crate::store::{ContainerDescriptor, WriteFailure};
use crate::transfer::CopyOutcome;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

/// Most failed documents kept in the state file and the run result.
pub const MAX_FAILED_DOCUMENTS: usize = 100;

/// Pipeline phases, in the order they complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Start,
    TempDbCreated,
    SourceContainersListed,
    TempContainersCreated,
    CopiedSourceToTemp,
    SourceDbDeleted,
    SourceDbRecreated,
    TempContainersListed,
    FinalContainersCreated,
    CopiedTempToFinal,
    TempDbDeleted,
    ThroughputApplied,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Start => "start",
            Phase::TempDbCreated => "temp_db_created",
            Phase::SourceContainersListed => "source_containers_listed",
            Phase::TempContainersCreated => "temp_containers_created",
            Phase::CopiedSourceToTemp => "copied_source_to_temp",
            Phase::SourceDbDeleted => "source_db_deleted",
            Phase::SourceDbRecreated => "source_db_recreated",
            Phase::TempContainersListed => "temp_containers_listed",
            Phase::FinalContainersCreated => "final_containers_created",
            Phase::CopiedTempToFinal => "copied_temp_to_final",
            Phase::TempDbDeleted => "temp_db_deleted",
            Phase::ThroughputApplied => "throughput_applied",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Document counters for one copy pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSummary {
    /// Containers copied.
    pub containers: usize,

    pub documents_submitted: usize,
    pub documents_succeeded: usize,
    pub documents_failed: usize,
}

impl PassSummary {
    /// Fold one container's outcome into the pass.
    pub fn add(&mut self, outcome: &CopyOutcome) {
        self.containers += 1;
        self.documents_submitted += outcome.submitted;
        self.documents_succeeded += outcome.succeeded;
        self.documents_failed += outcome.failed();
    }
}

/// A document the destination rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDocument {
    /// Copy pass the failure belongs to.
    pub pass: Phase,

    /// Destination container as `database/container`.
    pub container: String,

    pub document_id: Option<String>,
    pub status: Option<u16>,
    pub reason: String,
}

impl FailedDocument {
    fn from_failure(pass: Phase, container: &str, failure: &WriteFailure) -> Self {
        Self {
            pass,
            container: container.to_string(),
            document_id: failure.document_id.clone(),
            status: failure.status,
            reason: failure.reason.clone(),
        }
    }
}

/// Durable record of a re-provisioning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the configuration.
    pub config_hash: String,

    /// Database being re-provisioned.
    pub database: String,

    /// Temporary database holding the data while the source is recreated.
    pub temp_database: String,

    /// Last phase that completed.
    pub phase: Phase,

    /// Current run status.
    pub status: RunStatus,

    /// Containers listed from the source database.
    #[serde(default)]
    pub source_containers: Vec<ContainerDescriptor>,

    /// Containers listed from the temporary database.
    #[serde(default)]
    pub temp_containers: Vec<ContainerDescriptor>,

    #[serde(default)]
    pub source_to_temp: PassSummary,

    #[serde(default)]
    pub temp_to_final: PassSummary,

    /// Copy pass that started but has not completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_in_progress: Option<Phase>,

    /// Sample of rejected documents, at most [`MAX_FAILED_DOCUMENTS`].
    #[serde(default)]
    pub failed_documents: Vec<FailedDocument>,

    /// Throughput applied to the recreated database.
    pub final_throughput: Option<u32>,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run finished (if it has).
    pub completed_at: Option<DateTime<Utc>>,

    /// Last error, if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// HMAC-SHA256 over the serialized state (excluding this field), keyed
    /// with `config_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl MigrationState {
    pub fn new(
        run_id: String,
        config_hash: String,
        database: impl Into<String>,
        temp_database: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            config_hash,
            database: database.into(),
            temp_database: temp_database.into(),
            phase: Phase::Start,
            status: RunStatus::Running,
            source_containers: Vec::new(),
            temp_containers: Vec::new(),
            source_to_temp: PassSummary::default(),
            temp_to_final: PassSummary::default(),
            pass_in_progress: None,
            failed_documents: Vec::new(),
            final_throughput: None,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)?;
        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| ReprovisionError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load state from a file and verify its signature.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;

        match state.hmac {
            Some(ref stored) if *stored == state.compute_hmac()? => Ok(state),
            Some(_) => Err(ReprovisionError::State(
                "State file integrity check failed: HMAC mismatch (possible tampering)".into(),
            )),
            None => Err(ReprovisionError::State(
                "State file has no HMAC signature".into(),
            )),
        }
    }

    /// Sign and save state (atomic write).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(ReprovisionError::ConfigChanged);
        }
        Ok(())
    }

    /// Fail unless the run can be continued.
    pub fn ensure_resumable(&self) -> Result<()> {
        if self.status == RunStatus::Completed || self.phase == Phase::Done {
            return Err(ReprovisionError::NotResumable(format!(
                "run {} already completed",
                self.run_id
            )));
        }
        Ok(())
    }

    pub fn reached(&self, phase: Phase) -> bool {
        self.phase >= phase
    }

    /// Record that `phase` completed. Never moves backwards.
    pub fn advance(&mut self, phase: Phase) {
        if phase > self.phase {
            self.phase = phase;
        }
        if self.pass_in_progress == Some(phase) {
            self.pass_in_progress = None;
        }
    }

    /// Start the copy pass that completes `pass`, discarding the counters
    /// and failures of any earlier attempt at it.
    ///
    /// Returns `true` when an earlier attempt was interrupted, in which case
    /// some documents may already be in the destination.
    pub fn begin_pass(&mut self, pass: Phase) -> bool {
        let restarted = self.pass_in_progress == Some(pass);
        match pass {
            Phase::CopiedSourceToTemp => self.source_to_temp = PassSummary::default(),
            Phase::CopiedTempToFinal => self.temp_to_final = PassSummary::default(),
            _ => {}
        }
        self.failed_documents.retain(|f| f.pass != pass);
        self.pass_in_progress = Some(pass);
        restarted
    }

    /// Fail unless `phase` has completed; guards irreversible steps.
    pub fn ensure_reached(&self, phase: Phase, action: &str) -> Result<()> {
        if !self.reached(phase) {
            return Err(ReprovisionError::State(format!(
                "refusing to {}: phase {} has not completed (last completed: {})",
                action, phase, self.phase
            )));
        }
        Ok(())
    }

    /// Keep rejected documents from one container, up to the cap.
    pub fn record_failures(&mut self, pass: Phase, outcome: &CopyOutcome) {
        let room = MAX_FAILED_DOCUMENTS.saturating_sub(self.failed_documents.len());
        self.failed_documents.extend(
            outcome
                .failures
                .iter()
                .take(room)
                .map(|f| FailedDocument::from_failure(pass, &outcome.destination, f)),
        );
    }

    pub fn documents_failed(&self) -> usize {
        self.source_to_temp.documents_failed + self.temp_to_final.documents_failed
    }

    pub fn mark_completed(&mut self) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = RunStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }

    /// Put a failed run back in the running state for resume.
    pub fn mark_resumed(&mut self) {
        self.status = RunStatus::Running;
        self.error = None;
        self.completed_at = None;
    }
}
