//! Error types for the re-provisioning library.

use thiserror::Error;

/// Main error type for re-provisioning operations.
#[derive(Error, Debug)]
pub enum ReprovisionError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The store answered an administrative or read request with a failure status
    #[error("Store error ({status}): {message}\n  Context: {context}")]
    Store {
        status: u16,
        message: String,
        context: String,
    },

    /// Transport-level failure talking to the store
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Reading a page of documents failed
    #[error("Pagination failed for container {container}: {message}")]
    Pagination { container: String, message: String },

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Start a new run instead.")]
    ConfigChanged,

    /// The state file does not describe a run that can be continued
    #[error("Run cannot be resumed: {0}")]
    NotResumable(String),

    /// Documents failed to copy and the caller asked for that to be fatal
    #[error("{failed} of {submitted} document writes failed")]
    DocumentLoss { failed: usize, submitted: usize },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub const EXIT_CONFIG_ERROR: u8 = 1;
pub const EXIT_STORE_ERROR: u8 = 2;
pub const EXIT_READ_ERROR: u8 = 3;
pub const EXIT_STATE_ERROR: u8 = 4;
pub const EXIT_DOCUMENT_LOSS: u8 = 5;
pub const EXIT_SERIALIZATION_ERROR: u8 = 6;
pub const EXIT_IO_ERROR: u8 = 7;

impl ReprovisionError {
    /// Create a Store error with context about which request failed
    pub fn store(status: u16, message: impl Into<String>, context: impl Into<String>) -> Self {
        ReprovisionError::Store {
            status,
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Pagination error
    pub fn pagination(container: impl Into<String>, message: impl Into<String>) -> Self {
        ReprovisionError::Pagination {
            container: container.into(),
            message: message.into(),
        }
    }

    /// HTTP status behind this error, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Store { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Yaml(_) | Self::ConfigChanged => EXIT_CONFIG_ERROR,
            Self::Store { .. } | Self::Http(_) => EXIT_STORE_ERROR,
            Self::Pagination { .. } => EXIT_READ_ERROR,
            Self::State(_) | Self::NotResumable(_) => EXIT_STATE_ERROR,
            Self::DocumentLoss { .. } => EXIT_DOCUMENT_LOSS,
            Self::Json(_) => EXIT_SERIALIZATION_ERROR,
            Self::Io(_) => EXIT_IO_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for re-provisioning operations.
pub type Result<T> = std::result::Result<T, ReprovisionError>;
