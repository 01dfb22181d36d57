//! Error types for minishard

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Coordination Errors ===
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Transaction aborted at op {index}: {reason}")]
    TransactionAborted { index: usize, reason: String },

    #[error("Session expired: {0}")]
    SessionExpired(u64),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Job config not found: {0}")]
    ConfigNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Job Errors ===
    #[error("Job not registered: {0}")]
    JobNotRegistered(String),

    #[error("Trigger failed for {instance_id}: {reason}")]
    Trigger { instance_id: String, reason: String },

    #[error("Job execution failed: {0}")]
    Execution(String),

    #[error("Job {0} is shutting down")]
    Shutdown(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Transient coordination failures are; anything the caller did wrong,
    /// or a job that is going away, is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CoordinationUnavailable(_) | Error::TransactionAborted { .. }
        )
    }

    /// True when the error only means the job was stopped mid-wait.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown(_))
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}
