use crate::codec::CodecError;
use crate::job::{JobState, ProviderKind};
use crate::poller::PollError;
use crate::provider::ProviderError;
use crate::store::StoreError;
use crate::transfer::TransferError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Failure taxonomy shared by every component. Each concrete error maps to
/// exactly one kind so retry decisions never depend on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Transient,
    PermissionDenied,
    AuthFailure,
    OperationFailed,
    Timeout,
    TransferFailed,
    IntegrityMismatch,
    ConversionFailed,
    DuplicateInProgress,
    InvalidIdentifier,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Whether the orchestrator may re-enter the failed step.
    ///
    /// `IntegrityMismatch` is retryable here; the orchestrator caps it with
    /// `max_integrity_retries` before escalating.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient
                | ErrorKind::Timeout
                | ErrorKind::TransferFailed
                | ErrorKind::IntegrityMismatch
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transient => "transient",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::AuthFailure => "auth_failure",
            ErrorKind::OperationFailed => "operation_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransferFailed => "transfer_failed",
            ErrorKind::IntegrityMismatch => "integrity_mismatch",
            ErrorKind::ConversionFailed => "conversion_failed",
            ErrorKind::DuplicateInProgress => "duplicate_in_progress",
            ErrorKind::InvalidIdentifier => "invalid_identifier",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the migration orchestrator and its public API.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("VM '{vm}' on {provider} is already being migrated by job {holder}")]
    DuplicateInProgress {
        vm: String,
        provider: ProviderKind,
        holder: Uuid,
    },

    #[error("Provider unreachable: {0}")]
    ProviderUnreachable(String),

    #[error("Invalid VM identifier: {0}")]
    InvalidIdentifier(String),

    #[error("No adapter registered for provider {0}")]
    AdapterMissing(ProviderKind),

    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Job {0} failed with a permanent error and cannot be retried")]
    NotRetryable(Uuid),

    #[error("Job {job_id} cannot {action} while in state {state}")]
    InvalidState {
        job_id: Uuid,
        state: JobState,
        action: &'static str,
    },

    #[error("Job {job_id} gave up on {state} after {attempts} retries")]
    RetriesExhausted {
        job_id: Uuid,
        state: JobState,
        attempts: u32,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::DuplicateInProgress { .. } => ErrorKind::DuplicateInProgress,
            MigrationError::ProviderUnreachable(_) => ErrorKind::Transient,
            MigrationError::InvalidIdentifier(_) => ErrorKind::InvalidIdentifier,
            MigrationError::AdapterMissing(_) | MigrationError::ConfigError(_) => {
                ErrorKind::Internal
            }
            MigrationError::JobNotFound(_) => ErrorKind::NotFound,
            MigrationError::NotRetryable(_) | MigrationError::InvalidState { .. } => {
                ErrorKind::Internal
            }
            MigrationError::RetriesExhausted { .. } => ErrorKind::Internal,
            MigrationError::Provider(err) => err.kind(),
            MigrationError::Poll(err) => err.kind(),
            MigrationError::Transfer(err) => err.kind(),
            MigrationError::Codec(_) => ErrorKind::ConversionFailed,
            MigrationError::Store(_) | MigrationError::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<toml::de::Error> for MigrationError {
    fn from(err: toml::de::Error) -> Self {
        MigrationError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::IntegrityMismatch.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::PermissionDenied.is_retryable());
        assert!(!ErrorKind::AuthFailure.is_retryable());
        assert!(!ErrorKind::OperationFailed.is_retryable());
        assert!(!ErrorKind::ConversionFailed.is_retryable());
    }

    #[test]
    fn provider_errors_keep_their_kind() {
        let err: MigrationError = ProviderError::PermissionDenied("ec2:StopInstances".into()).into();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(!err.is_retryable());
    }
}
