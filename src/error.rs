//! Error types for the Hangar operator
//!
//! Every failure is classified into an [`ErrorKind`] so the reconcilers can
//! tell expected "retry later" conditions apart from real failures without
//! inspecting concrete variants.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Optimistic concurrency conflict on {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Conflict retries exhausted for {kind}/{name}")]
    ConflictRetriesExhausted { kind: String, name: String },

    // =========================================================================
    // Sentinel Errors (expected, retried silently)
    // =========================================================================
    #[error("Load balancer for {service} is not yet exposed")]
    LoadBalancerNotReady { service: String },

    #[error("Control plane address for {tenant} is not yet assigned")]
    AddressNotAssigned { tenant: String },

    #[error("Datastore migration for {tenant} is in progress")]
    MigrationInProgress { tenant: String },

    #[error("Control plane of {tenant} is not ready yet")]
    ControlPlaneNotReady { tenant: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Missing prerequisite for {resource}: {reason}")]
    MissingPrerequisite { resource: String, reason: String },

    #[error("Invalid tenant specification: {0}")]
    InvalidSpec(String),

    #[error("Invalid identifier {0:?}: only lowercase letters, digits and underscores are allowed")]
    InvalidIdentifier(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    // =========================================================================
    // Datastore Errors
    // =========================================================================
    #[error("Datastore {datastore} unavailable: {reason}")]
    DatastoreUnavailable { datastore: String, reason: String },

    #[error("Datastore operation failed: {driver} - {operation}: {reason}")]
    DatastoreOperation {
        driver: String,
        operation: String,
        reason: String,
    },

    #[error("Datastore operation timed out: {driver} - {operation}")]
    DatastoreTimeout { driver: String, operation: String },

    #[error("Migration failed for {tenant}: {reason}")]
    MigrationFailed { tenant: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification driving the reconciler's failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected condition; requeue silently
    Sentinel,
    /// Remote state could not be read or written
    Remote,
    /// Input or stored material is invalid; surfaced to the user
    Validation,
    /// Optimistic concurrency conflict
    Conflict,
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::LoadBalancerNotReady { .. }
            | Error::AddressNotAssigned { .. }
            | Error::MigrationInProgress { .. }
            | Error::ControlPlaneNotReady { .. } => ErrorKind::Sentinel,

            Error::Conflict { .. } => ErrorKind::Conflict,

            Error::Configuration(_)
            | Error::MissingPrerequisite { .. }
            | Error::InvalidSpec(_)
            | Error::InvalidIdentifier(_)
            | Error::Certificate(_)
            | Error::Kubeconfig(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorKind::Validation,

            _ => ErrorKind::Remote,
        }
    }

    /// Whether this error only signals "not yet, try again later"
    pub fn is_sentinel(&self) -> bool {
        self.kind() == ErrorKind::Sentinel
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::LoadBalancerNotReady { .. }
            | Error::AddressNotAssigned { .. }
            | Error::ControlPlaneNotReady { .. } => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            Error::MigrationInProgress { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(10))
            }

            // Prerequisites are produced by earlier resources in the pipeline
            Error::MissingPrerequisite { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(5))
            }

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_) | Error::InvalidSpec(_) | Error::InvalidIdentifier(_) => {
                ErrorAction::NoRequeue
            }

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    pub(crate) fn datastore(driver: impl ToString, operation: &str, err: impl ToString) -> Self {
        Error::DatastoreOperation {
            driver: driver.to_string(),
            operation: operation.to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn missing(resource: &str, reason: impl Into<String>) -> Self {
        Error::MissingPrerequisite {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_classification() {
        let sentinels = [
            Error::LoadBalancerNotReady {
                service: "tenant-a".into(),
            },
            Error::AddressNotAssigned {
                tenant: "tenant-a".into(),
            },
            Error::MigrationInProgress {
                tenant: "tenant-a".into(),
            },
            Error::ControlPlaneNotReady {
                tenant: "tenant-a".into(),
            },
        ];
        for err in &sentinels {
            assert!(err.is_sentinel(), "{err} should be a sentinel");
            assert_ne!(err.action(), ErrorAction::NoRequeue);
        }

        let fatal = Error::DatastoreUnavailable {
            datastore: "default".into(),
            reason: "connection refused".into(),
        };
        assert!(!fatal.is_sentinel());
        assert_eq!(fatal.kind(), ErrorKind::Remote);
    }

    #[test]
    fn test_error_actions() {
        let err = Error::MigrationInProgress {
            tenant: "ns/tenant".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(10))
        );

        let err = Error::InvalidSpec("downgrade".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = Error::Conflict {
            kind: "Secret".into(),
            name: "ca".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
    }

    #[test]
    fn test_error_requeue() {
        let config_err = Error::Configuration("invalid".into());
        assert_eq!(config_err.action(), ErrorAction::NoRequeue);

        let missing = Error::missing("apiserver-certificate", "CA secret not yet recorded");
        assert_eq!(missing.action(), ErrorAction::RequeueAfter(Duration::from_secs(5)));
        assert_eq!(missing.kind(), ErrorKind::Validation);
    }
}
