//! Error types for datalake-control.
//!
//! [`ControlError`] is the taxonomy surfaced to callers of submission and
//! reconciliation. [`ProviderError`] describes what went wrong while talking
//! to a cloud provider through the provisioning tool; it only ever reaches
//! callers wrapped in [`ControlError::Provider`] or as the cause string of a
//! failed deployment record.

use std::time::Duration;

use crate::types::ResourceDescriptor;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The request is malformed or the project is not eligible.
    #[error("validation error: {0}")]
    Validation(String),

    /// The request conflicts with the project's current deployment.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The deploy type is unknown or the registry cannot serve it.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A referenced entity does not exist or is not visible to the caller.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity ("project", "credentials", "deployment").
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Provisioning against the cloud provider failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The persisted record was not in the state a transition expected.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Job queue error.
    #[error("queue error: {0}")]
    Queue(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Service configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a conflict error.
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a configuration error.
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Create a queue error.
    #[must_use]
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error belongs to the infrastructure the worker depends on
    /// (database, queue) rather than to the job itself.
    ///
    /// Jobs that fail this way are handed back to the queue for redelivery.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Queue(_) | Self::Internal(_))
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialisation(err.to_string())
    }
}

impl From<figment::Error> for ControlError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Errors raised while provisioning or tearing down cloud resources.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The provisioning tool exited unsuccessfully.
    #[error("{operation} failed (exit code {exit_code:?}): {stderr}")]
    CommandFailed {
        /// Tool operation that failed (init, apply, destroy, output).
        operation: &'static str,
        /// Process exit code, absent when killed by a signal.
        exit_code: Option<i32>,
        /// Tail of the tool's standard error.
        stderr: String,
    },

    /// The provisioning tool could not be started.
    #[error("failed to spawn {binary}: {message}")]
    Spawn {
        /// Binary that was executed.
        binary: String,
        /// Underlying I/O error.
        message: String,
    },

    /// A tool operation exceeded its time limit.
    #[error("{operation} timed out after {limit:?}")]
    Timeout {
        /// Tool operation that timed out.
        operation: &'static str,
        /// Configured limit.
        limit: Duration,
    },

    /// The tool succeeded but an expected output was not produced.
    #[error("missing output {0}")]
    MissingOutput(String),

    /// Output from the tool could not be parsed.
    #[error("malformed tool output: {0}")]
    MalformedOutput(String),

    /// Credentials do not belong to the provider the deploy type targets.
    #[error("credentials for {found} cannot be used with {expected}")]
    CredentialMismatch {
        /// Provider the deploy type targets.
        expected: &'static str,
        /// Provider the credentials belong to.
        found: &'static str,
    },

    /// A resource descriptor did not carry an attribute needed for teardown.
    #[error("resource descriptor is missing {resource}.{attribute}")]
    IncompleteDescriptor {
        /// Logical resource name.
        resource: String,
        /// Missing attribute.
        attribute: String,
    },

    /// The working directory could not be prepared.
    #[error("workspace error: {0}")]
    Workspace(String),

    /// The workspace has no provisioning state for the deployment.
    ///
    /// Raised by teardown when the deployment was provisioned with local
    /// state on another host; destroying from here would remove nothing.
    #[error("no provisioning state in {dir}; run teardown where it was provisioned")]
    StateUnavailable {
        /// Workspace that was searched.
        dir: String,
    },
}

impl ProviderError {
    /// Whether the failure indicates the target resource is already gone.
    ///
    /// Teardown treats this as success.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        const MARKERS: [&str; 6] = [
            "not found",
            "notfound",
            "error 404",
            "nosuchbucket",
            "resourcenotfoundexception",
            "does not exist",
        ];

        match self {
            Self::CommandFailed { stderr, .. } => {
                let stderr = stderr.to_lowercase();
                MARKERS.iter().any(|marker| stderr.contains(marker))
            }
            _ => false,
        }
    }
}

/// A failed provisioning attempt together with whatever it managed to create.
#[derive(Debug, Clone)]
pub struct ProvisionFailure {
    /// What went wrong.
    pub error: ProviderError,
    /// Resources confirmed created before the failure.
    pub partial: ResourceDescriptor,
}

impl ProvisionFailure {
    /// Create a failure with the resources created so far.
    #[must_use]
    pub const fn new(error: ProviderError, partial: ResourceDescriptor) -> Self {
        Self { error, partial }
    }

    /// Resources left behind, if any.
    #[must_use]
    pub fn orphans(&self) -> Option<&ResourceDescriptor> {
        (!self.partial.is_empty()).then_some(&self.partial)
    }
}

impl std::fmt::Display for ProvisionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}
