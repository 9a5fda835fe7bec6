//! Keel operator error abstractions.

use std::time::Duration;

use crate::cluster::ClusterIdentity;

/// An error from an operation against the orchestration platform.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The requested resource does not exist (yet).
    #[error("{kind} {namespace}/{name} not found")]
    NotFound { kind: String, namespace: String, name: String },
    /// The platform did not answer in time.
    #[error("timeout while {0}")]
    Timeout(String),
    /// The platform rejected or failed the request.
    #[error("error {context}: {source}")]
    Api {
        context: String,
        #[source]
        source: kube::Error,
    },
    /// A resource could not be (de)serialized or is missing required fields.
    #[error("invalid resource: {0}")]
    Invalid(String),
}

impl PlatformError {
    pub fn not_found(kind: impl ToString, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// An error from the administrative query interface of a managed cluster.
///
/// Errors are `Clone + PartialEq` so that a failure observed while deciding on a restart can be
/// propagated to every caller unchanged.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AdminError {
    /// The query did not complete in time.
    #[error("admin query timed out: {0}")]
    Timeout(String),
    /// The queried topic or resource does not exist.
    #[error("admin resource not found: {0}")]
    NotFound(String),
    /// A config value returned by the cluster could not be parsed.
    #[error("invalid value {value:?} for config {key} of topic {topic}")]
    InvalidConfig { topic: String, key: String, value: String },
    /// No administrative client is available to this operator.
    #[error("admin client unavailable: {0}")]
    Unavailable(String),
    /// Any other failure of the administrative interface.
    #[error("admin query failed: {0}")]
    Other(String),
}

/// An error aborting a reconciliation flow.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("error deciding whether broker {broker} may restart: {source}")]
    Admin {
        broker: i32,
        #[source]
        source: AdminError,
    },
    /// Another flow holds the lock of the cluster.
    #[error("timeout after {1:?} while acquiring lock of {0}")]
    LockTimeout(ClusterIdentity, Duration),
    /// A broker did not become safe to restart before the deadline.
    #[error("broker {broker} did not become safe to restart within {deadline:?}")]
    RollDeadline { broker: i32, deadline: Duration },
    /// A wait on the platform exceeded the operation timeout.
    #[error("timeout while {0}")]
    Timeout(String),
    /// The declaring resource failed validation.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
}

impl OperationError {
    /// Whether the failure is expected to clear up by itself on a later pass.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout(..) | Self::RollDeadline { .. } | Self::Timeout(_) | Self::Platform(PlatformError::Timeout(_)) | Self::Admin { source: AdminError::Timeout(_), .. }
        )
    }

    /// A machine readable reason for status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Platform(_) => "PlatformError",
            Self::Admin { .. } => "AdminQueryFailed",
            Self::LockTimeout(..) => "LockTimeout",
            Self::RollDeadline { .. } => "RollDeadlineExceeded",
            Self::Timeout(_) => "Timeout",
            Self::InvalidSpec(_) => "InvalidSpec",
        }
    }
}

/// A result type used by the reconciliation flows.
pub type OperationResult<T> = ::std::result::Result<T, OperationError>;
