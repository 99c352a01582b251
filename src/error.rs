//! Error types for the vSphere cloud operator
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the context an operator needs: the configuration option,
//! the requested release, or the resource identity being acted upon.
//!
//! Two variants deserve special handling by callers:
//! - [`Error::NotReady`] is a blocking precondition, not a failure. The
//!   caller surfaces it as a "waiting" status and skips reconciliation.
//! - [`Error::ClusterOp`] carries a `retryable` flag distinguishing
//!   transient API failures (retried with backoff) from terminal ones.

use thiserror::Error;

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// A required input is missing from both config and relation data.
    ///
    /// Not an operator-facing failure: reconciliation must wait for the
    /// missing input to arrive.
    #[error("not ready: {message}")]
    NotReady {
        /// Which input is missing and where it is expected from
        message: String,
    },

    /// A configuration option has a malformed value
    #[error("invalid config [{option}]: {message}")]
    InvalidConfig {
        /// Name of the offending option (e.g., "control-node-selector")
        option: String,
        /// Description of what's malformed
        message: String,
    },

    /// A requested release version is absent from the catalog
    #[error("unknown {component} release {requested:?}, available: {available:?}")]
    UnknownRelease {
        /// Component whose catalog was queried (provider or storage)
        component: String,
        /// The version that was requested
        requested: String,
        /// Versions the catalog actually contains
        available: Vec<String>,
    },

    /// Template substitution failed during rendering
    ///
    /// Fatal for the reconciliation attempt: a partially substituted
    /// manifest is never applied.
    #[error("render error for {resource}: {message}")]
    Render {
        /// Identity of the resource being rendered
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// A cluster apply/delete operation failed
    #[error("cluster operation failed for {identity}: {message}")]
    ClusterOp {
        /// Identity of the resource being acted upon
        identity: String,
        /// Description of what failed
        message: String,
        /// Whether the failure is transient and worth retrying
        retryable: bool,
    },

    /// Applied-state persistence failed
    #[error("state store error [{scope}]: {message}")]
    State {
        /// Scope whose state was being read or written
        scope: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The reconciliation attempt was superseded by a newer triggering event
    ///
    /// Not a failure: the attempt stopped cleanly between cluster
    /// operations and defers to the newer event's attempt.
    #[error("reconciliation superseded by a newer event")]
    Superseded,
}

impl Error {
    /// Create a not-ready error for a missing required input
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady {
            message: msg.into(),
        }
    }

    /// Create an invalid-config error for the given option
    pub fn invalid_config(option: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidConfig {
            option: option.into(),
            message: msg.into(),
        }
    }

    /// Create a render error for the given resource
    pub fn render(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Render {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a cluster operation error
    pub fn cluster_op(
        identity: impl Into<String>,
        msg: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::ClusterOp {
            identity: identity.into(),
            message: msg.into(),
            retryable,
        }
    }

    /// Create a state store error for the given scope
    pub fn state(scope: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::State {
            scope: scope.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with the resource kind
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Whether this error represents a blocking "waiting" state rather
    /// than a failure
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }

    /// Whether this error is transient and worth retrying
    ///
    /// Kubernetes API errors are classified by status code: throttling and
    /// server-side failures are transient, client errors are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ClusterOp { retryable, .. } => *retryable,
            Self::Kube { source } => kube_error_is_retryable(source),
            _ => false,
        }
    }
}

/// Classify a kube-rs error as transient or terminal
///
/// Connection-level failures and HTTP 408/429/5xx are transient. Anything
/// the API server rejected outright (4xx other than throttling) is not.
pub fn kube_error_is_retryable(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => matches!(resp.code, 408 | 429 | 500 | 502 | 503 | 504),
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_is_waiting() {
        let err = Error::not_ready("waiting for definition of server");
        assert!(err.is_waiting());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cluster_op_retryable_flag() {
        let transient = Error::cluster_op("DaemonSet/kube-system/x", "timeout", true);
        let terminal = Error::cluster_op("DaemonSet/kube-system/x", "forbidden", false);
        assert!(transient.is_retryable());
        assert!(!terminal.is_retryable());
    }

    #[test]
    fn test_api_error_classification() {
        let resp = kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "too many requests".to_string(),
            reason: "TooManyRequests".to_string(),
            code: 429,
        };
        assert!(kube_error_is_retryable(&kube::Error::Api(resp)));

        let resp = kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        };
        assert!(!kube_error_is_retryable(&kube::Error::Api(resp)));
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::invalid_config("control-node-selector", "empty key in token '=x'");
        assert_eq!(
            err.to_string(),
            "invalid config [control-node-selector]: empty key in token '=x'"
        );
    }
}
