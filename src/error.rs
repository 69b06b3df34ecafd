//! Error types for the DBaaS control plane

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// Result type alias using the control plane's Error type
pub type Result<T> = std::result::Result<T, Error>;

lazy_static! {
    /// The operator API group exists but the credentials may not touch it
    static ref OPERATOR_FORBIDDEN: Regex = Regex::new(r".*\.percona\.com is forbidden").unwrap();

    /// The database custom resources are not registered in the cluster
    static ref RESOURCE_TYPE_MISSING: Regex = Regex::new(
        r#"the server doesn't have a resource type "(PerconaXtraDBCluster|PerconaServerMongoDB|DatabaseCluster)""#
    )
    .unwrap();
}

/// Control plane error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubeconfig could not be turned into a client configuration
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// Version service transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing cluster, registration or record
    #[error("Not found: {0}")]
    NotFound(String),

    /// A registration with the same key already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Malformed request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is valid but the current state forbids it
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// A bounded wait ran out
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Forbidden or unknown resource type, treated as an absent feature
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Version string that cannot be compared
    #[error("Invalid version '{version}': {source}")]
    Version {
        version: String,
        #[source]
        source: semver::Error,
    },

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Anything the caller can not act upon
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create a precondition-failed error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::PreconditionFailed(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// True for missing objects, both local and on the Kubernetes API.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// True when the error means "the feature is not available in this
    /// cluster" rather than a real failure.
    pub fn is_access_error(&self) -> bool {
        match self {
            Error::AccessDenied(_) => true,
            Error::Kube(kube::Error::Api(resp)) if resp.code == 403 => {
                OPERATOR_FORBIDDEN.is_match(&resp.message)
            }
            other => is_access_message(&other.to_string()),
        }
    }
}

/// Match an error message against the known access-denied shapes.
pub fn is_access_message(message: &str) -> bool {
    OPERATOR_FORBIDDEN.is_match(message) || RESOURCE_TYPE_MISSING.is_match(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, message: &str) -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: String::new(),
            code,
        }))
    }

    #[test]
    fn test_not_found_classification() {
        assert!(Error::not_found("cluster").is_not_found());
        assert!(api_error(404, "databaseclusters \"a\" not found").is_not_found());
        assert!(!api_error(500, "boom").is_not_found());
        assert!(!Error::internal("boom").is_not_found());
    }

    #[test]
    fn test_access_error_classification() {
        assert!(api_error(
            403,
            "perconaxtradbclusters.pxc.percona.com is forbidden: User cannot list resource"
        )
        .is_access_error());
        assert!(Error::internal(
            "the server doesn't have a resource type \"PerconaServerMongoDB\""
        )
        .is_access_error());
        assert!(!api_error(403, "pods is forbidden").is_access_error());
        assert!(!Error::internal("connection refused").is_access_error());
    }
}
