//! Error types for the Deployment Service controller

use thiserror::Error;

/// Result type alias using the controller's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Controller error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Object does not exist in the resource store
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Object already exists in the resource store
    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    /// Write was rejected because it carried a stale resource version
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Watch resource version is no longer available
    #[error("Resource version too old: {0}")]
    Gone(String),

    /// Backend call failed in a way that may succeed on retry
    #[error("Transient backend failure: {0}")]
    Transient(String),

    /// Backend call exceeded its deadline
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Desired state could not be derived from the observed object
    #[error("Malformed object: {0}")]
    Malformed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Manifest error
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Background task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a malformed object error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    /// Create a transient backend error
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    /// Create a manifest error
    pub fn manifest(msg: impl Into<String>) -> Self {
        Error::Manifest(msg.into())
    }

    /// The object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// A create hit an object that is already there
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409 && resp.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// An update lost an optimistic concurrency race
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409 && resp.reason == "Conflict",
            _ => false,
        }
    }

    /// A watch was requested from a compacted resource version
    pub fn is_gone(&self) -> bool {
        match self {
            Error::Gone(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 410,
            _ => false,
        }
    }

    /// Whether retrying the same request could change the outcome.
    ///
    /// Every API server rejection other than "already exists" is retried.
    /// A malformed derivation never is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transient(_)
            | Error::Timeout(_)
            | Error::Conflict(_)
            | Error::Gone(_)
            | Error::NotFound(_) => true,
            Error::AlreadyExists(_)
            | Error::Malformed(_)
            | Error::Config(_)
            | Error::Manifest(_)
            | Error::Yaml(_)
            | Error::Task(_) => false,
            Error::Kube(kube::Error::Api(resp)) => {
                !(resp.code == 409 && resp.reason == "AlreadyExists")
            }
            Error::Kube(_) | Error::Io(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} error", reason),
            reason: reason.to_string(),
            code,
        }))
    }

    #[test]
    fn test_kube_status_codes_are_classified() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(api_error(409, "AlreadyExists").is_already_exists());
        assert!(!api_error(409, "AlreadyExists").is_conflict());
        assert!(api_error(409, "Conflict").is_conflict());
        assert!(api_error(410, "Expired").is_gone());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::transient("connection reset").is_retryable());
        assert!(Error::Timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(Error::Conflict("stale".to_string()).is_retryable());
        assert!(api_error(500, "InternalError").is_retryable());
        assert!(api_error(429, "TooManyRequests").is_retryable());
        assert!(api_error(409, "Conflict").is_retryable());
        assert!(api_error(403, "Forbidden").is_retryable());
        assert!(api_error(401, "Unauthorized").is_retryable());
        assert!(api_error(422, "Invalid").is_retryable());
        assert!(api_error(404, "NotFound").is_retryable());

        assert!(!Error::malformed("no labels").is_retryable());
        assert!(!Error::AlreadyExists("default/app".to_string()).is_retryable());
        assert!(!api_error(409, "AlreadyExists").is_retryable());
        assert!(!Error::config("zero workers").is_retryable());
    }
}
