use thiserror::Error;

/// Errors surfaced by the registry, projects and credential providers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectError {
    #[error("invalid project name: {0:?}")]
    InvalidProjectName(String),

    #[error("failed to open metadata store: {0}")]
    StoreOpen(String),

    #[error("metadata store error: {0}")]
    Store(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("persistence is not available for this project")]
    PersistenceNotAvailable,

    #[error("no provider bound: {0}")]
    NoProviderBound(String),

    /// The provider was reached but issuing credentials failed.
    #[error("request for credentials failed: {0}")]
    CredentialRequest(String),

    #[error("secrets are already stored locally, no secrets bucket is used")]
    SecretStorageAlreadySet,

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("filesystem quota exceeded: {used} + {requested} bytes > {max} bytes")]
    QuotaExceeded { used: u64, requested: u64, max: u64 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ProjectError {
    /// Errors callers are expected to treat as a no-op rather than a failure.
    pub fn is_benign(&self) -> bool {
        matches!(self, ProjectError::SecretStorageAlreadySet)
    }

    /// Whether this error means "the caller's request for credentials failed"
    /// as opposed to "no credentials can be provided at all".
    pub fn is_credential_request_failure(&self) -> bool {
        matches!(self, ProjectError::CredentialRequest(_))
    }
}

impl From<serde_json::Error> for ProjectError {
    fn from(e: serde_json::Error) -> Self {
        ProjectError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_classification() {
        assert!(ProjectError::SecretStorageAlreadySet.is_benign());
        assert!(!ProjectError::PersistenceNotAvailable.is_benign());
        assert!(ProjectError::CredentialRequest("boom".into()).is_credential_request_failure());
        assert!(!ProjectError::NoProviderBound("cloudflare".into()).is_credential_request_failure());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = ProjectError::ProjectNotFound("blog-0123456789abcdef".into());
        assert!(err.to_string().contains("blog-0123456789abcdef"));

        let err = ProjectError::QuotaExceeded {
            used: 10,
            requested: 5,
            max: 12,
        };
        assert_eq!(
            err.to_string(),
            "filesystem quota exceeded: 10 + 5 bytes > 12 bytes"
        );
    }
}
