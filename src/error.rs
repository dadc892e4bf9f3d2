use std::time::Duration;

/// Error type returned by consumer-implemented stores.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure reported by an [`IdentityProvider`](crate::IdentityProvider) call.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// Network failure or provider outage.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its time budget.
    #[error("identity provider timed out after {0:?}")]
    Timeout(Duration),

    /// The provider answered, but refused the credential.
    #[error("credential rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Explicit refresh exhausted every recovery path.
    #[error("authentication unavailable: identity provider unreachable and no recent session")]
    AuthUnavailable,

    /// Operation requires an authenticated session.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// A user-initiated role assignment was not persisted.
    #[error("Role assignment failed: {0}")]
    RoleAssignmentFailed(String),

    /// String is not one of the known roles.
    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Identity provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Credential store read or write failed.
    #[error("Credential store error: {0}")]
    Store(String),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
