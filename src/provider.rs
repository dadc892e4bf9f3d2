use std::future::Future;

use tokio::sync::broadcast;

use crate::error::{BoxError, ProviderError};
use crate::types::{Role, Session, SessionEvent, UserId};

/// Change notification from the identity provider.
pub type SessionChange = (SessionEvent, Option<Session>);

/// Remote identity provider consumed by the resolver.
///
/// Every call is network-bound and may be arbitrarily slow; the resolver
/// races each one against its own timer and never cancels it.
///
/// # Example
///
/// ```rust,ignore
/// impl IdentityProvider for MyProvider {
///     async fn current_session(&self) -> Result<Option<Session>, ProviderError> {
///         self.client.get_session().await.map_err(|e| ProviderError::Unavailable(e.to_string()))
///     }
///     // ...
/// }
/// ```
pub trait IdentityProvider: Send + Sync + 'static {
    /// The provider's current session, `None` when signed out.
    fn current_session(
        &self,
    ) -> impl Future<Output = Result<Option<Session>, ProviderError>> + Send;

    /// Exchange the held credential for a fresh session.
    fn refresh_session(&self) -> impl Future<Output = Result<Session, ProviderError>> + Send;

    /// Consume a credential delivered inline in the URL fragment
    /// (magic link, OAuth implicit redirect).
    fn consume_url_credential(
        &self,
        fragment: &str,
    ) -> impl Future<Output = Result<Option<Session>, ProviderError>> + Send;

    /// Revoke the session remotely.
    fn sign_out(&self) -> impl Future<Output = Result<(), ProviderError>> + Send;

    /// Subscribe to session changes made outside the resolver
    /// (another tab, token auto-refresh, remote revocation).
    fn session_changes(&self) -> broadcast::Receiver<SessionChange>;
}

/// Remote profile store holding each user's role.
pub trait ProfileStore: Send + Sync + 'static {
    /// The user's role, `None` when none has been chosen.
    fn get_role(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Option<Role>, BoxError>> + Send;

    fn set_role(
        &self,
        user_id: &UserId,
        role: Role,
    ) -> impl Future<Output = Result<(), BoxError>> + Send;
}
