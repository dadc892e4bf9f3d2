use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::ResolverConfig;
use crate::error::Error;
use crate::provider::{IdentityProvider, ProfileStore};
use crate::race::{Raced, race};
use crate::resolver::{CachedCheck, SessionResolver};
use crate::role::{RoleLookup, RoleResolver};
use crate::state::{AuthStateCell, Subscription};
use crate::store::CredentialStore;
use crate::types::{AuthState, Role, UserId};

/// The client's single source of authentication state.
///
/// Construct once at process start and hand out by reference; consumers
/// read snapshots, subscribe to transitions, and ask for checks, refreshes,
/// sign-out and role changes. Must be used inside a Tokio runtime.
///
/// ```rust,ignore
/// let auth = AuthStateMachine::new(ResolverConfig::from_env()?, provider, profiles, store);
/// auth.start();
/// auth.initialize(Some(&current_url)).await;
///
/// let mut transitions = auth.subscribe();
/// while let Some(state) = transitions.recv().await {
///     router.on_auth_change(&state);
/// }
/// ```
pub struct AuthStateMachine<P, R, S> {
    provider: Arc<P>,
    resolver: Arc<SessionResolver<P, S, R>>,
    roles: RoleResolver<R>,
    state: Arc<AuthStateCell>,
    config: Arc<ResolverConfig>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<P, R, S> AuthStateMachine<P, R, S>
where
    P: IdentityProvider,
    R: ProfileStore,
    S: CredentialStore,
{
    #[must_use]
    pub fn new(config: ResolverConfig, provider: P, profiles: R, store: S) -> Self {
        let config = Arc::new(config);
        let provider = Arc::new(provider);
        let state = AuthStateCell::new();
        let roles = RoleResolver::new(Arc::new(profiles), state.clone(), config.clone());
        let resolver = Arc::new(SessionResolver::new(
            provider.clone(),
            Arc::new(store),
            state.clone(),
            roles.clone(),
            config.clone(),
        ));

        Self {
            provider,
            resolver,
            roles,
            state,
            config,
            listener: Mutex::new(None),
        }
    }

    /// Start following the provider's session change feed.
    ///
    /// Idempotent. Changes are re-evaluated through the same path as
    /// provider answers, so they respect sequence ordering.
    pub fn start(&self) {
        let mut slot = self.listener.lock();
        if slot.is_some() || !self.state.is_alive() {
            return;
        }

        let mut changes = self.provider.session_changes();
        let resolver = self.resolver.clone();
        let state = self.state.clone();

        *slot = Some(tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok((event, session)) => {
                        if !state.is_alive() {
                            break;
                        }
                        resolver.handle_change(event, session);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Session change feed lagged; revalidating");
                        if let Err(e) = resolver.refresh().await {
                            tracing::warn!(error = %e, "Revalidation after lag failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Session change listener stopped");
        }));
    }

    /// Establish the initial state. See [`SessionResolver::initialize`].
    pub async fn initialize(&self, current_url: Option<&Url>) -> AuthState {
        self.resolver.initialize(current_url).await
    }

    /// Latest snapshot.
    #[must_use]
    pub fn get_state(&self) -> AuthState {
        self.state.snapshot()
    }

    /// Receive every subsequent transition, in order, exactly once.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.state.subscribe()
    }

    pub async fn check_session_active(&self) -> bool {
        self.resolver.check_session_active().await
    }

    /// # Errors
    ///
    /// Returns [`Error::AuthUnavailable`] when the provider is unreachable
    /// and no recent session is on record.
    pub async fn refresh(&self) -> Result<AuthState, Error> {
        self.resolver.refresh().await
    }

    /// Sign out locally, then remotely.
    ///
    /// Local state is cleared and `Unauthenticated` published before the
    /// provider is contacted; a failing or hanging remote call is logged
    /// and otherwise ignored.
    pub async fn sign_out(&self) -> AuthState {
        self.resolver.forget_local();
        tracing::info!("Signed out locally");

        let provider = self.provider.clone();
        match race(self.config.provider_timeout, async move { provider.sign_out().await }).await {
            Raced::Completed(Ok(())) => {}
            Raced::Completed(Err(e)) => tracing::warn!(error = %e, "Remote sign-out failed"),
            Raced::TimedOut => tracing::warn!("Remote sign-out timed out"),
            Raced::Failed => tracing::warn!("Remote sign-out task failed"),
        }

        self.state.snapshot()
    }

    /// Assign a role to the signed-in user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAuthenticated`] without a session, or
    /// [`Error::RoleAssignmentFailed`] if the profile store rejects it.
    pub async fn set_role(&self, role: Role) -> Result<(), Error> {
        let user_id = self.signed_in_user()?;
        self.roles.assign_role(&user_id, role).await
    }

    /// Re-read the signed-in user's role, e.g. after it was changed elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAuthenticated`] without a session.
    pub async fn refresh_role(&self) -> Result<RoleLookup, Error> {
        let user_id = self.signed_in_user()?;
        Ok(self.roles.refresh_role(&user_id).await)
    }

    fn signed_in_user(&self) -> Result<UserId, Error> {
        let snapshot = self.state.snapshot();
        match (snapshot.is_authenticated(), snapshot.user_id) {
            (true, Some(user_id)) => Ok(user_id),
            _ => Err(Error::NotAuthenticated),
        }
    }

    #[must_use]
    pub fn cached_check(&self) -> Option<CachedCheck> {
        self.resolver.cached_check()
    }

    #[must_use]
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }
}

impl<P, R, S> AuthStateMachine<P, R, S> {
    /// Stop listening: late provider and role answers are ignored, the
    /// change feed listener ends, and subscriptions close.
    pub fn shutdown(&self) {
        self.state.close();
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

impl<P, R, S> Drop for AuthStateMachine<P, R, S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::{MemoryCredentialStore, TOKEN_KEY};
    use crate::testing::{ScriptedIdentityProvider, ScriptedProfileStore, session_for};
    use crate::types::{AuthStatus, RoleStatus, SessionEvent};

    type Machine =
        AuthStateMachine<ScriptedIdentityProvider, ScriptedProfileStore, Arc<MemoryCredentialStore>>;

    fn machine(
        provider: ScriptedIdentityProvider,
        profiles: ScriptedProfileStore,
        config: ResolverConfig,
    ) -> (Machine, Arc<MemoryCredentialStore>) {
        let store = Arc::new(MemoryCredentialStore::new());
        (
            AuthStateMachine::new(config, provider, profiles, store.clone()),
            store,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_publishes_transitions_in_order() {
        let (auth, _) = machine(
            ScriptedIdentityProvider::new().with_session(session_for("u1")),
            ScriptedProfileStore::new().with_role("u1", Role::Mentee),
            ResolverConfig::default(),
        );
        let mut sub = auth.subscribe();

        auth.initialize(None).await;
        settle().await;

        assert_eq!(sub.try_recv().unwrap().status, AuthStatus::Initializing);
        let authed = sub.try_recv().unwrap();
        assert_eq!(authed.status, AuthStatus::Authenticated);
        assert_eq!(authed.role, RoleStatus::Unknown);
        let with_role = sub.try_recv().unwrap();
        assert_eq!(with_role.role, RoleStatus::Assigned(Role::Mentee));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn absent_session_with_unreachable_role_store() {
        let profiles = ScriptedProfileStore::new();
        profiles.set_unavailable(true);
        let (auth, _) = machine(ScriptedIdentityProvider::new(), profiles, ResolverConfig::default());

        let state = auth.initialize(None).await;
        assert_eq!(state.status, AuthStatus::Unauthenticated);
        assert_eq!(auth.get_state().status, AuthStatus::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn role_arrives_after_authentication() {
        let profiles = ScriptedProfileStore::new().with_role("u1", Role::Mentor);
        profiles.set_latency(Duration::from_millis(50));
        let (auth, _) = machine(
            ScriptedIdentityProvider::new().with_session(session_for("u1")),
            profiles,
            ResolverConfig::default().with_role_timeout(Duration::from_millis(5000)),
        );

        let state = auth.initialize(None).await;
        assert_eq!(state.status, AuthStatus::Authenticated);
        assert_eq!(state.role, RoleStatus::Unknown);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(auth.get_state().role, RoleStatus::Unknown);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(auth.get_state().role, RoleStatus::Assigned(Role::Mentor));
    }

    #[tokio::test(start_paused = true)]
    async fn role_timeout_keeps_authenticated_with_unknown_role() {
        let profiles = ScriptedProfileStore::new().with_role("u1", Role::Mentor);
        profiles.set_latency(Duration::from_secs(10));
        let (auth, _) = machine(
            ScriptedIdentityProvider::new().with_session(session_for("u1")),
            profiles,
            ResolverConfig::default().with_role_timeout(Duration::from_secs(5)),
        );

        auth.initialize(None).await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        let state = auth.get_state();
        assert_eq!(state.status, AuthStatus::Authenticated);
        assert_eq!(state.role, RoleStatus::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_survives_remote_failure() {
        let provider = ScriptedIdentityProvider::new().with_session(session_for("u1"));
        provider.set_fail_sign_out(true);
        let (auth, store) = machine(provider, ScriptedProfileStore::new(), ResolverConfig::default());

        auth.initialize(None).await;
        assert!(auth.check_session_active().await);
        let mut sub = auth.subscribe();

        let state = auth.sign_out().await;
        assert_eq!(state.status, AuthStatus::Unauthenticated);
        assert_eq!(state.user_id, None);
        assert_eq!(store.get(TOKEN_KEY).unwrap(), None);
        assert!(auth.cached_check().is_none());
        assert_eq!(sub.try_recv().unwrap().status, AuthStatus::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_with_hung_provider_completes() {
        let provider = ScriptedIdentityProvider::new().with_session(session_for("u1"));
        let (auth, _) = machine(
            provider,
            ScriptedProfileStore::new(),
            ResolverConfig::default().with_provider_timeout(Duration::from_secs(2)),
        );
        auth.initialize(None).await;

        auth.provider.set_latency(Duration::from_secs(3600));
        let state = auth.sign_out().await;
        assert_eq!(state.status, AuthStatus::Unauthenticated);
        assert_eq!(auth.provider.sign_out_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_wins_over_in_flight_check() {
        let provider = ScriptedIdentityProvider::new().with_session(session_for("u1"));
        provider.set_latency(Duration::from_secs(1));
        let (auth, _) = machine(provider, ScriptedProfileStore::new(), ResolverConfig::default());

        let check = auth.check_session_active();
        let sign_out = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            auth.sign_out().await
        };
        let (active, _) = tokio::join!(check, sign_out);

        assert!(!active);
        assert_eq!(auth.get_state().status, AuthStatus::Unauthenticated);
        assert!(auth.cached_check().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_uses_fallback_when_direct_refresh_fails() {
        let provider = ScriptedIdentityProvider::new().with_session(session_for("u1"));
        provider.set_fail_refresh(true);
        let (auth, _) = machine(provider, ScriptedProfileStore::new(), ResolverConfig::default());

        let state = auth.refresh().await.unwrap();
        assert_eq!(state.status, AuthStatus::Authenticated);
        assert_eq!(state.user_id, Some(UserId::from("u1")));
    }

    #[tokio::test(start_paused = true)]
    async fn set_role_requires_session() {
        let (auth, _) = machine(
            ScriptedIdentityProvider::new(),
            ScriptedProfileStore::new(),
            ResolverConfig::default(),
        );
        auth.initialize(None).await;

        let err = auth.set_role(Role::Mentor).await.unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated));
        assert!(matches!(auth.refresh_role().await, Err(Error::NotAuthenticated)));
    }

    #[tokio::test(start_paused = true)]
    async fn set_role_updates_state_and_store() {
        let profiles = ScriptedProfileStore::new();
        let (auth, _) = machine(
            ScriptedIdentityProvider::new().with_session(session_for("u1")),
            profiles,
            ResolverConfig::default(),
        );
        auth.initialize(None).await;
        settle().await;
        assert_eq!(auth.get_state().role, RoleStatus::Unassigned);

        auth.set_role(Role::Mentor).await.unwrap();
        assert_eq!(auth.get_state().role, RoleStatus::Assigned(Role::Mentor));
        let lookup = auth.refresh_role().await.unwrap();
        assert_eq!(lookup.status(), RoleStatus::Assigned(Role::Mentor));
    }

    #[tokio::test(start_paused = true)]
    async fn set_role_failure_propagates() {
        let profiles = ScriptedProfileStore::new();
        profiles.set_fail_set(true);
        let (auth, _) = machine(
            ScriptedIdentityProvider::new().with_session(session_for("u1")),
            profiles,
            ResolverConfig::default(),
        );
        auth.initialize(None).await;

        let err = auth.set_role(Role::Mentee).await.unwrap_err();
        assert!(matches!(err, Error::RoleAssignmentFailed(_)));
        assert_eq!(auth.get_state().status, AuthStatus::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn change_feed_drives_state() {
        let (auth, _) = machine(
            ScriptedIdentityProvider::new(),
            ScriptedProfileStore::new().with_role("u2", Role::Mentee),
            ResolverConfig::default(),
        );
        auth.start();
        auth.initialize(None).await;
        assert_eq!(auth.get_state().status, AuthStatus::Unauthenticated);

        auth.provider.emit(SessionEvent::SignedIn, Some(session_for("u2")));
        settle().await;
        let state = auth.get_state();
        assert_eq!(state.status, AuthStatus::Authenticated);
        assert_eq!(state.user_id, Some(UserId::from("u2")));
        assert_eq!(state.role, RoleStatus::Assigned(Role::Mentee));

        auth.provider.emit(SessionEvent::SignedOut, None);
        settle().await;
        assert_eq!(auth.get_state().status, AuthStatus::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_listening() {
        let (auth, _) = machine(
            ScriptedIdentityProvider::new(),
            ScriptedProfileStore::new(),
            ResolverConfig::default(),
        );
        auth.start();
        auth.initialize(None).await;
        let mut sub = auth.subscribe();

        auth.shutdown();
        assert!(sub.recv().await.is_none());

        auth.provider.emit(SessionEvent::SignedIn, Some(session_for("u1")));
        settle().await;
        assert_eq!(auth.get_state().status, AuthStatus::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_machine_closes_subscriptions() {
        let (auth, _) = machine(
            ScriptedIdentityProvider::new().with_session(session_for("u1")),
            ScriptedProfileStore::new(),
            ResolverConfig::default(),
        );
        auth.start();
        let mut sub = auth.subscribe();
        auth.initialize(None).await;
        let provider = auth.provider.clone();

        drop(auth);
        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            while sub.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "subscription still open after drop");

        provider.emit(SessionEvent::SignedOut, None);
        settle().await;
    }
}
