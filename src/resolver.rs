//! Session verdicts with bounded leniency.
//!
//! `check_session_active` answers, in order:
//! 1. repeat calls within the debounce window get the previous answer;
//! 2. a verified positive within the leniency window is trusted;
//! 3. otherwise the provider is asked;
//! 4. on provider error shortly after sign-in, one delayed retry;
//! 5. still undecided: a fresh persisted hint keeps the user signed in,
//!    anything else signs them out.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use crate::config::ResolverConfig;
use crate::error::{Error, ProviderError};
use crate::fragment::credential_fragment;
use crate::provider::{IdentityProvider, ProfileStore};
use crate::race::{Raced, race};
use crate::role::RoleResolver;
use crate::state::{AuthStateCell, Ticket, Verdict};
use crate::store::{CredentialStore, PersistedHint};
use crate::types::{AuthState, Session, SessionEvent, UserId};

/// Last real verification, used to answer repeat checks without the provider.
///
/// Lives only in memory; a restart starts with an empty cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedCheck {
    pub verified_at: Instant,
    pub result: bool,
}

#[derive(Debug, Default)]
struct CheckCache {
    /// First call of the current debounce burst. Debounced calls never move
    /// it, so a cached answer cannot outlive the window.
    burst_started: Option<Instant>,
    /// Answer handed out by the previous check, verified or not.
    last_answer: Option<bool>,
    verified: Option<CachedCheck>,
    /// Real checks since the verdict last turned positive.
    checks_since_positive: Option<u32>,
}

impl CheckCache {
    fn record(&mut self, result: bool, at: Instant) {
        let was_positive = self.verified.is_some_and(|c| c.result);
        if result && !was_positive {
            self.checks_since_positive = Some(0);
        } else if !result {
            self.checks_since_positive = None;
        }
        self.verified = Some(CachedCheck {
            verified_at: at,
            result,
        });
        self.last_answer = Some(result);
    }
}

enum Recovery {
    /// The provider came back with an answer.
    Answered(Option<Session>),
    /// Provider still down, but a fresh hint says a session existed recently.
    Lenient,
    Exhausted,
}

/// Computes and caches the authenticated/unauthenticated verdict.
pub struct SessionResolver<P, S, R> {
    provider: Arc<P>,
    store: Arc<S>,
    state: Arc<AuthStateCell>,
    roles: RoleResolver<R>,
    config: Arc<ResolverConfig>,
    cache: Mutex<CheckCache>,
    /// Serializes `check_session_active` so near-simultaneous calls share
    /// one verification.
    check_gate: tokio::sync::Mutex<()>,
    role_task: Mutex<Option<(UserId, JoinHandle<()>)>>,
}

impl<P, S, R> SessionResolver<P, S, R>
where
    P: IdentityProvider,
    S: CredentialStore,
    R: ProfileStore,
{
    pub(crate) fn new(
        provider: Arc<P>,
        store: Arc<S>,
        state: Arc<AuthStateCell>,
        roles: RoleResolver<R>,
        config: Arc<ResolverConfig>,
    ) -> Self {
        Self {
            provider,
            store,
            state,
            roles,
            config,
            cache: Mutex::new(CheckCache::default()),
            check_gate: tokio::sync::Mutex::new(()),
            role_task: Mutex::new(None),
        }
    }

    /// Establish the initial verdict. Never fails and never leaves the
    /// state in `Initializing`: every provider call is individually timed.
    ///
    /// A credential carried in `current_url`'s fragment is handed to the
    /// provider first.
    pub async fn initialize(&self, current_url: Option<&Url>) -> AuthState {
        let ticket = self.state.ticket();
        self.state.apply(ticket, Verdict::Initializing, None);

        let mut consumed = None;
        if let Some(fragment) = current_url.and_then(credential_fragment) {
            let fragment = fragment.to_owned();
            match self
                .call(move |p| async move { p.consume_url_credential(&fragment).await })
                .await
            {
                Ok(session) => {
                    tracing::info!(found = session.is_some(), "Consumed URL credential");
                    consumed = session;
                }
                Err(e) => tracing::warn!(error = %e, "Failed to consume URL credential"),
            }
        }

        match self.current_session().await {
            Ok(session) => {
                self.conclude(ticket, session);
            }
            Err(e) if consumed.is_some() => {
                tracing::warn!(error = %e, "Session lookup failed; using consumed URL credential");
                self.conclude(ticket, consumed);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Session lookup failed during initialization");
                self.settle_recovery(ticket, self.recover(true).await);
            }
        }

        self.state.snapshot()
    }

    /// Explicit re-validation, e.g. before a sensitive write.
    ///
    /// Tries a direct token refresh, then a session lookup, then the
    /// recovery heuristic, stopping at the first that answers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthUnavailable`] when every path fails and no
    /// recent session is on record. The state moves to `Error`.
    pub async fn refresh(&self) -> Result<AuthState, Error> {
        let ticket = self.state.ticket();

        match self.call(|p| async move { p.refresh_session().await }).await {
            Ok(session) => {
                self.conclude(ticket, Some(session));
                return Ok(self.state.snapshot());
            }
            Err(e) => tracing::warn!(error = %e, "Token refresh failed; falling back to session lookup"),
        }

        match self.current_session().await {
            Ok(session) => {
                self.conclude(ticket, session);
                return Ok(self.state.snapshot());
            }
            Err(e) => tracing::warn!(error = %e, "Session lookup failed; attempting recovery"),
        }

        match self.recover(false).await {
            Recovery::Answered(session) => {
                self.conclude(ticket, session);
                Ok(self.state.snapshot())
            }
            Recovery::Lenient => {
                tracing::warn!("Provider unreachable; keeping state on recent-session hint");
                Ok(self.state.snapshot())
            }
            Recovery::Exhausted => {
                self.state.apply(ticket, Verdict::Error, None);
                Err(Error::AuthUnavailable)
            }
        }
    }

    /// Cheap probe used by navigation guards on every route transition.
    pub async fn check_session_active(&self) -> bool {
        let invoked_at = Instant::now();
        let _gate = self.check_gate.lock().await;

        {
            let mut cache = self.cache.lock();
            if let (Some(started), Some(answer)) = (cache.burst_started, cache.last_answer) {
                if invoked_at.saturating_duration_since(started) < self.config.debounce {
                    tracing::debug!(answer, "Session check debounced");
                    return answer;
                }
            }
            cache.burst_started = Some(invoked_at);

            if let Some(check) = cache.verified {
                if check.result
                    && invoked_at.saturating_duration_since(check.verified_at)
                        < self.config.leniency
                {
                    tracing::debug!("Session check answered from leniency window");
                    cache.last_answer = Some(true);
                    return true;
                }
            }

            if let Some(n) = cache.checks_since_positive.as_mut() {
                *n = n.saturating_add(1);
            }
        }

        let ticket = self.state.ticket();
        let error = match self.current_session().await {
            Ok(session) => return self.conclude(ticket, session),
            Err(e) => e,
        };

        let early = self
            .cache
            .lock()
            .checks_since_positive
            .is_some_and(|n| n <= self.config.early_retry_checks);
        if early {
            tracing::warn!(error = %error, "Session check failed shortly after sign-in; retrying once");
            tokio::time::sleep(self.config.retry_delay).await;
            match self.current_session().await {
                Ok(session) => return self.conclude(ticket, session),
                Err(e) => tracing::warn!(error = %e, "Session check retry failed"),
            }
        } else {
            tracing::warn!(error = %error, "Session check failed");
        }

        let hint = PersistedHint::load(&*self.store);
        let answer = if hint.is_fresh(OffsetDateTime::now_utc(), self.config.hint_max_age) {
            tracing::warn!("Provider unreachable; trusting recent-session hint");
            true
        } else {
            if self.state.apply(ticket, Verdict::Unauthenticated, None) {
                PersistedHint::forget(&*self.store);
                self.cache.lock().record(false, Instant::now());
            }
            self.state.snapshot().is_authenticated()
        };
        self.cache.lock().last_answer = Some(answer);
        answer
    }

    /// Most recent real verification, if any.
    #[must_use]
    pub fn cached_check(&self) -> Option<CachedCheck> {
        self.cache.lock().verified
    }

    /// Apply a change pushed by the provider's change feed.
    pub(crate) fn handle_change(&self, event: SessionEvent, session: Option<Session>) {
        let ticket = self.state.ticket();
        tracing::debug!(?event, has_session = session.is_some(), "Session change event");
        match event {
            SessionEvent::SignedOut => {
                self.conclude(ticket, None);
            }
            SessionEvent::InitialSession
            | SessionEvent::SignedIn
            | SessionEvent::TokenRefreshed
            | SessionEvent::UserUpdated => {
                self.conclude(ticket, session);
            }
        }
    }

    /// Drop every local trace of the session: persisted hint, stored token
    /// and cached checks. Then mark the state unauthenticated.
    pub(crate) fn forget_local(&self) {
        let ticket = self.state.ticket();
        PersistedHint::forget(&*self.store);
        *self.cache.lock() = CheckCache::default();
        self.state.apply(ticket, Verdict::Unauthenticated, None);
    }

    async fn current_session(&self) -> Result<Option<Session>, ProviderError> {
        self.call(|p| async move { p.current_session().await }).await
    }

    /// Run a provider operation raced against the provider timeout.
    async fn call<T, F, Fut>(&self, op: F) -> Result<T, ProviderError>
    where
        F: FnOnce(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
        T: Send + 'static,
    {
        let limit = self.config.provider_timeout;
        match race(limit, op(self.provider.clone())).await {
            Raced::Completed(result) => result,
            Raced::TimedOut => Err(ProviderError::Timeout(limit)),
            Raced::Failed => Err(ProviderError::Unavailable("provider task failed".into())),
        }
    }

    /// Recovery heuristic after a provider error. A fresh persisted hint
    /// earns one extra retry and, if the provider stays down, a lenient
    /// outcome instead of sign-out.
    async fn recover(&self, try_refresh: bool) -> Recovery {
        let hint = PersistedHint::load(&*self.store);
        let fresh = hint.is_fresh(OffsetDateTime::now_utc(), self.config.hint_max_age);

        if try_refresh && hint.has_stored_token {
            match self.call(|p| async move { p.refresh_session().await }).await {
                Ok(session) => return Recovery::Answered(Some(session)),
                Err(e) => tracing::debug!(error = %e, "Recovery refresh failed"),
            }
        }

        let retries: u32 = if fresh { 2 } else { 1 };
        for attempt in 1..=retries {
            tokio::time::sleep(self.config.retry_delay * attempt).await;
            match self.current_session().await {
                Ok(session) => return Recovery::Answered(session),
                Err(e) => tracing::debug!(attempt, error = %e, "Recovery lookup failed"),
            }
        }

        if fresh {
            Recovery::Lenient
        } else {
            Recovery::Exhausted
        }
    }

    fn settle_recovery(&self, ticket: Ticket, recovery: Recovery) {
        match recovery {
            Recovery::Answered(session) => {
                self.conclude(ticket, session);
            }
            Recovery::Lenient => {
                tracing::warn!("Provider unreachable with a recent session on record");
                self.state.apply(ticket, Verdict::Error, None);
            }
            Recovery::Exhausted => {
                tracing::warn!("Provider unreachable and no recent session; signing out");
                self.state.apply(ticket, Verdict::Unauthenticated, None);
            }
        }
    }

    /// Apply a provider answer: state, persisted hint, check cache, and
    /// background role resolution. Returns whether the user is now
    /// authenticated.
    fn conclude(&self, ticket: Ticket, session: Option<Session>) -> bool {
        let now = OffsetDateTime::now_utc();
        let session = session.filter(|s| {
            let expired = s.is_expired_at(now);
            if expired {
                tracing::info!(user_id = %s.user_id, "Provider returned an expired session");
            }
            !expired
        });

        match session {
            Some(session) => {
                let user_id = session.user_id.clone();
                if self
                    .state
                    .apply(ticket, Verdict::Authenticated(user_id.clone()), Some(now))
                {
                    PersistedHint::record(&*self.store, &session, now);
                    self.cache.lock().record(true, Instant::now());
                    self.resolve_role_if_unknown(user_id);
                }
            }
            None => {
                if self.state.apply(ticket, Verdict::Unauthenticated, Some(now)) {
                    PersistedHint::forget(&*self.store);
                    self.cache.lock().record(false, Instant::now());
                }
            }
        }

        // A discarded write means a newer operation already decided.
        self.state.snapshot().is_authenticated()
    }

    fn resolve_role_if_unknown(&self, user_id: UserId) {
        let snapshot = self.state.snapshot();
        if snapshot.role.is_known() || snapshot.user_id.as_ref() != Some(&user_id) {
            return;
        }
        let mut slot = self.role_task.lock();
        if let Some((running_for, handle)) = slot.as_ref() {
            if running_for == &user_id && !handle.is_finished() {
                return;
            }
        }
        *slot = Some((user_id.clone(), self.roles.spawn_resolution(user_id)));
    }
}
