use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::ResolverConfig;
use crate::error::Error;
use crate::provider::ProfileStore;
use crate::race::{Raced, race};
use crate::state::AuthStateCell;
use crate::types::{Role, RoleStatus, UserId};

/// Result of one role lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleLookup {
    /// The profile store answered: `Assigned` or `Unassigned`.
    Resolved(RoleStatus),
    /// The timer won. The lookup keeps running and may still update state.
    TimedOut,
    Failed,
}

impl RoleLookup {
    /// Role as the caller should treat it. Timeouts and failures are
    /// "not yet known", never "no role".
    #[must_use]
    pub fn status(&self) -> RoleStatus {
        match self {
            Self::Resolved(status) => *status,
            Self::TimedOut | Self::Failed => RoleStatus::Unknown,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Resolved(_))
    }
}

/// Resolves a user's role without ever touching session status.
pub struct RoleResolver<R> {
    profiles: Arc<R>,
    state: Arc<AuthStateCell>,
    config: Arc<ResolverConfig>,
}

// Manual Clone: avoid derive adding an `R: Clone` bound.
impl<R> Clone for RoleResolver<R> {
    fn clone(&self) -> Self {
        Self {
            profiles: self.profiles.clone(),
            state: self.state.clone(),
            config: self.config.clone(),
        }
    }
}

impl<R: ProfileStore> RoleResolver<R> {
    pub(crate) fn new(
        profiles: Arc<R>,
        state: Arc<AuthStateCell>,
        config: Arc<ResolverConfig>,
    ) -> Self {
        Self {
            profiles,
            state,
            config,
        }
    }

    /// Look up the role, racing the profile store against the role timeout.
    ///
    /// Whenever the lookup completes, even after losing the race, the
    /// answer is written to the auth state if that user is still signed in.
    pub async fn fetch_role(&self, user_id: &UserId) -> RoleLookup {
        let ticket = self.state.ticket();
        let profiles = self.profiles.clone();
        let state = self.state.clone();
        let uid = user_id.clone();

        let lookup = async move {
            match profiles.get_role(&uid).await {
                Ok(role) => {
                    state.apply_role(ticket, &uid, RoleStatus::from(role));
                    Ok(role)
                }
                Err(e) => Err(e.to_string()),
            }
        };

        match race(self.config.role_timeout, lookup).await {
            Raced::Completed(Ok(role)) => RoleLookup::Resolved(RoleStatus::from(role)),
            Raced::Completed(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "Role lookup failed");
                RoleLookup::Failed
            }
            Raced::TimedOut => {
                tracing::warn!(
                    user_id = %user_id,
                    timeout_ms = self.config.role_timeout.as_millis() as u64,
                    "Role lookup timed out; role stays unknown"
                );
                RoleLookup::TimedOut
            }
            Raced::Failed => RoleLookup::Failed,
        }
    }

    /// Re-fetch after a settle delay that covers read-after-write lag.
    pub async fn refresh_role(&self, user_id: &UserId) -> RoleLookup {
        tokio::time::sleep(self.config.role_settle_delay).await;
        self.fetch_role(user_id).await
    }

    /// Persist a user-chosen role and publish it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoleAssignmentFailed`] if the profile store rejects
    /// the write or does not answer in time.
    pub async fn assign_role(&self, user_id: &UserId, role: Role) -> Result<(), Error> {
        let profiles = self.profiles.clone();
        let uid = user_id.clone();
        let write = async move { profiles.set_role(&uid, role).await.map_err(|e| e.to_string()) };

        match race(self.config.role_timeout, write).await {
            Raced::Completed(Ok(())) => {}
            Raced::Completed(Err(e)) => {
                tracing::error!(user_id = %user_id, role = %role, error = %e, "Role assignment failed");
                return Err(Error::RoleAssignmentFailed(e));
            }
            Raced::TimedOut => {
                tracing::error!(user_id = %user_id, role = %role, "Role assignment timed out");
                return Err(Error::RoleAssignmentFailed("profile store timed out".into()));
            }
            Raced::Failed => {
                return Err(Error::RoleAssignmentFailed("profile store task failed".into()));
            }
        }

        // Ticket taken after the write so lookups started before it cannot
        // overwrite the assignment with a pre-write read.
        let ticket = self.state.ticket();
        self.state.apply_role(ticket, user_id, RoleStatus::Assigned(role));
        tracing::info!(user_id = %user_id, role = %role, "Role assigned");
        Ok(())
    }

    /// Resolve the role in the background, retrying timeouts and failures
    /// while the same user stays authenticated.
    pub(crate) fn spawn_resolution(&self, user_id: UserId) -> JoinHandle<()> {
        let resolver = self.clone();
        tokio::spawn(async move {
            let attempts = resolver.config.role_retry_attempts;
            for attempt in 0..=attempts {
                if !resolver.still_current(&user_id) {
                    return;
                }
                let lookup = resolver.fetch_role(&user_id).await;
                if !lookup.is_retryable() {
                    return;
                }
                if attempt < attempts {
                    tracing::debug!(user_id = %user_id, attempt, "Retrying role lookup");
                    tokio::time::sleep(resolver.config.role_retry_backoff * (attempt + 1)).await;
                }
            }
        })
    }

    fn still_current(&self, user_id: &UserId) -> bool {
        if !self.state.is_alive() {
            return false;
        }
        let snapshot = self.state.snapshot();
        snapshot.is_authenticated()
            && snapshot.user_id.as_ref() == Some(user_id)
            && !snapshot.role.is_known()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::state::Verdict;
    use crate::testing::ScriptedProfileStore;
    use crate::types::AuthStatus;

    fn resolver(
        profiles: ScriptedProfileStore,
        config: ResolverConfig,
    ) -> RoleResolver<ScriptedProfileStore> {
        let state = AuthStateCell::new();
        state.apply(state.ticket(), Verdict::Authenticated(UserId::from("u1")), None);
        RoleResolver::new(Arc::new(profiles), state, Arc::new(config))
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_known_role() {
        let r = resolver(
            ScriptedProfileStore::new().with_role("u1", Role::Mentor),
            ResolverConfig::default(),
        );
        let lookup = r.fetch_role(&UserId::from("u1")).await;
        assert_eq!(lookup, RoleLookup::Resolved(RoleStatus::Assigned(Role::Mentor)));
        assert_eq!(r.state.snapshot().role, RoleStatus::Assigned(Role::Mentor));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_role_is_unassigned_not_unknown() {
        let r = resolver(ScriptedProfileStore::new(), ResolverConfig::default());
        let lookup = r.fetch_role(&UserId::from("u1")).await;
        assert_eq!(lookup.status(), RoleStatus::Unassigned);
        assert!(!lookup.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_role_unknown_and_status_authenticated() {
        let profiles = ScriptedProfileStore::new().with_role("u1", Role::Mentee);
        profiles.set_latency(Duration::from_secs(30));
        let r = resolver(
            profiles,
            ResolverConfig::default().with_role_timeout(Duration::from_secs(5)),
        );

        let lookup = r.fetch_role(&UserId::from("u1")).await;
        assert_eq!(lookup, RoleLookup::TimedOut);
        assert_eq!(lookup.status(), RoleStatus::Unknown);

        let snapshot = r.state.snapshot();
        assert_eq!(snapshot.status, AuthStatus::Authenticated);
        assert_eq!(snapshot.role, RoleStatus::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn late_answer_still_lands_after_timeout() {
        let profiles = ScriptedProfileStore::new().with_role("u1", Role::Mentee);
        profiles.set_latency(Duration::from_secs(8));
        let r = resolver(
            profiles,
            ResolverConfig::default().with_role_timeout(Duration::from_secs(5)),
        );

        assert_eq!(r.fetch_role(&UserId::from("u1")).await, RoleLookup::TimedOut);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(r.state.snapshot().role, RoleStatus::Assigned(Role::Mentee));
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_is_retryable() {
        let profiles = ScriptedProfileStore::new();
        profiles.set_unavailable(true);
        let r = resolver(profiles, ResolverConfig::default());

        let lookup = r.fetch_role(&UserId::from("u1")).await;
        assert_eq!(lookup, RoleLookup::Failed);
        assert!(lookup.is_retryable());
        assert_eq!(r.state.snapshot().role, RoleStatus::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_waits_for_settle_delay() {
        let r = resolver(
            ScriptedProfileStore::new().with_role("u1", Role::Mentor),
            ResolverConfig::default().with_role_settle_delay(Duration::from_millis(500)),
        );
        let started = tokio::time::Instant::now();
        let lookup = r.refresh_role(&UserId::from("u1")).await;
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(lookup.status(), RoleStatus::Assigned(Role::Mentor));
    }

    #[tokio::test(start_paused = true)]
    async fn assign_role_publishes_on_success() {
        let r = resolver(ScriptedProfileStore::new(), ResolverConfig::default());
        r.assign_role(&UserId::from("u1"), Role::Mentee).await.unwrap();
        assert_eq!(r.profiles.stored_role("u1"), Some(Role::Mentee));
        assert_eq!(r.state.snapshot().role, RoleStatus::Assigned(Role::Mentee));
    }

    #[tokio::test(start_paused = true)]
    async fn assign_role_failure_is_surfaced() {
        let profiles = ScriptedProfileStore::new();
        profiles.set_fail_set(true);
        let r = resolver(profiles, ResolverConfig::default());

        let err = r.assign_role(&UserId::from("u1"), Role::Mentor).await.unwrap_err();
        assert!(matches!(err, Error::RoleAssignmentFailed(_)));
        assert_eq!(r.state.snapshot().role, RoleStatus::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn background_resolution_retries_until_store_recovers() {
        let profiles = ScriptedProfileStore::new().with_role("u1", Role::Mentor);
        profiles.set_unavailable(true);
        let r = resolver(
            profiles,
            ResolverConfig::default().with_role_retries(3, Duration::from_secs(1)),
        );

        let handle = r.spawn_resolution(UserId::from("u1"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(r.state.snapshot().role, RoleStatus::Unknown);

        r.profiles.set_unavailable(false);
        handle.await.unwrap();
        assert_eq!(r.state.snapshot().role, RoleStatus::Assigned(Role::Mentor));
        assert_eq!(r.profiles.get_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn background_resolution_stops_after_sign_out() {
        let profiles = ScriptedProfileStore::new();
        profiles.set_unavailable(true);
        let r = resolver(
            profiles,
            ResolverConfig::default().with_role_retries(5, Duration::from_secs(1)),
        );

        let handle = r.spawn_resolution(UserId::from("u1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        r.state.apply(r.state.ticket(), Verdict::Unauthenticated, None);
        handle.await.unwrap();

        assert_eq!(r.profiles.get_calls(), 1);
    }
}
