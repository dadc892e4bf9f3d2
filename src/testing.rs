//! Scripted in-memory collaborators for exercising the resolver.
//!
//! Available in this crate's unit tests and, for downstream crates, with
//! the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! marketplace-auth = { version = "0.1", features = ["testing"] }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::error::{BoxError, ProviderError};
use crate::provider::{IdentityProvider, ProfileStore, SessionChange};
use crate::types::{Role, Session, SessionEvent, UserId};

/// A session for `user_id` valid for the next hour.
#[must_use]
pub fn session_for(user_id: &str) -> Session {
    Session::new(
        user_id,
        OffsetDateTime::now_utc() + time::Duration::hours(1),
        format!("token-{user_id}"),
    )
}

#[derive(Default)]
struct ProviderScript {
    session: Option<Session>,
    url_session: Option<Session>,
    unavailable: bool,
    fail_next_current: usize,
    fail_refresh: bool,
    fail_sign_out: bool,
    latency: Duration,
}

/// Identity provider whose answers are set by the test.
pub struct ScriptedIdentityProvider {
    script: Mutex<ProviderScript>,
    changes: broadcast::Sender<SessionChange>,
    current_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
}

impl ScriptedIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            script: Mutex::new(ProviderScript::default()),
            changes,
            current_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_session(self, session: Session) -> Self {
        self.set_session(Some(session));
        self
    }

    pub fn set_session(&self, session: Option<Session>) {
        self.script.lock().session = session;
    }

    /// Session returned when a URL credential is consumed.
    pub fn set_url_session(&self, session: Session) {
        self.script.lock().url_session = Some(session);
    }

    /// Make every call fail with [`ProviderError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.script.lock().unavailable = unavailable;
    }

    /// Fail only the next `n` `current_session` calls.
    pub fn fail_next_current(&self, n: usize) {
        self.script.lock().fail_next_current = n;
    }

    pub fn set_fail_refresh(&self, fail: bool) {
        self.script.lock().fail_refresh = fail;
    }

    pub fn set_fail_sign_out(&self, fail: bool) {
        self.script.lock().fail_sign_out = fail;
    }

    /// Delay applied before every answer.
    pub fn set_latency(&self, latency: Duration) {
        self.script.lock().latency = latency;
    }

    /// Push a change notification to subscribers.
    pub fn emit(&self, event: SessionEvent, session: Option<Session>) {
        let _ = self.changes.send((event, session));
    }

    #[must_use]
    pub fn current_calls(&self) -> usize {
        self.current_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn outage() -> ProviderError {
    ProviderError::Unavailable("scripted outage".into())
}

// Answers are decided when the request arrives and delivered after the
// scripted latency, like a server responding over a slow link.
impl IdentityProvider for ScriptedIdentityProvider {
    async fn current_session(&self) -> Result<Option<Session>, ProviderError> {
        self.current_calls.fetch_add(1, Ordering::SeqCst);
        let (answer, latency) = {
            let mut script = self.script.lock();
            let answer = if script.unavailable {
                Err(outage())
            } else if script.fail_next_current > 0 {
                script.fail_next_current -= 1;
                Err(outage())
            } else {
                Ok(script.session.clone())
            };
            (answer, script.latency)
        };
        tokio::time::sleep(latency).await;
        answer
    }

    async fn refresh_session(&self) -> Result<Session, ProviderError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let (answer, latency) = {
            let script = self.script.lock();
            let answer = if script.unavailable || script.fail_refresh {
                Err(outage())
            } else {
                script
                    .session
                    .clone()
                    .ok_or_else(|| ProviderError::Rejected("no session to refresh".into()))
            };
            (answer, script.latency)
        };
        tokio::time::sleep(latency).await;
        answer
    }

    async fn consume_url_credential(
        &self,
        _fragment: &str,
    ) -> Result<Option<Session>, ProviderError> {
        let (answer, latency) = {
            let mut script = self.script.lock();
            let answer = if script.unavailable {
                Err(outage())
            } else {
                let session = script.url_session.take();
                if session.is_some() {
                    script.session = session.clone();
                }
                Ok(session)
            };
            (answer, script.latency)
        };
        tokio::time::sleep(latency).await;
        answer
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        let (answer, latency) = {
            let mut script = self.script.lock();
            let answer = if script.unavailable || script.fail_sign_out {
                Err(outage())
            } else {
                script.session = None;
                Ok(())
            };
            (answer, script.latency)
        };
        tokio::time::sleep(latency).await;
        answer
    }

    fn session_changes(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }
}

#[derive(Default)]
struct ProfileScript {
    roles: HashMap<UserId, Role>,
    latency: Duration,
    unavailable: bool,
    fail_set: bool,
}

/// Profile store whose answers are set by the test.
#[derive(Default)]
pub struct ScriptedProfileStore {
    script: Mutex<ProfileScript>,
    get_calls: AtomicUsize,
}

impl ScriptedProfileStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_role(self, user_id: &str, role: Role) -> Self {
        self.script.lock().roles.insert(UserId::from(user_id), role);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.script.lock().latency = latency;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.script.lock().unavailable = unavailable;
    }

    pub fn set_fail_set(&self, fail: bool) {
        self.script.lock().fail_set = fail;
    }

    #[must_use]
    pub fn stored_role(&self, user_id: &str) -> Option<Role> {
        self.script.lock().roles.get(&UserId::from(user_id)).copied()
    }

    #[must_use]
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }
}

impl ProfileStore for ScriptedProfileStore {
    async fn get_role(&self, user_id: &UserId) -> Result<Option<Role>, BoxError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let (answer, latency) = {
            let script = self.script.lock();
            let answer = if script.unavailable {
                Err("profile store unreachable")
            } else {
                Ok(script.roles.get(user_id).copied())
            };
            (answer, script.latency)
        };
        tokio::time::sleep(latency).await;
        answer.map_err(Into::into)
    }

    async fn set_role(&self, user_id: &UserId, role: Role) -> Result<(), BoxError> {
        let latency = self.script.lock().latency;
        tokio::time::sleep(latency).await;

        let mut script = self.script.lock();
        if script.unavailable || script.fail_set {
            return Err("profile write rejected".into());
        }
        script.roles.insert(user_id.clone(), role);
        Ok(())
    }
}
