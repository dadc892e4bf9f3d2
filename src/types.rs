use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::Error;

/// Identity provider user identifier (opaque string).
///
/// Also the primary key of the profile store's role record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Authorization role selecting which views a user may reach.
///
/// Orthogonal to authentication: holding a role never grants access on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Mentor,
    Mentee,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mentor => "mentor",
            Self::Mentee => "mentee",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mentor" => Ok(Self::Mentor),
            "mentee" => Ok(Self::Mentee),
            other => Err(Error::InvalidRole(other.to_owned())),
        }
    }
}

/// What is currently known about the authenticated user's role.
///
/// `Unknown` means "not resolved yet" (lookup pending, timed out or failed).
/// `Unassigned` means the profile store answered and the user has no role,
/// which is the only state in which a role-selection flow should be shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "role")]
pub enum RoleStatus {
    #[default]
    Unknown,
    Unassigned,
    Assigned(Role),
}

impl RoleStatus {
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Assigned(role) => Some(*role),
            Self::Unknown | Self::Unassigned => None,
        }
    }

    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl From<Option<Role>> for RoleStatus {
    fn from(role: Option<Role>) -> Self {
        role.map_or(Self::Unassigned, Self::Assigned)
    }
}

/// Identity provider session. The provider owns it; the resolver only
/// keeps a cached copy.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    /// Opaque provider credential.
    pub raw_token: String,
}

impl Session {
    #[must_use]
    pub fn new(
        user_id: impl Into<UserId>,
        expires_at: OffsetDateTime,
        raw_token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            expires_at,
            raw_token: raw_token.into(),
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }
}

// Token stays out of logs.
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .field("raw_token", &"<redacted>")
            .finish()
    }
}

/// Kind of change reported by the identity provider's change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    #[default]
    Uninitialized,
    Initializing,
    Authenticated,
    Unauthenticated,
    /// Provider unreachable with no way to decide; recoverable by retrying.
    Error,
}

/// Snapshot of the client's authentication state.
///
/// `status == Authenticated` alone decides access to authenticated routes;
/// `role` only selects role-specific views and may lag behind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthState {
    pub status: AuthStatus,
    pub user_id: Option<UserId>,
    pub role: RoleStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_verified_at: Option<OffsetDateTime>,
}

impl AuthState {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.status == AuthStatus::Authenticated
    }

    /// True when the observable parts (`status`, `user_id`, `role`) match.
    pub(crate) fn same_transition_state(&self, other: &Self) -> bool {
        self.status == other.status && self.user_id == other.user_id && self.role == other.role
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn role_parses_known_values() {
        assert_eq!("mentor".parse::<Role>().unwrap(), Role::Mentor);
        assert_eq!("mentee".parse::<Role>().unwrap(), Role::Mentee);
    }

    #[test]
    fn role_rejects_unknown_values() {
        assert!(matches!("admin".parse::<Role>(), Err(Error::InvalidRole(r)) if r == "admin"));
        assert!("Mentor".parse::<Role>().is_err());
        assert!("".parse::<Role>().is_err());
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Mentee).unwrap(), "\"mentee\"");
        let parsed: Role = serde_json::from_str("\"mentor\"").unwrap();
        assert_eq!(parsed, Role::Mentor);
    }

    #[test]
    fn role_status_from_store_answer() {
        assert_eq!(RoleStatus::from(None), RoleStatus::Unassigned);
        assert_eq!(
            RoleStatus::from(Some(Role::Mentor)),
            RoleStatus::Assigned(Role::Mentor)
        );
        assert!(!RoleStatus::Unknown.is_known());
        assert!(RoleStatus::Unassigned.is_known());
        assert_eq!(RoleStatus::Unassigned.role(), None);
    }

    #[test]
    fn session_expiry() {
        let now = OffsetDateTime::now_utc();
        let session = Session::new("u1", now + Duration::minutes(5), "tok");
        assert!(!session.is_expired_at(now));
        assert!(session.is_expired_at(now + Duration::minutes(5)));
    }

    #[test]
    fn session_debug_hides_token() {
        let session = Session::new("u1", OffsetDateTime::now_utc(), "secret-token");
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("u1"));
    }

    #[test]
    fn default_state_is_uninitialized() {
        let state = AuthState::default();
        assert_eq!(state.status, AuthStatus::Uninitialized);
        assert_eq!(state.role, RoleStatus::Unknown);
        assert!(!state.is_authenticated());
    }

    #[test]
    fn user_id_from_string() {
        let id = UserId::from("user-123".to_string());
        assert_eq!(id.to_string(), "user-123");
        assert_eq!(UserId::from("user-123"), id);
    }
}
