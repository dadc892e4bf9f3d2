//! REST adapters for a hosted auth + database backend.
//!
//! [`RestIdentityProvider`] speaks the GoTrue-style `/auth/v1` API and
//! [`RestProfileStore`] reads and writes the `profiles` table through a
//! PostgREST-style `/rest/v1` API. Both share one token slot, so profile
//! requests carry the signed-in user's access token.
//!
//! ```rust,ignore
//! let config = RestConfig::new("https://project.example.co".parse()?, "anon-key");
//! let provider = RestIdentityProvider::new(config.clone())?;
//! let profiles = RestProfileStore::for_provider(&provider);
//! let auth = AuthStateMachine::new(ResolverConfig::from_env()?, provider, profiles, store);
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use url::Url;

use crate::error::{BoxError, Error, ProviderError};
use crate::provider::{IdentityProvider, ProfileStore, SessionChange};
use crate::types::{Role, Session, SessionEvent, UserId};

const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Backend location and credentials.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RestConfig {
    pub(crate) base_url: Url,
    pub(crate) api_key: String,
    pub(crate) request_timeout: Duration,
}

impl RestConfig {
    /// `api_key` is the public (anonymous) key sent as the `apikey` header.
    #[must_use]
    pub fn new(base_url: Url, api_key: impl Into<String>) -> Self {
        Self {
            base_url,
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Transport-level timeout. The resolver applies its own, shorter
    /// timers on top of this.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URL for `path` under the base URL, keeping any base path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL cannot carry a path.
    pub fn endpoint(&self, path: &str) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("base URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(path.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }

    fn client(&self) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(Into::into)
    }
}

#[derive(Debug, Clone)]
struct Tokens {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: OffsetDateTime,
}

impl Tokens {
    fn is_expired(&self) -> bool {
        self.expires_at <= OffsetDateTime::now_utc()
    }
}

type TokenSlot = Arc<Mutex<Option<Tokens>>>;

/// Credential delivered inline in a redirect URL fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct FragmentCredential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: OffsetDateTime,
}

impl FragmentCredential {
    /// Parse `access_token=...&refresh_token=...&expires_in=...`.
    ///
    /// `expires_at` (unix seconds) wins over `expires_in`; with neither the
    /// credential is assumed valid for an hour.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Rejected`] without a usable access token.
    pub fn parse(fragment: &str) -> Result<Self, ProviderError> {
        let mut access_token = None;
        let mut refresh_token = None;
        let mut expires_in = None;
        let mut expires_at = None;

        for (key, value) in url::form_urlencoded::parse(fragment.trim_start_matches('#').as_bytes()) {
            match key.as_ref() {
                "access_token" if !value.is_empty() => access_token = Some(value.into_owned()),
                "refresh_token" if !value.is_empty() => refresh_token = Some(value.into_owned()),
                "expires_in" => expires_in = value.parse::<i64>().ok(),
                "expires_at" => {
                    expires_at = value
                        .parse::<i64>()
                        .ok()
                        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok());
                }
                "error_description" => {
                    return Err(ProviderError::Rejected(value.into_owned()));
                }
                _ => {}
            }
        }

        let access_token = access_token
            .ok_or_else(|| ProviderError::Rejected("fragment carries no access token".into()))?;
        let expires_at = expires_at.unwrap_or_else(|| {
            OffsetDateTime::now_utc()
                + time::Duration::seconds(expires_in.unwrap_or(DEFAULT_EXPIRES_IN))
        });

        Ok(Self {
            access_token,
            refresh_token,
            expires_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    user: UserResponse,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: UserId,
}

/// GoTrue-style identity provider.
pub struct RestIdentityProvider {
    config: RestConfig,
    http: reqwest::Client,
    tokens: TokenSlot,
    changes: broadcast::Sender<SessionChange>,
}

impl RestIdentityProvider {
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be built.
    pub fn new(config: RestConfig) -> Result<Self, Error> {
        let http = config.client()?;
        let (changes, _) = broadcast::channel(32);
        Ok(Self {
            config,
            http,
            tokens: Arc::new(Mutex::new(None)),
            changes,
        })
    }

    /// Use a custom HTTP client (for connection pool reuse).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Resume from a refresh token kept across restarts. The first
    /// `current_session` call exchanges it.
    #[must_use]
    pub fn with_refresh_token(self, refresh_token: impl Into<String>) -> Self {
        *self.tokens.lock() = Some(Tokens {
            access_token: String::new(),
            refresh_token: Some(refresh_token.into()),
            expires_at: OffsetDateTime::UNIX_EPOCH,
        });
        self
    }

    /// Refresh token currently held, for persisting across restarts.
    #[must_use]
    pub fn refresh_token(&self) -> Option<String> {
        self.tokens.lock().as_ref().and_then(|t| t.refresh_token.clone())
    }

    fn emit(&self, event: SessionEvent, session: Option<Session>) {
        // No receivers is fine.
        let _ = self.changes.send((event, session));
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.config
            .endpoint(path)
            .map_err(|e| ProviderError::Unavailable(e.to_string()))
    }

    async fn fetch_user(&self, access_token: &str) -> Result<UserResponse, ProviderError> {
        let response = self
            .http
            .get(self.endpoint("auth/v1/user")?)
            .header("apikey", &self.config.api_key)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| transport("user request", &e))?;

        let response = ensure_success(response, "user request").await?;
        response
            .json::<UserResponse>()
            .await
            .map_err(|e| transport("user request", &e))
    }

    fn store_tokens(&self, tokens: Tokens) {
        *self.tokens.lock() = Some(tokens);
    }

    fn clear_tokens(&self) {
        *self.tokens.lock() = None;
    }
}

impl IdentityProvider for RestIdentityProvider {
    async fn current_session(&self) -> Result<Option<Session>, ProviderError> {
        let Some(tokens) = self.tokens.lock().clone() else {
            return Ok(None);
        };

        if tokens.is_expired() {
            if tokens.refresh_token.is_none() {
                self.clear_tokens();
                return Ok(None);
            }
            return match self.refresh_session().await {
                Ok(session) => Ok(Some(session)),
                Err(ProviderError::Rejected(reason)) => {
                    tracing::debug!(reason = %reason, "Stored refresh token rejected");
                    self.clear_tokens();
                    Ok(None)
                }
                Err(e) => Err(e),
            };
        }

        match self.fetch_user(&tokens.access_token).await {
            Ok(user) => Ok(Some(Session::new(
                user.id,
                tokens.expires_at,
                tokens.access_token,
            ))),
            Err(ProviderError::Rejected(reason)) => {
                tracing::debug!(reason = %reason, "Access token rejected");
                self.clear_tokens();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn refresh_session(&self) -> Result<Session, ProviderError> {
        let refresh_token = self
            .tokens
            .lock()
            .as_ref()
            .and_then(|t| t.refresh_token.clone())
            .ok_or_else(|| ProviderError::Rejected("no refresh token held".into()))?;

        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut()
            .append_pair("grant_type", "refresh_token");

        let response = self
            .http
            .post(url)
            .header("apikey", &self.config.api_key)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| transport("token refresh", &e))?;

        let response = ensure_success(response, "token refresh").await?;
        let body = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| transport("token refresh", &e))?;

        let expires_at = OffsetDateTime::now_utc()
            + time::Duration::seconds(body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN));
        let session = Session::new(body.user.id, expires_at, body.access_token.clone());
        self.store_tokens(Tokens {
            access_token: body.access_token,
            refresh_token: body.refresh_token.or(Some(refresh_token)),
            expires_at,
        });
        self.emit(SessionEvent::TokenRefreshed, Some(session.clone()));
        Ok(session)
    }

    async fn consume_url_credential(
        &self,
        fragment: &str,
    ) -> Result<Option<Session>, ProviderError> {
        let credential = FragmentCredential::parse(fragment)?;
        let user = self.fetch_user(&credential.access_token).await?;

        let session = Session::new(
            user.id,
            credential.expires_at,
            credential.access_token.clone(),
        );
        self.store_tokens(Tokens {
            access_token: credential.access_token,
            refresh_token: credential.refresh_token,
            expires_at: credential.expires_at,
        });
        tracing::info!(user_id = %session.user_id, "Consumed URL credential");
        self.emit(SessionEvent::SignedIn, Some(session.clone()));
        Ok(Some(session))
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        let Some(tokens) = self.tokens.lock().take() else {
            return Ok(());
        };
        self.emit(SessionEvent::SignedOut, None);

        let response = self
            .http
            .post(self.endpoint("auth/v1/logout")?)
            .header("apikey", &self.config.api_key)
            .bearer_auth(&tokens.access_token)
            .send()
            .await
            .map_err(|e| transport("logout", &e))?;
        ensure_success(response, "logout").await?;
        Ok(())
    }

    fn session_changes(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }
}

#[derive(Debug, Deserialize)]
struct ProfileRow {
    #[serde(default)]
    role: Option<String>,
}

/// PostgREST-style `profiles` table: one row per user, keyed by `id`,
/// with a nullable `role` column.
pub struct RestProfileStore {
    config: RestConfig,
    http: reqwest::Client,
    tokens: TokenSlot,
    table: String,
}

impl RestProfileStore {
    /// Profile store authenticating as whoever `provider` has signed in.
    #[must_use]
    pub fn for_provider(provider: &RestIdentityProvider) -> Self {
        Self {
            config: provider.config.clone(),
            http: provider.http.clone(),
            tokens: provider.tokens.clone(),
            table: "profiles".into(),
        }
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Row URL for `user_id`, optionally selecting only the role column.
    fn row_url(&self, user_id: &UserId, select_role: bool) -> Result<Url, Error> {
        let mut url = self.config.endpoint(&format!("rest/v1/{}", self.table))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("id", &format!("eq.{user_id}"));
            if select_role {
                query.append_pair("select", "role");
            }
        }
        Ok(url)
    }

    fn bearer(&self) -> String {
        self.tokens
            .lock()
            .as_ref()
            .filter(|t| !t.access_token.is_empty())
            .map_or_else(|| self.config.api_key.clone(), |t| t.access_token.clone())
    }
}

impl ProfileStore for RestProfileStore {
    async fn get_role(&self, user_id: &UserId) -> Result<Option<Role>, BoxError> {
        let response = self
            .http
            .get(self.row_url(user_id, true)?)
            .header("apikey", &self.config.api_key)
            .bearer_auth(self.bearer())
            .send()
            .await?;

        let response = ensure_success(response, "profile read").await?;
        let rows = response.json::<Vec<ProfileRow>>().await?;
        role_from_rows(&rows).map_err(Into::into)
    }

    async fn set_role(&self, user_id: &UserId, role: Role) -> Result<(), BoxError> {
        let response = self
            .http
            .patch(self.row_url(user_id, false)?)
            .header("apikey", &self.config.api_key)
            .header("Prefer", "return=minimal")
            .bearer_auth(self.bearer())
            .json(&serde_json::json!({ "role": role }))
            .send()
            .await?;

        ensure_success(response, "profile write").await?;
        Ok(())
    }
}

/// A missing row and a null column both mean "no role chosen".
fn role_from_rows(rows: &[ProfileRow]) -> Result<Option<Role>, Error> {
    rows.first()
        .and_then(|row| row.role.as_deref())
        .map(str::parse::<Role>)
        .transpose()
}

fn transport(operation: &'static str, e: &reqwest::Error) -> ProviderError {
    ProviderError::Unavailable(format!("{operation}: {e}"))
}

/// Checks HTTP response status; client errors mean the credential was
/// refused, anything else non-2xx means the backend is unavailable.
async fn ensure_success(
    response: reqwest::Response,
    operation: &'static str,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{operation} returned {}: {body}", status.as_u16());
    if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(ProviderError::Rejected(detail))
    } else {
        Err(ProviderError::Unavailable(detail))
    }
}
