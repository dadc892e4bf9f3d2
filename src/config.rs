use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::Error;

/// How much the deployment trusts cached positive verdicts.
///
/// Preview and staging deployments sit behind slower edge propagation and
/// colder backing stores, so they get longer leniency and role timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustLevel {
    #[default]
    Primary,
    Preview,
}

impl TrustLevel {
    /// `Primary` when `current` has the same origin as the configured
    /// primary deployment, `Preview` otherwise.
    #[must_use]
    pub fn for_origin(current: &Url, primary: &Url) -> Self {
        if current.origin() == primary.origin() {
            Self::Primary
        } else {
            Self::Preview
        }
    }
}

impl FromStr for TrustLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "production" => Ok(Self::Primary),
            "preview" | "staging" => Ok(Self::Preview),
            other => Err(Error::Config(format!("unknown trust level: {other}"))),
        }
    }
}

/// Timing policy for session and role resolution.
///
/// Use [`new()`](ResolverConfig::new) and `with_*` overrides, or
/// [`from_env()`](ResolverConfig::from_env) for convention-based setup.
///
/// ```rust,ignore
/// use std::time::Duration;
/// use marketplace_auth::{ResolverConfig, TrustLevel};
///
/// let config = ResolverConfig::new(TrustLevel::Preview)
///     .with_debounce(Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ResolverConfig {
    pub(crate) trust_level: TrustLevel,
    pub(crate) debounce: Duration,
    pub(crate) leniency: Duration,
    pub(crate) early_retry_checks: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) hint_max_age: Duration,
    pub(crate) provider_timeout: Duration,
    pub(crate) role_timeout: Duration,
    pub(crate) role_settle_delay: Duration,
    pub(crate) role_retry_attempts: u32,
    pub(crate) role_retry_backoff: Duration,
}

impl ResolverConfig {
    /// Defaults for the given trust level.
    #[must_use]
    pub fn new(trust_level: TrustLevel) -> Self {
        let (leniency, role_timeout) = match trust_level {
            TrustLevel::Primary => (Duration::from_secs(20 * 60), Duration::from_secs(5)),
            TrustLevel::Preview => (Duration::from_secs(30 * 60), Duration::from_secs(10)),
        };
        Self {
            trust_level,
            debounce: Duration::from_secs(2),
            leniency,
            early_retry_checks: 5,
            retry_delay: Duration::from_millis(500),
            hint_max_age: Duration::from_secs(60 * 60),
            provider_timeout: Duration::from_secs(10),
            role_timeout,
            role_settle_delay: Duration::from_millis(500),
            role_retry_attempts: 3,
            role_retry_backoff: Duration::from_secs(1),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Optional env vars
    /// - `AUTH_TRUST_LEVEL`: `primary` (default) or `preview`
    /// - `AUTH_DEBOUNCE_MS`
    /// - `AUTH_LENIENCY_SECS`
    /// - `AUTH_EARLY_RETRY_CHECKS`
    /// - `AUTH_RETRY_DELAY_MS`
    /// - `AUTH_HINT_MAX_AGE_SECS`
    /// - `AUTH_PROVIDER_TIMEOUT_MS`
    /// - `AUTH_ROLE_TIMEOUT_MS`
    /// - `AUTH_ROLE_SETTLE_MS`
    ///
    /// Unset variables keep the trust level's defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, Error> {
        let trust_level = match std::env::var("AUTH_TRUST_LEVEL") {
            Ok(value) => value.parse()?,
            Err(_) => TrustLevel::default(),
        };

        let mut config = Self::new(trust_level);

        if let Some(ms) = env_number("AUTH_DEBOUNCE_MS")? {
            config = config.with_debounce(Duration::from_millis(ms));
        }
        if let Some(secs) = env_number("AUTH_LENIENCY_SECS")? {
            config = config.with_leniency(Duration::from_secs(secs));
        }
        if let Some(checks) = env_number("AUTH_EARLY_RETRY_CHECKS")? {
            let checks = u32::try_from(checks)
                .map_err(|e| Error::Config(format!("AUTH_EARLY_RETRY_CHECKS: {e}")))?;
            config = config.with_early_retry_checks(checks);
        }
        if let Some(ms) = env_number("AUTH_RETRY_DELAY_MS")? {
            config = config.with_retry_delay(Duration::from_millis(ms));
        }
        if let Some(secs) = env_number("AUTH_HINT_MAX_AGE_SECS")? {
            config = config.with_hint_max_age(Duration::from_secs(secs));
        }
        if let Some(ms) = env_number("AUTH_PROVIDER_TIMEOUT_MS")? {
            config = config.with_provider_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = env_number("AUTH_ROLE_TIMEOUT_MS")? {
            config = config.with_role_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = env_number("AUTH_ROLE_SETTLE_MS")? {
            config = config.with_role_settle_delay(Duration::from_millis(ms));
        }

        Ok(config)
    }

    /// Window after an invocation during which repeat checks get the cached answer.
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// How long a verified positive check is trusted without the provider.
    #[must_use]
    pub fn with_leniency(mut self, leniency: Duration) -> Self {
        self.leniency = leniency;
        self
    }

    /// Number of real checks after sign-in that get a retry on provider error.
    #[must_use]
    pub fn with_early_retry_checks(mut self, checks: u32) -> Self {
        self.early_retry_checks = checks;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Maximum age of a persisted hint that still grants continuity.
    #[must_use]
    pub fn with_hint_max_age(mut self, max_age: Duration) -> Self {
        self.hint_max_age = max_age;
        self
    }

    #[must_use]
    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_role_timeout(mut self, timeout: Duration) -> Self {
        self.role_timeout = timeout;
        self
    }

    /// Delay before `refresh_role` reads, covering read-after-write lag.
    #[must_use]
    pub fn with_role_settle_delay(mut self, delay: Duration) -> Self {
        self.role_settle_delay = delay;
        self
    }

    /// Background retries for role lookups that timed out or failed.
    #[must_use]
    pub fn with_role_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.role_retry_attempts = attempts;
        self.role_retry_backoff = backoff;
        self
    }

    #[must_use]
    pub fn trust_level(&self) -> TrustLevel {
        self.trust_level
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    #[must_use]
    pub fn leniency(&self) -> Duration {
        self.leniency
    }

    #[must_use]
    pub fn early_retry_checks(&self) -> u32 {
        self.early_retry_checks
    }

    #[must_use]
    pub fn hint_max_age(&self) -> Duration {
        self.hint_max_age
    }

    #[must_use]
    pub fn provider_timeout(&self) -> Duration {
        self.provider_timeout
    }

    #[must_use]
    pub fn role_timeout(&self) -> Duration {
        self.role_timeout
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::new(TrustLevel::Primary)
    }
}

fn env_number(name: &str) -> Result<Option<u64>, Error> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}: {e}"))),
        Err(_) => Ok(None),
    }
}
