use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::Error;
use crate::types::Session;

/// Key holding the last-known opaque credential.
pub const TOKEN_KEY: &str = "auth.token";
/// Key holding the RFC 3339 timestamp of the last successful validation.
pub const LAST_VERIFIED_KEY: &str = "auth.lastVerifiedAt";

/// Persisted key/value storage that survives restarts.
///
/// No logic beyond get/set/clear. Every value is advisory: the resolver
/// treats a missing key as a normal state and logs store failures instead
/// of propagating them.
pub trait CredentialStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>, Error>;

    fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    /// Remove a key. Removing an absent key is not an error.
    fn clear(&self, key: &str) -> Result<(), Error>;
}

impl<T: CredentialStore> CredentialStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        (**self).set(key, value)
    }

    fn clear(&self, key: &str) -> Result<(), Error> {
        (**self).clear(key)
    }
}

/// Process-local store. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.entries.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), Error> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// JSON file backed store.
///
/// The whole map is rewritten on every mutation; last write wins.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileCredentialStore {
    /// Open (or lazily create) the store at `path`.
    ///
    /// A missing file is an empty store. An unreadable or corrupt file is
    /// also treated as empty, since its contents are only hints.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Discarding corrupt credential file");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Credential file unreadable");
                HashMap::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &HashMap<String, String>) -> Result<(), Error> {
        let bytes = serde_json::to_vec(entries).map_err(|e| Error::Store(e.to_string()))?;
        std::fs::write(&self.path, bytes)
            .map_err(|e| Error::Store(format!("{}: {e}", self.path.display())))
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_owned(), value.to_owned());
        self.flush(&entries)
    }

    fn clear(&self, key: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

/// Heuristic left behind by the last confirmed session.
///
/// Read only while recovering from a provider outage. A fresh hint raises
/// leniency; it never grants authentication by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistedHint {
    pub last_session_at: Option<OffsetDateTime>,
    pub has_stored_token: bool,
}

impl PersistedHint {
    /// Read the hint. Store failures and malformed timestamps read as absent.
    pub fn load<S: CredentialStore + ?Sized>(store: &S) -> Self {
        let has_stored_token = match store.get(TOKEN_KEY) {
            Ok(token) => token.is_some_and(|t| !t.is_empty()),
            Err(e) => {
                tracing::warn!(error = %e, "Credential store read failed");
                false
            }
        };

        let last_session_at = match store.get(LAST_VERIFIED_KEY) {
            Ok(Some(raw)) => OffsetDateTime::parse(&raw, &Rfc3339)
                .map_err(|e| tracing::debug!(error = %e, "Ignoring malformed lastVerifiedAt"))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Credential store read failed");
                None
            }
        };

        Self {
            last_session_at,
            has_stored_token,
        }
    }

    /// Whether a session was confirmed no longer than `max_age` before `now`.
    #[must_use]
    pub fn is_fresh(&self, now: OffsetDateTime, max_age: Duration) -> bool {
        if !self.has_stored_token {
            return false;
        }
        match self.last_session_at {
            Some(at) => {
                let age = now - at;
                !age.is_negative() && age <= max_age
            }
            None => false,
        }
    }

    /// Persist a confirmed session. Best-effort.
    pub(crate) fn record<S: CredentialStore + ?Sized>(
        store: &S,
        session: &Session,
        at: OffsetDateTime,
    ) {
        if let Err(e) = store.set(TOKEN_KEY, &session.raw_token) {
            tracing::warn!(error = %e, "Failed to persist credential");
        }
        match at.format(&Rfc3339) {
            Ok(stamp) => {
                if let Err(e) = store.set(LAST_VERIFIED_KEY, &stamp) {
                    tracing::warn!(error = %e, "Failed to persist lastVerifiedAt");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to format lastVerifiedAt"),
        }
    }

    /// Remove token and timestamp. Best-effort.
    pub(crate) fn forget<S: CredentialStore + ?Sized>(store: &S) {
        for key in [TOKEN_KEY, LAST_VERIFIED_KEY] {
            if let Err(e) = store.clear(key) {
                tracing::warn!(key, error = %e, "Failed to clear credential key");
            }
        }
    }
}
