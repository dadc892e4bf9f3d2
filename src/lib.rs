#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod fragment;
#[cfg(feature = "http")]
pub mod http;
pub mod machine;
pub mod provider;
mod race;
pub mod resolver;
pub mod role;
mod state;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

// Re-exports for convenient access
pub use config::{ResolverConfig, TrustLevel};
pub use error::{BoxError, Error, ProviderError};
pub use fragment::credential_fragment;
#[cfg(feature = "http")]
pub use http::{FragmentCredential, RestConfig, RestIdentityProvider, RestProfileStore};
pub use machine::AuthStateMachine;
pub use provider::{IdentityProvider, ProfileStore, SessionChange};
pub use resolver::{CachedCheck, SessionResolver};
pub use role::{RoleLookup, RoleResolver};
pub use state::Subscription;
pub use store::{
    CredentialStore, FileCredentialStore, LAST_VERIFIED_KEY, MemoryCredentialStore,
    PersistedHint, TOKEN_KEY,
};
pub use types::{AuthState, AuthStatus, Role, RoleStatus, Session, SessionEvent, UserId};
