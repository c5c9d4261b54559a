//! Core library for the Marketspace client.
//!
//! This crate owns everything the app needs to keep a user signed in against
//! the Marketspace API:
//!
//! - `auth`: the `SessionManager`, its `CredentialStore`, and the interceptor
//!   contract the HTTP layer uses to report token refreshes and rejections
//! - `api`: the reqwest-based `ApiClient` with single-flight token refresh
//! - `storage`: key-value backends (memory, JSON files, OS keychain)
//! - `config`: application configuration on disk
//! - `models`: user profile and token records

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiClient, ApiError};
pub use auth::{
    AuthError, AuthHeader, AuthInterceptor, AuthTransport, CredentialStore,
    InterceptorRegistration, RefreshedToken, SessionManager, SessionOptions, SessionSnapshot,
    SessionState,
};
pub use config::{Config, StorageBackend};
pub use models::{AuthToken, SignInResponse, UserProfile};
pub use storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore, StorageError};
