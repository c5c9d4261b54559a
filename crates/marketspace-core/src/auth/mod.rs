//! Authentication: the user's session and where it is kept.
//!
//! This module provides:
//! - `SessionManager`: owns the signed-in user and bearer token, restores
//!   them at startup, and reacts to token refreshes and server rejections
//! - `CredentialStore`: persists profile and token under two fixed keys
//! - `AuthInterceptor` / `AuthTransport`: the contract with the HTTP layer
//!
//! Sessions are persisted to the configured key-value store and survive
//! process restarts.

pub mod credentials;
pub mod error;
pub mod interceptor;
pub mod session;

pub use credentials::{CredentialStore, AUTH_TOKEN_STORAGE_KEY, USER_STORAGE_KEY};
pub use error::AuthError;
pub use interceptor::{
    AuthHeader, AuthInterceptor, AuthTransport, InterceptorRegistration, InterceptorSlot,
    RefreshedToken,
};
pub use session::{SessionManager, SessionOptions, SessionSnapshot, SessionState};
