//! Data models shared by the session manager and the API client.
//!
//! - `UserProfile`: identity of the signed-in user
//! - `AuthToken`: bearer token record as persisted
//! - `SignInResponse`, `TokenResponse`: wire shapes of the session endpoints

pub mod token;
pub mod user;

pub use token::{AuthToken, TokenResponse};
pub use user::{SignInResponse, UserProfile};
