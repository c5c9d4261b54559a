//! REST API client module for the Marketspace API.
//!
//! This module provides the `ApiClient` for signing in and for making
//! authenticated requests. The API uses bearer tokens obtained from
//! `POST /sessions`; expired tokens are renewed through
//! `POST /sessions/refresh-token` and the failed request is retried.

pub mod client;
pub mod error;
pub mod refresh;

pub use client::ApiClient;
pub use error::ApiError;
pub use refresh::RefreshGate;
