use thiserror::Error;

use crate::api::ApiError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Network error: {0}")]
    Network(ApiError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sign-in rejected: {0}")]
    AuthRejected(String),

    #[error("Session is no longer valid - please sign in again")]
    SessionInvalidated,

    #[error("No user is signed in")]
    NotSignedIn,

    #[error("Session changed while the operation was in progress")]
    Superseded,

    #[error("Operation interrupted: {0}")]
    Interrupted(String),
}

impl From<ApiError> for AuthError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::SessionExpired => AuthError::SessionInvalidated,
            other => AuthError::Network(other),
        }
    }
}

impl AuthError {
    /// Classify an error from the sign-in endpoint. Credential problems become
    /// `AuthRejected`; everything else is passed through.
    pub(crate) fn from_sign_in(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized | ApiError::TokenExpired => {
                AuthError::AuthRejected("Invalid email or password".to_string())
            }
            ApiError::AccessDenied(msg) | ApiError::BadRequest(msg) => AuthError::AuthRejected(msg),
            other => other.into(),
        }
    }

    /// Short message suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            AuthError::AuthRejected(msg) => msg.clone(),
            AuthError::Network(ApiError::NetworkError(e)) if e.is_timeout() => {
                "Connection timed out. Please try again.".to_string()
            }
            AuthError::Network(ApiError::NetworkError(_)) => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
            AuthError::Network(ApiError::RateLimited) => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            AuthError::Network(e) => format!("Request failed: {}", e),
            AuthError::Storage(_) => "Could not save your session on this device.".to_string(),
            AuthError::SessionInvalidated => "Your session expired. Please sign in again.".to_string(),
            AuthError::NotSignedIn => "You are not signed in.".to_string(),
            AuthError::Superseded => "You were signed out while this was in progress.".to_string(),
            AuthError::Interrupted(_) => "The operation was interrupted.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_in_rejections() {
        assert!(matches!(
            AuthError::from_sign_in(ApiError::Unauthorized),
            AuthError::AuthRejected(_)
        ));
        match AuthError::from_sign_in(ApiError::BadRequest("E-mail required".to_string())) {
            AuthError::AuthRejected(msg) => assert_eq!(msg, "E-mail required"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            AuthError::from_sign_in(ApiError::ServerError("boom".to_string())),
            AuthError::Network(ApiError::ServerError(_))
        ));
    }

    #[test]
    fn test_session_expired_becomes_invalidated() {
        assert!(matches!(
            AuthError::from(ApiError::SessionExpired),
            AuthError::SessionInvalidated
        ));
    }
}
