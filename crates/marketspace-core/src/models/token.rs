use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Bearer token record as kept in memory and in the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn new(token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            token: token.into(),
            refresh_token,
            issued_at: Utc::now(),
        }
    }

    /// Value for the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.issued_at
    }

    /// Age for display, e.g. "just now", "12m", "3h"
    pub fn age_display(&self) -> String {
        let minutes = self.age().num_minutes();
        if minutes < 1 {
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m", minutes)
        } else if minutes < 1440 {
            format!("{}h", minutes / 60)
        } else {
            format!("{}d", minutes / 1440)
        }
    }
}

/// Body of a successful `POST /sessions/refresh-token`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl From<TokenResponse> for AuthToken {
    fn from(resp: TokenResponse) -> Self {
        AuthToken::new(resp.token, resp.refresh_token)
    }
}
