//! API client for communicating with the Marketspace REST API.
//!
//! This module provides the `ApiClient` struct, which is also the HTTP layer
//! the `SessionManager` registers with. It keeps the default bearer token,
//! renews it when the server reports it expired, and tells the registered
//! interceptor about renewals and rejections.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{
    AuthHeader, AuthInterceptor, AuthTransport, InterceptorRegistration, InterceptorSlot,
    RefreshedToken,
};
use crate::models::{AuthToken, SignInResponse, TokenResponse, UserProfile};

use super::{ApiError, RefreshGate};

// ============================================================================
// Constants
// ============================================================================

/// Sign-in endpoint
const SESSIONS_PATH: &str = "/sessions";

/// Token renewal endpoint
const REFRESH_TOKEN_PATH: &str = "/sessions/refresh-token";

/// Profile of the signed-in user
const ME_PATH: &str = "/users/me";

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Serialize)]
struct SessionRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// API client for Marketspace.
/// Clone is cheap - clones share the connection pool, the default token and
/// the registered interceptor.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    auth: Arc<RwLock<Option<AuthHeader>>>,
    interceptor: InterceptorSlot,
    refresh_gate: Arc<RefreshGate<AuthHeader>>,
}

impl ApiClient {
    /// Create a new API client for the given base URL
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: Arc::new(RwLock::new(None)),
            interceptor: InterceptorSlot::new(),
            refresh_gate: Arc::new(RefreshGate::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn current_auth(&self) -> Option<AuthHeader> {
        self.auth
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Send one logical request with the given token, backing off on 429.
    async fn execute<T, B>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
        auth: Option<&AuthHeader>,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self.client.request(method.clone(), url);
            if let Some(auth) = auth {
                request = request.bearer_auth(&auth.token.token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    return response.json().await.map_err(|e| {
                        ApiError::InvalidResponse(format!(
                            "Failed to parse JSON response from {}: {}",
                            url, e
                        ))
                    });
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    /// Send a request with the default token. An expired token is refreshed
    /// once and the request retried; a rejected session is reported to the
    /// interceptor.
    async fn send_authorized<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.url(path);
        let sent_with = self.current_auth();

        match self.execute(method.clone(), &url, body, sent_with.as_ref()).await {
            Err(ApiError::TokenExpired) => {}
            Err(ApiError::Unauthorized) => {
                if let Some(rejected) = &sent_with {
                    self.report_auth_failure(rejected.generation).await;
                }
                return Err(ApiError::Unauthorized);
            }
            other => return other,
        }

        let Some(stale) = sent_with else {
            return Err(ApiError::Unauthorized);
        };
        let Some(fresh) = self.refresh_for(&stale).await else {
            self.report_auth_failure(stale.generation).await;
            return Err(ApiError::SessionExpired);
        };

        debug!(url = %url, "Retrying request with refreshed token");
        match self.execute(method, &url, body, Some(&fresh)).await {
            Err(ApiError::TokenExpired) | Err(ApiError::Unauthorized) => {
                self.report_auth_failure(fresh.generation).await;
                Err(ApiError::SessionExpired)
            }
            other => other,
        }
    }

    async fn refresh_for(&self, stale: &AuthHeader) -> Option<AuthHeader> {
        self.refresh_gate
            .run(&stale.token.token, || self.perform_refresh(stale.clone()))
            .await
    }

    async fn perform_refresh(&self, stale: AuthHeader) -> Option<AuthHeader> {
        let Some(refresh_token) = stale.token.refresh_token.as_deref() else {
            warn!(generation = stale.generation, "No refresh token available");
            return None;
        };

        let url = self.url(REFRESH_TOKEN_PATH);
        let body = RefreshRequest { refresh_token };
        let response: TokenResponse = match self.execute(Method::POST, &url, Some(&body), None).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, generation = stale.generation, "Token refresh failed");
                return None;
            }
        };

        let mut token = AuthToken::from(response);
        if token.refresh_token.is_none() {
            token.refresh_token = stale.token.refresh_token.clone();
        }
        let fresh = AuthHeader {
            token,
            generation: stale.generation,
        };

        {
            let mut auth = self.auth.write().unwrap_or_else(|e| e.into_inner());
            if auth.as_ref().map(|a| a.generation) != Some(stale.generation) {
                debug!(generation = stale.generation, "Session changed during refresh, dropping new token");
                return None;
            }
            *auth = Some(fresh.clone());
        }

        info!(generation = fresh.generation, "Token refreshed");
        if let Some(interceptor) = self.interceptor.get() {
            interceptor.on_token_refreshed(RefreshedToken {
                token: fresh.token.clone(),
                generation: fresh.generation,
            });
        }
        Some(fresh)
    }

    async fn report_auth_failure(&self, generation: u64) {
        match self.interceptor.get() {
            Some(interceptor) => interceptor.on_auth_failure(generation).await,
            None => debug!(generation, "Auth failure with no interceptor registered"),
        }
    }

    // ===== Authenticated requests =====

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_authorized::<T, ()>(Method::GET, path, None).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_authorized(Method::POST, path, Some(body)).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_authorized(Method::PUT, path, Some(body)).await
    }

    /// Fetch the signed-in user's profile from the server
    pub async fn fetch_me(&self) -> Result<UserProfile, ApiError> {
        self.get(ME_PATH).await
    }
}

#[async_trait]
impl AuthTransport for ApiClient {
    fn set_default_auth(&self, auth: Option<AuthHeader>) {
        *self.auth.write().unwrap_or_else(|e| e.into_inner()) = auth;
    }

    fn register_auth_interceptor(
        &self,
        interceptor: std::sync::Weak<dyn AuthInterceptor>,
    ) -> InterceptorRegistration {
        self.interceptor.register(interceptor)
    }

    async fn create_session(
        &self,
        email: &str,
        password: &str,
    ) -> Result<SignInResponse, ApiError> {
        let url = self.url(SESSIONS_PATH);

        let response = self
            .client
            .post(&url)
            .json(&SessionRequest { email, password })
            .send()
            .await?;

        let response = Self::check_response(response).await?;

        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse sign-in response: {}", e)))
    }
}
