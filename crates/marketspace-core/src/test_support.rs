//! Fakes shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Notify};

use crate::api::ApiError;
use crate::auth::{AuthHeader, AuthInterceptor, AuthTransport, InterceptorRegistration, InterceptorSlot};
use crate::models::{SignInResponse, UserProfile};
use crate::storage::{KeyValueStore, MemoryStore, StorageError};

pub(crate) fn sample_user(id: &str) -> UserProfile {
    UserProfile {
        id: id.to_string(),
        name: format!("User {}", id),
        email: format!("{}@example.com", id),
        avatar: Some(format!("{}.png", id)),
        phone: Some("11999990000".to_string()),
    }
}

pub(crate) fn sign_in_response(user_id: &str, token: &str) -> SignInResponse {
    SignInResponse {
        user: sample_user(user_id),
        token: token.to_string(),
        refresh_token: Some(format!("ref-{}", token)),
    }
}

/// Transport double that records the default header and replays queued
/// sign-in responses.
#[derive(Default)]
pub(crate) struct FakeTransport {
    auth: Mutex<Option<AuthHeader>>,
    slot: InterceptorSlot,
    responses: Mutex<VecDeque<Result<SignInResponse, ApiError>>>,
    hold: Mutex<Option<oneshot::Receiver<()>>>,
    entered: Notify,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn respond_with(&self, response: Result<SignInResponse, ApiError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// Make the next sign-in call wait until the returned sender fires
    pub(crate) fn hold_next_sign_in(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.hold.lock().unwrap() = Some(rx);
        tx
    }

    /// Resolve once a sign-in call has reached the transport
    pub(crate) async fn wait_for_sign_in(&self) {
        self.entered.notified().await;
    }

    pub(crate) fn auth(&self) -> Option<AuthHeader> {
        self.auth.lock().unwrap().clone()
    }

    pub(crate) fn bearer(&self) -> Option<String> {
        self.auth().map(|a| a.token.bearer())
    }

    pub(crate) fn interceptor(&self) -> Arc<dyn AuthInterceptor> {
        self.slot.get().expect("no live interceptor registered")
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.slot.is_registered()
    }
}

#[async_trait]
impl AuthTransport for FakeTransport {
    fn set_default_auth(&self, auth: Option<AuthHeader>) {
        *self.auth.lock().unwrap() = auth;
    }

    fn register_auth_interceptor(
        &self,
        interceptor: Weak<dyn AuthInterceptor>,
    ) -> InterceptorRegistration {
        self.slot.register(interceptor)
    }

    async fn create_session(
        &self,
        _email: &str,
        _password: &str,
    ) -> Result<SignInResponse, ApiError> {
        self.entered.notify_one();
        let hold = self.hold.lock().unwrap().take();
        if let Some(rx) = hold {
            let _ = rx.await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ApiError::Unauthorized))
    }
}

/// Memory store with switchable failures and a one-shot write gate.
#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_removes: AtomicBool,
    fail_write_key: Mutex<Option<String>>,
    held_write: Mutex<Option<(String, oneshot::Receiver<()>)>>,
    write_entered: Notify,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes_to(&self, key: Option<&str>) {
        *self.fail_write_key.lock().unwrap() = key.map(str::to_string);
    }

    /// Make the next write to `key` wait until the returned sender fires
    pub(crate) fn hold_next_write_to(&self, key: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.held_write.lock().unwrap() = Some((key.to_string(), rx));
        tx
    }

    /// Resolve once the held write has started
    pub(crate) async fn wait_for_held_write(&self) {
        self.write_entered.notified().await;
    }

    fn io_error() -> StorageError {
        StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk unavailable"))
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::io_error());
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let fail = self.fail_write_key.lock().unwrap().as_deref() == Some(key);
        if fail {
            return Err(Self::io_error());
        }

        let hold = {
            let mut held = self.held_write.lock().unwrap();
            match held.take() {
                Some((held_key, rx)) if held_key == key => Some(rx),
                other => {
                    *held = other;
                    None
                }
            }
        };
        if let Some(rx) = hold {
            self.write_entered.notify_one();
            let _ = rx.await;
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(Self::io_error());
        }
        self.inner.remove(key).await
    }
}

/// Token the stub API issues on sign-in
pub(crate) const STUB_TOKEN: &str = "tok-1";

/// Token the stub API issues on refresh
pub(crate) const STUB_REFRESHED_TOKEN: &str = "tok-2";

/// In-process HTTP server speaking the sessions and `/users/me` endpoints.
pub(crate) struct StubApi {
    /// Bearer token `/users/me` currently accepts
    accepted: Mutex<Option<String>>,
    /// `message` of the 401 body for any other token
    rejection: Mutex<&'static str>,
    refresh_allowed: AtomicBool,
    refresh_calls: AtomicUsize,
    me_calls: AtomicUsize,
    held_refresh: Mutex<Option<oneshot::Receiver<()>>>,
    refresh_entered: Notify,
}

impl StubApi {
    /// Bind on a free local port; returns the stub and its base URL
    pub(crate) async fn start() -> (Arc<Self>, String) {
        let stub = Arc::new(Self {
            accepted: Mutex::new(None),
            rejection: Mutex::new("token.expired"),
            refresh_allowed: AtomicBool::new(true),
            refresh_calls: AtomicUsize::new(0),
            me_calls: AtomicUsize::new(0),
            held_refresh: Mutex::new(None),
            refresh_entered: Notify::new(),
        });

        let app = Router::new()
            .route("/sessions", post(stub_create_session))
            .route("/sessions/refresh-token", post(stub_refresh_token))
            .route("/users/me", get(stub_me))
            .with_state(stub.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (stub, format!("http://{}", addr))
    }

    /// Stop accepting the current token; the 401 says `token.expired`
    pub(crate) fn expire_token(&self) {
        *self.accepted.lock().unwrap() = None;
        *self.rejection.lock().unwrap() = "token.expired";
    }

    /// Stop accepting the current token with a 401 that cannot be refreshed
    pub(crate) fn revoke_token(&self) {
        *self.accepted.lock().unwrap() = None;
        *self.rejection.lock().unwrap() = "Unauthorized";
    }

    pub(crate) fn reject_refresh(&self) {
        self.refresh_allowed.store(false, Ordering::SeqCst);
    }

    /// Make the next refresh wait until the returned sender fires
    pub(crate) fn hold_next_refresh(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.held_refresh.lock().unwrap() = Some(rx);
        tx
    }

    /// Resolve once a refresh request has reached the stub
    pub(crate) async fn wait_for_refresh(&self) {
        self.refresh_entered.notified().await;
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn me_calls(&self) -> usize {
        self.me_calls.load(Ordering::SeqCst)
    }
}

async fn stub_create_session(State(stub): State<Arc<StubApi>>) -> Json<Value> {
    *stub.accepted.lock().unwrap() = Some(STUB_TOKEN.to_string());
    Json(json!({
        "user": sample_user("u1"),
        "token": STUB_TOKEN,
        "refresh_token": "ref-1",
    }))
}

async fn stub_refresh_token(State(stub): State<Arc<StubApi>>) -> (StatusCode, Json<Value>) {
    stub.refresh_calls.fetch_add(1, Ordering::SeqCst);
    stub.refresh_entered.notify_one();
    let hold = stub.held_refresh.lock().unwrap().take();
    if let Some(rx) = hold {
        let _ = rx.await;
    }

    if !stub.refresh_allowed.load(Ordering::SeqCst) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "token.invalid" })),
        );
    }
    *stub.accepted.lock().unwrap() = Some(STUB_REFRESHED_TOKEN.to_string());
    (
        StatusCode::OK,
        Json(json!({ "token": STUB_REFRESHED_TOKEN, "refresh_token": "ref-2" })),
    )
}

async fn stub_me(State(stub): State<Arc<StubApi>>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    stub.me_calls.fetch_add(1, Ordering::SeqCst);
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let accepted = stub.accepted.lock().unwrap().clone();

    if bearer.is_some() && bearer == accepted {
        (StatusCode::OK, Json(json!(sample_user("u1"))))
    } else {
        let message = *stub.rejection.lock().unwrap();
        (StatusCode::UNAUTHORIZED, Json(json!({ "message": message })))
    }
}
