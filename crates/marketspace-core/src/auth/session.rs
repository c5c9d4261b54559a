//! Session manager: owns the signed-in user and bearer token.
//!
//! A session is either fully present (profile and token both held in memory
//! and persisted) or fully absent. Every established session gets a new
//! generation number; sign-out advances the generation as well, so work that
//! started under an older generation (an in-flight sign-in, a token refresh,
//! an auth failure report) can tell that the session it belonged to is gone.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[cfg(feature = "ts")]
use ts_rs::TS;

use super::credentials::CredentialStore;
use super::error::AuthError;
use super::interceptor::{
    AuthHeader, AuthInterceptor, AuthTransport, InterceptorRegistration, RefreshedToken,
};
use crate::models::{AuthToken, UserProfile};
use crate::storage::StorageError;

/// Delay before a refreshed token is written to storage.
/// Refreshes can arrive once per request, so writes are batched.
pub const DEFAULT_TOKEN_FLUSH_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub enum SessionState {
    /// Startup, before the stored session has been read
    Restoring,
    Authenticated,
    Unauthenticated,
}

/// Point-in-time view of the session, published to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub user: Option<UserProfile>,
    pub token: Option<String>,
    /// True while restoring, signing in or signing out. A missing user during
    /// this window does not mean signed out.
    pub is_loading: bool,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub token_flush_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            token_flush_delay: DEFAULT_TOKEN_FLUSH_DELAY,
        }
    }
}

struct Session {
    user: UserProfile,
    token: AuthToken,
    generation: u64,
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    restoring: bool,
    loading: u32,
    generation: u64,
    /// Generation assigned by the most recent sign-out
    revoked_at: u64,
    /// Refreshed token not yet written to storage
    pending_token: Option<RefreshedToken>,
    flush_scheduled: bool,
}

impl Inner {
    fn state(&self) -> SessionState {
        if self.session.is_some() {
            SessionState::Authenticated
        } else if self.restoring {
            SessionState::Restoring
        } else {
            SessionState::Unauthenticated
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state(),
            user: self.session.as_ref().map(|s| s.user.clone()),
            token: self.session.as_ref().map(|s| s.token.token.clone()),
            is_loading: self.is_loading(),
            generation: self.generation,
        }
    }

    /// A manager that has not finished restoring counts as loading
    fn is_loading(&self) -> bool {
        self.loading > 0 || self.restoring
    }

    fn current_generation(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.generation)
    }

    fn revoked_since(&self, generation: u64) -> bool {
        self.revoked_at > generation
    }
}

struct Shared {
    me: Weak<Shared>,
    credentials: CredentialStore,
    transport: Arc<dyn AuthTransport>,
    options: SessionOptions,
    inner: Mutex<Inner>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    /// Serializes the manager's storage writes so a sign-out always removes
    /// whatever a concurrent sign-in or flush wrote.
    storage_lock: tokio::sync::Mutex<()>,
    registration: Mutex<Option<InterceptorRegistration>>,
}

/// Decrements the loading counter when dropped.
struct LoadingGuard {
    shared: Arc<Shared>,
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.loading = inner.loading.saturating_sub(1);
        self.shared.publish(&inner);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, inner: &Inner) {
        self.snapshot_tx.send_replace(inner.snapshot());
    }

    fn begin_loading(self: &Arc<Self>) -> LoadingGuard {
        let mut inner = self.lock();
        inner.loading += 1;
        self.publish(&inner);
        LoadingGuard {
            shared: Arc::clone(self),
        }
    }

    fn establish(&self, inner: &mut Inner, user: UserProfile, token: AuthToken) -> u64 {
        inner.generation += 1;
        let generation = inner.generation;
        inner.pending_token = None;
        self.transport.set_default_auth(Some(AuthHeader {
            token: token.clone(),
            generation,
        }));
        inner.session = Some(Session {
            user,
            token,
            generation,
        });
        self.publish(inner);
        generation
    }

    fn clear(&self, inner: &mut Inner) -> bool {
        inner.generation += 1;
        inner.revoked_at = inner.generation;
        inner.pending_token = None;
        let had_session = inner.session.take().is_some();
        self.transport.set_default_auth(None);
        self.publish(inner);
        had_session
    }

    async fn load_stored(&self) -> Result<Option<(UserProfile, AuthToken)>, StorageError> {
        let user = self.credentials.get_profile().await?;
        let token = self.credentials.get_token().await?;
        match (user, token) {
            (Some(user), Some(token)) => Ok(Some((user, token))),
            (user, token) => {
                if user.is_some() || token.is_some() {
                    debug!(
                        has_profile = user.is_some(),
                        has_token = token.is_some(),
                        "Ignoring partial stored session"
                    );
                }
                Ok(None)
            }
        }
    }

    async fn restore(&self, start: u64) {
        let stored = {
            let _storage = self.storage_lock.lock().await;
            self.load_stored().await
        };

        let mut inner = self.lock();
        match stored {
            Ok(Some((user, token))) if inner.generation == start => {
                let generation = self.establish(&mut inner, user, token);
                info!(generation, "Restored stored session");
            }
            Ok(Some(_)) => debug!("Session changed during restore, keeping current state"),
            Ok(None) => info!("No stored session"),
            Err(e) => warn!(error = %e, "Failed to restore session, continuing signed out"),
        }
        inner.restoring = false;
        self.publish(&inner);
    }

    /// `start` is the generation when the caller asked to sign in. Any
    /// sign-out after that point wins over this sign-in.
    async fn sign_in(&self, start: u64, email: &str, password: &str) -> Result<(), AuthError> {
        let response = self
            .transport
            .create_session(email, password)
            .await
            .map_err(|e| {
                warn!(error = %e, "Sign-in request failed");
                AuthError::from_sign_in(e)
            })?;
        let token = AuthToken::new(response.token, response.refresh_token);
        let user = response.user;

        let _storage = self.storage_lock.lock().await;
        if self.lock().revoked_since(start) {
            info!("Sign-in superseded by sign-out, discarding");
            return Err(AuthError::Superseded);
        }

        self.persist_session(&user, &token).await?;

        let mut inner = self.lock();
        if inner.revoked_since(start) {
            // The sign-out is queued on the storage lock and removes what we wrote
            info!("Sign-in superseded by sign-out, discarding");
            return Err(AuthError::Superseded);
        }
        let generation = self.establish(&mut inner, user, token);
        info!(generation, "Signed in");
        Ok(())
    }

    /// Write profile then token. If the token write fails the profile key is
    /// put back so it never pairs with a token from another session.
    async fn persist_session(&self, user: &UserProfile, token: &AuthToken) -> Result<(), StorageError> {
        let previous = self.lock().session.as_ref().map(|s| s.user.clone());

        self.credentials.save_profile(user).await?;
        if let Err(e) = self.credentials.save_token(token).await {
            let rollback = match &previous {
                Some(profile) => self.credentials.save_profile(profile).await,
                None => self.credentials.remove_profile().await,
            };
            if let Err(rollback_err) = rollback {
                warn!(error = %rollback_err, "Failed to roll back stored profile");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn remove_stored(&self) {
        let _storage = self.storage_lock.lock().await;
        if let Err(e) = self.credentials.remove_profile().await {
            warn!(error = %e, "Failed to remove stored profile");
        }
        if let Err(e) = self.credentials.remove_token().await {
            warn!(error = %e, "Failed to remove stored token");
        }
    }

    fn end_session(&self) {
        let had_session = {
            let mut inner = self.lock();
            self.clear(&mut inner)
        };
        info!(had_session, "Signed out");
    }

    async fn force_sign_out(&self, generation: u64) {
        let cleared = {
            let mut inner = self.lock();
            let is_current = inner.current_generation() == Some(generation);
            if is_current {
                self.clear(&mut inner);
            }
            is_current
        };
        if !cleared {
            debug!(generation, "Ignoring auth failure for a session that is already gone");
            return;
        }
        warn!(generation, "Session rejected by server, signing out");
        self.remove_stored().await;
    }

    async fn update_profile(&self, profile: UserProfile) -> Result<(), AuthError> {
        let generation = {
            let mut inner = self.lock();
            let session = inner.session.as_mut().ok_or(AuthError::NotSignedIn)?;
            session.user = profile.clone();
            let generation = session.generation;
            self.publish(&inner);
            generation
        };

        let _storage = self.storage_lock.lock().await;
        if self.lock().current_generation() != Some(generation) {
            return Err(AuthError::Superseded);
        }
        self.credentials.save_profile(&profile).await?;
        debug!(generation, "Profile updated");
        Ok(())
    }

    fn token_refreshed(&self, refreshed: RefreshedToken) {
        let schedule = {
            let mut inner = self.lock();
            if inner.current_generation() != Some(refreshed.generation) {
                debug!(
                    generation = refreshed.generation,
                    current = inner.generation,
                    "Discarding token refresh for a session that is already gone"
                );
                return;
            }
            if let Some(session) = inner.session.as_mut() {
                session.token = refreshed.token.clone();
            }
            self.transport.set_default_auth(Some(AuthHeader {
                token: refreshed.token.clone(),
                generation: refreshed.generation,
            }));
            inner.pending_token = Some(refreshed);
            self.publish(&inner);
            !std::mem::replace(&mut inner.flush_scheduled, true)
        };

        if schedule {
            self.schedule_flush();
        }
    }

    fn schedule_flush(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime for background flush, refreshed token waits for flush()");
            self.lock().flush_scheduled = false;
            return;
        };

        let weak = self.me.clone();
        let delay = self.options.token_flush_delay;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                if let Err(e) = shared.flush_pending().await {
                    warn!(error = %e, "Failed to persist refreshed token");
                }
            }
        });
    }

    async fn flush_pending(&self) -> Result<(), StorageError> {
        let _storage = self.storage_lock.lock().await;
        let pending = {
            let mut inner = self.lock();
            inner.flush_scheduled = false;
            let current = inner.current_generation();
            match inner.pending_token.take() {
                Some(pending) if Some(pending.generation) == current => pending,
                _ => return Ok(()),
            }
        };

        if let Err(e) = self.credentials.save_token(&pending.token).await {
            let mut inner = self.lock();
            if inner.pending_token.is_none()
                && inner.current_generation() == Some(pending.generation)
            {
                inner.pending_token = Some(pending);
            }
            return Err(e);
        }
        debug!(generation = pending.generation, "Persisted refreshed token");
        Ok(())
    }
}

#[async_trait]
impl AuthInterceptor for Shared {
    async fn on_auth_failure(&self, generation: u64) {
        let Some(shared) = self.me.upgrade() else {
            return;
        };
        let result = run_to_completion(async move { shared.force_sign_out(generation).await }).await;
        if let Err(e) = result {
            warn!(error = %e, "Forced sign-out did not complete");
        }
    }

    fn on_token_refreshed(&self, refreshed: RefreshedToken) {
        self.token_refreshed(refreshed);
    }
}

/// Drive `fut` on its own task so that dropping the caller's future does not
/// abandon a state transition half way.
async fn run_to_completion<F>(fut: F) -> Result<F::Output, AuthError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(output) => Ok(output),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(AuthError::Interrupted(e.to_string())),
    }
}

/// Handle to the app's session. Cheap to clone; all clones share one session.
///
/// Construct one at startup and pass it to whatever needs the current user.
/// On construction the manager registers itself with the transport so
/// refreshed tokens and server-side rejections reach it; `shutdown()` (or
/// dropping the last clone) removes that registration.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Create a manager in the `Restoring` state. Call `restore()` next, or use
    /// `start()` to do both.
    pub fn new(
        credentials: CredentialStore,
        transport: Arc<dyn AuthTransport>,
        options: SessionOptions,
    ) -> Self {
        let initial = Inner {
            restoring: true,
            ..Default::default()
        };
        let (snapshot_tx, _) = watch::channel(initial.snapshot());

        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            credentials,
            transport,
            options,
            inner: Mutex::new(initial),
            snapshot_tx,
            storage_lock: tokio::sync::Mutex::new(()),
            registration: Mutex::new(None),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let interceptor: Weak<dyn AuthInterceptor> = weak;
        let registration = shared.transport.register_auth_interceptor(interceptor);
        *shared
            .registration
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(registration);

        Self { shared }
    }

    /// Create a manager and restore any stored session.
    pub async fn start(
        credentials: CredentialStore,
        transport: Arc<dyn AuthTransport>,
        options: SessionOptions,
    ) -> Self {
        let manager = Self::new(credentials, transport, options);
        manager.restore().await;
        manager
    }

    /// Load the stored session, if both the profile and the token are present.
    ///
    /// Storage errors are logged and treated as signed out.
    pub async fn restore(&self) {
        let loading = self.shared.begin_loading();
        let start = self.shared.lock().generation;
        let shared = self.shared.clone();
        let restoring = async move {
            let _loading = loading;
            shared.restore(start).await
        };
        if let Err(e) = run_to_completion(restoring).await {
            warn!(error = %e, "Session restore did not complete");
        }
    }

    /// Authenticate and establish a new session.
    ///
    /// On failure any existing session is left as it was.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(), AuthError> {
        // Taken before spawning so that a sign_out called after this one
        // always supersedes it, whichever task the runtime polls first
        let loading = self.shared.begin_loading();
        let start = self.shared.lock().generation;

        let shared = self.shared.clone();
        let email = email.to_string();
        let password = password.to_string();
        run_to_completion(async move {
            let _loading = loading;
            shared.sign_in(start, &email, &password).await
        })
        .await?
    }

    /// End the session. The in-memory session is cleared when this is called,
    /// before storage is touched; storage failures are logged and do not fail
    /// the sign-out.
    pub async fn sign_out(&self) {
        let loading = self.shared.begin_loading();
        self.shared.end_session();

        let shared = self.shared.clone();
        let removing = async move {
            let _loading = loading;
            shared.remove_stored().await
        };
        if let Err(e) = run_to_completion(removing).await {
            warn!(error = %e, "Sign-out did not complete");
        }
    }

    /// Replace the profile. The in-memory copy changes immediately; a storage
    /// failure is returned but not rolled back.
    pub async fn update_profile(&self, profile: UserProfile) -> Result<(), AuthError> {
        let shared = self.shared.clone();
        run_to_completion(async move { shared.update_profile(profile).await }).await?
    }

    /// Apply a token obtained by a background refresh. Ignored unless
    /// `refreshed.generation` is the current session's generation.
    pub fn on_token_refreshed(&self, refreshed: RefreshedToken) {
        self.shared.token_refreshed(refreshed);
    }

    /// Write any refreshed token that has not been persisted yet.
    pub async fn flush(&self) -> Result<(), AuthError> {
        self.shared.flush_pending().await?;
        Ok(())
    }

    /// Detach from the transport and flush pending writes.
    pub async fn shutdown(&self) -> Result<(), AuthError> {
        let registration = self
            .shared
            .registration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(registration) = registration {
            registration.unregister();
            debug!("Auth interceptor unregistered");
        }
        self.flush().await
    }

    // ===== Observation =====

    pub fn user(&self) -> Option<UserProfile> {
        self.shared.lock().session.as_ref().map(|s| s.user.clone())
    }

    pub fn current_token(&self) -> Option<String> {
        self.shared
            .lock()
            .session
            .as_ref()
            .map(|s| s.token.token.clone())
    }

    /// Full token record, including the refresh token and issue time
    pub fn auth_token(&self) -> Option<AuthToken> {
        self.shared.lock().session.as_ref().map(|s| s.token.clone())
    }

    pub fn is_loading_session(&self) -> bool {
        self.shared.lock().is_loading()
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state()
    }

    /// Current generation counter
    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    /// Receive a new snapshot after every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("SessionManager")
            .field("state", &inner.state())
            .field("generation", &inner.generation)
            .field("loading", &inner.is_loading())
            .finish()
    }
}
