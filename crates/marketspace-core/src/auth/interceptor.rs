//! Contract between the session manager and the HTTP layer.
//!
//! The manager hands the transport a weak reference to itself as an
//! `AuthInterceptor`. The transport reports refreshed tokens and rejected
//! sessions through it, tagging each report with the generation of the
//! session it was acting for so the manager can drop reports about sessions
//! that no longer exist.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;

use crate::api::ApiError;
use crate::models::{AuthToken, SignInResponse};

/// Token the transport attaches to outgoing requests, tagged with the
/// generation of the session that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub token: AuthToken,
    pub generation: u64,
}

/// A token obtained by the transport's own refresh flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub token: AuthToken,
    pub generation: u64,
}

/// Callbacks the transport invokes on the session owner.
#[async_trait]
pub trait AuthInterceptor: Send + Sync {
    /// The server rejected the session with the given generation and it could
    /// not be refreshed.
    async fn on_auth_failure(&self, generation: u64);

    /// The transport refreshed the token of the session with the given
    /// generation. Called on the request path; must not block.
    fn on_token_refreshed(&self, refreshed: RefreshedToken);
}

/// The HTTP layer as seen by the session manager.
#[async_trait]
pub trait AuthTransport: Send + Sync {
    /// Replace the default `Authorization` header; `None` removes it.
    ///
    /// Called while the manager holds its state lock, so implementations must
    /// not call back into the manager from here.
    fn set_default_auth(&self, auth: Option<AuthHeader>);

    /// Install `interceptor`, replacing any previous one. Dropping the
    /// returned registration removes it again.
    fn register_auth_interceptor(
        &self,
        interceptor: Weak<dyn AuthInterceptor>,
    ) -> InterceptorRegistration;

    /// Exchange credentials for a user profile and token.
    async fn create_session(&self, email: &str, password: &str)
        -> Result<SignInResponse, ApiError>;
}

/// Handle returned by `register_auth_interceptor`.
///
/// Deregisters on `unregister()` or on drop, whichever comes first.
#[must_use = "dropping the registration removes the interceptor"]
pub struct InterceptorRegistration {
    unregister: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl InterceptorRegistration {
    pub fn new(unregister: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unregister: Some(Box::new(unregister)),
        }
    }

    pub fn unregister(mut self) {
        if let Some(f) = self.unregister.take() {
            f();
        }
    }
}

impl Drop for InterceptorRegistration {
    fn drop(&mut self) {
        if let Some(f) = self.unregister.take() {
            f();
        }
    }
}

impl std::fmt::Debug for InterceptorRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorRegistration")
            .field("active", &self.unregister.is_some())
            .finish()
    }
}

#[derive(Default)]
struct SlotInner {
    next_id: u64,
    current: Option<(u64, Weak<dyn AuthInterceptor>)>,
}

/// Single-interceptor holder for transports.
///
/// Registering replaces the previous interceptor; a stale registration being
/// dropped later does not remove its replacement.
#[derive(Clone, Default)]
pub struct InterceptorSlot {
    inner: Arc<Mutex<SlotInner>>,
}

impl InterceptorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, interceptor: Weak<dyn AuthInterceptor>) -> InterceptorRegistration {
        let id = {
            let mut inner = lock(&self.inner);
            inner.next_id += 1;
            let id = inner.next_id;
            inner.current = Some((id, interceptor));
            id
        };

        let slot = Arc::downgrade(&self.inner);
        InterceptorRegistration::new(move || {
            if let Some(slot) = slot.upgrade() {
                let mut inner = lock(&slot);
                if matches!(inner.current, Some((current, _)) if current == id) {
                    inner.current = None;
                }
            }
        })
    }

    /// The live interceptor, if one is registered and its owner still exists
    pub fn get(&self) -> Option<Arc<dyn AuthInterceptor>> {
        lock(&self.inner)
            .current
            .as_ref()
            .and_then(|(_, weak)| weak.upgrade())
    }

    pub fn is_registered(&self) -> bool {
        lock(&self.inner).current.is_some()
    }
}

fn lock(inner: &Mutex<SlotInner>) -> MutexGuard<'_, SlotInner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        refreshed: AtomicUsize,
    }

    #[async_trait]
    impl AuthInterceptor for Counting {
        async fn on_auth_failure(&self, _generation: u64) {}

        fn on_token_refreshed(&self, _refreshed: RefreshedToken) {
            self.refreshed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn weak_of(arc: &Arc<Counting>) -> Weak<dyn AuthInterceptor> {
        let weak: Weak<Counting> = Arc::downgrade(arc);
        weak
    }

    #[test]
    fn test_registration_drop_unregisters() {
        let slot = InterceptorSlot::new();
        let interceptor = Arc::new(Counting::default());

        let registration = slot.register(weak_of(&interceptor));
        assert!(slot.get().is_some());

        drop(registration);
        assert!(!slot.is_registered());
        assert!(slot.get().is_none());
    }

    #[test]
    fn test_stale_registration_keeps_replacement() {
        let slot = InterceptorSlot::new();
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());

        let first_reg = slot.register(weak_of(&first));
        let _second_reg = slot.register(weak_of(&second));
        first_reg.unregister();

        let current = slot.get().expect("second interceptor should remain");
        current.on_token_refreshed(RefreshedToken {
            token: AuthToken::new("t", None),
            generation: 1,
        });
        assert_eq!(second.refreshed.load(Ordering::SeqCst), 1);
        assert_eq!(first.refreshed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dead_owner_is_not_returned() {
        let slot = InterceptorSlot::new();
        let interceptor = Arc::new(Counting::default());
        let _registration = slot.register(weak_of(&interceptor));

        drop(interceptor);
        assert!(slot.is_registered());
        assert!(slot.get().is_none());
    }
}
