//! Single-flight token refresh.
//!
//! When several requests fail with an expired token at once, only the first
//! one refreshes. The rest wait for it and reuse its outcome instead of
//! spending the refresh token again.

use std::future::Future;

use tokio::sync::Mutex;
use tracing::debug;

pub struct RefreshGate<T> {
    /// Stale token of the last refresh and what it produced (`None` = failed)
    last: Mutex<Option<(String, Option<T>)>>,
}

impl<T: Clone> Default for RefreshGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> RefreshGate<T> {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    /// Refresh `stale` unless that already happened, returning the new value
    /// or `None` if refreshing failed.
    pub async fn run<F, Fut>(&self, stale: &str, refresh: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let mut last = self.last.lock().await;
        if let Some((key, outcome)) = last.as_ref() {
            if key == stale {
                debug!(refreshed = outcome.is_some(), "Reusing result of concurrent token refresh");
                return outcome.clone();
            }
        }

        let outcome = refresh().await;
        *last = Some((stale.to_string(), outcome.clone()));
        outcome
    }
}
