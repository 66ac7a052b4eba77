//! Single-flight access-token refresh.
//!
//! Every request that sees a 401 while a refresh is running awaits that same
//! refresh instead of starting its own. The in-flight exchange is kept as a
//! `Shared` future; the first waiter to observe its completion clears the
//! marker so a later 401 can start a fresh exchange.

use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::client::ClientState;
use super::request::join_url;
use super::types::{decode_payload, RefreshRequest, RefreshResponse};
use crate::auth::StorageKey;

const REFRESH_PATH: &str = "/auth/refresh";

/// Why a refresh exchange did not produce a new access token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("no refresh token stored")]
    MissingRefreshToken,

    #[error("refresh rejected with status {0}")]
    Rejected(u16),

    #[error("refresh timed out")]
    Timeout,

    #[error("refresh request failed: {0}")]
    Network(String),

    #[error("malformed refresh response: {0}")]
    Malformed(String),

    #[error("could not access token storage: {0}")]
    Storage(String),

    /// Logout, login or another failed refresh replaced the session this
    /// refresh belonged to. Nothing was written.
    #[error("session ended while refreshing")]
    SessionEnded,
}

pub(crate) type RefreshOutcome = Result<(), RefreshFailure>;

type InFlight = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Holds the marker for the refresh currently in flight, if any.
#[derive(Default)]
pub(crate) struct RefreshGate {
    in_flight: Mutex<Option<InFlight>>,
}

impl RefreshGate {
    /// Join the running refresh, or start one with `start` if none is running.
    /// `start` runs with the slot locked.
    pub(crate) async fn run<F>(&self, start: F) -> RefreshOutcome
    where
        F: FnOnce() -> BoxFuture<'static, RefreshOutcome>,
    {
        let refresh = {
            let mut slot = self.in_flight.lock().await;
            if let Some(running) = slot.as_ref().filter(|r| r.peek().is_none()) {
                debug!("Joining in-flight token refresh");
                running.clone()
            } else {
                debug!("Starting token refresh");
                let refresh = start().shared();
                *slot = Some(refresh.clone());
                refresh
            }
        };

        let outcome = refresh.clone().await;

        let mut slot = self.in_flight.lock().await;
        if slot
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&refresh))
        {
            *slot = None;
        }

        outcome
    }

    pub(crate) async fn is_running(&self) -> bool {
        self.in_flight
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| running.peek().is_none())
    }
}

/// Starts the refresh for a request that was rejected after being sent with
/// `sent`. Called by the gate with its slot locked, so a refresh that
/// finished in the meantime is always visible here.
pub(crate) fn refresh_for_rejected(
    state: Arc<ClientState>,
    sent: Option<String>,
) -> BoxFuture<'static, RefreshOutcome> {
    let stored = match state.store.get(StorageKey::AccessToken) {
        Ok(stored) => stored,
        Err(e) => {
            warn!(error = %e, "Failed to read access token, refreshing anyway");
            return refresh_tokens(state);
        }
    };

    match (sent.as_deref(), stored.as_deref()) {
        (Some(_), None) => {
            debug!("Session already ended, not refreshing");
            future::ready(Err(RefreshFailure::SessionEnded)).boxed()
        }
        (sent, Some(stored)) if sent != Some(stored) => {
            debug!("Access token already rotated, not refreshing");
            future::ready(Ok(())).boxed()
        }
        _ => refresh_tokens(state),
    }
}

/// The refresh procedure proper. Runs once per cycle no matter how many
/// callers are waiting on it, so the session-expired cascade also runs once.
pub(crate) fn refresh_tokens(state: Arc<ClientState>) -> BoxFuture<'static, RefreshOutcome> {
    async move {
        let generation = state.generation();
        let outcome = exchange(&state, generation).await;
        match &outcome {
            Ok(()) => debug!("Token refresh succeeded"),
            Err(RefreshFailure::SessionEnded) => {
                debug!("Session ended during refresh, discarding new tokens")
            }
            Err(failure) => {
                if state.expire_session(generation).await {
                    warn!(%failure, "Token refresh failed, session ended");
                } else {
                    debug!(%failure, "Token refresh failed after the session had already ended");
                }
            }
        }
        outcome
    }
    .boxed()
}

async fn exchange(state: &ClientState, generation: u64) -> RefreshOutcome {
    let refresh_token = state
        .store
        .get(StorageKey::RefreshToken)
        .map_err(|e| RefreshFailure::Storage(format!("{:#}", e)))?
        .filter(|token| !token.is_empty())
        .ok_or(RefreshFailure::MissingRefreshToken)?;

    let url = join_url(&state.api_base_url, REFRESH_PATH);
    let response = state
        .http
        .post(&url)
        .timeout(state.timeout)
        .json(&RefreshRequest {
            refresh_token: &refresh_token,
        })
        .send()
        .await
        .map_err(transport_failure)?;

    let status = response.status();
    if !status.is_success() {
        return Err(RefreshFailure::Rejected(status.as_u16()));
    }

    let body = response.bytes().await.map_err(transport_failure)?;
    let tokens: RefreshResponse =
        decode_payload(&body).map_err(|e| RefreshFailure::Malformed(e.to_string()))?;
    if tokens.access_token.is_empty() {
        return Err(RefreshFailure::Malformed("empty access token".to_string()));
    }

    // Both tokens are written while holding the lock so readers never see a
    // half-rotated pair.
    let _guard = state.write_lock.lock().await;
    if state.generation() != generation {
        return Err(RefreshFailure::SessionEnded);
    }
    state
        .store
        .set(StorageKey::AccessToken, &tokens.access_token)
        .map_err(|e| RefreshFailure::Storage(format!("{:#}", e)))?;
    if let Some(rotated) = tokens.refresh_token.filter(|token| !token.is_empty()) {
        state
            .store
            .set(StorageKey::RefreshToken, &rotated)
            .map_err(|e| RefreshFailure::Storage(format!("{:#}", e)))?;
    }

    Ok(())
}

fn transport_failure(e: reqwest::Error) -> RefreshFailure {
    if e.is_timeout() {
        RefreshFailure::Timeout
    } else {
        RefreshFailure::Network(e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AuthEvent;
    use crate::auth::{MemoryTokenStore, TokenStore};
    use crate::config::{ClientConfig, TokenStorage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// State whose backend is unreachable, so any real exchange fails.
    fn offline_state(access: Option<&str>) -> (Arc<ClientState>, Arc<MemoryTokenStore>) {
        let store = Arc::new(MemoryTokenStore::new());
        if let Some(token) = access {
            store.set(StorageKey::AccessToken, token).unwrap();
        }
        store.set(StorageKey::RefreshToken, "R1").unwrap();
        let config = ClientConfig {
            api_base_url: "http://127.0.0.1:9/api".to_string(),
            admin_api_base_url: "http://127.0.0.1:9/api/admin".to_string(),
            timeout_secs: 1,
            token_storage: TokenStorage::Memory,
        };
        let state = ClientState::new(&config, store.clone()).unwrap();
        (Arc::new(state), store)
    }

    fn counted(
        starts: &Arc<AtomicUsize>,
        outcome: RefreshOutcome,
        delay: Duration,
    ) -> impl FnOnce() -> BoxFuture<'static, RefreshOutcome> {
        let starts = starts.clone();
        move || {
            starts.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(delay).await;
                outcome
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let gate = Arc::new(RefreshGate::default());
        let starts = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let gate = gate.clone();
            let start = counted(&starts, Ok(()), Duration::from_millis(50));
            handles.push(tokio::spawn(async move { gate.run(start).await }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(!gate.is_running().await);
    }

    #[tokio::test]
    async fn test_waiters_all_see_the_same_failure() {
        let gate = Arc::new(RefreshGate::default());
        let starts = Arc::new(AtomicUsize::new(0));

        let first = {
            let gate = gate.clone();
            let start = counted(
                &starts,
                Err(RefreshFailure::Rejected(401)),
                Duration::from_millis(50),
            );
            tokio::spawn(async move { gate.run(start).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(gate.is_running().await);

        let second = gate
            .run(counted(&starts, Ok(()), Duration::ZERO))
            .await;

        assert_eq!(second, Err(RefreshFailure::Rejected(401)));
        assert_eq!(first.await.unwrap(), Err(RefreshFailure::Rejected(401)));
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sequential_refreshes_each_run() {
        let gate = RefreshGate::default();
        let starts = Arc::new(AtomicUsize::new(0));

        assert_eq!(gate.run(counted(&starts, Ok(()), Duration::ZERO)).await, Ok(()));
        assert_eq!(
            gate.run(counted(&starts, Err(RefreshFailure::Timeout), Duration::ZERO))
                .await,
            Err(RefreshFailure::Timeout)
        );
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rotated_token_is_detected_under_the_gate() {
        let (state, store) = offline_state(Some("A2"));
        let mut events = state.subscribe();
        let gate = RefreshGate::default();

        let outcome = gate
            .run(|| refresh_for_rejected(state, Some("A1".to_string())))
            .await;

        assert_eq!(outcome, Ok(()));
        assert_eq!(store.get(StorageKey::AccessToken).unwrap().as_deref(), Some("A2"));
        assert_eq!(store.get(StorageKey::RefreshToken).unwrap().as_deref(), Some("R1"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ended_session_is_not_refreshed_again() {
        let (state, store) = offline_state(None);
        let mut events = state.subscribe();
        let gate = RefreshGate::default();

        let outcome = gate
            .run(|| refresh_for_rejected(state, Some("A1".to_string())))
            .await;

        assert_eq!(outcome, Err(RefreshFailure::SessionEnded));
        assert_eq!(store.get(StorageKey::RefreshToken).unwrap().as_deref(), Some("R1"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_expire_session_ignores_a_stale_generation() {
        let (state, store) = offline_state(Some("A1"));
        let mut events = state.subscribe();
        let generation = state.generation();

        assert!(state.expire_session(generation).await);
        store.set(StorageKey::AccessToken, "A9").unwrap();
        assert!(!state.expire_session(generation).await);

        assert_eq!(store.get(StorageKey::AccessToken).unwrap().as_deref(), Some("A9"));
        assert_eq!(events.try_recv().unwrap(), AuthEvent::SessionExpired);
        assert!(events.try_recv().is_err());
    }
}
