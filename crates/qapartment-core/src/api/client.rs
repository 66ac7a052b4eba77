//! Authenticated HTTP client for the Q Apartment backend.
//!
//! Every feature reaches the backend through [`AuthHttpClient::send`]. The
//! client attaches the stored access token to each request. A 401 triggers
//! one shared token refresh and one retry of the original request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::refresh::{refresh_for_rejected, refresh_tokens, RefreshFailure, RefreshGate};
use super::request::{join_url, ApiBase, ApiRequest};
use super::types::{
    decode_payload, error_message, LoginRequest, LoginResponse, PasswordChangeRequest,
    RefreshRequest,
};
use super::AuthError;
use crate::auth::{Session, StorageKey, TokenStore, UserSummary};
use crate::config::ClientConfig;

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "/auth/login";
const LOGOUT_PATH: &str = "/auth/logout";
const CURRENT_USER_PATH: &str = "/auth/me";
const CHANGE_PASSWORD_PATH: &str = "/auth/change-password";

/// Minimum length the backend accepts for a new password.
const MIN_PASSWORD_LENGTH: usize = 6;

/// Buffered auth events per subscriber before the oldest are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Session lifecycle notifications for the navigation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    LoggedIn { user_id: i64 },
    LoggedOut,
    /// The refresh token was missing or rejected. Storage has been cleared
    /// and the user has to log in again.
    SessionExpired,
}

/// State shared by every clone of the client and by the in-flight refresh.
pub(crate) struct ClientState {
    pub(crate) http: Client,
    pub(crate) api_base_url: String,
    pub(crate) admin_api_base_url: String,
    pub(crate) timeout: Duration,
    pub(crate) store: Arc<dyn TokenStore>,
    /// Held for multi-key writes to the store.
    pub(crate) write_lock: Mutex<()>,
    /// Bumped under `write_lock` whenever the stored session is replaced or
    /// cleared.
    generation: AtomicU64,
    events: broadcast::Sender<AuthEvent>,
}

impl ClientState {
    pub(crate) fn new(config: &ClientConfig, store: Arc<dyn TokenStore>) -> Result<Self, AuthError> {
        let http = Client::builder().timeout(config.timeout()).build()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            http,
            api_base_url: config.api_base_url.clone(),
            admin_api_base_url: config.admin_api_base_url.clone(),
            timeout: config.timeout(),
            store,
            write_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            events,
        })
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: AuthEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn base_url(&self, base: ApiBase) -> &str {
        match base {
            ApiBase::Admin => &self.admin_api_base_url,
            ApiBase::Api => &self.api_base_url,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Caller holds `write_lock`.
    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Clear every stored credential. Never fails; a store that refuses to
    /// clear is emptied key by key. Caller holds `write_lock`.
    fn clear_store(&self) {
        self.bump_generation();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear token store, removing keys individually");
            for key in StorageKey::ALL {
                if let Err(e) = self.store.remove(key) {
                    warn!(error = %e, key = key.as_str(), "Failed to remove stored credential");
                }
            }
        }
    }

    async fn clear_credentials(&self) {
        let _guard = self.write_lock.lock().await;
        self.clear_store();
    }

    /// End the session a failed refresh belonged to. Returns false without
    /// touching the store if that session is already gone.
    pub(crate) async fn expire_session(&self, generation: u64) -> bool {
        {
            let _guard = self.write_lock.lock().await;
            if self.generation() != generation {
                return false;
            }
            self.clear_store();
        }
        self.emit(AuthEvent::SessionExpired);
        true
    }
}

/// HTTP client for the authenticated backend surface.
/// Clone is cheap - all clones share tokens, refresh state and the
/// connection pool.
#[derive(Clone)]
pub struct AuthHttpClient {
    state: Arc<ClientState>,
    refresh: Arc<RefreshGate>,
}

impl AuthHttpClient {
    /// Create a client that keeps its tokens in `store`.
    pub fn new(config: &ClientConfig, store: Arc<dyn TokenStore>) -> Result<Self, AuthError> {
        Ok(Self {
            state: Arc::new(ClientState::new(config, store)?),
            refresh: Arc::new(RefreshGate::default()),
        })
    }

    /// Subscribe to login, logout and session-expired notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.state.subscribe()
    }

    /// Whether a token refresh exchange is currently in flight.
    pub async fn is_refreshing(&self) -> bool {
        self.refresh.is_running().await
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.state.store
    }

    fn access_token(&self) -> Result<Option<String>, AuthError> {
        self.state
            .store
            .get(StorageKey::AccessToken)
            .map_err(AuthError::Storage)
    }

    // ===== Request Pipeline =====

    /// Send `request` with the current access token.
    ///
    /// Any response other than 401 is returned untouched, error statuses
    /// included. A 401 refreshes the access token (sharing any refresh
    /// already in flight) and replays the request once. The replay's
    /// response is returned as-is, even if it is another 401. No refresh is
    /// made when another request already rotated the token, or already
    /// ended the session. If the refresh fails, or the session ends while it
    /// runs, `SessionExpired` is returned with the original status.
    pub async fn send(&self, mut request: ApiRequest) -> Result<Response, AuthError> {
        if request.headers.remove(AUTHORIZATION).is_some() {
            warn!(path = %request.path, "Ignoring caller-supplied Authorization header");
        }

        let sent_token = self.access_token()?;
        let response = self.dispatch(&request, sent_token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(path = %request.path, "Received 401, refreshing access token");

        let state = self.state.clone();
        let expired = AuthError::SessionExpired {
            status: response.status().as_u16(),
        };
        if let Err(failure) = self.refresh.run(move || refresh_for_rejected(state, sent_token)).await {
            debug!(path = %request.path, %failure, "Refresh failed, giving up on request");
            return Err(expired);
        }
        let Some(retry_token) = self.access_token()? else {
            debug!(path = %request.path, "Session ended before retry");
            return Err(expired);
        };

        let retried = self.dispatch(&request, Some(retry_token.as_str())).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            warn!(path = %request.path, "Request still unauthorized after refresh, not retrying again");
        }
        Ok(retried)
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<Response, AuthError> {
        let base_url = self.state.base_url(request.base);
        let mut builder = request.build(&self.state.http, base_url, self.state.timeout);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        debug!(
            method = %request.method,
            path = %request.path,
            status = response.status().as_u16(),
            "Request completed"
        );
        Ok(response)
    }

    /// Run the single-flight refresh, joining one already in flight.
    pub async fn refresh_access_token(&self) -> Result<(), RefreshFailure> {
        let state = self.state.clone();
        self.refresh.run(move || refresh_tokens(state)).await
    }

    // ===== Typed Helpers =====

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, AuthError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = error_message(&body).unwrap_or(body);
            Err(AuthError::from_status(status, &message))
        }
    }

    async fn parse<T: DeserializeOwned>(response: Response, path: &str) -> Result<T, AuthError> {
        let body = response.bytes().await?;
        decode_payload(&body).map_err(|e| {
            AuthError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", path, e))
        })
    }

    /// Send `request` and decode the payload of a successful response.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, AuthError> {
        let path = request.path.clone();
        let response = Self::check_response(self.send(request).await?).await?;
        Self::parse(response, &path).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AuthError> {
        self.send_json(ApiRequest::get(path)).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, AuthError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(ApiRequest::post(path).json(body)?).await
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T, AuthError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_json(ApiRequest::put(path).json(body)?).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), AuthError> {
        let response = self.send(ApiRequest::delete(path)).await?;
        Self::check_response(response).await?;
        Ok(())
    }

    /// Unauthenticated GET against the public API, e.g. property listings.
    pub async fn public_get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AuthError> {
        let url = join_url(&self.state.api_base_url, path);
        let response = self.state.http.get(&url).timeout(self.state.timeout).send().await?;
        let response = Self::check_response(response).await?;
        Self::parse(response, path).await
    }

    /// Fetch the signed-in user's profile from the backend.
    pub async fn current_user(&self) -> Result<UserSummary, AuthError> {
        self.send_json(ApiRequest::get(CURRENT_USER_PATH).on(ApiBase::Api))
            .await
    }

    /// Change the signed-in user's password.
    pub async fn change_password(
        &self,
        current_password: &str,
        new_password: &str,
        confirm_password: &str,
    ) -> Result<(), AuthError> {
        if new_password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(AuthError::InvalidRequest(format!(
                "New password must be at least {} characters long",
                MIN_PASSWORD_LENGTH
            )));
        }
        if new_password != confirm_password {
            return Err(AuthError::InvalidRequest(
                "New password and confirmation password do not match".to_string(),
            ));
        }

        let body = PasswordChangeRequest {
            current_password: current_password.to_string(),
            new_password: new_password.to_string(),
            confirm_password: confirm_password.to_string(),
        };
        let request = ApiRequest::post(CHANGE_PASSWORD_PATH)
            .on(ApiBase::Api)
            .json(&body)?;
        let response = self.send(request).await?;
        Self::check_response(response).await?;
        info!("Password changed");
        Ok(())
    }

    // ===== Session Lifecycle =====

    /// Log in and persist the token pair and profile.
    pub async fn login(&self, credentials: &LoginRequest) -> Result<Session, AuthError> {
        let url = join_url(&self.state.api_base_url, LOGIN_PATH);
        let response = self
            .state
            .http
            .post(&url)
            .timeout(self.state.timeout)
            .json(credentials)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(&body);
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    AuthError::InvalidCredentials(
                        message.unwrap_or_else(|| "Invalid email or password".to_string()),
                    )
                }
                _ => AuthError::from_status(status, &message.unwrap_or(body)),
            });
        }

        let login: LoginResponse = Self::parse(response, LOGIN_PATH).await?;
        if !login.user.is_valid() {
            return Err(AuthError::InvalidResponse(
                "Login response carried no user identifier".to_string(),
            ));
        }
        let profile = serde_json::to_string(&login.user).map_err(|e| {
            AuthError::InvalidResponse(format!("Failed to encode user profile: {}", e))
        })?;

        let tokens = login.tokens();
        {
            let _guard = self.state.write_lock.lock().await;
            self.state.bump_generation();
            let store = &self.state.store;
            store
                .set(StorageKey::AccessToken, &tokens.access_token)
                .and_then(|_| store.set(StorageKey::RefreshToken, &tokens.refresh_token))
                .and_then(|_| store.set(StorageKey::User, &profile))
                .map_err(AuthError::Storage)?;
        }

        info!(user_id = login.user.id, "Login successful");
        self.state.emit(AuthEvent::LoggedIn {
            user_id: login.user.id,
        });

        Ok(Session {
            access_token: tokens.access_token,
            user: login.user,
        })
    }

    /// Forget the session locally, then tell the backend on a best-effort
    /// basis. Never fails.
    pub async fn logout(&self) {
        let refresh_token = self
            .state
            .store
            .get(StorageKey::RefreshToken)
            .ok()
            .flatten();

        self.state.clear_credentials().await;
        self.state.emit(AuthEvent::LoggedOut);
        info!("Logged out");

        let url = join_url(&self.state.api_base_url, LOGOUT_PATH);
        let mut builder = self.state.http.post(&url).timeout(self.state.timeout);
        if let Some(ref token) = refresh_token {
            builder = builder.json(&RefreshRequest {
                refresh_token: token,
            });
        }
        match builder.send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(status = response.status().as_u16(), "Backend logout notification rejected");
            }
            Ok(_) => debug!("Backend notified of logout"),
            Err(e) => warn!(error = %e, "Backend logout notification failed"),
        }
    }

    /// Rebuild the session from storage at startup.
    ///
    /// A stored profile that does not parse or has no identifier is treated
    /// as corrupt: storage is cleared and `None` is returned.
    pub async fn restore_session(&self) -> Option<Session> {
        match self.load_session() {
            Ok(Some(session)) => {
                info!(user_id = session.user_id(), "Session restored");
                Some(session)
            }
            Ok(None) => {
                debug!("No stored session");
                None
            }
            Err(AuthError::CorruptLocalState(reason)) => {
                warn!(%reason, "Stored session is corrupt, clearing");
                self.state.clear_credentials().await;
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to read stored session");
                None
            }
        }
    }

    fn load_session(&self) -> Result<Option<Session>, AuthError> {
        let store = &self.state.store;
        let token = store
            .get(StorageKey::AccessToken)
            .map_err(AuthError::Storage)?
            .filter(|t| !t.is_empty());
        let profile = store.get(StorageKey::User).map_err(AuthError::Storage)?;

        let (Some(access_token), Some(profile)) = (token, profile) else {
            return Ok(None);
        };

        let user = UserSummary::from_stored(&profile).map_err(AuthError::CorruptLocalState)?;
        Ok(Some(Session { access_token, user }))
    }
}
