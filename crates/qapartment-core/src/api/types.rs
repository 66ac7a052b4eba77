//! Wire types for the backend's auth endpoints and response envelope.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::auth::{TokenPair, UserSummary};

#[cfg(feature = "ts")]
use ts_rs::TS;

/// Wrapper the backend puts around every JSON payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub data: T,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

fn default_success() -> bool {
    true
}

/// Error bodies carry a message and no usable data.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    message: Option<String>,
}

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A 2xx envelope that reports `success: false`.
    #[error("backend reported failure: {0}")]
    Unsuccessful(String),
}

/// Decode a payload that may or may not be wrapped in an [`ApiEnvelope`].
pub fn decode_payload<T: DeserializeOwned>(body: &[u8]) -> Result<T, PayloadError> {
    match serde_json::from_slice::<ApiEnvelope<T>>(body) {
        Ok(envelope) if !envelope.success => Err(PayloadError::Unsuccessful(envelope.message)),
        Ok(envelope) => Ok(envelope.data),
        Err(_) => {
            if let Some(message) = unsuccessful_message(body) {
                return Err(PayloadError::Unsuccessful(message));
            }
            Ok(serde_json::from_slice::<T>(body)?)
        }
    }
}

/// `Some(message)` when `body` is an envelope with `success: false`, whether
/// or not its `data` matches the expected type.
fn unsuccessful_message(body: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct Status {
        success: bool,
        #[serde(default)]
        message: String,
    }

    serde_json::from_slice::<Status>(body)
        .ok()
        .filter(|status| !status.success)
        .map(|status| status.message)
}

/// Pull the human-readable message out of an error body, if there is one.
pub fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|e| e.message)
        .filter(|m| !m.trim().is_empty())
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl LoginRequest {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    pub user: UserSummary,
}

impl LoginResponse {
    pub fn tokens(&self) -> TokenPair {
        TokenPair {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// The backend may or may not rotate the refresh token.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct PasswordChangeRequest {
    pub current_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_payload_unwraps_envelope() {
        let body = br#"{"success":true,"message":"Token refreshed successfully","data":{"accessToken":"A2","refreshToken":"R2"},"timestamp":"2024-05-01T10:00:00"}"#;
        let refreshed: RefreshResponse = decode_payload(body).unwrap();
        assert_eq!(refreshed.access_token, "A2");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("R2"));
    }

    #[test]
    fn test_decode_payload_accepts_bare_body() {
        let refreshed: RefreshResponse = decode_payload(br#"{"accessToken":"A2"}"#).unwrap();
        assert_eq!(refreshed.access_token, "A2");
        assert_eq!(refreshed.refresh_token, None);
    }

    #[test]
    fn test_decode_payload_rejects_malformed_body() {
        assert!(decode_payload::<RefreshResponse>(b"<html>").is_err());
        assert!(decode_payload::<RefreshResponse>(br#"{"data":{}}"#).is_err());
    }

    #[test]
    fn test_decode_payload_rejects_unsuccessful_envelope() {
        let body = br#"{"success":false,"message":"Refresh token revoked","data":null}"#;
        let err = decode_payload::<RefreshResponse>(body).unwrap_err();
        assert!(matches!(err, PayloadError::Unsuccessful(ref m) if m == "Refresh token revoked"));

        let typed = br#"{"success":false,"message":"Stale","data":{"accessToken":"A2"}}"#;
        assert!(matches!(
            decode_payload::<RefreshResponse>(typed),
            Err(PayloadError::Unsuccessful(_))
        ));
    }

    #[test]
    fn test_login_response_parses() {
        let body = br#"{"success":true,"message":"Login successful","data":{
            "accessToken":"A1","refreshToken":"R1","tokenType":"Bearer","expiresIn":900,
            "user":{"id":1,"email":"admin@example.com","fullName":"Admin","role":"ADMIN","isActive":true}}}"#;
        let login: LoginResponse = decode_payload(body).unwrap();
        assert_eq!(login.tokens().refresh_token, "R1");
        assert_eq!(login.access_token, "A1");
        assert_eq!(login.expires_in, Some(900));
        assert_eq!(login.user.email, "admin@example.com");
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            error_message(r#"{"success":false,"message":"Bad credentials"}"#).as_deref(),
            Some("Bad credentials")
        );
        assert_eq!(error_message(r#"{"message":""}"#), None);
        assert_eq!(error_message("plain text"), None);
    }

    #[test]
    fn test_request_bodies_use_camel_case() {
        let refresh = serde_json::to_value(RefreshRequest { refresh_token: "R1" }).unwrap();
        assert_eq!(refresh, serde_json::json!({ "refreshToken": "R1" }));

        let change = serde_json::to_value(PasswordChangeRequest {
            current_password: "old".into(),
            new_password: "newpass".into(),
            confirm_password: "newpass".into(),
        })
        .unwrap();
        assert_eq!(change["currentPassword"], "old");
        assert_eq!(change["confirmPassword"], "newpass");
    }
}
