use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The request got `status` back and the session could not be renewed.
    #[error("Session expired (status {status}) - please log in again")]
    SessionExpired { status: u16 },

    #[error("Corrupt local state: {0}")]
    CorruptLocalState(String),

    #[error("Unauthorized - token rejected after refresh")]
    Unauthorized,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Token storage error: {0:#}")]
    Storage(anyhow::Error),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl AuthError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => AuthError::Unauthorized,
            403 => AuthError::AccessDenied(truncated),
            404 => AuthError::NotFound(truncated),
            500..=599 => AuthError::ServerError(truncated),
            _ => AuthError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Transport failures are the only errors a caller may blindly retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::NetworkError(_))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            AuthError::from_status(StatusCode::UNAUTHORIZED, ""),
            AuthError::Unauthorized
        ));
        assert!(matches!(
            AuthError::from_status(StatusCode::FORBIDDEN, "no"),
            AuthError::AccessDenied(ref m) if m == "no"
        ));
        assert!(matches!(
            AuthError::from_status(StatusCode::NOT_FOUND, "gone"),
            AuthError::NotFound(_)
        ));
        assert!(matches!(
            AuthError::from_status(StatusCode::BAD_GATEWAY, ""),
            AuthError::ServerError(_)
        ));
        assert!(matches!(
            AuthError::from_status(StatusCode::CONFLICT, "dup"),
            AuthError::InvalidResponse(ref m) if m.contains("409")
        ));
    }

    #[test]
    fn test_truncate_body() {
        let short = "short body";
        assert_eq!(AuthError::truncate_body(short), short);

        let long = "x".repeat(MAX_ERROR_BODY_LENGTH + 10);
        let truncated = AuthError::truncate_body(&long);
        assert!(truncated.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(truncated.contains("510 total bytes"));
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_BODY_LENGTH);
        let truncated = AuthError::truncate_body(&long);
        assert!(truncated.contains("truncated"));
    }

    #[test]
    fn test_only_network_errors_are_retryable() {
        assert!(!AuthError::SessionExpired { status: 401 }.is_retryable());
        assert!(!AuthError::InvalidCredentials("bad".into()).is_retryable());
        assert!(!AuthError::Unauthorized.is_retryable());
    }

    #[test]
    fn test_session_expired_reports_status() {
        let err = AuthError::SessionExpired { status: 401 };
        assert_eq!(
            err.to_string(),
            "Session expired (status 401) - please log in again"
        );
    }
}
