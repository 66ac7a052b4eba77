//! Authenticated REST client for the Q Apartment backend.
//!
//! This module provides the `AuthHttpClient` through which every feature
//! reaches the admin API. It attaches bearer tokens, refreshes an expired
//! access token once per 401 (shared across concurrent requests) and reports
//! session expiry to subscribers.

pub mod client;
pub mod error;
pub mod refresh;
pub mod request;
pub mod types;

pub use client::{AuthEvent, AuthHttpClient};
pub use error::AuthError;
pub use refresh::RefreshFailure;
pub use request::{ApiBase, ApiRequest, RequestBody};
pub use types::{ApiEnvelope, LoginRequest, LoginResponse, PasswordChangeRequest, PayloadError};
