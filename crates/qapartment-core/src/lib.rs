//! Core library for the Q Apartment rental site's authenticated API access.
//!
//! - [`api`]: `AuthHttpClient`, request descriptors and wire types
//! - [`auth`]: token storage backends and the client-side session
//! - [`config`]: base URLs, timeouts and storage selection

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiRequest, AuthError, AuthEvent, AuthHttpClient, LoginRequest};
pub use auth::{Session, StorageKey, TokenStore, UserSummary};
pub use config::ClientConfig;
