//! Authentication state kept on the client side.
//!
//! This module provides:
//! - `TokenStore`: durable storage for the token pair and cached profile,
//!   backed by memory, a JSON file or the OS keychain
//! - `Session`, `UserSummary`, `TokenPair`: what a signed-in client holds

pub mod session;
pub mod store;

pub use session::{Session, TokenPair, UserRole, UserSummary};
pub use store::{FileTokenStore, KeyringTokenStore, MemoryTokenStore, StorageKey, TokenStore};
