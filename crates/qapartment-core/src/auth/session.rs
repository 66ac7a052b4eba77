use serde::{Deserialize, Serialize};

#[cfg(feature = "ts")]
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    SuperAdmin,
    Admin,
    Editor,
}

/// Cached profile of the signed-in back-office user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    pub role: UserRole,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl UserSummary {
    /// A profile identifies a user only if it carries a real id and email.
    pub fn is_valid(&self) -> bool {
        self.id > 0 && !self.email.trim().is_empty()
    }

    /// Parse a stored profile, rejecting ones that fail [`is_valid`].
    ///
    /// [`is_valid`]: UserSummary::is_valid
    pub fn from_stored(raw: &str) -> Result<Self, String> {
        let user: UserSummary = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        if !user.is_valid() {
            return Err(format!("stored profile has no identifier (id {})", user.id));
        }
        Ok(user)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// The client's belief that a user is signed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub user: UserSummary,
}

impl Session {
    pub fn user_id(&self) -> i64 {
        self.user.id
    }
}

// ============================================================================
// Tests
// ============================================================================
