//! Request and response schemas for the auth operations.

use serde::{Deserialize, Serialize};

use crate::types::Role;

/// Treats an absent or empty string as "not supplied".
fn is_filled(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.is_empty())
}

fn default_roles() -> Vec<Role> {
    vec![Role::User]
}

/// Body of a `login` request. Exactly one identifier is expected; email
/// wins when both are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub password: String,
}

impl LoginRequest {
    /// True when at least one identifier and the password are usable.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.has_identifier() && !self.password.is_empty()
    }

    #[must_use]
    pub fn has_identifier(&self) -> bool {
        is_filled(self.email.as_deref()) || is_filled(self.phone_number.as_deref())
    }
}

/// Body of a `refresh` request, mirroring the claims of the presented
/// refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub user_id: String,
    pub roles: Vec<Role>,
}

/// Body of a `register` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default = "default_roles")]
    pub roles: Vec<Role>,
}

impl RegisterRequest {
    #[must_use]
    pub fn has_identifier(&self) -> bool {
        is_filled(self.email.as_deref()) || is_filled(self.phone_number.as_deref())
    }
}

/// Successful outcome of login and refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}
