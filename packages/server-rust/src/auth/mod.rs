//! Authentication use cases and their collaborators.
//!
//! Each use case implements [`crate::broker::AuthHandler`] so the
//! listener can route decoded requests straight to it.

pub mod login;
pub mod password;
pub mod refresh;
pub mod register;
pub mod tokens;

pub use login::LoginUseCase;
pub use password::{BcryptHasher, PasswordHasher};
pub use refresh::RefreshUseCase;
pub use register::RegisterUseCase;
pub use tokens::{Claims, TokenIssuer, TokenType};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use keygate_core::AuthError;

/// Decodes a request payload into its typed form. Shape problems are
/// the caller's fault, not ours.
fn parse_request<T: DeserializeOwned>(payload: Value) -> Result<T, AuthError> {
    serde_json::from_value(payload).map_err(|e| AuthError::Validation {
        detail: format!("invalid request body: {e}"),
    })
}

/// Serializes a reply body. Failure here means a bug in our own types.
fn to_reply_body<T: Serialize>(body: &T) -> Result<Value, AuthError> {
    serde_json::to_value(body).map_err(|e| AuthError::Internal {
        detail: format!("reply serialization failed: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use keygate_core::messages::auth::LoginRequest;

    use super::*;

    #[test]
    fn parse_request_reports_the_offending_field() {
        let err = parse_request::<LoginRequest>(json!({"email": "a@b.c"})).unwrap_err();
        assert_eq!(err.status_code(), 400);
        match err {
            AuthError::Validation { detail } => assert!(detail.contains("password")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn reply_bodies_serialize_to_json_objects() {
        let body = to_reply_body(&json!({"ok": true})).unwrap();
        assert_eq!(body, json!({"ok": true}));
    }
}
