//! Token refresh use case.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::error;

use keygate_core::messages::auth::{RefreshRequest, TokenPair};
use keygate_core::AuthError;

use crate::auth::tokens::TokenIssuer;
use crate::broker::AuthHandler;

/// Issues a fresh token pair for a subject whose refresh token the
/// gateway has already verified. The request carries the verified
/// claims, so no user lookup happens here.
pub struct RefreshUseCase {
    tokens: Arc<TokenIssuer>,
}

impl RefreshUseCase {
    pub fn new(tokens: Arc<TokenIssuer>) -> Self {
        Self { tokens }
    }

    /// # Errors
    ///
    /// [`AuthError::TokenGeneration`] when signing fails.
    pub async fn execute(&self, request: RefreshRequest) -> Result<TokenPair, AuthError> {
        self.tokens
            .issue_pair(&request.user_id, &request.roles)
            .map_err(|e| {
                error!(user_id = %request.user_id, error = %e, "token issuing failed");
                e
            })
    }
}

#[async_trait]
impl AuthHandler for RefreshUseCase {
    async fn handle(&self, payload: Value) -> Result<Value, AuthError> {
        let request: RefreshRequest = super::parse_request(payload)?;
        let pair = self.execute(request).await?;
        super::to_reply_body(&pair)
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
    use serde_json::json;

    use keygate_core::Role;

    use crate::auth::tokens::{Claims, TokenType};
    use crate::config::TokenConfig;

    use super::*;

    fn use_case() -> RefreshUseCase {
        let tokens = TokenIssuer::new(&TokenConfig {
            secret: "test-secret".to_owned(),
            ..TokenConfig::default()
        })
        .unwrap();
        RefreshUseCase::new(Arc::new(tokens))
    }

    fn decode_claims(token: &str) -> Claims {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(b"test-secret"),
            &Validation::new(Algorithm::HS256),
        )
        .unwrap()
        .claims
    }

    #[tokio::test]
    async fn refresh_issues_one_access_and_one_refresh_token() {
        let pair = use_case()
            .execute(RefreshRequest {
                user_id: "42".to_owned(),
                roles: vec![Role::User, Role::CssAdmin],
            })
            .await
            .unwrap();

        let access = decode_claims(&pair.access_token);
        let refresh = decode_claims(&pair.refresh_token);
        assert_eq!(access.token_type, TokenType::Access);
        assert_eq!(refresh.token_type, TokenType::Refresh);
        assert_eq!(access.sub, "42");
        assert_eq!(refresh.sub, "42");
        assert_eq!(access.roles, vec![Role::User, Role::CssAdmin]);
    }

    #[tokio::test]
    async fn handler_round_trips_through_json() {
        let body = use_case()
            .handle(json!({"user_id": "7", "roles": ["user"]}))
            .await
            .unwrap();

        let access = decode_claims(body["access_token"].as_str().unwrap());
        assert_eq!(access.sub, "7");
    }

    #[tokio::test]
    async fn handler_rejects_a_payload_without_user_id() {
        let err = use_case()
            .handle(json!({"roles": ["user"]}))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), 400);
    }
}
