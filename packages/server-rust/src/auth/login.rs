//! Login use case.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, warn};

use keygate_core::messages::auth::{LoginRequest, TokenPair};
use keygate_core::AuthError;

use crate::auth::password::PasswordHasher;
use crate::auth::tokens::TokenIssuer;
use crate::broker::AuthHandler;
use crate::users::UserDirectory;

/// Verifies credentials against the user service and issues a token
/// pair on success.
pub struct LoginUseCase {
    users: Arc<dyn UserDirectory>,
    hasher: Arc<dyn PasswordHasher>,
    tokens: Arc<TokenIssuer>,
}

impl LoginUseCase {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        hasher: Arc<dyn PasswordHasher>,
        tokens: Arc<TokenIssuer>,
    ) -> Self {
        Self {
            users,
            hasher,
            tokens,
        }
    }

    /// Runs the login flow.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidCredentials`] when identifier or password is
    /// missing, [`AuthError::UserNotFound`] / [`AuthError::InactiveUser`] /
    /// [`AuthError::InvalidPassword`] per account state, and any broker
    /// tier error from the user lookup.
    pub async fn execute(&self, request: LoginRequest) -> Result<TokenPair, AuthError> {
        if !request.has_credentials() {
            return Err(AuthError::InvalidCredentials {
                detail: "missing identifier or password".to_owned(),
            });
        }

        // Email wins when both identifiers are present.
        let email = request.email.as_deref().unwrap_or_default();
        let phone = request.phone_number.as_deref().unwrap_or_default();
        let user = if email.is_empty() {
            self.users.get_by_phone(phone).await?
        } else {
            self.users.get_by_email(email).await?
        };

        if !user.is_active {
            return Err(AuthError::InactiveUser);
        }

        let Some(hashed) = user.hashed_password.as_deref() else {
            warn!(user_id = user.id, "login rejected, record has no password hash");
            return Err(AuthError::InvalidPassword);
        };
        if !self.hasher.verify(&request.password, hashed).await? {
            warn!(user_id = user.id, "login rejected, password mismatch");
            return Err(AuthError::InvalidPassword);
        }

        self.tokens
            .issue_pair(&user.id.to_string(), &user.roles)
            .map_err(|e| {
                error!(user_id = user.id, error = %e, "token issuing failed");
                e
            })
    }
}

#[async_trait]
impl AuthHandler for LoginUseCase {
    async fn handle(&self, payload: Value) -> Result<Value, AuthError> {
        let request: LoginRequest = super::parse_request(payload)?;
        let pair = self.execute(request).await?;
        super::to_reply_body(&pair)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;

    use keygate_core::messages::user::{NewUserRecord, UserProfile, UserRecord};
    use keygate_core::Role;

    use crate::auth::password::BcryptHasher;
    use crate::config::TokenConfig;

    use super::*;

    struct StubDirectory {
        user: Option<UserRecord>,
        error: Option<AuthError>,
        lookups: Mutex<Vec<String>>,
    }

    impl StubDirectory {
        fn returning(user: UserRecord) -> Self {
            Self {
                user: Some(user),
                error: None,
                lookups: Mutex::new(Vec::new()),
            }
        }

        fn failing(error: AuthError) -> Self {
            Self {
                user: None,
                error: Some(error),
                lookups: Mutex::new(Vec::new()),
            }
        }

        fn resolve(&self, lookup: String) -> Result<UserRecord, AuthError> {
            self.lookups.lock().push(lookup);
            if let Some(error) = &self.error {
                return Err(error.clone());
            }
            self.user.clone().ok_or(AuthError::UserNotFound)
        }
    }

    #[async_trait]
    impl UserDirectory for StubDirectory {
        async fn get_by_id(&self, id: &str) -> Result<UserRecord, AuthError> {
            self.resolve(format!("id:{id}"))
        }

        async fn get_by_email(&self, email: &str) -> Result<UserRecord, AuthError> {
            self.resolve(format!("email:{email}"))
        }

        async fn get_by_phone(&self, phone: &str) -> Result<UserRecord, AuthError> {
            self.resolve(format!("phone:{phone}"))
        }

        async fn add(&self, _user: &NewUserRecord) -> Result<UserProfile, AuthError> {
            panic!("login never adds users")
        }
    }

    fn active_user(hashed_password: Option<String>) -> UserRecord {
        UserRecord {
            id: 42,
            email: Some("ada@example.com".to_owned()),
            phone_number: Some("+15550100".to_owned()),
            first_name: "Ada".to_owned(),
            last_name: "Lovelace".to_owned(),
            hashed_password,
            roles: vec![Role::User],
            is_active: true,
            created_at: "2024-01-01T00:00:00Z".to_owned(),
            updated_at: "2024-01-01T00:00:00Z".to_owned(),
        }
    }

    fn use_case(directory: StubDirectory) -> LoginUseCase {
        let tokens = TokenIssuer::new(&TokenConfig {
            secret: "test-secret".to_owned(),
            ..TokenConfig::default()
        })
        .unwrap();
        LoginUseCase::new(
            Arc::new(directory),
            Arc::new(BcryptHasher::with_cost(4)),
            Arc::new(tokens),
        )
    }

    fn login_request(email: Option<&str>, phone: Option<&str>, password: &str) -> LoginRequest {
        LoginRequest {
            email: email.map(str::to_owned),
            phone_number: phone.map(str::to_owned),
            password: password.to_owned(),
        }
    }

    #[tokio::test]
    async fn valid_email_credentials_issue_a_pair() {
        let hashed = bcrypt::hash("hunter2", 4).unwrap();
        let login = use_case(StubDirectory::returning(active_user(Some(hashed))));

        let pair = login
            .execute(login_request(Some("ada@example.com"), None, "hunter2"))
            .await
            .unwrap();

        assert!(!pair.access_token.is_empty());
        assert_ne!(pair.access_token, pair.refresh_token);
    }

    #[tokio::test]
    async fn phone_lookup_is_used_when_email_is_absent() {
        let hashed = bcrypt::hash("hunter2", 4).unwrap();
        let directory = Arc::new(StubDirectory::returning(active_user(Some(hashed))));
        let tokens = TokenIssuer::new(&TokenConfig {
            secret: "test-secret".to_owned(),
            ..TokenConfig::default()
        })
        .unwrap();
        let login = LoginUseCase::new(
            directory.clone(),
            Arc::new(BcryptHasher::with_cost(4)),
            Arc::new(tokens),
        );

        login
            .execute(login_request(None, Some("+15550100"), "hunter2"))
            .await
            .unwrap();

        assert_eq!(directory.lookups.lock().as_slice(), ["phone:+15550100"]);
    }

    #[tokio::test]
    async fn email_wins_when_both_identifiers_are_present() {
        let hashed = bcrypt::hash("hunter2", 4).unwrap();
        let directory = Arc::new(StubDirectory::returning(active_user(Some(hashed))));
        let tokens = TokenIssuer::new(&TokenConfig {
            secret: "test-secret".to_owned(),
            ..TokenConfig::default()
        })
        .unwrap();
        let login = LoginUseCase::new(
            directory.clone(),
            Arc::new(BcryptHasher::with_cost(4)),
            Arc::new(tokens),
        );

        login
            .execute(login_request(
                Some("ada@example.com"),
                Some("+15550100"),
                "hunter2",
            ))
            .await
            .unwrap();

        assert_eq!(
            directory.lookups.lock().as_slice(),
            ["email:ada@example.com"]
        );
    }

    #[tokio::test]
    async fn missing_identifier_is_invalid_credentials() {
        let login = use_case(StubDirectory::returning(active_user(None)));

        let err = login
            .execute(login_request(None, None, "hunter2"))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), 401);
        assert_eq!(err.to_string(), "Invalid credentials provided.");
    }

    #[tokio::test]
    async fn empty_password_is_invalid_credentials() {
        let login = use_case(StubDirectory::returning(active_user(None)));

        let err = login
            .execute(login_request(Some("ada@example.com"), None, ""))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn unknown_user_surfaces_not_found() {
        let login = use_case(StubDirectory::failing(AuthError::UserNotFound));

        let err = login
            .execute(login_request(Some("ghost@example.com"), None, "hunter2"))
            .await
            .unwrap_err();

        assert_eq!(err, AuthError::UserNotFound);
    }

    #[tokio::test]
    async fn inactive_account_is_rejected() {
        let hashed = bcrypt::hash("hunter2", 4).unwrap();
        let mut user = active_user(Some(hashed));
        user.is_active = false;
        let login = use_case(StubDirectory::returning(user));

        let err = login
            .execute(login_request(Some("ada@example.com"), None, "hunter2"))
            .await
            .unwrap_err();

        assert_eq!(err, AuthError::InactiveUser);
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let hashed = bcrypt::hash("hunter2", 4).unwrap();
        let login = use_case(StubDirectory::returning(active_user(Some(hashed))));

        let err = login
            .execute(login_request(Some("ada@example.com"), None, "wrong"))
            .await
            .unwrap_err();

        assert_eq!(err, AuthError::InvalidPassword);
    }

    #[tokio::test]
    async fn record_without_hash_cannot_log_in() {
        let login = use_case(StubDirectory::returning(active_user(None)));

        let err = login
            .execute(login_request(Some("ada@example.com"), None, "hunter2"))
            .await
            .unwrap_err();

        assert_eq!(err, AuthError::InvalidPassword);
    }

    #[tokio::test]
    async fn handler_parses_payload_and_serializes_the_pair() {
        let hashed = bcrypt::hash("hunter2", 4).unwrap();
        let login = use_case(StubDirectory::returning(active_user(Some(hashed))));

        let body = login
            .handle(json!({"email": "ada@example.com", "password": "hunter2"}))
            .await
            .unwrap();

        assert!(body["access_token"].is_string());
        assert!(body["refresh_token"].is_string());
    }

    #[tokio::test]
    async fn handler_rejects_a_payload_without_password() {
        let login = use_case(StubDirectory::returning(active_user(None)));

        let err = login
            .handle(json!({"email": "ada@example.com"}))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), 400);
    }
}
