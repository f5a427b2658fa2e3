//! Registration use case.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

use keygate_core::messages::auth::RegisterRequest;
use keygate_core::messages::user::{NewUserRecord, UserProfile};
use keygate_core::AuthError;

use crate::auth::password::PasswordHasher;
use crate::broker::AuthHandler;
use crate::users::UserDirectory;

/// Hashes the new user's password and hands the record to the user
/// service for storage.
pub struct RegisterUseCase {
    users: Arc<dyn UserDirectory>,
    hasher: Arc<dyn PasswordHasher>,
}

impl RegisterUseCase {
    pub fn new(users: Arc<dyn UserDirectory>, hasher: Arc<dyn PasswordHasher>) -> Self {
        Self { users, hasher }
    }

    /// # Errors
    ///
    /// [`AuthError::Validation`] when no identifier is supplied, plus
    /// whatever the user service answers (duplicate identifiers come
    /// back as validation failures).
    pub async fn execute(&self, request: RegisterRequest) -> Result<UserProfile, AuthError> {
        if !request.has_identifier() {
            return Err(AuthError::Validation {
                detail: "either email or phone_number is required".to_owned(),
            });
        }

        let hashed_password = self.hasher.hash(&request.password).await?;
        let stamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| AuthError::Internal {
                detail: format!("timestamp formatting failed: {e}"),
            })?;
        let record = NewUserRecord {
            email: request.email,
            phone_number: request.phone_number,
            hashed_password,
            first_name: request.first_name,
            last_name: request.last_name,
            roles: request.roles,
            is_active: true,
            created_at: stamp.clone(),
            updated_at: stamp,
        };

        let profile = self.users.add(&record).await?;
        info!(user_id = profile.id, "registered new user");
        Ok(profile)
    }
}

#[async_trait]
impl AuthHandler for RegisterUseCase {
    async fn handle(&self, payload: Value) -> Result<Value, AuthError> {
        let request: RegisterRequest = super::parse_request(payload)?;
        let profile = self.execute(request).await?;
        super::to_reply_body(&profile)
    }
}
