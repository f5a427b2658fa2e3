//! User directory backed by the user service over broker RPC.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::error;

use keygate_core::messages::user::{NewUserRecord, UserProfile, UserRecord};
use keygate_core::{AuthError, ReplyEnvelope};

use crate::broker::RpcClient;
use crate::config::BrokerConfig;

use super::UserDirectory;

/// Talks to the user service through the RPC client.
///
/// Lookups go out on the `get` routing key, creation on `post`. Failure
/// envelopes are translated into local errors; remote detail strings are
/// never surfaced to callers.
pub struct BrokerUserDirectory {
    rpc: Arc<RpcClient>,
    get_key: String,
    post_key: String,
}

impl BrokerUserDirectory {
    #[must_use]
    pub fn new(rpc: Arc<RpcClient>, config: &BrokerConfig) -> Self {
        Self {
            rpc,
            get_key: config.users_get_key.clone(),
            post_key: config.users_post_key.clone(),
        }
    }

    async fn lookup(&self, payload: Value) -> Result<UserRecord, AuthError> {
        let envelope = self.rpc.call(&self.get_key, &payload).await?;
        Self::decode(envelope)
    }

    fn decode<T: serde::de::DeserializeOwned>(envelope: ReplyEnvelope) -> Result<T, AuthError> {
        if !envelope.success() {
            return Err(Self::translate_failure(&envelope));
        }
        serde_json::from_value(envelope.into_body()).map_err(|e| AuthError::Internal {
            detail: format!("user service returned an unreadable record: {e}"),
        })
    }

    fn translate_failure(envelope: &ReplyEnvelope) -> AuthError {
        let translated = AuthError::from_remote_reply(
            envelope.status_code(),
            envelope.error_message(),
            envelope.error_origin(),
        );
        if matches!(translated, AuthError::RemoteService { .. }) {
            error!(
                status = envelope.status_code(),
                message = ?envelope.error_message(),
                "user service reported an internal failure"
            );
        }
        translated
    }
}

#[async_trait]
impl UserDirectory for BrokerUserDirectory {
    async fn get_by_id(&self, user_id: &str) -> Result<UserRecord, AuthError> {
        self.lookup(json!({ "user_id": user_id })).await
    }

    async fn get_by_email(&self, email: &str) -> Result<UserRecord, AuthError> {
        self.lookup(json!({ "user_email": email })).await
    }

    async fn get_by_phone(&self, phone_number: &str) -> Result<UserRecord, AuthError> {
        self.lookup(json!({ "user_phone_number": phone_number })).await
    }

    async fn add(&self, new_user: &NewUserRecord) -> Result<UserProfile, AuthError> {
        let payload = serde_json::to_value(new_user).map_err(|e| AuthError::Internal {
            detail: format!("new user record failed to serialize: {e}"),
        })?;
        let envelope = self.rpc.call(&self.post_key, &payload).await?;
        Self::decode(envelope)
    }
}
