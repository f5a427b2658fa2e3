//! JWT issuing.

use std::fmt;
use std::time::Duration;

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use keygate_core::messages::auth::TokenPair;
use keygate_core::{AuthError, Role};

use crate::config::TokenConfig;

/// Claim set this service signs. The gateway verifies these; this
/// service only issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub roles: Vec<Role>,
    pub token_type: TokenType,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Signs access and refresh tokens with an HMAC key.
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    header: Header,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    /// Builds an issuer from configuration.
    ///
    /// # Errors
    ///
    /// Rejects an empty secret and any non-HMAC algorithm; this service
    /// has no key material for asymmetric signing.
    pub fn new(config: &TokenConfig) -> anyhow::Result<Self> {
        if config.secret.is_empty() {
            anyhow::bail!("token signing secret must not be empty");
        }
        let algorithm: Algorithm = config
            .algorithm
            .parse()
            .map_err(|_| anyhow::anyhow!("unknown signing algorithm '{}'", config.algorithm))?;
        if !matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            anyhow::bail!("only HMAC signing is supported, got '{}'", config.algorithm);
        }
        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            header: Header::new(algorithm),
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
        })
    }

    /// Signs an access token for `subject`.
    ///
    /// # Errors
    ///
    /// [`AuthError::TokenGeneration`] when signing fails.
    pub fn issue_access(&self, subject: &str, roles: &[Role]) -> Result<String, AuthError> {
        self.issue(subject, roles, TokenType::Access, self.access_ttl)
    }

    /// Signs a refresh token for `subject`.
    ///
    /// # Errors
    ///
    /// [`AuthError::TokenGeneration`] when signing fails.
    pub fn issue_refresh(&self, subject: &str, roles: &[Role]) -> Result<String, AuthError> {
        self.issue(subject, roles, TokenType::Refresh, self.refresh_ttl)
    }

    /// Signs one access and one refresh token.
    ///
    /// # Errors
    ///
    /// [`AuthError::TokenGeneration`] when either signing fails.
    pub fn issue_pair(&self, subject: &str, roles: &[Role]) -> Result<TokenPair, AuthError> {
        Ok(TokenPair {
            access_token: self.issue_access(subject, roles)?,
            refresh_token: self.issue_refresh(subject, roles)?,
        })
    }

    fn issue(
        &self,
        subject: &str,
        roles: &[Role],
        token_type: TokenType,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: subject.to_owned(),
            roles: roles.to_vec(),
            token_type,
            iat: now.unix_timestamp(),
            exp: (now + ttl).unix_timestamp(),
        };
        encode(&self.header, &claims, &self.encoding_key).map_err(|e| {
            debug!(error = %e, "jwt signing failed");
            AuthError::TokenGeneration
        })
    }
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("header", &self.header)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}
