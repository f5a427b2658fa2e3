//! Password hashing.

use async_trait::async_trait;
use tracing::debug;

use keygate_core::AuthError;

/// Hashing seam so use cases can be exercised without paying bcrypt
/// cost in every test.
#[async_trait]
pub trait PasswordHasher: Send + Sync {
    /// Hashes a plaintext password.
    async fn hash(&self, password: &str) -> Result<String, AuthError>;

    /// Checks a plaintext password against a stored hash.
    async fn verify(&self, password: &str, hashed: &str) -> Result<bool, AuthError>;
}

/// Bcrypt-backed hasher. Hashing runs on the blocking pool so a burst
/// of logins cannot stall the dispatch loops.
#[derive(Debug, Clone)]
pub struct BcryptHasher {
    cost: u32,
}

impl BcryptHasher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cost: bcrypt::DEFAULT_COST,
        }
    }

    /// Lower costs are only useful in tests.
    #[must_use]
    pub fn with_cost(cost: u32) -> Self {
        Self { cost }
    }
}

impl Default for BcryptHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PasswordHasher for BcryptHasher {
    async fn hash(&self, password: &str) -> Result<String, AuthError> {
        let password = password.to_owned();
        let cost = self.cost;
        let joined = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost)).await;
        match joined {
            Ok(Ok(hashed)) => Ok(hashed),
            Ok(Err(e)) => {
                debug!(error = %e, "bcrypt hashing failed");
                Err(AuthError::Internal {
                    detail: format!("password hashing failed: {e}"),
                })
            }
            Err(e) => Err(AuthError::Internal {
                detail: format!("hashing task failed: {e}"),
            }),
        }
    }

    async fn verify(&self, password: &str, hashed: &str) -> Result<bool, AuthError> {
        let password = password.to_owned();
        let hashed = hashed.to_owned();
        let joined = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hashed)).await;
        match joined {
            Ok(Ok(matches)) => Ok(matches),
            Ok(Err(e)) => {
                debug!(error = %e, "bcrypt verification failed");
                Err(AuthError::Internal {
                    detail: format!("password verification failed: {e}"),
                })
            }
            Err(e) => Err(AuthError::Internal {
                detail: format!("verification task failed: {e}"),
            }),
        }
    }
}
