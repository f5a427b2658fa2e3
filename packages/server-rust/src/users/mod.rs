//! Access to the user service.

use async_trait::async_trait;

use keygate_core::messages::user::{NewUserRecord, UserProfile, UserRecord};
use keygate_core::AuthError;

pub mod remote;

pub use remote::BrokerUserDirectory;

/// Lookup and creation of user records.
///
/// The production implementation calls the user service over the broker;
/// tests substitute an in-memory directory.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Fetches a user by the id carried in token claims.
    async fn get_by_id(&self, user_id: &str) -> Result<UserRecord, AuthError>;

    async fn get_by_email(&self, email: &str) -> Result<UserRecord, AuthError>;

    async fn get_by_phone(&self, phone_number: &str) -> Result<UserRecord, AuthError>;

    /// Creates a user. The record's password is already hashed.
    async fn add(&self, new_user: &NewUserRecord) -> Result<UserProfile, AuthError>;
}
