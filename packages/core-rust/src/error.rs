//! Error taxonomy for the auth service.
//!
//! Every failure that can cross the service boundary maps to one variant
//! here, and every variant knows its HTTP-style status code and which tier
//! of the system produced it. Handlers return these, the listener folds
//! them into reply envelopes, and the RPC client reconstructs them from
//! remote replies.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::ReplyEnvelope;

// ---------------------------------------------------------------------------
// ErrorOrigin
// ---------------------------------------------------------------------------

/// Which tier of the system produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorOrigin {
    /// The message broker itself (connection loss, channel failure).
    Broker,
    /// A downstream service reached over the broker.
    RemoteService,
    /// This service's own logic.
    ThisService,
}

impl ErrorOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorOrigin::Broker => "broker",
            ErrorOrigin::RemoteService => "remote-service",
            ErrorOrigin::ThisService => "this-service",
        }
    }
}

impl std::fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AuthError
// ---------------------------------------------------------------------------

/// Failures raised while serving an auth operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The broker could not be reached or the connection dropped.
    #[error("An error occurred in RabbitMQ.")]
    BrokerUnavailable { detail: String },

    /// The broker connection is up but a protocol step failed.
    #[error("An error occurred in RabbitMQ.")]
    BrokerProtocol { detail: String },

    /// A downstream call did not answer within its deadline.
    #[error("Source timeout exceeded.")]
    SourceTimeout { detail: String },

    /// A downstream service reported an internal failure.
    #[error("An error occurred in the User Service.")]
    RemoteService { status_code: u16, detail: String },

    /// Credentials were missing or structurally invalid.
    #[error("Invalid credentials provided.")]
    InvalidCredentials { detail: String },

    /// No user matched the supplied identifier.
    #[error("User not found.")]
    UserNotFound,

    /// The account exists but is deactivated.
    #[error("User account is inactive.")]
    InactiveUser,

    /// The password did not match the stored hash.
    #[error("Invalid password.")]
    InvalidPassword,

    /// Token signing failed.
    #[error("Failed to generate authentication tokens.")]
    TokenGeneration,

    /// The request named an operation no handler is registered for.
    #[error("Unknown 'operation_type' received: {operation}")]
    UnknownOperation { operation: String },

    /// The request body failed validation.
    #[error("{detail}")]
    Validation { detail: String },

    /// Anything not covered above.
    #[error("Unknown error occurred.")]
    Internal { detail: String },
}

impl AuthError {
    /// HTTP-style status code carried on the reply envelope.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::BrokerUnavailable { .. } | AuthError::BrokerProtocol { .. } => 503,
            AuthError::SourceTimeout { .. } => 504,
            AuthError::RemoteService { status_code, .. } => *status_code,
            AuthError::InvalidCredentials { .. } | AuthError::InvalidPassword => 401,
            AuthError::UserNotFound | AuthError::UnknownOperation { .. } => 404,
            AuthError::InactiveUser => 403,
            AuthError::Validation { .. } => 400,
            AuthError::TokenGeneration | AuthError::Internal { .. } => 500,
        }
    }

    #[must_use]
    pub fn origin(&self) -> ErrorOrigin {
        match self {
            AuthError::BrokerUnavailable { .. } | AuthError::BrokerProtocol { .. } => {
                ErrorOrigin::Broker
            }
            AuthError::SourceTimeout { .. } | AuthError::RemoteService { .. } => {
                ErrorOrigin::RemoteService
            }
            _ => ErrorOrigin::ThisService,
        }
    }

    /// Folds this error into the envelope the listener publishes back.
    #[must_use]
    pub fn to_envelope(&self) -> ReplyEnvelope {
        ReplyEnvelope::fail(self.status_code(), self.to_string(), self.origin())
    }

    /// Reconstructs an error from a failed remote reply.
    ///
    /// Remote detail strings are not trusted across the boundary: each
    /// status maps to this service's own variant and message. A 500 from
    /// a remote origin stays attributed to the remote tier; anything
    /// unrecognized collapses to an internal error.
    #[must_use]
    pub fn from_remote_reply(
        status: u16,
        message: Option<&str>,
        origin: Option<ErrorOrigin>,
    ) -> Self {
        match status {
            400 => AuthError::Validation {
                detail: message.unwrap_or("Bad request.").to_owned(),
            },
            404 => AuthError::UserNotFound,
            504 => AuthError::SourceTimeout {
                detail: message.unwrap_or("Source timeout exceeded.").to_owned(),
            },
            s if s >= 500 && origin == Some(ErrorOrigin::RemoteService) => {
                AuthError::RemoteService {
                    status_code: 500,
                    detail: message.unwrap_or("remote failure").to_owned(),
                }
            }
            _ => AuthError::Internal {
                detail: format!(
                    "unexpected remote reply: status={status} message={message:?}"
                ),
            },
        }
    }
}
