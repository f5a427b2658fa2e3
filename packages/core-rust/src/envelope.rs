//! Reply envelope published back to callers over the broker.
//!
//! Every reply, success or failure, is one JSON object with the same five
//! fields. Fields are private so an envelope can only be built through
//! [`ReplyEnvelope::ok`] and [`ReplyEnvelope::fail`], which keep the
//! success flag consistent with the error fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ErrorOrigin;

/// Wire shape of every broker reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    status_code: u16,
    #[serde(default)]
    body: Value,
    success: bool,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    error_origin: Option<ErrorOrigin>,
}

/// Failures while reading an envelope off the wire.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed reply envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("inconsistent reply envelope: success flag contradicts error fields")]
    Inconsistent,
}

impl ReplyEnvelope {
    /// A successful reply carrying `body` as its payload.
    #[must_use]
    pub fn ok(status_code: u16, body: Value) -> Self {
        ReplyEnvelope {
            status_code,
            body,
            success: true,
            error_message: None,
            error_origin: None,
        }
    }

    /// A failed reply. The body is always an empty object so callers never
    /// read partial data out of a failure.
    #[must_use]
    pub fn fail(status_code: u16, message: impl Into<String>, origin: ErrorOrigin) -> Self {
        ReplyEnvelope {
            status_code,
            body: Value::Object(serde_json::Map::new()),
            success: false,
            error_message: Some(message.into()),
            error_origin: Some(origin),
        }
    }

    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.success
    }

    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Consumes the envelope, yielding its payload.
    #[must_use]
    pub fn into_body(self) -> Value {
        self.body
    }

    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    #[must_use]
    pub fn error_origin(&self) -> Option<ErrorOrigin> {
        self.error_origin
    }

    /// Serializes for publishing.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] if the body fails to serialize.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses an envelope off the wire and checks its internal consistency:
    /// a success must carry no error fields, a failure must carry a message.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::Malformed`] for invalid JSON or missing fields,
    /// [`EnvelopeError::Inconsistent`] when the success flag contradicts
    /// the error fields.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: ReplyEnvelope = serde_json::from_slice(bytes)?;
        if envelope.success == envelope.error_message.is_none() {
            Ok(envelope)
        } else {
            Err(EnvelopeError::Inconsistent)
        }
    }
}
