//! Keygate Core — reply envelope, error taxonomy, and wire message schemas.

pub mod envelope;
pub mod error;
pub mod messages;
pub mod types;

pub use envelope::{EnvelopeError, ReplyEnvelope};
pub use error::{AuthError, ErrorOrigin};
pub use types::{OperationKind, Role, OPERATION_TYPE_FIELD};
