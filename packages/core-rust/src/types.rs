//! Operation kinds and role definitions shared across the service boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Body field every inbound request carries to name its operation.
pub const OPERATION_TYPE_FIELD: &str = "operation_type";

/// Logical operations the auth service answers over the broker.
///
/// The wire value is the `operation_type` field of the request body,
/// serialized lowercase to match the gateway's dispatch keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Login,
    Refresh,
    Register,
}

impl OperationKind {
    /// Every operation a complete dispatch table must have a handler for.
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Login,
        OperationKind::Refresh,
        OperationKind::Register,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Login => "login",
            OperationKind::Refresh => "refresh",
            OperationKind::Register => "register",
        }
    }

    /// Resolves a wire `operation_type` value, `None` for anything unregistered.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "login" => Some(OperationKind::Login),
            "refresh" => Some(OperationKind::Refresh),
            "register" => Some(OperationKind::Register),
            _ => None,
        }
    }

    /// Reply status for a successful invocation. Register creates a resource
    /// and answers 201; everything else answers 200.
    #[must_use]
    pub fn success_status(self) -> u16 {
        match self {
            OperationKind::Register => 201,
            OperationKind::Login | OperationKind::Refresh => 200,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User roles carried in JWT claims and user records.
///
/// Serialized snake_case to match the role strings the user service stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    CssEmployee,
    CssAdmin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::CssEmployee => "css_employee",
            Role::CssAdmin => "css_admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
