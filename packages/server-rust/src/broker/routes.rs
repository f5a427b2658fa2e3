//! Dispatch table mapping operations to their handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use keygate_core::{AuthError, OperationKind};

/// One auth operation's implementation.
#[async_trait]
pub trait AuthHandler: Send + Sync {
    /// Handles a request payload (already stripped of `operation_type`)
    /// and returns the success body.
    async fn handle(&self, payload: Value) -> Result<Value, AuthError>;
}

/// Operation -> handler table.
///
/// Built once at startup, validated before the listener consumes anything,
/// then only read. Registering twice for the same operation replaces the
/// earlier handler.
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: HashMap<OperationKind, Arc<dyn AuthHandler>>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: OperationKind, handler: Arc<dyn AuthHandler>) {
        self.routes.insert(kind, handler);
    }

    /// Checks that every operation has a handler.
    ///
    /// # Errors
    ///
    /// Names the first missing operation. The listener refuses to start
    /// on an incomplete table.
    pub fn validate(&self) -> anyhow::Result<()> {
        for kind in OperationKind::ALL {
            if !self.routes.contains_key(&kind) {
                anyhow::bail!("no handler registered for operation '{kind}'");
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn resolve(&self, kind: OperationKind) -> Option<Arc<dyn AuthHandler>> {
        self.routes.get(&kind).cloned()
    }

    /// Operations with a registered handler.
    pub fn operations(&self) -> impl Iterator<Item = OperationKind> + '_ {
        self.routes.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut operations: Vec<&str> = self.routes.keys().map(|k| k.as_str()).collect();
        operations.sort_unstable();
        f.debug_struct("RouteTable")
            .field("operations", &operations)
            .finish()
    }
}
