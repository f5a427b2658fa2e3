//! Correlation table for in-flight RPC calls.
//!
//! Each outbound call registers its correlation id here and waits on a
//! oneshot receiver. The reply consumer completes the entry when a reply
//! with that id arrives. Entries are removed on every exit path: normal
//! completion removes eagerly, and an RAII guard removes on timeout or
//! caller cancellation so the table never leaks.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;

use keygate_core::{AuthError, ReplyEnvelope};

type CallResult = Result<ReplyEnvelope, AuthError>;

/// Shared table of calls awaiting replies, keyed by correlation id.
#[derive(Debug, Clone, Default)]
pub struct PendingCalls {
    calls: Arc<DashMap<String, oneshot::Sender<CallResult>>>,
}

impl PendingCalls {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new call.
    ///
    /// Returns the receiver the caller awaits and a guard that removes
    /// the entry when dropped. Keep the guard alive for exactly as long
    /// as the caller is willing to accept a reply.
    #[must_use]
    pub fn register(&self, correlation_id: &str) -> (oneshot::Receiver<CallResult>, PendingCallGuard) {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(correlation_id.to_owned(), tx);
        let guard = PendingCallGuard {
            calls: Arc::clone(&self.calls),
            correlation_id: correlation_id.to_owned(),
        };
        (rx, guard)
    }

    /// Delivers a result to the call registered under `correlation_id`.
    ///
    /// Returns `false` when no caller is waiting anymore, which is how a
    /// late reply looks: the entry was already removed by timeout or by
    /// an earlier completion.
    pub fn complete(&self, correlation_id: &str, result: CallResult) -> bool {
        match self.calls.remove(correlation_id) {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Number of calls currently awaiting replies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Removes the pending entry when dropped.
#[derive(Debug)]
pub struct PendingCallGuard {
    calls: Arc<DashMap<String, oneshot::Sender<CallResult>>>,
    correlation_id: String,
}

impl Drop for PendingCallGuard {
    fn drop(&mut self) {
        self.calls.remove(&self.correlation_id);
    }
}
