//! Transport seam between the RPC layer and the broker.
//!
//! Everything above this trait (the RPC client, the listener) speaks in
//! exchanges, queues, and deliveries without knowing whether the other
//! side is a live AMQP connection or the in-memory broker used by tests.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use keygate_core::AuthError;

/// Properties attached to a published message.
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Persistent messages survive a broker restart. Requests are
    /// published persistent; replies are not, their reply queue dies
    /// with the caller anyway.
    pub persistent: bool,
}

/// One message taken off a queue.
///
/// Must be settled exactly once: [`Delivery::ack`] on success,
/// [`Delivery::reject`] to hand it back to the broker.
pub struct Delivery {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// True when the broker redelivered this message after a prior
    /// consumer failed to settle it.
    pub redelivered: bool,
    pub(crate) acker: Box<dyn DeliveryAck>,
}

impl Delivery {
    /// Acknowledges the delivery.
    ///
    /// # Errors
    ///
    /// Returns a broker error if the acknowledgement cannot be sent.
    pub async fn ack(self) -> Result<(), AuthError> {
        self.acker.ack().await
    }

    /// Rejects the delivery, optionally requeueing it for redelivery.
    ///
    /// # Errors
    ///
    /// Returns a broker error if the rejection cannot be sent.
    pub async fn reject(self, requeue: bool) -> Result<(), AuthError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Settlement half of a delivery, implemented per transport.
#[async_trait]
pub trait DeliveryAck: Send {
    async fn ack(self: Box<Self>) -> Result<(), AuthError>;
    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), AuthError>;
}

/// A live consumer on one queue.
#[derive(Debug)]
pub struct ConsumerHandle {
    /// Consumer tag, used to cancel the consumer later.
    pub tag: String,
    /// Stream of deliveries. Closes when the consumer is cancelled or
    /// the connection drops.
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Broker operations the RPC layer needs.
///
/// Implementations are shared behind an `Arc` and must be safe to call
/// from concurrent tasks.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Ensures a live connection, dialing if necessary.
    ///
    /// Returns `true` when this call established a fresh connection, in
    /// which case callers must redeclare any topology they rely on.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::BrokerUnavailable`] when the broker cannot be
    /// reached within the configured attempts.
    async fn ensure_connected(&self) -> Result<bool, AuthError>;

    /// Declares a durable direct exchange.
    async fn declare_direct_exchange(&self, name: &str) -> Result<(), AuthError>;

    /// Declares a durable queue that survives broker restarts.
    async fn declare_durable_queue(&self, name: &str) -> Result<(), AuthError>;

    /// Declares an exclusive auto-delete queue for one call's replies.
    async fn declare_reply_queue(&self, name: &str) -> Result<(), AuthError>;

    /// Binds `queue` to `exchange` under `routing_key`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AuthError>;

    /// Publishes one message.
    ///
    /// An empty `exchange` names the default exchange, which routes
    /// directly to the queue named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), AuthError>;

    /// Starts consuming from `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str) -> Result<ConsumerHandle, AuthError>;

    /// Cancels a consumer by tag.
    async fn cancel_consumer(&self, tag: &str) -> Result<(), AuthError>;

    /// Deletes a queue. Used to tear down reply queues after a call.
    async fn delete_queue(&self, name: &str) -> Result<(), AuthError>;
}
