//! Client-side RPC over the broker.
//!
//! One call publishes a request to a well-known routing key, then waits on
//! a private reply queue for the envelope whose correlation id matches.
//! Every call sets up and tears down its own reply queue and consumer;
//! only the connection, channel, and exchange outlive the call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use keygate_core::{AuthError, ReplyEnvelope};

use crate::config::BrokerConfig;

use super::pending::PendingCalls;
use super::transport::{BrokerTransport, ConsumerHandle, Delivery, MessageProperties};

type CallResult = Result<ReplyEnvelope, AuthError>;

/// Broker RPC client with per-call correlation.
pub struct RpcClient {
    transport: Arc<dyn BrokerTransport>,
    config: BrokerConfig,
    pending: PendingCalls,
    /// Serializes connection checks and topology declaration.
    setup: Mutex<()>,
    exchange_ready: AtomicBool,
}

impl RpcClient {
    #[must_use]
    pub fn new(transport: Arc<dyn BrokerTransport>, config: BrokerConfig) -> Self {
        Self {
            transport,
            config,
            pending: PendingCalls::new(),
            setup: Mutex::new(()),
            exchange_ready: AtomicBool::new(false),
        }
    }

    /// Calls `routing_key` with the configured default timeout.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::call_with_timeout`].
    pub async fn call(&self, routing_key: &str, payload: &Value) -> CallResult {
        self.call_with_timeout(routing_key, payload, self.config.call_timeout)
            .await
    }

    /// Publishes `payload` to `routing_key` and waits for the correlated
    /// reply envelope.
    ///
    /// The reply queue, its consumer, and the pending-call entry are torn
    /// down on every exit path. A reply arriving after the timeout is
    /// dropped, it never resolves a later call.
    ///
    /// # Errors
    ///
    /// [`AuthError::BrokerUnavailable`] when no connection can be
    /// established, [`AuthError::BrokerProtocol`] for declare/publish
    /// faults or an unparseable reply, [`AuthError::SourceTimeout`] when
    /// no reply arrives in time.
    pub async fn call_with_timeout(
        &self,
        routing_key: &str,
        payload: &Value,
        timeout: Duration,
    ) -> CallResult {
        self.ensure_topology().await?;

        let reply_queue = self.config.reply_queue_name();
        self.transport.declare_reply_queue(&reply_queue).await?;

        let correlation_id = Uuid::new_v4().to_string();
        let (rx, _guard) = self.pending.register(&correlation_id);

        let consumer = match self.transport.consume(&reply_queue).await {
            Ok(consumer) => consumer,
            Err(e) => {
                self.discard_reply_queue(None, &reply_queue).await;
                return Err(e);
            }
        };
        let consumer_tag = consumer.tag.clone();
        self.watch_replies(consumer, correlation_id.clone());

        let outcome = self
            .publish_and_wait(routing_key, payload, &correlation_id, &reply_queue, rx, timeout)
            .await;

        self.discard_reply_queue(Some(&consumer_tag), &reply_queue).await;
        outcome
    }

    /// Number of calls currently awaiting replies.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Connects if necessary and declares the outbound exchange once per
    /// connection. Serialized so concurrent calls cannot race a redial.
    async fn ensure_topology(&self) -> Result<(), AuthError> {
        let _setup = self.setup.lock().await;
        if self.transport.ensure_connected().await? {
            self.exchange_ready.store(false, Ordering::SeqCst);
        }
        if !self.exchange_ready.load(Ordering::SeqCst) {
            self.transport
                .declare_direct_exchange(&self.config.users_exchange)
                .await?;
            self.exchange_ready.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Forwards reply deliveries into the pending table. Every delivery
    /// is acked; only a matching correlation id resolves the call, and
    /// the task ends after the first match.
    fn watch_replies(&self, mut consumer: ConsumerHandle, expected: String) {
        let pending = self.pending.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.deliveries.recv().await {
                let Delivery {
                    body,
                    correlation_id,
                    acker,
                    ..
                } = delivery;
                if let Err(e) = acker.ack().await {
                    warn!(error = %e, "failed to ack reply delivery");
                }
                match correlation_id {
                    Some(id) if id == expected => {
                        let result = ReplyEnvelope::from_bytes(&body).map_err(|e| {
                            AuthError::BrokerProtocol {
                                detail: e.to_string(),
                            }
                        });
                        if !pending.complete(&id, result) {
                            debug!(correlation_id = %id, "dropping late reply");
                        }
                        break;
                    }
                    other => {
                        debug!(correlation_id = ?other, "ignoring reply with foreign correlation id");
                    }
                }
            }
        });
    }

    async fn publish_and_wait(
        &self,
        routing_key: &str,
        payload: &Value,
        correlation_id: &str,
        reply_queue: &str,
        rx: oneshot::Receiver<CallResult>,
        timeout: Duration,
    ) -> CallResult {
        let body = serde_json::to_vec(payload).map_err(|e| AuthError::Internal {
            detail: format!("request serialization failed: {e}"),
        })?;

        self.transport
            .publish(
                &self.config.users_exchange,
                routing_key,
                MessageProperties {
                    correlation_id: Some(correlation_id.to_owned()),
                    reply_to: Some(reply_queue.to_owned()),
                    persistent: true,
                },
                body,
            )
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AuthError::Internal {
                detail: "reply channel closed without a result".to_owned(),
            }),
            Err(_) => Err(AuthError::SourceTimeout {
                detail: format!("no reply on '{routing_key}' within {timeout:?}"),
            }),
        }
    }

    /// Best-effort teardown of the call-scoped consumer and queue.
    async fn discard_reply_queue(&self, consumer_tag: Option<&str>, reply_queue: &str) {
        if let Some(tag) = consumer_tag {
            if let Err(e) = self.transport.cancel_consumer(tag).await {
                warn!(error = %e, "failed to cancel reply consumer");
            }
        }
        if let Err(e) = self.transport.delete_queue(reply_queue).await {
            warn!(error = %e, "failed to delete reply queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::broker::memory::MemoryBroker;

    use super::*;

    fn client(broker: &MemoryBroker) -> RpcClient {
        RpcClient::new(Arc::new(broker.clone()), BrokerConfig::default())
    }

    /// Stands in for the user service: consumes `users.get` and answers
    /// every request with a fixed envelope.
    async fn spawn_responder(broker: &MemoryBroker, reply: ReplyEnvelope) {
        broker.ensure_connected().await.unwrap();
        broker.declare_direct_exchange("auth.users.direct").await.unwrap();
        broker.declare_durable_queue("users.get").await.unwrap();
        broker
            .bind_queue("users.get", "auth.users.direct", "users.get")
            .await
            .unwrap();
        let mut handle = broker.consume("users.get").await.unwrap();
        let broker = broker.clone();
        tokio::spawn(async move {
            while let Some(delivery) = handle.deliveries.recv().await {
                let reply_to = delivery.reply_to.clone().unwrap();
                let correlation_id = delivery.correlation_id.clone();
                delivery.ack().await.unwrap();
                broker
                    .publish(
                        "",
                        &reply_to,
                        MessageProperties {
                            correlation_id,
                            reply_to: None,
                            persistent: false,
                        },
                        reply.to_bytes().unwrap(),
                    )
                    .await
                    .unwrap();
            }
        });
    }

    fn reply_queue_names(broker: &MemoryBroker) -> Vec<String> {
        broker
            .queue_names()
            .into_iter()
            .filter(|name| name.starts_with("auth.reply."))
            .collect()
    }

    #[tokio::test]
    async fn call_returns_matching_reply() {
        let broker = MemoryBroker::new();
        spawn_responder(&broker, ReplyEnvelope::ok(200, json!({"id": 42}))).await;

        let client = client(&broker);
        let envelope = client.call("users.get", &json!({"user_id": 42})).await.unwrap();

        assert_eq!(envelope.status_code(), 200);
        assert_eq!(envelope.body()["id"], 42);
        assert_eq!(client.pending_count(), 0);
        assert!(reply_queue_names(&broker).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out_without_reply() {
        let broker = MemoryBroker::new();
        // Queue exists but its consumer never answers
        broker.ensure_connected().await.unwrap();
        broker.declare_direct_exchange("auth.users.direct").await.unwrap();
        broker.declare_durable_queue("users.get").await.unwrap();
        broker
            .bind_queue("users.get", "auth.users.direct", "users.get")
            .await
            .unwrap();
        let _silent = broker.consume("users.get").await.unwrap();

        let client = client(&broker);
        let err = client
            .call_with_timeout("users.get", &json!({"user_id": 1}), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::SourceTimeout { .. }));
        assert_eq!(client.pending_count(), 0);
        assert!(reply_queue_names(&broker).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_dropped_silently() {
        let broker = MemoryBroker::new();
        broker.ensure_connected().await.unwrap();
        broker.declare_direct_exchange("auth.users.direct").await.unwrap();
        broker.declare_durable_queue("users.get").await.unwrap();
        broker
            .bind_queue("users.get", "auth.users.direct", "users.get")
            .await
            .unwrap();
        let mut handle = broker.consume("users.get").await.unwrap();
        let responder_broker = broker.clone();
        tokio::spawn(async move {
            while let Some(delivery) = handle.deliveries.recv().await {
                let reply_to = delivery.reply_to.clone().unwrap();
                let correlation_id = delivery.correlation_id.clone();
                delivery.ack().await.unwrap();
                // Answer well past the caller's deadline
                tokio::time::sleep(Duration::from_secs(30)).await;
                let _ = responder_broker
                    .publish(
                        "",
                        &reply_to,
                        MessageProperties {
                            correlation_id,
                            reply_to: None,
                            persistent: false,
                        },
                        ReplyEnvelope::ok(200, json!({})).to_bytes().unwrap(),
                    )
                    .await;
            }
        });

        let client = client(&broker);
        let err = client
            .call_with_timeout("users.get", &json!({"user_id": 1}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SourceTimeout { .. }));

        // Let the late reply fire; it lands on a deleted queue
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.pending_count(), 0);
        assert!(reply_queue_names(&broker).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unroutable_request_times_out() {
        let broker = MemoryBroker::new();
        let client = client(&broker);

        let err = client
            .call_with_timeout("users.get", &json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::SourceTimeout { .. }));
        // First call dialed the connection and declared the exchange itself
        assert!(broker.exchange_exists("auth.users.direct"));
    }

    #[tokio::test]
    async fn connection_failure_is_broker_unavailable() {
        let broker = MemoryBroker::new();
        broker.set_fail_connections(true);

        let client = client(&broker);
        let err = client.call("users.get", &json!({})).await.unwrap_err();

        assert!(matches!(err, AuthError::BrokerUnavailable { .. }));
        assert_eq!(client.pending_count(), 0);
        assert!(reply_queue_names(&broker).is_empty());
    }

    #[tokio::test]
    async fn foreign_correlation_ids_are_ignored() {
        let broker = MemoryBroker::new();
        broker.ensure_connected().await.unwrap();
        broker.declare_direct_exchange("auth.users.direct").await.unwrap();
        broker.declare_durable_queue("users.get").await.unwrap();
        broker
            .bind_queue("users.get", "auth.users.direct", "users.get")
            .await
            .unwrap();
        let mut handle = broker.consume("users.get").await.unwrap();
        let responder_broker = broker.clone();
        tokio::spawn(async move {
            while let Some(delivery) = handle.deliveries.recv().await {
                let reply_to = delivery.reply_to.clone().unwrap();
                let correlation_id = delivery.correlation_id.clone();
                delivery.ack().await.unwrap();
                // A stray reply first, then the real one
                responder_broker
                    .publish(
                        "",
                        &reply_to,
                        MessageProperties {
                            correlation_id: Some("someone-elses-call".to_owned()),
                            reply_to: None,
                            persistent: false,
                        },
                        ReplyEnvelope::ok(200, json!({"stray": true})).to_bytes().unwrap(),
                    )
                    .await
                    .unwrap();
                responder_broker
                    .publish(
                        "",
                        &reply_to,
                        MessageProperties {
                            correlation_id,
                            reply_to: None,
                            persistent: false,
                        },
                        ReplyEnvelope::ok(200, json!({"stray": false})).to_bytes().unwrap(),
                    )
                    .await
                    .unwrap();
            }
        });

        let client = client(&broker);
        let envelope = client.call("users.get", &json!({"user_id": 9})).await.unwrap();
        assert_eq!(envelope.body()["stray"], false);
    }

    #[tokio::test]
    async fn malformed_reply_is_a_broker_protocol_error() {
        let broker = MemoryBroker::new();
        broker.ensure_connected().await.unwrap();
        broker.declare_direct_exchange("auth.users.direct").await.unwrap();
        broker.declare_durable_queue("users.get").await.unwrap();
        broker
            .bind_queue("users.get", "auth.users.direct", "users.get")
            .await
            .unwrap();
        let mut handle = broker.consume("users.get").await.unwrap();
        let responder_broker = broker.clone();
        tokio::spawn(async move {
            while let Some(delivery) = handle.deliveries.recv().await {
                let reply_to = delivery.reply_to.clone().unwrap();
                let correlation_id = delivery.correlation_id.clone();
                delivery.ack().await.unwrap();
                responder_broker
                    .publish(
                        "",
                        &reply_to,
                        MessageProperties {
                            correlation_id,
                            reply_to: None,
                            persistent: false,
                        },
                        b"{ not an envelope".to_vec(),
                    )
                    .await
                    .unwrap();
            }
        });

        let client = client(&broker);
        let err = client.call("users.get", &json!({})).await.unwrap_err();
        assert!(matches!(err, AuthError::BrokerProtocol { .. }));
    }

    #[tokio::test]
    async fn concurrent_calls_resolve_independently() {
        let broker = MemoryBroker::new();
        // Echo responder: answers with the request payload as the body
        broker.ensure_connected().await.unwrap();
        broker.declare_direct_exchange("auth.users.direct").await.unwrap();
        broker.declare_durable_queue("users.get").await.unwrap();
        broker
            .bind_queue("users.get", "auth.users.direct", "users.get")
            .await
            .unwrap();
        let mut handle = broker.consume("users.get").await.unwrap();
        let responder_broker = broker.clone();
        tokio::spawn(async move {
            while let Some(delivery) = handle.deliveries.recv().await {
                let reply_to = delivery.reply_to.clone().unwrap();
                let correlation_id = delivery.correlation_id.clone();
                let request: Value = serde_json::from_slice(&delivery.body).unwrap();
                delivery.ack().await.unwrap();
                responder_broker
                    .publish(
                        "",
                        &reply_to,
                        MessageProperties {
                            correlation_id,
                            reply_to: None,
                            persistent: false,
                        },
                        ReplyEnvelope::ok(200, request).to_bytes().unwrap(),
                    )
                    .await
                    .unwrap();
            }
        });

        let client = Arc::new(client(&broker));
        let a = Arc::clone(&client);
        let b = Arc::clone(&client);
        let (first, second) = tokio::join!(
            async move { a.call("users.get", &json!({"user_id": 1})).await },
            async move { b.call("users.get", &json!({"user_id": 2})).await },
        );

        assert_eq!(first.unwrap().body()["user_id"], 1);
        assert_eq!(second.unwrap().body()["user_id"], 2);
        assert_eq!(client.pending_count(), 0);
        assert!(reply_queue_names(&broker).is_empty());
    }
}
