//! Server-side listener and dispatcher.
//!
//! Binds one durable queue per operation to the gateway exchange, consumes
//! with manual acknowledgement, and runs each request through the route
//! table. Every inbound message is settled exactly once: answered and
//! acked, or rejected back to the broker when the reply cannot be
//! published. A panicking handler costs one 500 reply, never the loop.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use keygate_core::{AuthError, OperationKind, ReplyEnvelope, OPERATION_TYPE_FIELD};

use crate::config::BrokerConfig;
use crate::shutdown::ShutdownController;

use super::routes::RouteTable;
use super::transport::{BrokerTransport, ConsumerHandle, Delivery, MessageProperties};

/// Consumes auth requests from the broker and dispatches them.
pub struct AuthListener {
    transport: Arc<dyn BrokerTransport>,
    config: BrokerConfig,
    routes: Arc<RouteTable>,
    shutdown: Arc<ShutdownController>,
}

impl AuthListener {
    #[must_use]
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        config: BrokerConfig,
        routes: RouteTable,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            transport,
            config,
            routes: Arc::new(routes),
            shutdown,
        }
    }

    /// Declares the topology and starts consuming.
    ///
    /// One durable queue per registered operation, bound to the gateway
    /// exchange under a routing key equal to the queue name. Each queue
    /// gets its own dispatch loop, so a slow operation never stalls the
    /// others. Marks the service ready once all consumers are bound.
    ///
    /// # Errors
    ///
    /// Fails on an incomplete route table or when the broker topology
    /// cannot be established.
    pub async fn start_listening(self) -> anyhow::Result<ListenerHandle> {
        self.routes.validate()?;

        self.transport.ensure_connected().await?;
        self.transport
            .declare_direct_exchange(&self.config.gateway_exchange)
            .await?;
        info!(exchange = %self.config.gateway_exchange, "declared gateway exchange");

        let kinds: Vec<OperationKind> = self.routes.operations().collect();
        let mut consumer_tags = Vec::with_capacity(kinds.len());
        let mut loops = Vec::with_capacity(kinds.len());

        for kind in kinds {
            let queue = self.config.auth_queue_name(kind);
            self.transport.declare_durable_queue(&queue).await?;
            self.transport
                .bind_queue(&queue, &self.config.gateway_exchange, &queue)
                .await?;
            let consumer = self.transport.consume(&queue).await?;
            info!(queue = %queue, operation = %kind, "consuming");

            consumer_tags.push(consumer.tag.clone());
            loops.push(tokio::spawn(run_dispatch_loop(
                kind,
                consumer,
                Arc::clone(&self.transport),
                Arc::clone(&self.routes),
                Arc::clone(&self.shutdown),
            )));
        }

        self.shutdown.set_ready();
        info!("auth listener ready");

        Ok(ListenerHandle {
            transport: self.transport,
            consumer_tags,
            loops,
        })
    }
}

/// Running listener. Dropping it leaves the loops running; call
/// [`ListenerHandle::stop`] for an orderly teardown.
pub struct ListenerHandle {
    transport: Arc<dyn BrokerTransport>,
    consumer_tags: Vec<String>,
    loops: Vec<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Cancels all consumers and joins the dispatch loops.
    ///
    /// Messages already delivered but not yet processed stay unacked and
    /// will be redelivered on the next start.
    pub async fn stop(self) {
        for tag in &self.consumer_tags {
            if let Err(e) = self.transport.cancel_consumer(tag).await {
                warn!(tag = %tag, error = %e, "failed to cancel consumer");
            }
        }
        for task in self.loops {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("dispatch loop panicked");
                }
            }
        }
        info!("auth listener stopped");
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("consumer_tags", &self.consumer_tags)
            .field("loops", &self.loops.len())
            .finish_non_exhaustive()
    }
}

/// Drains one operation queue until its consumer closes or shutdown fires.
async fn run_dispatch_loop(
    kind: OperationKind,
    mut consumer: ConsumerHandle,
    transport: Arc<dyn BrokerTransport>,
    routes: Arc<RouteTable>,
    shutdown: Arc<ShutdownController>,
) {
    let mut stop = shutdown.shutdown_receiver();
    loop {
        tokio::select! {
            maybe = consumer.deliveries.recv() => match maybe {
                Some(delivery) => {
                    process_delivery(&transport, &routes, &shutdown, delivery).await;
                }
                None => {
                    debug!(operation = %kind, "consumer stream closed");
                    break;
                }
            },
            _ = stop.changed() => {
                debug!(operation = %kind, "shutdown signalled");
                break;
            }
        }
    }
}

/// Runs one inbound message through dispatch and settles it exactly once.
async fn process_delivery(
    transport: &Arc<dyn BrokerTransport>,
    routes: &Arc<RouteTable>,
    shutdown: &Arc<ShutdownController>,
    delivery: Delivery,
) {
    let _in_flight = shutdown.in_flight_guard();

    if delivery.redelivered {
        debug!("processing redelivered request");
    }

    let envelope = dispatch(routes, &delivery.body).await;

    let Some(reply_to) = delivery.reply_to.clone() else {
        warn!("request carries no reply_to, nothing to answer");
        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "failed to ack request");
        }
        return;
    };

    let bytes = match envelope.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "reply envelope failed to serialize");
            if let Err(e) = delivery.ack().await {
                warn!(error = %e, "failed to ack request");
            }
            return;
        }
    };

    let properties = MessageProperties {
        correlation_id: delivery.correlation_id.clone(),
        reply_to: None,
        persistent: false,
    };
    match transport.publish("", &reply_to, properties, bytes).await {
        Ok(()) => {
            if let Err(e) = delivery.ack().await {
                warn!(error = %e, "failed to ack request");
            }
        }
        Err(e) => {
            warn!(error = %e, "reply publish failed, returning request to the broker");
            if let Err(e) = delivery.reject(true).await {
                warn!(error = %e, "failed to reject request");
            }
        }
    }
}

/// Decodes a request body, routes it, and folds the outcome into a reply
/// envelope. Handlers run on their own task so a panic is contained.
async fn dispatch(routes: &Arc<RouteTable>, body: &[u8]) -> ReplyEnvelope {
    let mut payload: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "request body is not valid JSON");
            return AuthError::Validation {
                detail: format!("request body is not valid JSON: {e}"),
            }
            .to_envelope();
        }
    };

    let Some(fields) = payload.as_object_mut() else {
        return AuthError::Validation {
            detail: "request body must be a JSON object".to_owned(),
        }
        .to_envelope();
    };
    let Some(operation_value) = fields.remove(OPERATION_TYPE_FIELD) else {
        return AuthError::Validation {
            detail: format!("missing '{OPERATION_TYPE_FIELD}' field"),
        }
        .to_envelope();
    };
    let Some(operation) = operation_value.as_str() else {
        return AuthError::Validation {
            detail: format!("'{OPERATION_TYPE_FIELD}' must be a string"),
        }
        .to_envelope();
    };

    let Some(kind) = OperationKind::parse(operation) else {
        error!(operation = %operation, "unknown operation_type received");
        return AuthError::UnknownOperation {
            operation: operation.to_owned(),
        }
        .to_envelope();
    };
    let Some(handler) = routes.resolve(kind) else {
        error!(operation = %operation, "operation has no registered handler");
        return AuthError::UnknownOperation {
            operation: operation.to_owned(),
        }
        .to_envelope();
    };

    match tokio::spawn(async move { handler.handle(payload).await }).await {
        Ok(Ok(body)) => ReplyEnvelope::ok(kind.success_status(), body),
        Ok(Err(e)) => {
            if e.status_code() >= 500 {
                error!(operation = %kind, error = %e, "operation failed");
            } else {
                info!(operation = %kind, error = %e, "operation rejected");
            }
            e.to_envelope()
        }
        Err(join_error) => {
            if join_error.is_panic() {
                error!(operation = %kind, "handler panicked");
            } else {
                error!(operation = %kind, "handler task cancelled");
            }
            AuthError::Internal {
                detail: format!("handler for '{kind}' aborted"),
            }
            .to_envelope()
        }
    }
}
