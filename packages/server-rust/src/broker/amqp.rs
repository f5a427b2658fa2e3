//! AMQP transport backed by lapin.
//!
//! Holds one connection and one long-lived channel behind a mutex. Every
//! operation clones the channel out of the lock, so slow broker calls
//! never hold it. Reconnection is centralized in `ensure_connected`:
//! callers learn from its return value whether topology must be
//! redeclared on a fresh connection.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use keygate_core::AuthError;

use crate::config::BrokerConfig;

use super::transport::{
    BrokerTransport, ConsumerHandle, Delivery, DeliveryAck, MessageProperties,
};

/// Connection name shown in the broker's management UI.
const CONNECTION_NAME: &str = "keygate-auth-service";

struct AmqpState {
    connection: Connection,
    channel: Channel,
}

/// Live broker transport over AMQP.
pub struct AmqpBroker {
    config: BrokerConfig,
    state: Mutex<Option<AmqpState>>,
}

impl AmqpBroker {
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    /// Clones the current channel out of the lock.
    async fn channel(&self) -> Result<Channel, AuthError> {
        let state = self.state.lock().await;
        match state.as_ref() {
            Some(s) if s.channel.status().connected() => Ok(s.channel.clone()),
            _ => Err(AuthError::BrokerUnavailable {
                detail: "not connected".to_owned(),
            }),
        }
    }

    /// Dials the broker with bounded retries and linear backoff.
    async fn dial(&self) -> Result<AmqpState, AuthError> {
        let properties = ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into());
        let mut last_error = String::new();

        for attempt in 1..=self.config.connect_attempts {
            match tokio::time::timeout(
                self.config.connect_timeout,
                Connection::connect(&self.config.url, properties.clone()),
            )
            .await
            {
                Ok(Ok(connection)) => {
                    let channel = connection
                        .create_channel()
                        .await
                        .map_err(|e| map_error(&e))?;
                    debug!(attempt, "connected to broker");
                    return Ok(AmqpState {
                        connection,
                        channel,
                    });
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    warn!(attempt, error = %e, "broker connection attempt failed");
                }
                Err(_) => {
                    last_error = "connection handshake timed out".to_owned();
                    warn!(attempt, "broker connection attempt timed out");
                }
            }

            if attempt < self.config.connect_attempts {
                let jitter = rand::rng().random_range(0..100);
                let backoff =
                    self.config.retry_backoff * attempt + std::time::Duration::from_millis(jitter);
                tokio::time::sleep(backoff).await;
            }
        }

        Err(AuthError::BrokerUnavailable { detail: last_error })
    }
}

#[async_trait]
impl BrokerTransport for AmqpBroker {
    async fn ensure_connected(&self) -> Result<bool, AuthError> {
        let mut state = self.state.lock().await;
        if let Some(s) = state.as_ref() {
            if s.connection.status().connected() && s.channel.status().connected() {
                return Ok(false);
            }
            warn!("broker connection lost, redialing");
        }
        *state = Some(self.dial().await?);
        Ok(true)
    }

    async fn declare_direct_exchange(&self, name: &str) -> Result<(), AuthError> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(&e))
    }

    async fn declare_durable_queue(&self, name: &str) -> Result<(), AuthError> {
        let channel = self.channel().await?;
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| map_error(&e))
    }

    async fn declare_reply_queue(&self, name: &str) -> Result<(), AuthError> {
        let channel = self.channel().await?;
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| map_error(&e))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AuthError> {
        let channel = self.channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(&e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), AuthError> {
        let channel = self.channel().await?;

        let mut props = BasicProperties::default();
        if let Some(id) = properties.correlation_id {
            props = props.with_correlation_id(id.into());
        }
        if let Some(reply_to) = properties.reply_to {
            props = props.with_reply_to(reply_to.into());
        }
        if properties.persistent {
            props = props.with_delivery_mode(2);
        }

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                props,
            )
            .await
            .map_err(|e| map_error(&e))?
            .await
            .map_err(|e| map_error(&e))?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<ConsumerHandle, AuthError> {
        let channel = self.channel().await?;
        let tag = format!("keygate-{}", Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(&e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue_name = queue.to_owned();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let forwarded = Delivery {
                            body: delivery.data,
                            correlation_id: delivery
                                .properties
                                .correlation_id()
                                .as_ref()
                                .map(ToString::to_string),
                            reply_to: delivery
                                .properties
                                .reply_to()
                                .as_ref()
                                .map(ToString::to_string),
                            redelivered: delivery.redelivered,
                            acker: Box::new(AmqpAck {
                                acker: delivery.acker,
                            }),
                        };
                        if tx.send(forwarded).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(queue = %queue_name, error = %e, "consumer stream failed");
                        break;
                    }
                }
            }
        });

        Ok(ConsumerHandle {
            tag,
            deliveries: rx,
        })
    }

    async fn cancel_consumer(&self, tag: &str) -> Result<(), AuthError> {
        let channel = self.channel().await?;
        channel
            .basic_cancel(tag, BasicCancelOptions::default())
            .await
            .map_err(|e| map_error(&e))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AuthError> {
        let channel = self.channel().await?;
        channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| map_error(&e))
    }
}

struct AmqpAck {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl DeliveryAck for AmqpAck {
    async fn ack(self: Box<Self>) -> Result<(), AuthError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| map_error(&e))
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), AuthError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| map_error(&e))
    }
}

/// Connection-level failures are unavailability; everything else is a
/// protocol failure on an otherwise live connection.
fn map_error(e: &lapin::Error) -> AuthError {
    match e {
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            AuthError::BrokerUnavailable {
                detail: e.to_string(),
            }
        }
        _ => AuthError::BrokerProtocol {
            detail: e.to_string(),
        },
    }
}
