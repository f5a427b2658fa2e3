//! In-memory broker implementing [`BrokerTransport`] for tests.
//!
//! Models the slice of AMQP the service relies on: direct exchanges with
//! routing-key bindings, the default exchange routing by queue name,
//! exclusive auto-delete reply queues, manual acknowledgement, and
//! redelivery of unsettled messages. Test knobs simulate connection
//! failures and broker-side redelivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use keygate_core::AuthError;

use super::transport::{
    BrokerTransport, ConsumerHandle, Delivery, DeliveryAck, MessageProperties,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    buffered: VecDeque<StoredMessage>,
    consumer: Option<(String, mpsc::UnboundedSender<Delivery>)>,
    auto_delete: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    /// (exchange, routing key) -> queue name.
    bindings: HashMap<(String, String), String>,
    queues: HashMap<String, QueueState>,
    /// Delivered but not yet settled, keyed by delivery id.
    unacked: HashMap<u64, (String, StoredMessage)>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<BrokerState>,
    connected: AtomicBool,
    fail_connections: AtomicBool,
    fail_publishes: AtomicU64,
    next_delivery_id: AtomicU64,
    next_consumer_id: AtomicU64,
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                connected: AtomicBool::new(false),
                fail_connections: AtomicBool::new(false),
                fail_publishes: AtomicU64::new(0),
                next_delivery_id: AtomicU64::new(0),
                next_consumer_id: AtomicU64::new(0),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Test knobs
    // -----------------------------------------------------------------------

    /// Makes every subsequent connection attempt fail.
    pub fn set_fail_connections(&self, fail: bool) {
        self.inner.fail_connections.store(fail, Ordering::SeqCst);
    }

    /// Fails the next `count` publishes with a protocol error.
    pub fn fail_next_publishes(&self, count: u64) {
        self.inner.fail_publishes.store(count, Ordering::SeqCst);
    }

    /// Simulates a dropped connection: consumers are closed and unsettled
    /// messages return to their queues marked redelivered.
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        let mut state = self.inner.state.lock();
        for queue in state.queues.values_mut() {
            queue.consumer = None;
        }
        let unacked: Vec<_> = state.unacked.drain().map(|(_, v)| v).collect();
        for (queue_name, mut message) in unacked {
            message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.buffered.push_front(message);
            }
        }
    }

    /// Requeues everything delivered but never settled, as a broker would
    /// after a consumer failure.
    pub fn redeliver_unacked(&self) {
        let mut state = self.inner.state.lock();
        let unacked: Vec<_> = state.unacked.drain().map(|(_, v)| v).collect();
        for (queue_name, mut message) in unacked {
            message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.buffered.push_front(message);
            }
        }
        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            Self::flush_queue(&self.inner, &mut state, &name);
        }
    }

    #[must_use]
    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.state.lock().queues.contains_key(name)
    }

    /// Names of all queues currently declared. Lets tests assert that
    /// call-scoped reply queues were torn down.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        self.inner.state.lock().queues.keys().cloned().collect()
    }

    #[must_use]
    pub fn exchange_exists(&self, name: &str) -> bool {
        self.inner.state.lock().exchanges.contains(name)
    }

    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> usize {
        let state = self.inner.state.lock();
        state
            .queues
            .get(queue)
            .map_or(0, |q| usize::from(q.consumer.is_some()))
    }

    #[must_use]
    pub fn buffered_len(&self, queue: &str) -> usize {
        let state = self.inner.state.lock();
        state.queues.get(queue).map_or(0, |q| q.buffered.len())
    }

    /// Messages delivered to a consumer but not yet acked or rejected.
    #[must_use]
    pub fn unacked_len(&self) -> usize {
        self.inner.state.lock().unacked.len()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn check_connected(&self) -> Result<(), AuthError> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AuthError::BrokerUnavailable {
                detail: "not connected".to_owned(),
            })
        }
    }

    /// Moves buffered messages into the queue's consumer, tracking each
    /// as unacked until settled. A closed consumer channel unregisters
    /// the consumer and puts the message back.
    fn flush_queue(inner: &Arc<Inner>, state: &mut BrokerState, queue_name: &str) {
        loop {
            let Some(queue) = state.queues.get_mut(queue_name) else {
                return;
            };
            let Some((_, sender)) = queue.consumer.clone() else {
                return;
            };
            let Some(message) = queue.buffered.pop_front() else {
                return;
            };

            let delivery_id = inner.next_delivery_id.fetch_add(1, Ordering::Relaxed);
            let delivery = Delivery {
                body: message.body.clone(),
                correlation_id: message.correlation_id.clone(),
                reply_to: message.reply_to.clone(),
                redelivered: message.redelivered,
                acker: Box::new(MemoryAck {
                    inner: Arc::clone(inner),
                    delivery_id,
                }),
            };

            if sender.send(delivery).is_ok() {
                state
                    .unacked
                    .insert(delivery_id, (queue_name.to_owned(), message));
            } else {
                let Some(queue) = state.queues.get_mut(queue_name) else {
                    return;
                };
                queue.consumer = None;
                queue.buffered.push_front(message);
                return;
            }
        }
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn ensure_connected(&self) -> Result<bool, AuthError> {
        if self.inner.fail_connections.load(Ordering::SeqCst) {
            return Err(AuthError::BrokerUnavailable {
                detail: "connection refused".to_owned(),
            });
        }
        let was_connected = self.inner.connected.swap(true, Ordering::SeqCst);
        Ok(!was_connected)
    }

    async fn declare_direct_exchange(&self, name: &str) -> Result<(), AuthError> {
        self.check_connected()?;
        self.inner.state.lock().exchanges.insert(name.to_owned());
        Ok(())
    }

    async fn declare_durable_queue(&self, name: &str) -> Result<(), AuthError> {
        self.check_connected()?;
        self.inner
            .state
            .lock()
            .queues
            .entry(name.to_owned())
            .or_default();
        Ok(())
    }

    async fn declare_reply_queue(&self, name: &str) -> Result<(), AuthError> {
        self.check_connected()?;
        let mut state = self.inner.state.lock();
        let queue = state.queues.entry(name.to_owned()).or_default();
        queue.auto_delete = true;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AuthError> {
        self.check_connected()?;
        let mut state = self.inner.state.lock();
        if !state.exchanges.contains(exchange) {
            return Err(AuthError::BrokerProtocol {
                detail: format!("bind to unknown exchange '{exchange}'"),
            });
        }
        if !state.queues.contains_key(queue) {
            return Err(AuthError::BrokerProtocol {
                detail: format!("bind of unknown queue '{queue}'"),
            });
        }
        state
            .bindings
            .insert((exchange.to_owned(), routing_key.to_owned()), queue.to_owned());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<(), AuthError> {
        self.check_connected()?;
        if self
            .inner
            .fail_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AuthError::BrokerProtocol {
                detail: "channel closed mid-publish".to_owned(),
            });
        }
        let mut state = self.inner.state.lock();

        // The default exchange routes straight to the queue named by the
        // routing key. Unroutable messages are dropped, as a direct
        // exchange drops them without a mandatory flag.
        let target = if exchange.is_empty() {
            state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
        } else {
            if !state.exchanges.contains(exchange) {
                return Err(AuthError::BrokerProtocol {
                    detail: format!("publish to unknown exchange '{exchange}'"),
                });
            }
            state
                .bindings
                .get(&(exchange.to_owned(), routing_key.to_owned()))
                .cloned()
        };

        let Some(queue_name) = target else {
            return Ok(());
        };

        let message = StoredMessage {
            body,
            correlation_id: properties.correlation_id,
            reply_to: properties.reply_to,
            redelivered: false,
        };
        if let Some(queue) = state.queues.get_mut(&queue_name) {
            queue.buffered.push_back(message);
        }
        Self::flush_queue(&self.inner, &mut state, &queue_name);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<ConsumerHandle, AuthError> {
        self.check_connected()?;
        let mut state = self.inner.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(AuthError::BrokerProtocol {
                detail: format!("consume from unknown queue '{queue}'"),
            });
        }

        let tag = format!(
            "ctag-{}",
            self.inner.next_consumer_id.fetch_add(1, Ordering::Relaxed)
        );
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(entry) = state.queues.get_mut(queue) {
            entry.consumer = Some((tag.clone(), tx));
        }
        Self::flush_queue(&self.inner, &mut state, queue);

        Ok(ConsumerHandle {
            tag,
            deliveries: rx,
        })
    }

    async fn cancel_consumer(&self, tag: &str) -> Result<(), AuthError> {
        let mut state = self.inner.state.lock();
        let owner = state.queues.iter().find_map(|(name, queue)| {
            queue
                .consumer
                .as_ref()
                .filter(|(t, _)| t == tag)
                .map(|_| (name.clone(), queue.auto_delete))
        });
        if let Some((name, auto_delete)) = owner {
            if auto_delete {
                // Exclusive reply queues die with their consumer.
                state.queues.remove(&name);
            } else if let Some(queue) = state.queues.get_mut(&name) {
                queue.consumer = None;
            }
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AuthError> {
        self.inner.state.lock().queues.remove(name);
        Ok(())
    }
}

struct MemoryAck {
    inner: Arc<Inner>,
    delivery_id: u64,
}

#[async_trait]
impl DeliveryAck for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), AuthError> {
        self.inner.state.lock().unacked.remove(&self.delivery_id);
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), AuthError> {
        let mut state = self.inner.state.lock();
        let Some((queue_name, mut message)) = state.unacked.remove(&self.delivery_id) else {
            return Ok(());
        };
        if requeue {
            message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                queue.buffered.push_front(message);
            }
            MemoryBroker::flush_queue(&self.inner, &mut state, &queue_name);
        }
        Ok(())
    }
}
