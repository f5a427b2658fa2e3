//! Broker-mediated RPC.
//!
//! [`transport`] is the seam; [`amqp`] and [`memory`] implement it.
//! [`rpc`] is the client side (correlation engine), [`listener`] the
//! server side (dispatcher), and [`routes`] the table between them.

pub mod amqp;
pub mod listener;
pub mod memory;
pub mod pending;
pub mod routes;
pub mod rpc;
pub mod transport;

pub use amqp::AmqpBroker;
pub use listener::{AuthListener, ListenerHandle};
pub use memory::MemoryBroker;
pub use pending::PendingCalls;
pub use routes::{AuthHandler, RouteTable};
pub use rpc::RpcClient;
pub use transport::{BrokerTransport, ConsumerHandle, Delivery, MessageProperties};
