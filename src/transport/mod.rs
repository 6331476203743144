//! Broker client abstraction
//!
//! The worker only ever talks to a [`BrokerClient`] obtained from a
//! [`BrokerConnector`], which lets tests swap the MQTT implementation for a
//! mock without a running broker.

use crate::protocol::InboundMessage;
use tokio::sync::mpsc;

pub mod mqtt;

/// Items delivered on a subscription's inbound channel
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A message published on a topic matching the subscription
    Message(InboundMessage),
    /// The connection went away; no further messages will follow
    ConnectionLost(String),
}

/// One broker connection handle
///
/// A handle is used for a single connect/subscribe/disconnect cycle. Restarts
/// build a fresh handle through the connector.
#[async_trait::async_trait]
pub trait BrokerClient: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the broker, applying TLS settings first when configured
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Subscribe to a topic filter and start receiving
    ///
    /// Messages arrive on the returned channel in broker delivery order.
    /// Closing the receiver stops delivery.
    async fn subscribe(
        &mut self,
        topic_filter: &str,
    ) -> Result<mpsc::Receiver<InboundEvent>, Self::Error>;

    /// Disconnect from the broker. A no-op on a handle that is not connected.
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Check if the handle is currently connected
    fn is_connected(&self) -> bool;
}

/// Factory for broker connection handles
pub trait BrokerConnector: Send + Sync {
    type Client: BrokerClient + 'static;

    /// Build a new, unconnected handle
    fn create_client(&self) -> Self::Client;
}
