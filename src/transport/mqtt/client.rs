//! Impure I/O operations for MQTT client
//!
//! This module owns the rumqttc client and event loop: connecting, pumping
//! received publishes onto the subscription channel and disconnecting.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::observability::metrics::metrics;
use crate::protocol::{validate_topic_filter, validate_topic_name, InboundMessage};
use crate::transport::{BrokerClient, BrokerConnector, InboundEvent};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, ConnectionError, Event, EventLoop};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;
/// Capacity of the inbound message channel handed to the subscriber
const INBOUND_CHANNEL_CAPACITY: usize = 100;
/// How long the pump may keep polling to get DISCONNECT onto the wire
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);
/// How long disconnect() waits for the pump before aborting it
const PUMP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
/// Extra time on top of rumqttc's own connection timeout before giving up on ConnAck
const CONNACK_GRACE: Duration = Duration::from_secs(5);

/// MQTT broker connection handle for one connect/subscribe/disconnect cycle
pub struct MqttClient {
    client_name: String,
    config: MqttSection,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: Option<watch::Sender<bool>>,
    pump_handle: Option<JoinHandle<()>>,
}

impl MqttClient {
    /// Create an unconnected handle. Options (and TLS material) are built on `connect()`.
    pub fn new(client_name: &str, config: MqttSection) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        Self {
            client_name: client_name.to_string(),
            config,
            client: None,
            event_loop: None,
            state_tx,
            state_rx,
            shutdown_tx: None,
            pump_handle: None,
        }
    }

    /// Connect to the broker and wait for ConnAck
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        if self.client.is_some() {
            return Err(MqttError::ConnectionFailedStr(
                "connect() called twice on the same handle".to_string(),
            ));
        }

        metrics().mqtt_connection_attempt();
        self.state_tx.send_replace(ConnectionState::Connecting);

        match self.establish().await {
            Ok(()) => {
                metrics().mqtt_connection_established();
                self.state_tx.send_replace(ConnectionState::Connected);
                info!(
                    client = %self.client_name,
                    "Connected to MQTT broker"
                );
                Ok(())
            }
            Err(e) => {
                metrics().mqtt_connection_failed();
                self.state_tx
                    .send_replace(ConnectionState::Disconnected(e.to_string()));
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> Result<(), MqttError> {
        let mqtt_options = configure_mqtt_options(&self.client_name, &self.config)?;
        let (host, port) = mqtt_options.broker_address();
        debug!(host = %host, port = port, "Opening MQTT connection");

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let timeout =
            Duration::from_secs(self.config.connection_timeout_secs.max(1)) + CONNACK_GRACE;
        Self::wait_for_connack(&mut event_loop, timeout).await?;

        self.client = Some(client);
        self.event_loop = Some(event_loop);
        Ok(())
    }

    /// Poll the event loop until the broker acknowledges the connection
    async fn wait_for_connack(event_loop: &mut EventLoop, timeout: Duration) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                let event = event_loop.poll().await.map_err(classify_connection_error)?;
                match MessageHandler::route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged => return Ok(()),
                    EventRoute::Disconnected(reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Broker disconnected during connect: {reason}"
                        )))
                    }
                    _ => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Subscribe at QoS 1 and start forwarding matching publishes
    pub async fn subscribe(
        &mut self,
        topic_filter: &str,
    ) -> Result<mpsc::Receiver<InboundEvent>, MqttError> {
        validate_topic_filter(topic_filter)?;
        self.check_connection_state()?;

        let client = self.client.as_ref().ok_or_else(|| MqttError::NotConnected {
            state: self.connection_state(),
        })?;
        if self.event_loop.is_none() {
            return Err(MqttError::SubscriptionFailed(
                "this handle already has an active subscription".into(),
            ));
        }

        client
            .subscribe(topic_filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;

        let event_loop = self.event_loop.take().ok_or_else(|| {
            MqttError::SubscriptionFailed("event loop no longer available".into())
        })?;
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_event_pump(
            event_loop,
            topic_filter.to_string(),
            inbound_tx,
            shutdown_rx,
            self.state_tx.clone(),
        ));

        self.shutdown_tx = Some(shutdown_tx);
        self.pump_handle = Some(handle);

        info!(topic_filter = %topic_filter, "Subscribed");
        Ok(inbound_rx)
    }

    /// Disconnect from the broker
    ///
    /// Sends DISCONNECT, stops the event pump and waits briefly for it to
    /// finish. A no-op on a handle that never connected.
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        let Some(client) = self.client.take() else {
            debug!("Disconnect requested on unconnected handle");
            return Ok(());
        };

        // The connection may already be gone, in which case there is nothing to tell the broker
        if let Err(e) = client.try_disconnect() {
            debug!("Could not queue DISCONNECT: {}", e);
        }

        if let Some(mut event_loop) = self.event_loop.take() {
            // Never subscribed, so no pump is polling; flush it here
            flush_disconnect(&mut event_loop).await;
        }

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            shutdown_tx.send_replace(true);
        }

        if let Some(handle) = self.pump_handle.take() {
            let abort = handle.abort_handle();
            match tokio::time::timeout(PUMP_SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("Event pump shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event pump ended with error: {}", e),
                Err(_) => {
                    warn!("Event pump didn't shut down gracefully, forcing abort");
                    abort.abort();
                }
                _ => {}
            }
        }

        metrics().mqtt_disconnected();
        self.state_tx.send_replace(ConnectionState::Disconnected(
            "Client disconnected".to_string(),
        ));
        info!(client = %self.client_name, "MQTT client disconnected");
        Ok(())
    }

    /// Publish a single message on a concrete topic at QoS 1
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<bytes::Bytes>,
        retain: bool,
    ) -> Result<(), MqttError> {
        validate_topic_name(topic)?;
        self.check_connection_state()?;

        let client = self.client.as_ref().ok_or_else(|| MqttError::NotConnected {
            state: self.connection_state(),
        })?;
        client
            .publish(topic, QoS::AtLeastOnce, retain, payload.into())
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(topic = %topic, retain = retain, "Queued publish");
        Ok(())
    }

    /// Publish, then keep the event loop turning until the broker acknowledges it
    ///
    /// For one-shot publishers that never subscribe.
    pub async fn publish_and_flush(
        &mut self,
        topic: &str,
        payload: impl Into<bytes::Bytes>,
        retain: bool,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        self.publish(topic, payload, retain).await?;

        let event_loop = self.event_loop.as_mut().ok_or_else(|| {
            MqttError::PublishFailed("event loop is owned by an active subscription".into())
        })?;

        let flushed = tokio::time::timeout(timeout, async {
            loop {
                let event = event_loop.poll().await.map_err(classify_connection_error)?;
                if let Event::Incoming(Packet::PubAck(_)) = event {
                    return Ok(());
                }
            }
        })
        .await;

        match flushed {
            Ok(result) => result,
            Err(_) => Err(MqttError::PublishFailed(
                "timed out waiting for PubAck".into(),
            )),
        }
    }

    /// Get current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<(), MqttError> {
        let current_state = self.connection_state();
        if current_state != ConnectionState::Connected {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }
}

/// Map rumqttc connection failures, keeping TLS problems distinguishable
fn classify_connection_error(error: ConnectionError) -> MqttError {
    match error {
        ConnectionError::Tls(e) => MqttError::Tls(e.to_string()),
        other => MqttError::ConnectionFailed(Box::new(other)),
    }
}

/// Drive the event loop until our DISCONNECT has been written, or give up
async fn flush_disconnect(event_loop: &mut EventLoop) {
    let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
        loop {
            match event_loop.poll().await {
                Ok(event) => {
                    if let EventRoute::DisconnectSent = MessageHandler::route_mqtt_event(&event) {
                        return;
                    }
                }
                Err(e) => {
                    debug!("Event loop closed while flushing DISCONNECT: {}", e);
                    return;
                }
            }
        }
    })
    .await;

    if flushed.is_err() {
        debug!("DISCONNECT not confirmed before flush timeout");
    }
}

/// Forward publishes matching `topic_filter` until shutdown or connection loss
async fn run_event_pump(
    mut event_loop: EventLoop,
    topic_filter: String,
    inbound_tx: mpsc::Sender<InboundEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<ConnectionState>,
) {
    debug!(topic_filter = %topic_filter, "Event pump started");

    loop {
        tokio::select! {
            biased;

            _ = stop_requested(&mut shutdown_rx) => {
                flush_disconnect(&mut event_loop).await;
                break;
            }

            polled = event_loop.poll() => {
                let route = match polled {
                    Ok(event) => MessageHandler::route_mqtt_event(&event),
                    Err(e) => {
                        let reason = e.to_string();
                        warn!(error = %reason, "MQTT connection error");
                        report_connection_lost(&inbound_tx, &state_tx, reason).await;
                        break;
                    }
                };

                match route {
                    EventRoute::MessageReceived { topic, payload, retain } => {
                        if !MessageHandler::should_forward(&topic, &topic_filter) {
                            continue;
                        }
                        debug!(topic = %topic, bytes = payload.len(), retain = retain, "Received message");
                        let message = InboundMessage::new(topic, payload);
                        if inbound_tx.send(InboundEvent::Message(message)).await.is_err() {
                            // Subscriber closed its end; hold the connection until told to disconnect
                            stop_requested(&mut shutdown_rx).await;
                            flush_disconnect(&mut event_loop).await;
                            break;
                        }
                    }
                    EventRoute::Disconnected(reason) => {
                        warn!(reason = %reason, "Broker closed the connection");
                        report_connection_lost(&inbound_tx, &state_tx, reason).await;
                        break;
                    }
                    EventRoute::SubscriptionRejected { reasons } => {
                        let reason = format!("subscription to {topic_filter} rejected: {reasons}");
                        warn!("{}", reason);
                        report_connection_lost(&inbound_tx, &state_tx, reason).await;
                        break;
                    }
                    EventRoute::SubscriptionConfirmed { packet_id } => {
                        debug!(packet_id = packet_id, "Subscription confirmed");
                    }
                    EventRoute::InfrastructureEvent(event) => {
                        tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event);
                    }
                    EventRoute::ConnectionAcknowledged
                    | EventRoute::DisconnectSent
                    | EventRoute::OutgoingEvent => {}
                }
            }
        }
    }

    debug!(topic_filter = %topic_filter, "Event pump stopped");
}

/// Resolves once shutdown is signalled or the handle is gone
async fn stop_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

async fn report_connection_lost(
    inbound_tx: &mpsc::Sender<InboundEvent>,
    state_tx: &watch::Sender<ConnectionState>,
    reason: String,
) {
    metrics().mqtt_connection_lost();
    state_tx.send_replace(ConnectionState::Disconnected(reason.clone()));
    let _ = inbound_tx.send(InboundEvent::ConnectionLost(reason)).await;
}

#[async_trait]
impl BrokerClient for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn subscribe(
        &mut self,
        topic_filter: &str,
    ) -> Result<mpsc::Receiver<InboundEvent>, Self::Error> {
        MqttClient::subscribe(self, topic_filter).await
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            shutdown_tx.send_replace(true);
        }

        // Can't do async operations in Drop; callers use disconnect() for a clean close
        if let Some(handle) = self.pump_handle.take() {
            handle.abort();
        }
    }
}

/// Builds a fresh [`MqttClient`] per worker session
#[derive(Debug, Clone)]
pub struct MqttConnector {
    client_name: String,
    config: MqttSection,
}

impl MqttConnector {
    pub fn new(client_name: &str, config: MqttSection) -> Self {
        Self {
            client_name: client_name.to_string(),
            config,
        }
    }
}

impl BrokerConnector for MqttConnector {
    type Client = MqttClient;

    fn create_client(&self) -> MqttClient {
        MqttClient::new(&self.client_name, self.config.clone())
    }
}
