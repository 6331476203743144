//! Mock implementations for testing
//!
//! Provides a mock broker connector and an in-memory sink so the worker and
//! supervisor can be exercised without a running MQTT broker.

use crate::protocol::{topic_matches, InboundMessage, ProducedEvent};
use crate::sink::{EventSink, SinkError};
use crate::transport::{BrokerClient, BrokerConnector, InboundEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// How long the `wait_for_*` helpers wait before panicking
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;

    if waited.is_err() {
        panic!("timed out waiting for {what}");
    }
}

#[derive(Debug, Error)]
pub enum MockTransportError {
    #[error("Mock connection failure")]
    ConnectFailed,
    #[error("Mock subscription failure")]
    SubscribeFailed,
    #[error("Not connected")]
    NotConnected,
}

#[derive(Debug)]
struct ActiveSubscription {
    client_id: usize,
    filter: String,
    sender: mpsc::Sender<InboundEvent>,
}

#[derive(Debug, Default)]
struct MockBrokerState {
    clients: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    subscriptions: AtomicUsize,
    failing_connects: AtomicU32,
    failing_subscribes: AtomicU32,
    active: Mutex<Option<ActiveSubscription>>,
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Mock connector; clones share one fake broker
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<MockBrokerState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: u32) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` subscribe attempts fail
    pub fn fail_next_subscribes(&self, n: u32) {
        self.state.failing_subscribes.store(n, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.state.subscriptions.load(Ordering::SeqCst)
    }

    /// Topic filter of the live subscription, if any
    pub async fn active_filter(&self) -> Option<String> {
        self.state
            .active
            .lock()
            .await
            .as_ref()
            .map(|active| active.filter.clone())
    }

    /// Wait until `n` subscriptions have been made in total
    pub async fn wait_for_subscriptions(&self, n: usize) {
        let state = Arc::clone(&self.state);
        wait_until("subscriptions", move || {
            state.subscriptions.load(Ordering::SeqCst) >= n
        })
        .await;
    }

    /// Publish a message to the live subscription
    ///
    /// Returns false when nothing is subscribed or the topic does not match.
    pub async fn deliver(&self, topic: &str, payload: impl Into<bytes::Bytes>) -> bool {
        let sender = {
            let active = self.state.active.lock().await;
            match active.as_ref() {
                Some(active) if topic_matches(&active.filter, topic) => active.sender.clone(),
                _ => return false,
            }
        };

        sender
            .send(InboundEvent::Message(InboundMessage::new(topic, payload)))
            .await
            .is_ok()
    }

    /// Simulate the broker dropping the live connection
    pub async fn drop_connection(&self, reason: &str) -> bool {
        let Some(active) = self.state.active.lock().await.take() else {
            return false;
        };

        active
            .sender
            .send(InboundEvent::ConnectionLost(reason.to_string()))
            .await
            .is_ok()
    }
}

impl BrokerConnector for MockConnector {
    type Client = MockBrokerClient;

    fn create_client(&self) -> Self::Client {
        MockBrokerClient {
            id: self.state.clients.fetch_add(1, Ordering::SeqCst),
            state: Arc::clone(&self.state),
            connected: false,
        }
    }
}

/// Handle created by [`MockConnector`]
#[derive(Debug)]
pub struct MockBrokerClient {
    id: usize,
    state: Arc<MockBrokerState>,
    connected: bool,
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    type Error = MockTransportError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.state.failing_connects) {
            return Err(MockTransportError::ConnectFailed);
        }
        self.connected = true;
        Ok(())
    }

    async fn subscribe(
        &mut self,
        topic_filter: &str,
    ) -> Result<mpsc::Receiver<InboundEvent>, Self::Error> {
        if !self.connected {
            return Err(MockTransportError::NotConnected);
        }
        if take_failure(&self.state.failing_subscribes) {
            return Err(MockTransportError::SubscribeFailed);
        }

        let (sender, receiver) = mpsc::channel(100);
        *self.state.active.lock().await = Some(ActiveSubscription {
            client_id: self.id,
            filter: topic_filter.to_string(),
            sender,
        });
        self.state.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(receiver)
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected = false;

        let mut active = self.state.active.lock().await;
        if active.as_ref().is_some_and(|a| a.client_id == self.id) {
            *active = None;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Sink that keeps events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ProducedEvent>>,
    accepted: AtomicUsize,
    failing_submits: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` submissions
    pub fn fail_next_submits(&self, n: u32) {
        self.failing_submits.store(n, Ordering::SeqCst);
    }

    pub async fn events(&self) -> Vec<ProducedEvent> {
        self.events.lock().await.clone()
    }

    pub fn len(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `n` events were accepted
    pub async fn wait_for_events(&self, n: usize) {
        wait_until("events", || self.accepted.load(Ordering::SeqCst) >= n).await;
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn submit(&self, event: &ProducedEvent) -> Result<(), SinkError> {
        if take_failure(&self.failing_submits) {
            return Err(SinkError::Rejected("mock sink failure".to_string()));
        }

        self.events.lock().await.push(event.clone());
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
