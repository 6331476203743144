//! Subscription worker
//!
//! One worker owns at most one broker handle. It subscribes to the configured
//! topic filter, turns every received message into a [`ProducedEvent`] and
//! hands it to the sink, in arrival order. Every `restart_interval` (or on
//! request) it drops the handle and connects afresh.
//!
//! Connection and subscription failures surface as [`WorkerError`] for the
//! supervisor to handle. Sink failures never do: they are logged and the
//! worker keeps listening.

use crate::config::AgentConfig;
use crate::health::ActivityTracker;
use crate::observability::metrics::metrics;
use crate::protocol::{InboundMessage, ProducedEvent};
use crate::sink::EventSink;
use crate::transport::{BrokerClient, BrokerConnector, InboundEvent};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn, Instrument};

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Connecting,
    Listening,
    Restarting,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Connecting => "connecting",
            WorkerState::Listening => "listening",
            WorkerState::Restarting => "restarting",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }
}

/// Worker errors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Connection failed: {0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription to '{topic}' failed: {source}")]
    Subscription {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

/// What a worker needs to know about its job
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub name: String,
    pub topic: String,
    pub restart_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            name: config.agent.name.clone(),
            topic: config.mqtt.topic.clone(),
            restart_interval: Duration::from_secs(config.worker.restart_interval_secs),
        }
    }
}

/// Cloneable remote control for a worker (and the supervisor driving it)
#[derive(Debug, Clone)]
pub struct WorkerControl {
    shutdown: Arc<watch::Sender<bool>>,
    restart: Arc<Notify>,
    state: Arc<watch::Sender<WorkerState>>,
    activity: Arc<ActivityTracker>,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self {
            shutdown: Arc::new(watch::Sender::new(false)),
            restart: Arc::new(Notify::new()),
            state: Arc::new(watch::Sender::new(WorkerState::Idle)),
            activity: Arc::new(ActivityTracker::new()),
        }
    }

    /// Ask the worker to stop. Safe to call any number of times, from anywhere.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Ask the worker to reconnect now instead of waiting for the timer
    ///
    /// Only counts while the worker is listening. A request made while it
    /// connects, or while the supervisor backs off, is dropped.
    pub fn restart(&self) {
        self.restart.notify_waiters();
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn activity(&self) -> Arc<ActivityTracker> {
        Arc::clone(&self.activity)
    }

    pub(crate) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = previous.as_str(), to = state.as_str(), "Worker state changed");
        }
        metrics().set_worker_state(state.as_str());
    }
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once stop is requested (or every control handle is gone)
pub(crate) async fn stop_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Why listening ended
#[derive(Debug)]
enum ListenOutcome {
    Stop,
    Restart(&'static str),
    ConnectionLost(String),
}

/// Subscribes to one topic filter and feeds a sink
pub struct SubscriptionWorker<C, S>
where
    C: BrokerConnector,
    S: EventSink + ?Sized,
{
    settings: WorkerSettings,
    connector: C,
    sink: Arc<S>,
    handle: Option<C::Client>,
    control: WorkerControl,
    shutdown_rx: watch::Receiver<bool>,
    has_listened: bool,
}

impl<C, S> SubscriptionWorker<C, S>
where
    C: BrokerConnector,
    S: EventSink + ?Sized,
{
    pub fn new(settings: WorkerSettings, connector: C, sink: Arc<S>, control: WorkerControl) -> Self {
        let shutdown_rx = control.shutdown_receiver();
        Self {
            settings,
            connector,
            sink,
            handle: None,
            control,
            shutdown_rx,
            has_listened: false,
        }
    }

    pub fn control(&self) -> &WorkerControl {
        &self.control
    }

    /// Whether any session of this worker reached the listening state
    pub fn has_listened(&self) -> bool {
        self.has_listened
    }

    /// Create a fresh broker handle and connect it
    ///
    /// Any previous handle is disconnected first. The new handle is kept even
    /// when connecting fails, so a later `stop()` disconnects it. A stop that
    /// arrives mid-connect drops the handle and returns `Ok(())`; the
    /// following `run()` then stops right away.
    pub async fn setup(&mut self) -> Result<(), WorkerError> {
        self.release_handle().await;
        self.control.set_state(WorkerState::Connecting);
        let span = crate::mqtt_span!(worker = %self.settings.name, operation = "connect");

        let mut client = self.connector.create_client();
        let connected = tokio::select! {
            biased;
            _ = stop_requested(&mut self.shutdown_rx) => None,
            connected = client.connect().instrument(span) => Some(connected),
        };
        let Some(result) = connected else {
            debug!("Stop requested while connecting");
            return Ok(());
        };
        self.handle = Some(client);

        result.map_err(|e| {
            let error = WorkerError::Connection(Box::new(e));
            self.control.activity.record_error(Utc::now(), &error.to_string());
            error
        })
    }

    /// Listen until stopped or the connection fails
    ///
    /// Returns `Ok(())` only after a stop. Scheduled and requested restarts
    /// are handled inside without returning.
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        if self.control.state() == WorkerState::Stopped {
            return Ok(());
        }
        let connected = matches!(&self.handle, Some(client) if client.is_connected());
        if !connected && !self.control.is_stop_requested() {
            self.setup().await?;
        }

        loop {
            if self.control.is_stop_requested() {
                self.stop().await;
                return Ok(());
            }

            let mut inbound = self.subscribe().await?;

            match self.listen(&mut inbound).await {
                ListenOutcome::Stop => {
                    inbound.close();
                    self.stop().await;
                    return Ok(());
                }
                ListenOutcome::Restart(reason) => {
                    let span =
                        crate::lifecycle_span!(worker = %self.settings.name, event = "restart");
                    self.restart_session(reason, inbound).instrument(span).await?;
                }
                ListenOutcome::ConnectionLost(reason) => {
                    let error = WorkerError::ConnectionLost(reason);
                    self.control
                        .activity
                        .record_error(Utc::now(), &error.to_string());
                    return Err(error);
                }
            }
        }
    }

    /// Flush what is already buffered, then reconnect with a fresh handle
    async fn restart_session(
        &mut self,
        reason: &'static str,
        mut inbound: mpsc::Receiver<InboundEvent>,
    ) -> Result<(), WorkerError> {
        info!(reason = reason, "Restarting subscription");
        self.control.set_state(WorkerState::Restarting);

        inbound.close();
        while let Ok(event) = inbound.try_recv() {
            if let InboundEvent::Message(message) = event {
                self.deliver(&message).await;
            }
        }

        self.setup().await
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<InboundEvent>, WorkerError> {
        let topic = self.settings.topic.clone();
        let client = self
            .handle
            .as_mut()
            .ok_or_else(|| WorkerError::ConnectionLost("no broker handle".to_string()))?;

        match client.subscribe(&topic).await {
            Ok(inbound) => Ok(inbound),
            Err(e) => {
                let error = WorkerError::Subscription {
                    topic,
                    source: Box::new(e),
                };
                self.control
                    .activity
                    .record_error(Utc::now(), &error.to_string());
                Err(error)
            }
        }
    }

    async fn listen(&mut self, inbound: &mut mpsc::Receiver<InboundEvent>) -> ListenOutcome {
        let restart_timer = tokio::time::sleep(self.settings.restart_interval);
        tokio::pin!(restart_timer);
        let restart = Arc::clone(&self.control.restart);
        let restart_requested = restart.notified();
        tokio::pin!(restart_requested);
        restart_requested.as_mut().enable();

        self.control.set_state(WorkerState::Listening);
        self.has_listened = true;
        info!(
            worker = %self.settings.name,
            topic = %self.settings.topic,
            restart_in_secs = self.settings.restart_interval.as_secs(),
            "Listening"
        );

        loop {
            tokio::select! {
                biased;

                _ = stop_requested(&mut self.shutdown_rx) => return ListenOutcome::Stop,

                _ = &mut restart_timer => {
                    metrics().restart_scheduled();
                    return ListenOutcome::Restart("scheduled");
                }

                _ = &mut restart_requested => {
                    metrics().restart_requested();
                    return ListenOutcome::Restart("requested");
                }

                received = inbound.recv() => match received {
                    Some(InboundEvent::Message(message)) => self.deliver(&message).await,
                    Some(InboundEvent::ConnectionLost(reason)) => {
                        return ListenOutcome::ConnectionLost(reason)
                    }
                    None => {
                        return ListenOutcome::ConnectionLost(
                            "inbound channel closed".to_string(),
                        )
                    }
                },
            }
        }
    }

    /// Decode one message and hand it to the sink; sink errors are logged, not returned
    async fn deliver(&mut self, message: &InboundMessage) {
        metrics().mqtt_message_received();

        let (event, passed_through) = ProducedEvent::from_inbound(message);
        if passed_through {
            metrics().payload_passed_through();
            debug!(topic = %event.topic, "Payload is not JSON, passing it through as text");
        }

        let span = crate::event_span!(topic = %event.topic);
        let started = Instant::now();
        match self.sink.submit(&event).instrument(span).await {
            Ok(()) => {
                metrics().event_emitted(started.elapsed());
                self.control.activity.record_event(Utc::now());
            }
            Err(e) => {
                metrics().sink_failed(started.elapsed());
                warn!(topic = %event.topic, error = %e, "Sink rejected event, continuing");
                self.control
                    .activity
                    .record_error(Utc::now(), &format!("sink: {e}"));
            }
        }
    }

    async fn release_handle(&mut self) {
        if let Some(mut client) = self.handle.take() {
            if let Err(e) = client.disconnect().await {
                warn!(error = %e, "Disconnect failed");
            }
        }
    }

    /// Disconnect and mark the worker stopped
    ///
    /// Idempotent: the handle is disconnected at most once, and a worker that
    /// never connected just changes state.
    pub async fn stop(&mut self) {
        if self.control.state() == WorkerState::Stopped && self.handle.is_none() {
            return;
        }

        self.control.set_state(WorkerState::Stopping);
        self.release_handle().await;
        self.control.set_state(WorkerState::Stopped);
        info!(worker = %self.settings.name, "Worker stopped");
    }
}
