//! Destinations for produced events
//!
//! The worker hands each [`ProducedEvent`] to an [`EventSink`] exactly once,
//! in arrival order. A failing sink is the sink's problem: the worker logs
//! the error and keeps listening.

use crate::config::SinkSection;
use crate::protocol::ProducedEvent;
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Sink errors
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to write event: {0}")]
    Io(#[from] std::io::Error),
    #[error("Event receiver has gone away")]
    ChannelClosed,
    #[error("Event rejected: {0}")]
    Rejected(String),
}

/// Consumer of produced events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Accept one event. Called sequentially, never concurrently for one worker.
    async fn submit(&self, event: &ProducedEvent) -> Result<(), SinkError>;
}

/// Writes one JSON object per line
///
/// Clones share the writer, so several workers can append to the same file
/// without interleaving partial lines.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Arc<Mutex<W>>,
}

impl<W: Write + Send> Clone for JsonLinesSink<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Give the writer back once every clone has been dropped
    pub fn into_inner(self) -> Option<W> {
        Arc::try_unwrap(self.writer).ok().map(Mutex::into_inner)
    }
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl JsonLinesSink<std::fs::File> {
    /// Append to `path`, creating it if needed
    pub fn file(path: &Path) -> Result<Self, SinkError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self::new(file))
    }
}

#[async_trait]
impl<W: Write + Send + 'static> EventSink for JsonLinesSink<W> {
    async fn submit(&self, event: &ProducedEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

/// Forwards events to an in-process channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<ProducedEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<ProducedEvent>) -> Self {
        Self { sender }
    }

    /// Create a sink and the receiving end of its channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProducedEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn submit(&self, event: &ProducedEvent) -> Result<(), SinkError> {
        self.sender
            .send(event.clone())
            .await
            .map_err(|_| SinkError::ChannelClosed)
    }
}

/// Build the sink described by the `[sink]` config section
pub fn from_config(section: &SinkSection) -> Result<Arc<dyn EventSink>, SinkError> {
    Ok(match section {
        SinkSection::Stdout => Arc::new(JsonLinesSink::stdout()),
        SinkSection::File { path } => Arc::new(JsonLinesSink::file(path)?),
    })
}
