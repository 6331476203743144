//! Worker supervision
//!
//! The supervisor runs one worker session after another. A session that ends
//! with an error (connect, TLS, subscribe, lost connection) is followed by a
//! fresh session after a backoff delay. A stop ends supervision.

use crate::agent::worker::{
    stop_requested, SubscriptionWorker, WorkerControl, WorkerSettings, WorkerState,
};
use crate::config::WorkerSection;
use crate::observability::metrics::metrics;
use crate::sink::EventSink;
use crate::transport::BrokerConnector;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Restart policy after failed sessions
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Maximum consecutive failed sessions (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delays in milliseconds for the first restarts
    pub backoff_pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&WorkerSection::default())
    }
}

impl From<&WorkerSection> for RestartPolicy {
    fn from(section: &WorkerSection) -> Self {
        Self {
            max_attempts: section.max_restarts,
            backoff_pattern: section.restart_backoff_ms.clone(),
            sustained_delay: section.restart_backoff_sustained_ms,
        }
    }
}

/// Outcome of a restart decision
#[derive(Debug, Clone, PartialEq)]
pub enum RestartDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Decide whether to restart after `failures` consecutive failed sessions
    pub fn decide(&self, failures: u32, shutdown_requested: bool) -> RestartDecision {
        if shutdown_requested {
            return RestartDecision::AbortShutdownRequested;
        }

        let attempt = failures + 1;
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return RestartDecision::AbortMaxAttemptsExceeded;
        }

        RestartDecision::Proceed {
            attempt,
            delay_ms: self.calculate_backoff_delay(attempt),
        }
    }
}

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Worker failed {attempts} times in a row, giving up: {last_error}")]
    RestartsExhausted { attempts: u32, last_error: String },
    #[error("Supervisor task failed: {0}")]
    TaskFailed(String),
}

/// Sleep for `delay_ms` unless a stop arrives first
///
/// Returns true if the sleep completed, false if stop was requested.
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        _ = stop_requested(shutdown_rx) => {
            info!("Stop requested during restart delay");
            false
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

/// Keeps a subscription worker running
pub struct WorkerSupervisor<C, S>
where
    C: BrokerConnector + Clone + 'static,
    S: EventSink + ?Sized + 'static,
{
    settings: WorkerSettings,
    connector: C,
    sink: Arc<S>,
    policy: RestartPolicy,
    control: WorkerControl,
    handle: Option<JoinHandle<Result<(), SupervisorError>>>,
}

impl<C, S> WorkerSupervisor<C, S>
where
    C: BrokerConnector + Clone + 'static,
    S: EventSink + ?Sized + 'static,
{
    pub fn new(settings: WorkerSettings, connector: C, sink: Arc<S>, policy: RestartPolicy) -> Self {
        Self {
            settings,
            connector,
            sink,
            policy,
            control: WorkerControl::new(),
            handle: None,
        }
    }

    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Spawn the supervision loop. Calling it again while running does nothing.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("Supervisor already started");
            return;
        }

        let settings = self.settings.clone();
        let connector = self.connector.clone();
        let sink = Arc::clone(&self.sink);
        let policy = self.policy.clone();
        let control = self.control.clone();

        info!(worker = %settings.name, topic = %settings.topic, "Starting supervisor");
        self.handle = Some(tokio::spawn(supervise(
            settings, connector, sink, policy, control,
        )));
    }

    /// Wait for supervision to end on its own
    ///
    /// Cancel-safe: dropping the future keeps the task attached, so a later
    /// `shutdown()` still waits for it.
    pub async fn wait(&mut self) -> Result<(), SupervisorError> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        let joined = handle.await;
        self.handle = None;
        joined.map_err(|e| SupervisorError::TaskFailed(e.to_string()))?
    }

    /// Stop the worker and wait up to `timeout` for it to disconnect
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<(), SupervisorError> {
        self.control.stop();

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let abort = handle.abort_handle();

        match tokio::time::timeout(timeout, handle).await {
            Ok(joined) => joined.map_err(|e| SupervisorError::TaskFailed(e.to_string()))?,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Worker did not stop in time, aborting");
                abort.abort();
                Ok(())
            }
        }
    }
}

async fn supervise<C, S>(
    settings: WorkerSettings,
    connector: C,
    sink: Arc<S>,
    policy: RestartPolicy,
    control: WorkerControl,
) -> Result<(), SupervisorError>
where
    C: BrokerConnector + Clone + 'static,
    S: EventSink + ?Sized + 'static,
{
    let mut shutdown_rx = control.shutdown_receiver();
    let mut failures = 0u32;

    loop {
        let mut worker = SubscriptionWorker::new(
            settings.clone(),
            connector.clone(),
            Arc::clone(&sink),
            control.clone(),
        );

        let outcome = match worker.setup().await {
            Ok(()) => worker.run().await,
            Err(e) => Err(e),
        };
        worker.stop().await;

        let error = match outcome {
            Ok(()) => {
                info!(worker = %settings.name, "Supervision finished");
                return Ok(());
            }
            Err(error) => error,
        };

        if worker.has_listened() {
            failures = 0;
        }
        error!(worker = %settings.name, error = %error, "Worker session failed");

        match policy.decide(failures, control.is_stop_requested()) {
            RestartDecision::Proceed { attempt, delay_ms } => {
                failures = attempt;
                metrics().supervisor_recovery();
                control.set_state(WorkerState::Restarting);

                let max_display = policy
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    "Restarting worker {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                if !interruptible_sleep(&mut shutdown_rx, delay_ms).await {
                    control.set_state(WorkerState::Stopped);
                    return Ok(());
                }
            }
            RestartDecision::AbortShutdownRequested => {
                info!("Stop requested, not restarting worker");
                return Ok(());
            }
            RestartDecision::AbortMaxAttemptsExceeded => {
                error!(attempts = failures, "Giving up on worker");
                return Err(SupervisorError::RestartsExhausted {
                    attempts: failures,
                    last_error: error.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MemorySink, MockConnector};

    fn settings() -> WorkerSettings {
        WorkerSettings {
            name: "test-worker".to_string(),
            topic: "sensors/+/temperature".to_string(),
            restart_interval: Duration::from_secs(3600),
        }
    }

    fn fast_policy(max_attempts: Option<u32>) -> RestartPolicy {
        RestartPolicy {
            max_attempts,
            backoff_pattern: vec![1, 2],
            sustained_delay: 3,
        }
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let policy = RestartPolicy {
            max_attempts: None,
            backoff_pattern: vec![100, 500],
            sustained_delay: 1_000,
        };

        assert_eq!(policy.calculate_backoff_delay(1), 100);
        assert_eq!(policy.calculate_backoff_delay(2), 500);
        assert_eq!(policy.calculate_backoff_delay(3), 1_000);
        assert_eq!(policy.calculate_backoff_delay(50), 1_000);
    }

    #[test]
    fn test_empty_pattern_uses_sustained_delay() {
        let policy = RestartPolicy {
            max_attempts: None,
            backoff_pattern: vec![],
            sustained_delay: 42,
        };
        assert_eq!(policy.calculate_backoff_delay(1), 42);
    }

    #[test]
    fn test_default_policy_follows_config_defaults() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.max_attempts, None);
        assert_eq!(policy.calculate_backoff_delay(1), 1_000);
        assert_eq!(policy.calculate_backoff_delay(10), 60_000);
    }

    #[test]
    fn test_decide() {
        let policy = fast_policy(Some(2));

        assert_eq!(
            policy.decide(0, false),
            RestartDecision::Proceed { attempt: 1, delay_ms: 1 }
        );
        assert_eq!(
            policy.decide(1, false),
            RestartDecision::Proceed { attempt: 2, delay_ms: 2 }
        );
        assert_eq!(policy.decide(2, false), RestartDecision::AbortMaxAttemptsExceeded);
        assert_eq!(policy.decide(0, true), RestartDecision::AbortShutdownRequested);
    }

    #[test]
    fn test_unlimited_never_gives_up() {
        let policy = fast_policy(None);
        assert!(matches!(
            policy.decide(10_000, false),
            RestartDecision::Proceed { attempt: 10_001, delay_ms: 3 }
        ));
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        assert!(interruptible_sleep(&mut shutdown_rx, 10).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });

        assert!(!interruptible_sleep(&mut shutdown_rx, 10_000).await);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let connector = MockConnector::new();
        connector.fail_next_connects(10);
        let sink = Arc::new(MemorySink::new());

        let mut supervisor =
            WorkerSupervisor::new(settings(), connector.clone(), sink, fast_policy(Some(2)));
        supervisor.start();

        let result = supervisor.wait().await;
        match result {
            Err(SupervisorError::RestartsExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected exhausted restarts, got {other:?}"),
        }
        assert_eq!(connector.connect_count(), 3);
        assert_eq!(connector.disconnect_count(), 3);
    }

    #[tokio::test]
    async fn test_recovers_after_connect_failures() {
        let connector = MockConnector::new();
        connector.fail_next_connects(2);
        let sink = Arc::new(MemorySink::new());

        let mut supervisor = WorkerSupervisor::new(
            settings(),
            connector.clone(),
            Arc::clone(&sink),
            fast_policy(Some(5)),
        );
        supervisor.start();

        connector.wait_for_subscriptions(1).await;
        connector.deliver("sensors/kitchen/temperature", "21.5").await;
        sink.wait_for_events(1).await;

        supervisor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(connector.connect_count(), 3);
        assert_eq!(supervisor.control().state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let connector = MockConnector::new();
        let sink = Arc::new(MemorySink::new());
        let mut supervisor = WorkerSupervisor::new(settings(), connector.clone(), sink, fast_policy(None));

        supervisor.shutdown(Duration::from_millis(100)).await.unwrap();
        assert!(!supervisor.is_running());
        assert_eq!(connector.connect_count(), 0);
    }
}
