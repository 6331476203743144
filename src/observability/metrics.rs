//! Thread-safe metrics collection system
//!
//! Atomic counters and mutex-protected collections for the MQTT connection,
//! event delivery and worker lifecycle.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Keep at most this many sink latency samples
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // MQTT metrics
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    messages_received: AtomicU64,
    last_message_at: AtomicU64,
    connection_start_time: AtomicU64,

    // Event delivery metrics
    events_emitted: AtomicU64,
    payloads_passed_through: AtomicU64,
    sink_failures: AtomicU64,
    sink_latencies: Mutex<Vec<u64>>, // in milliseconds

    // Lifecycle metrics
    worker_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
    scheduled_restarts: AtomicU64,
    requested_restarts: AtomicU64,
    supervisor_recoveries: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            last_message_at: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            payloads_passed_through: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            sink_latencies: Mutex::new(Vec::new()),
            worker_state: Mutex::new("idle".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            state_transitions: AtomicU64::new(0),
            scheduled_restarts: AtomicU64::new(0),
            requested_restarts: AtomicU64::new(0),
            supervisor_recoveries: AtomicU64::new(0),
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    /// A clean disconnect; not counted as a loss
    pub fn mqtt_disconnected(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Event delivery metrics
    pub fn event_emitted(&self, sink_latency: Duration) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        self.record_sink_latency(sink_latency);
    }

    pub fn payload_passed_through(&self) {
        self.payloads_passed_through.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sink_failed(&self, sink_latency: Duration) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
        self.record_sink_latency(sink_latency);
    }

    fn record_sink_latency(&self, duration: Duration) {
        if let Ok(mut times) = self.sink_latencies.lock() {
            times.push(duration.as_millis() as u64);

            if times.len() > MAX_LATENCY_SAMPLES {
                times.remove(0);
            }
        }
    }

    // Lifecycle metrics

    /// Record the worker's state
    ///
    /// The collector is process-wide and holds a single state, which fits the
    /// binary's one supervised worker. Several workers in one process share it:
    /// the last writer wins and transitions from all of them are counted.
    pub fn set_worker_state(&self, state: &str) {
        if let Ok(mut current_state) = self.worker_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    pub fn restart_scheduled(&self) {
        self.scheduled_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn restart_requested(&self) {
        self.requested_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn supervisor_recovery(&self) {
        self.supervisor_recoveries.fetch_add(1, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        let now = current_timestamp();

        self.mqtt_connected.store(false, Ordering::Relaxed);
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connections_lost,
            &self.messages_received,
            &self.last_message_at,
            &self.connection_start_time,
            &self.events_emitted,
            &self.payloads_passed_through,
            &self.sink_failures,
            &self.state_transitions,
            &self.scheduled_restarts,
            &self.requested_restarts,
            &self.supervisor_recoveries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.uptime_start.store(now, Ordering::Relaxed);

        if let Ok(mut times) = self.sink_latencies.lock() {
            times.clear();
        }
        if let Ok(mut state) = self.worker_state.lock() {
            *state = "idle".to_string();
        }
    }

    /// Average and percentiles of recorded sink latencies
    fn calculate_latency_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.sink_latencies.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted_times = times.clone();
        sorted_times.sort_unstable();

        let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
        (
            avg,
            percentile(&sorted_times, 50.0),
            percentile(&sorted_times, 95.0),
            percentile(&sorted_times, 99.0),
        )
    }

    fn calculate_connection_duration(&self, now: u64) -> u64 {
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if self.mqtt_connected.load(Ordering::Relaxed) && start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    fn current_worker_state(&self) -> String {
        self.worker_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_sink_latency_ms, p50, p95, p99) = self.calculate_latency_statistics();

        MetricsSnapshot {
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                last_message_at: self.last_message_at.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            events: EventMetrics {
                events_emitted: self.events_emitted.load(Ordering::Relaxed),
                payloads_passed_through: self.payloads_passed_through.load(Ordering::Relaxed),
                sink_failures: self.sink_failures.load(Ordering::Relaxed),
                avg_sink_latency_ms,
                sink_latency_p50_ms: p50,
                sink_latency_p95_ms: p95,
                sink_latency_p99_ms: p99,
            },
            lifecycle: LifecycleMetrics {
                current_state: self.current_worker_state(),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                scheduled_restarts: self.scheduled_restarts.load(Ordering::Relaxed),
                requested_restarts: self.requested_restarts.load(Ordering::Relaxed),
                supervisor_recoveries: self.supervisor_recoveries.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub mqtt: MqttMetrics,
    pub events: EventMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub messages_received: u64,
    pub last_message_at: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct EventMetrics {
    pub events_emitted: u64,
    pub payloads_passed_through: u64,
    pub sink_failures: u64,
    pub avg_sink_latency_ms: f64,
    pub sink_latency_p50_ms: f64,
    pub sink_latency_p95_ms: f64,
    pub sink_latency_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
    pub scheduled_restarts: u64,
    pub requested_restarts: u64,
    pub supervisor_recoveries: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
