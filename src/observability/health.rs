//! Health check HTTP server for container orchestration
//!
//! `/health` reports whether the worker is producing events within the
//! expected update period, `/ready` whether it is currently subscribed.

use crate::agent::worker::WorkerState;
use crate::health::{ActivitySnapshot, ActivityStatus, ActivityTracker};
use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    agent_name: String,
    port: u16,
    activity: Arc<ActivityTracker>,
    worker_state: watch::Receiver<WorkerState>,
    expected_update_period: chrono::Duration,
}

impl HealthServer {
    pub fn new(
        agent_name: String,
        port: u16,
        activity: Arc<ActivityTracker>,
        worker_state: watch::Receiver<WorkerState>,
        expected_update_period: chrono::Duration,
    ) -> Self {
        Self {
            agent_name,
            port,
            activity,
            worker_state,
            expected_update_period,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start the HTTP health server; runs until the task is dropped
    pub async fn start(self: Arc<Self>) {
        let health_server = Arc::clone(&self);
        let ready_server = Arc::clone(&self);

        // GET /health - activity assessment
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = Arc::clone(&health_server);
            async move {
                let status = server.health_status();
                let code = if status.healthy {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(|| async move {
            Ok::<_, Infallible>(warp::reply::json(&metrics().get_metrics()))
        });

        // GET /ready - subscribed and listening
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = Arc::clone(&ready_server);
            async move {
                let response = server.readiness();
                let code = if response.ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            }
        });

        // GET /live - process is up
        let live_route = warp::path("live").and(warp::get()).and_then(|| async move {
            Ok::<_, Infallible>(warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            }))
        });

        // GET / - endpoint list
        let root_route = warp::path::end().and(warp::get()).and_then(|| async move {
            Ok::<_, Infallible>(warp::reply::json(&ApiDocumentationResponse {
                endpoints: endpoint_descriptions(),
            }))
        });

        let routes = health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin());

        tracing::info!("Starting health server on port {}", self.port);

        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
    }

    fn current_state(&self) -> WorkerState {
        *self.worker_state.borrow()
    }

    fn health_status(&self) -> HealthStatus {
        let snapshot = self.activity.snapshot();
        let activity = crate::health::assess_activity(
            &snapshot,
            chrono::Utc::now(),
            self.expected_update_period,
        );

        HealthStatus {
            healthy: activity.is_healthy(),
            working: activity.is_working(),
            agent_name: self.agent_name.clone(),
            worker_state: self.current_state(),
            timestamp: current_timestamp(),
            uptime_seconds: metrics().get_metrics().lifecycle.uptime_seconds,
            activity,
            snapshot,
        }
    }

    fn readiness(&self) -> ReadinessResponse {
        ReadinessResponse {
            ready: self.current_state() == WorkerState::Listening,
            worker_state: self.current_state(),
            timestamp: current_timestamp(),
        }
    }
}

fn endpoint_descriptions() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([
        ("/health", "Whether the worker produced events within the expected period"),
        ("/metrics", "Connection, event and lifecycle counters"),
        ("/ready", "Readiness probe: subscribed and listening"),
        ("/live", "Liveness probe"),
    ])
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    healthy: bool,
    working: bool,
    agent_name: String,
    worker_state: WorkerState,
    timestamp: u64,
    uptime_seconds: u64,
    activity: ActivityStatus,
    snapshot: ActivitySnapshot,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    worker_state: WorkerState,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: BTreeMap<&'static str, &'static str>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
