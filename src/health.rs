//! Worker activity tracking
//!
//! A worker "is working" when it produced an event within the expected
//! update period and has not logged an error since shortly before that
//! event.

use crate::error::sanitize_error_message;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Mutex;

/// Errors logged up to this long before the last event still count as recent
pub const RECENT_ERROR_WINDOW_SECS: i64 = 120;

/// Point-in-time copy of a worker's activity
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActivitySnapshot {
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub events: u64,
    pub errors: u64,
}

/// Outcome of an activity assessment
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActivityStatus {
    /// Recent events and no recent errors
    Working,
    /// Nothing produced since start
    NoEventsYet,
    /// Last event is older than the expected update period
    Stale { idle_secs: i64 },
    /// An error was logged after (or just before) the last event
    RecentError { error: Option<String> },
}

impl ActivityStatus {
    pub fn is_working(&self) -> bool {
        matches!(self, ActivityStatus::Working)
    }

    /// Healthy for a probe: a worker that has simply not seen traffic yet is not failing
    pub fn is_healthy(&self) -> bool {
        matches!(self, ActivityStatus::Working | ActivityStatus::NoEventsYet)
    }
}

/// Decide whether a worker is working from its activity snapshot
pub fn assess_activity(
    snapshot: &ActivitySnapshot,
    now: DateTime<Utc>,
    expected_update_period: Duration,
) -> ActivityStatus {
    let Some(last_event_at) = snapshot.last_event_at else {
        return ActivityStatus::NoEventsYet;
    };

    if now - last_event_at > expected_update_period {
        return ActivityStatus::Stale {
            idle_secs: (now - last_event_at).num_seconds(),
        };
    }

    let recent_error_cutoff = last_event_at - Duration::seconds(RECENT_ERROR_WINDOW_SECS);
    match snapshot.last_error_at {
        Some(error_at) if error_at > recent_error_cutoff => ActivityStatus::RecentError {
            error: snapshot.last_error.clone(),
        },
        _ => ActivityStatus::Working,
    }
}

/// Shared, thread-safe activity record for one worker
#[derive(Debug, Default)]
pub struct ActivityTracker {
    state: Mutex<ActivitySnapshot>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that an event was emitted
    pub fn record_event(&self, at: DateTime<Utc>) {
        if let Ok(mut state) = self.state.lock() {
            state.last_event_at = Some(at);
            state.events += 1;
        }
    }

    /// Note an error. The message is sanitized before it is stored.
    pub fn record_error(&self, at: DateTime<Utc>, message: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.last_error_at = Some(at);
            state.last_error = Some(sanitize_error_message(message));
            state.errors += 1;
        }
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    pub fn assess(&self, now: DateTime<Utc>, expected_update_period: Duration) -> ActivityStatus {
        assess_activity(&self.snapshot(), now, expected_update_period)
    }

    pub fn is_working(&self, expected_update_period: Duration) -> bool {
        self.assess(Utc::now(), expected_update_period).is_working()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn days(n: i64) -> Duration {
        Duration::days(n)
    }

    #[test]
    fn test_no_events_is_not_working() {
        let tracker = ActivityTracker::new();
        let status = tracker.assess(Utc::now(), days(2));

        assert_eq!(status, ActivityStatus::NoEventsYet);
        assert!(!status.is_working());
        assert!(status.is_healthy());
    }

    #[test]
    fn test_recent_event_is_working() {
        let tracker = ActivityTracker::new();
        let now = Utc::now();
        tracker.record_event(now - Duration::hours(1));

        assert!(tracker.assess(now, days(2)).is_working());
        assert!(tracker.is_working(days(2)));
    }

    #[test]
    fn test_stale_event_is_not_working() {
        let tracker = ActivityTracker::new();
        let now = Utc::now();
        tracker.record_event(now - days(3));

        match tracker.assess(now, days(2)) {
            ActivityStatus::Stale { idle_secs } => assert_eq!(idle_secs, 3 * 24 * 3600),
            other => panic!("expected stale, got {other:?}"),
        }
    }

    #[test]
    fn test_error_after_last_event_is_recent() {
        let tracker = ActivityTracker::new();
        let now = Utc::now();
        tracker.record_event(now - Duration::minutes(10));
        tracker.record_error(now - Duration::minutes(5), "sink failed: password=hunter2");

        let status = tracker.assess(now, days(2));
        assert!(!status.is_working());
        assert!(!status.is_healthy());
        match status {
            ActivityStatus::RecentError { error: Some(message) } => {
                assert!(!message.contains("hunter2"))
            }
            other => panic!("expected recent error, got {other:?}"),
        }
    }

    #[test]
    fn test_error_shortly_before_last_event_is_recent() {
        let tracker = ActivityTracker::new();
        let now = Utc::now();
        tracker.record_error(now - Duration::seconds(90), "connection lost");
        tracker.record_event(now);

        assert!(matches!(
            tracker.assess(now, days(2)),
            ActivityStatus::RecentError { .. }
        ));
    }

    #[test]
    fn test_old_error_does_not_count() {
        let tracker = ActivityTracker::new();
        let now = Utc::now();
        tracker.record_error(now - Duration::minutes(30), "connection lost");
        tracker.record_event(now - Duration::minutes(1));

        assert_eq!(tracker.assess(now, days(2)), ActivityStatus::Working);
    }

    #[test]
    fn test_snapshot_counts() {
        let tracker = ActivityTracker::new();
        let now = Utc::now();
        tracker.record_event(now);
        tracker.record_event(now);
        tracker.record_error(now, "boom");

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.events, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(ActivityStatus::Stale { idle_secs: 5 }).unwrap();
        assert_eq!(json["status"], "stale");
        assert_eq!(json["idle_secs"], 5);
    }
}
