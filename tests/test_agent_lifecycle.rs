//! Worker and supervisor lifecycle tests
//!
//! Exercises the subscription worker end to end against the mock broker:
//! - events in arrival order, JSON or raw text
//! - idempotent stop, nothing emitted after stop
//! - requested and scheduled restarts
//! - sink failures do not stop the loop
//! - supervision of failing connections

mod test_helpers;

use mqtt_agent::agent::{SubscriptionWorker, WorkerControl, WorkerState, WorkerSupervisor};
use mqtt_agent::sink::ChannelSink;
use mqtt_agent::testing::mocks::{MemorySink, MockConnector};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{fast_policy, worker_settings};

const HOUR: Duration = Duration::from_secs(3600);

fn spawn_worker(
    topic: &str,
    restart_interval: Duration,
    connector: &MockConnector,
    sink: &Arc<MemorySink>,
) -> (
    WorkerControl,
    tokio::task::JoinHandle<Result<(), mqtt_agent::agent::WorkerError>>,
) {
    let control = WorkerControl::new();
    let mut worker = SubscriptionWorker::new(
        worker_settings(topic, restart_interval),
        connector.clone(),
        Arc::clone(sink),
        control.clone(),
    );
    let handle = tokio::spawn(async move {
        worker.setup().await?;
        worker.run().await
    });
    (control, handle)
}

#[tokio::test]
async fn test_events_arrive_in_order() {
    let connector = MockConnector::new();
    let sink = Arc::new(MemorySink::new());
    let (control, handle) = spawn_worker("owntracks/#", HOUR, &connector, &sink);

    connector.wait_for_subscriptions(1).await;
    for n in 0..20 {
        let payload = format!(r#"{{"_type":"location","seq":{n}}}"#);
        assert!(connector.deliver("owntracks/demo/Dan", payload).await);
    }
    sink.wait_for_events(20).await;

    control.stop();
    handle.await.unwrap().unwrap();

    let events = sink.events().await;
    assert_eq!(events.len(), 20);
    for (n, event) in events.iter().enumerate() {
        assert_eq!(event.message["seq"], json!(n));
    }
}

#[tokio::test]
async fn test_owntracks_payloads() {
    let connector = MockConnector::new();
    let sink = Arc::new(MemorySink::new());
    let (control, handle) = spawn_worker("owntracks/#", HOUR, &connector, &sink);

    connector.wait_for_subscriptions(1).await;
    connector
        .deliver(
            "owntracks/demo/Dan",
            r#"{"_type":"location","lat":"-34.85","lon":"138.58","tst":1700000000}"#,
        )
        .await;
    connector.deliver("owntracks/demo/Dan/event", "not json {").await;
    connector.deliver("owntracks/demo/Dan/cmd", "").await;
    sink.wait_for_events(3).await;

    control.stop();
    handle.await.unwrap().unwrap();

    let events = sink.events().await;
    assert_eq!(events[0].message["_type"], "location");
    assert_eq!(events[0].message["lat"], "-34.85");
    assert_eq!(events[1].topic, "owntracks/demo/Dan/event");
    assert_eq!(events[1].message, json!("not json {"));
    assert_eq!(events[2].message, json!(""));
    assert!(events.iter().all(|event| event.time > 0));
}

#[tokio::test]
async fn test_wildcard_filter_limits_topics() {
    let connector = MockConnector::new();
    let sink = Arc::new(MemorySink::new());
    let (control, handle) = spawn_worker("sensors/+/temperature", HOUR, &connector, &sink);

    connector.wait_for_subscriptions(1).await;
    assert!(connector.deliver("sensors/kitchen/temperature", "21.5").await);
    assert!(!connector.deliver("sensors/kitchen/humidity", "40").await);
    assert!(connector.deliver("sensors/garage/temperature", "9").await);
    sink.wait_for_events(2).await;

    control.stop();
    handle.await.unwrap().unwrap();

    let topics: Vec<String> = sink.events().await.into_iter().map(|e| e.topic).collect();
    assert_eq!(
        topics,
        vec!["sensors/kitchen/temperature", "sensors/garage/temperature"]
    );
}

#[tokio::test]
async fn test_nothing_emitted_after_stop() {
    let connector = MockConnector::new();
    let sink = Arc::new(MemorySink::new());
    let (control, handle) = spawn_worker("a/#", HOUR, &connector, &sink);

    connector.wait_for_subscriptions(1).await;
    connector.deliver("a/1", "1").await;
    sink.wait_for_events(1).await;

    control.stop();
    handle.await.unwrap().unwrap();

    assert!(!connector.deliver("a/2", "2").await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(sink.len(), 1);
    assert_eq!(control.state(), WorkerState::Stopped);
    assert_eq!(connector.disconnect_count(), 1);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let connector = MockConnector::new();
    let sink = Arc::new(MemorySink::new());
    let (control, handle) = spawn_worker("a/#", HOUR, &connector, &sink);

    connector.wait_for_subscriptions(1).await;
    control.stop();
    control.stop();
    tokio_test::assert_ok!(handle.await.unwrap());
    control.stop();

    assert_eq!(connector.connect_count(), 1);
    assert_eq!(connector.disconnect_count(), 1);
}

#[tokio::test]
async fn test_requested_restart_reconnects_once() {
    let connector = MockConnector::new();
    let sink = Arc::new(MemorySink::new());
    let (control, handle) = spawn_worker("a/#", HOUR, &connector, &sink);

    connector.wait_for_subscriptions(1).await;
    connector.deliver("a/before", "1").await;
    sink.wait_for_events(1).await;

    control.restart();
    connector.wait_for_subscriptions(2).await;
    assert_eq!(connector.connect_count(), 2);
    assert_eq!(connector.disconnect_count(), 1);

    connector.deliver("a/after", "2").await;
    sink.wait_for_events(2).await;

    control.stop();
    handle.await.unwrap().unwrap();

    let topics: Vec<String> = sink.events().await.into_iter().map(|e| e.topic).collect();
    assert_eq!(topics, vec!["a/before", "a/after"]);
    assert_eq!(connector.disconnect_count(), 2);
}

#[tokio::test]
async fn test_restart_delivers_buffered_messages() {
    let connector = MockConnector::new();
    let sink = Arc::new(MemorySink::new());
    let (control, handle) = spawn_worker("a/#", HOUR, &connector, &sink);

    let mut state = control.subscribe_state();
    state
        .wait_for(|state| *state == WorkerState::Listening)
        .await
        .unwrap();
    for n in 0..10 {
        assert!(connector.deliver(&format!("a/{n}"), n.to_string()).await);
    }
    control.restart();

    connector.wait_for_subscriptions(2).await;
    sink.wait_for_events(10).await;
    assert_eq!(connector.connect_count(), 2);

    control.stop();
    handle.await.unwrap().unwrap();

    let topics: Vec<String> = sink.events().await.into_iter().map(|e| e.topic).collect();
    let expected: Vec<String> = (0..10).map(|n| format!("a/{n}")).collect();
    assert_eq!(topics, expected);
    assert_eq!(connector.disconnect_count(), 2);
}

#[tokio::test]
async fn test_scheduled_restart() {
    let connector = MockConnector::new();
    let sink = Arc::new(MemorySink::new());
    let (control, handle) = spawn_worker("a/#", Duration::from_millis(50), &connector, &sink);

    connector.wait_for_subscriptions(3).await;
    control.stop();
    handle.await.unwrap().unwrap();

    assert!(connector.connect_count() >= 3);
    assert_eq!(connector.connect_count(), connector.disconnect_count());
}

#[tokio::test]
async fn test_sink_failure_does_not_stop_worker() {
    let connector = MockConnector::new();
    let sink = Arc::new(MemorySink::new());
    sink.fail_next_submits(2);
    let (control, handle) = spawn_worker("a/#", HOUR, &connector, &sink);

    connector.wait_for_subscriptions(1).await;
    for n in 0..5 {
        connector.deliver(&format!("a/{n}"), n.to_string()).await;
    }
    sink.wait_for_events(3).await;

    assert_eq!(control.state(), WorkerState::Listening);

    control.stop();
    handle.await.unwrap().unwrap();

    let snapshot = control.activity().snapshot();
    assert_eq!(snapshot.errors, 2);
    assert_eq!(snapshot.events, 3);

    let topics: Vec<String> = sink.events().await.into_iter().map(|e| e.topic).collect();
    assert_eq!(topics, vec!["a/2", "a/3", "a/4"]);
}

#[tokio::test]
async fn test_subscription_failure_is_reported() {
    let connector = MockConnector::new();
    connector.fail_next_subscribes(1);
    let sink = Arc::new(MemorySink::new());
    let (_control, handle) = spawn_worker("a/#", HOUR, &connector, &sink);

    let result = handle.await.unwrap();
    assert!(matches!(
        result,
        Err(mqtt_agent::agent::WorkerError::Subscription { ref topic, .. }) if topic == "a/#"
    ));
}

#[tokio::test]
async fn test_channel_sink_receives_events() {
    let connector = MockConnector::new();
    let (sink, mut receiver) = ChannelSink::channel(8);
    let control = WorkerControl::new();
    let mut worker = SubscriptionWorker::new(
        worker_settings("a/#", HOUR),
        connector.clone(),
        Arc::new(sink),
        control.clone(),
    );
    let handle = tokio::spawn(async move {
        worker.setup().await?;
        worker.run().await
    });

    connector.wait_for_subscriptions(1).await;
    connector.deliver("a/b", r#"{"x":1}"#).await;

    let event = receiver.recv().await.unwrap();
    assert_eq!(event.topic, "a/b");
    assert_eq!(event.message, json!({"x": 1}));

    control.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_supervisor_restarts_after_connection_loss() {
    let connector = MockConnector::new();
    let sink = Arc::new(MemorySink::new());
    let mut supervisor = WorkerSupervisor::new(
        worker_settings("a/#", HOUR),
        connector.clone(),
        Arc::clone(&sink),
        fast_policy(Some(1)),
    );
    supervisor.start();

    for round in 1..=3 {
        connector.wait_for_subscriptions(round).await;
        connector.deliver("a/b", round.to_string()).await;
        sink.wait_for_events(round).await;
        connector.drop_connection("broker restarted").await;
    }

    // Failures reset after every listening session, so one allowed restart suffices
    connector.wait_for_subscriptions(4).await;
    assert!(supervisor.is_running());

    supervisor.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(sink.len(), 3);
    assert_eq!(connector.connect_count(), connector.disconnect_count());
}

#[tokio::test]
async fn test_concurrent_workers_are_independent() {
    let connectors: Vec<MockConnector> = (0..4).map(|_| MockConnector::new()).collect();
    let sinks: Vec<Arc<MemorySink>> = (0..4).map(|_| Arc::new(MemorySink::new())).collect();

    let runs = connectors.iter().zip(&sinks).enumerate().map(|(n, (connector, sink))| {
        let connector = connector.clone();
        let sink = Arc::clone(sink);
        async move {
            let (control, handle) = spawn_worker("w/#", HOUR, &connector, &sink);
            connector.wait_for_subscriptions(1).await;
            for i in 0..=n {
                connector.deliver(&format!("w/{n}"), i.to_string()).await;
            }
            sink.wait_for_events(n + 1).await;
            control.stop();
            handle.await.unwrap().unwrap();
        }
    });
    futures::future::join_all(runs).await;

    for (n, sink) in sinks.iter().enumerate() {
        let events = sink.events().await;
        assert_eq!(events.len(), n + 1);
        assert!(events.iter().all(|e| e.topic == format!("w/{n}")));
    }
}
