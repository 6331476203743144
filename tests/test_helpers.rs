//! Test helpers and utilities for integration tests

use mqtt_agent::agent::{RestartPolicy, WorkerSettings};
use mqtt_agent::config::{AgentConfig, MqttSection};
use std::time::Duration;

/// Parse and validate a minimal configuration
#[allow(dead_code)]
pub fn test_config() -> AgentConfig {
    AgentConfig::from_toml_str(
        r#"
[agent]
name = "test-agent"

[mqtt]
uri = "mqtt://localhost:1883"
topic = "owntracks/#"
"#,
    )
    .expect("test config should parse")
}

/// MQTT settings pointing at a port nothing listens on
#[allow(dead_code)]
pub fn unreachable_broker(topic: &str) -> MqttSection {
    MqttSection {
        uri: "mqtt://127.0.0.1:9".to_string(),
        topic: topic.to_string(),
        username_env: None,
        password_env: None,
        ssl: None,
        ca_file: None,
        cert_file: None,
        key_file: None,
        keep_alive_secs: 30,
        connection_timeout_secs: 2,
    }
}

#[allow(dead_code)]
pub fn worker_settings(topic: &str, restart_interval: Duration) -> WorkerSettings {
    WorkerSettings {
        name: "test-worker".to_string(),
        topic: topic.to_string(),
        restart_interval,
    }
}

/// Millisecond backoff so supervision tests run quickly
#[allow(dead_code)]
pub fn fast_policy(max_attempts: Option<u32>) -> RestartPolicy {
    RestartPolicy {
        max_attempts,
        backoff_pattern: vec![1, 2, 5],
        sustained_delay: 5,
    }
}
