//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use mqtt_agent::config::{AgentConfig, ConfigError, SinkSection, TlsVersion};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[agent]
name = "owntracks-worker"

[mqtt]
uri = "mqtt://broker.local:1883"
topic = "owntracks/#"
"#,
    );

    let config = AgentConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.agent.name, "owntracks-worker");
    assert_eq!(config.mqtt.uri, "mqtt://broker.local:1883");
    assert_eq!(config.mqtt.topic, "owntracks/#");
    assert_eq!(config.worker.restart_interval_secs, 3600);
    assert_eq!(config.worker.expected_update_period_in_days, 2);
    assert_eq!(config.sink, SinkSection::Stdout);
}

#[test]
fn test_config_loads_with_tls_and_file_sink() {
    let temp_file = write_config(
        r#"
[agent]
name = "secure-worker"

[mqtt]
uri = "mqtts://broker.local"
topic = "sensors/+/temperature"
username_env = "MQTT_USER"
password_env = "MQTT_PASS"
ssl = "TLSv1_2"
ca_file = "/etc/mqtt/ca.pem"
cert_file = "/etc/mqtt/client.pem"
key_file = "/etc/mqtt/client.key"

[worker]
restart_interval_secs = 600

[sink]
kind = "file"
path = "/var/lib/mqtt-agent/events.jsonl"
"#,
    );

    let config = AgentConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.ssl, Some(TlsVersion::Tls12));
    assert_eq!(config.mqtt.ca_file, Some(PathBuf::from("/etc/mqtt/ca.pem")));
    assert_eq!(config.mqtt.username_env.as_deref(), Some("MQTT_USER"));
    assert_eq!(config.worker.restart_interval_secs, 600);
    assert_eq!(
        config.sink,
        SinkSection::File {
            path: PathBuf::from("/var/lib/mqtt-agent/events.jsonl")
        }
    );
}

#[test]
fn test_config_fails_on_missing_file() {
    let result = AgentConfig::load_from_file(&PathBuf::from("/nonexistent/mqtt-agent.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_fails_on_invalid_toml() {
    let temp_file = write_config("[agent\nname = ");
    let result = AgentConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_fails_on_missing_topic() {
    let temp_file = write_config(
        r#"
[agent]
name = "worker"

[mqtt]
uri = "mqtt://localhost"
"#,
    );
    assert!(matches!(
        AgentConfig::load_from_file(temp_file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_config_rejects_malformed_topic_filter() {
    let temp_file = write_config(
        r#"
[agent]
name = "worker"

[mqtt]
uri = "mqtt://localhost"
topic = "owntracks/#/extra"
"#,
    );
    assert!(matches!(
        AgentConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidTopic(_))
    ));
}

#[test]
fn test_config_rejects_unsupported_tls_version() {
    let temp_file = write_config(
        r#"
[agent]
name = "worker"

[mqtt]
uri = "mqtts://localhost"
topic = "a/b"
ssl = "SSLv3"
"#,
    );

    let error = AgentConfig::load_from_file(temp_file.path()).unwrap_err();
    assert!(error.to_string().contains("SSLv3"));
}

#[test]
fn test_config_rejects_invalid_agent_name() {
    let temp_file = write_config(
        r#"
[agent]
name = "has spaces"

[mqtt]
uri = "mqtt://localhost"
topic = "a/b"
"#,
    );
    assert!(matches!(
        AgentConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidAgentName(_))
    ));
}

#[test]
fn test_config_rejects_unknown_uri_scheme() {
    let temp_file = write_config(
        r#"
[agent]
name = "worker"

[mqtt]
uri = "http://localhost"
topic = "a/b"
"#,
    );
    assert!(matches!(
        AgentConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_config_round_trips_through_show() {
    let temp_file = write_config(
        r#"
[agent]
name = "worker"

[mqtt]
uri = "mqtt://localhost"
topic = "a/+"
ssl = "TLSv1.3"
"#,
    );
    let config = AgentConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    assert!(rendered.contains("TLSv1_3"));
    assert_eq!(AgentConfig::from_toml_str(&rendered).unwrap(), config);
}
