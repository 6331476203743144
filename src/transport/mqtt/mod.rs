//! MQTT v5 broker client built on rumqttc
//!
//! Pure functions are kept apart from I/O:
//!
//! - [`connection`] - broker URI parsing, option building and TLS setup
//! - [`message_handler`] - routing decisions for event loop output
//! - [`client`] - the connection handle and its event pump
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_agent::config::MqttSection;
//! use mqtt_agent::transport::mqtt::MqttClient;
//!
//! # tokio_test::block_on(async {
//! let config: MqttSection = toml::from_str(r#"
//!     uri = "mqtt://localhost:1883"
//!     topic = "owntracks/#"
//! "#)?;
//!
//! let mut client = MqttClient::new("my-agent", config);
//! client.connect().await?;
//! let mut inbound = client.subscribe("owntracks/#").await?;
//! while let Some(event) = inbound.recv().await {
//!     println!("{event:?}");
//! }
//! client.disconnect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttClient, MqttConnector};
pub use connection::{
    build_tls_config, configure_mqtt_options, parse_broker_uri, BrokerEndpoint, ConnectionState,
    MqttError,
};
pub use message_handler::{EventRoute, MessageHandler};
