//! mqtt-agent
//!
//! A long-running MQTT subscription worker. It subscribes to one topic filter
//! (wildcards allowed), decodes each payload best-effort (JSON when it
//! parses, raw text otherwise) and hands `{topic, message, time}` events to a
//! sink. The connection is rebuilt on a fixed interval and after failures.
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_agent::protocol::{InboundMessage, ProducedEvent};
//! use serde_json::json;
//!
//! let message = InboundMessage::new("owntracks/demo/Dan", r#"{"_type":"location"}"#);
//! let (event, passed_through) = ProducedEvent::from_inbound(&message);
//!
//! assert_eq!(event.topic, "owntracks/demo/Dan");
//! assert_eq!(event.message, json!({"_type": "location"}));
//! assert!(!passed_through);
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod health;
pub mod observability;
pub mod protocol;
pub mod sink;
pub mod testing;
pub mod transport;

pub use agent::{SubscriptionWorker, WorkerControl, WorkerState, WorkerSupervisor};
pub use config::*;
pub use error::{AgentError, AgentResult};
pub use protocol::*;
pub use sink::{EventSink, SinkError};
pub use transport::mqtt::MqttClient;
