//! Testing utilities and mock implementations
//!
//! Mocks for running the worker and supervisor without an MQTT broker.

pub mod mocks;

pub use mocks::*;
