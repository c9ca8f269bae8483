//! rumqttc-backed implementation of the [`Transport`](crate::transport::Transport) capability
//!
//! Pure functions are kept apart from I/O so most of the adapter is testable
//! without a broker.
//!
//! # Architecture
//!
//! - [`connection`] - option building and config validation
//! - [`signing`] - SigV4 presigned websocket URLs
//! - [`message_handler`] - routing of rumqttc events to transport signals
//! - [`health_monitor`] - reconnection decisions
//! - [`client`] - the client, its supervisor task and the factory
//!
//! # Usage
//!
//! ```rust,no_run
//! use iot_session::transport::MqttTransportFactory;
//! use iot_session::{SessionManager, SessionOptions};
//! use std::sync::Arc;
//!
//! let manager = SessionManager::new(Arc::new(MqttTransportFactory), SessionOptions::default());
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod signing;

// Re-export public types for convenience
pub use client::{MqttTransport, MqttTransportFactory};
pub use connection::configure_mqtt_options;
pub use health_monitor::{HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
