//! Transport capability consumed by the session manager
//!
//! The session core never speaks the wire protocol itself. It builds a
//! [`ConnectionConfig`], hands it to a [`TransportFactory`] together with a
//! [`SignalSink`], and from then on talks to the resulting [`Transport`]
//! through this trait while observing its lifecycle through the signals it
//! pushes into the sink.

use crate::credentials::Credential;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Errors raised by a transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport construction failed: {0}")]
    Construction(String),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Transport is closed")]
    Closed,
}

/// Lifecycle signals pushed by a transport, in the order it observed them
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    /// Broker accepted the connection (initial or after a reconnect)
    Connect,
    /// Raw inbound publish
    Message { topic: String, payload: Bytes },
    /// Non-fatal transport error
    Error(String),
    /// The transport is about to retry the connection
    Reconnect,
    /// The connection dropped; the transport will retry on its own
    Offline,
    /// The transport stopped and will not reconnect on its own
    Close,
}

/// Sending half of a transport's signal channel
///
/// Cheap to clone. Sends never block; a signal sent after the session has
/// stopped listening is silently discarded.
#[derive(Debug, Clone)]
pub struct SignalSink {
    tx: mpsc::UnboundedSender<TransportSignal>,
}

impl SignalSink {
    /// Create a sink and the receiver the session pumps signals from
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Push a signal. Returns false when nobody is listening anymore.
    pub fn emit(&self, signal: TransportSignal) -> bool {
        self.tx.send(signal).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Wire protocol tag of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// MQTT over secure websockets with a SigV4 presigned URL
    #[default]
    Wss,
    /// MQTT over TLS
    Mqtts,
    /// Plain MQTT, for local brokers
    Mqtt,
}

impl Protocol {
    /// Parse a protocol tag, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "wss" => Some(Protocol::Wss),
            "mqtts" => Some(Protocol::Mqtts),
            "mqtt" | "tcp" => Some(Protocol::Mqtt),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Wss => "wss",
            Protocol::Mqtts => "mqtts",
            Protocol::Mqtt => "mqtt",
        }
    }

    /// Port used when none is configured
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Wss => 443,
            Protocol::Mqtts => 8883,
            Protocol::Mqtt => 1883,
        }
    }
}

/// Reconnect timing handed through to the transport
///
/// The session never sleeps or retries; these bounds only shape the
/// transport's own backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectBounds {
    /// Delay of the first retry
    pub base_delay: Duration,
    /// Lower clamp for any retry delay
    pub min_delay: Duration,
    /// Upper clamp for any retry delay
    pub max_delay: Duration,
    /// Give up (and signal `Close`) after this many consecutive failures
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectBounds {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(128_000),
            max_attempts: None,
        }
    }
}

impl ReconnectBounds {
    /// Delay before retry `attempt` (1-based): base doubled per attempt,
    /// clamped into `[min_delay, max_delay]`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

/// Everything a transport needs to open one connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub client_id: String,
    pub region: String,
    pub credential: Credential,
    pub debug: bool,
    pub keep_alive: Duration,
    pub reconnect: ReconnectBounds,
}

/// Long-lived connection object implementing publish/subscribe
///
/// Calls are "fire and observe": success means the request was handed to the
/// transport, not that the broker processed it.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Shut the connection down; resolves once the transport confirms closure.
    /// `force` skips the graceful disconnect handshake.
    async fn end(&self, force: bool) -> Result<(), TransportError>;

    /// Swap authentication material without reconnecting
    async fn update_credentials(&self, credential: &Credential) -> Result<(), TransportError>;
}

/// Builds transports; injected into the session manager
pub trait TransportFactory: Send + Sync {
    fn construct(
        &self,
        config: &ConnectionConfig,
        signals: SignalSink,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

pub use mqtt::MqttTransportFactory;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mqtt_factory_is_usable_as_a_value() {
        let factory: Arc<dyn TransportFactory> = Arc::new(MqttTransportFactory);
        assert_eq!(Arc::strong_count(&factory), 1);
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!(Protocol::parse("wss"), Some(Protocol::Wss));
        assert_eq!(Protocol::parse("MQTTS"), Some(Protocol::Mqtts));
        assert_eq!(Protocol::parse(" mqtt "), Some(Protocol::Mqtt));
        assert_eq!(Protocol::parse("tcp"), Some(Protocol::Mqtt));
        assert_eq!(Protocol::parse("http"), None);
    }

    #[test]
    fn test_protocol_default_ports() {
        assert_eq!(Protocol::Wss.default_port(), 443);
        assert_eq!(Protocol::Mqtts.default_port(), 8883);
        assert_eq!(Protocol::Mqtt.default_port(), 1883);
    }

    #[test]
    fn test_reconnect_delay_doubles_and_clamps() {
        let bounds = ReconnectBounds {
            base_delay: Duration::from_millis(500),
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(4000),
            max_attempts: None,
        };

        // 500ms base is lifted to the 1s floor
        assert_eq!(bounds.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(bounds.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(bounds.delay_for_attempt(3), Duration::from_millis(2000));
        assert_eq!(bounds.delay_for_attempt(4), Duration::from_millis(4000));
        assert_eq!(bounds.delay_for_attempt(5), Duration::from_millis(4000));
        assert_eq!(bounds.delay_for_attempt(1000), Duration::from_millis(4000));
    }

    #[test]
    fn test_reconnect_attempt_limit() {
        let unlimited = ReconnectBounds::default();
        assert!(unlimited.allows_attempt(u32::MAX - 1));

        let limited = ReconnectBounds {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(limited.allows_attempt(2));
        assert!(!limited.allows_attempt(3));
    }

    #[tokio::test]
    async fn test_signal_sink_delivers_in_order() {
        let (sink, mut rx) = SignalSink::channel();
        assert!(sink.emit(TransportSignal::Connect));
        assert!(sink.emit(TransportSignal::Offline));
        assert_eq!(rx.recv().await, Some(TransportSignal::Connect));
        assert_eq!(rx.recv().await, Some(TransportSignal::Offline));

        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.emit(TransportSignal::Close));
    }
}
