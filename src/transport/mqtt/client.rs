//! Impure I/O for the rumqttc-backed transport
//!
//! [`MqttTransport`] owns a shared `AsyncClient` and a supervisor task that
//! polls the event loop, turns events into [`TransportSignal`]s and rebuilds
//! the connection with bounded exponential backoff when it drops.

use super::connection::{configure_mqtt_options, REQUEST_CHANNEL_CAPACITY};
use super::health_monitor::{HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use crate::credentials::Credential;
use crate::transport::{
    ConnectionConfig, ReconnectBounds, SignalSink, Transport, TransportError, TransportFactory,
    TransportSignal,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// How long `end` waits for the supervisor before aborting it
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Supervisor run mode, driven by `end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownMode {
    Running,
    /// Disconnect requested; keep polling until it is flushed
    Draining,
    Stop,
}

/// Builds [`MqttTransport`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttTransportFactory;

impl TransportFactory for MqttTransportFactory {
    fn construct(
        &self,
        config: &ConnectionConfig,
        signals: SignalSink,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(MqttTransport::start(config.clone(), signals)?))
    }
}

/// MQTT v5 transport over websockets, TLS or plain TCP
pub struct MqttTransport {
    client: Arc<Mutex<AsyncClient>>,
    config: Arc<Mutex<ConnectionConfig>>,
    topics: Arc<Mutex<Vec<String>>>,
    shutdown_tx: watch::Sender<ShutdownMode>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
    signals: SignalSink,
    debug: bool,
}

impl MqttTransport {
    /// Build the client and spawn its supervisor. Must be called within a
    /// tokio runtime.
    pub fn start(config: ConnectionConfig, signals: SignalSink) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Construction(format!("no async runtime: {e}")))?;

        let (client, event_loop) = Self::create_connection(&config)?;
        let client = Arc::new(Mutex::new(client));
        let topics = Arc::new(Mutex::new(Vec::new()));
        let debug = config.debug;
        let reconnect = config.reconnect.clone();
        let span = crate::mqtt_span!(client_id = %config.client_id, host = %config.host);
        let config = Arc::new(Mutex::new(config));
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMode::Running);

        let supervisor = Supervisor {
            client: client.clone(),
            config: config.clone(),
            topics: topics.clone(),
            signals: signals.clone(),
            shutdown_rx,
            reconnect,
            debug,
        };
        let handle = runtime.spawn(supervisor.run(event_loop).instrument(span));

        Ok(Self {
            client,
            config,
            topics,
            shutdown_tx,
            supervisor: std::sync::Mutex::new(Some(handle)),
            signals,
            debug,
        })
    }

    /// Helper to create a client and event loop
    /// Used for initial connection and reconnection attempts
    fn create_connection(
        config: &ConnectionConfig,
    ) -> Result<(AsyncClient, EventLoop), TransportError> {
        let mqtt_options = configure_mqtt_options(config)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if *self.shutdown_tx.borrow() == ShutdownMode::Running {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn take_supervisor(&self) -> Option<JoinHandle<()>> {
        self.supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Topics re-subscribed after every reconnect
    pub async fn tracked_topics(&self) -> Vec<String> {
        self.topics.lock().await.clone()
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_running()?;
        if self.debug {
            debug!(target: "mqtt_transport", topic, bytes = payload.len(), "Publishing");
        }
        let client = self.client.lock().await;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_running()?;
        {
            let mut topics = self.topics.lock().await;
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
        }
        let client = self.client.lock().await;
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        debug!(target: "mqtt_transport", topic, "Subscribe requested");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_running()?;
        self.topics.lock().await.retain(|t| t != topic);
        let client = self.client.lock().await;
        client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn end(&self, force: bool) -> Result<(), TransportError> {
        let Some(handle) = self.take_supervisor() else {
            debug!(target: "mqtt_transport", "Transport already ended");
            return Ok(());
        };

        if force {
            self.shutdown_tx.send_replace(ShutdownMode::Stop);
        } else {
            self.shutdown_tx.send_replace(ShutdownMode::Draining);
            let client = self.client.lock().await;
            if let Err(e) = client.disconnect().await {
                // Event loop already gone; nothing left to flush
                debug!(target: "mqtt_transport", error = %e, "Disconnect request not delivered");
                self.shutdown_tx.send_replace(ShutdownMode::Stop);
            }
        }

        // Give the supervisor time to flush and stop gracefully
        let abort = handle.abort_handle();
        match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => {
                info!("MQTT transport shut down gracefully");
            }
            Ok(Err(e)) if !e.is_cancelled() => {
                warn!("MQTT supervisor ended with error: {}", e);
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("MQTT supervisor didn't shut down in time, forcing abort");
                abort.abort();
                self.signals.emit(TransportSignal::Close);
            }
        }
        Ok(())
    }

    async fn update_credentials(&self, credential: &Credential) -> Result<(), TransportError> {
        let mut config = self.config.lock().await;
        config.credential = credential.clone();
        info!(
            target: "mqtt_transport",
            access_key_id = %credential.access_key_id,
            "Credentials updated; used from the next reconnect"
        );
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        // Signal shutdown to the supervisor if it is still running
        self.shutdown_tx.send_replace(ShutdownMode::Stop);

        // Abort the supervisor task if it's still running
        if let Some(handle) = self.take_supervisor() {
            handle.abort();
        }
    }
}

/// Outcome of one iteration of the supervisor loop
enum Step {
    Shutdown(ShutdownMode),
    Polled(Result<Event, ConnectionError>),
}

/// Reconnection supervisor: owns the event loop for the transport's lifetime
struct Supervisor {
    client: Arc<Mutex<AsyncClient>>,
    config: Arc<Mutex<ConnectionConfig>>,
    topics: Arc<Mutex<Vec<String>>>,
    signals: SignalSink,
    shutdown_rx: watch::Receiver<ShutdownMode>,
    reconnect: ReconnectBounds,
    debug: bool,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        info!("Starting MQTT event loop with reconnection supervisor");
        let mut reconnect_attempts = 0u32;
        let mut connected_once = false;

        loop {
            let step = tokio::select! {
                // Check for shutdown signal first (higher priority)
                biased;
                changed = self.shutdown_rx.changed() => match changed {
                    Ok(()) => Step::Shutdown(*self.shutdown_rx.borrow()),
                    Err(_) => Step::Shutdown(ShutdownMode::Stop),
                },
                polled = event_loop.poll() => Step::Polled(polled),
            };

            let connection_lost = match step {
                Step::Shutdown(ShutdownMode::Stop) => {
                    info!("Shutdown signal received, stopping reconnection supervisor");
                    break;
                }
                Step::Shutdown(_) => continue,
                Step::Polled(Ok(event)) => {
                    let route = MessageHandler::route_mqtt_event(&event);
                    if route == EventRoute::ConnectionAcknowledged {
                        reconnect_attempts = 0;
                        if connected_once {
                            self.resubscribe_to_topics().await;
                        }
                        connected_once = true;
                        info!("MQTT connection acknowledged");
                    }
                    if self.debug {
                        if let EventRoute::MessageReceived { topic, payload, .. } = &route {
                            debug!(
                                target: "mqtt_transport",
                                topic = %topic,
                                payload = %String::from_utf8_lossy(payload),
                                "Received MQTT message"
                            );
                        }
                    }
                    if let Some(signal) = MessageHandler::signal_for(&route) {
                        self.signals.emit(signal);
                    }
                    route.ends_connection()
                }
                Step::Polled(Err(e)) => {
                    if !self.is_draining() {
                        error!("MQTT event loop error: {}", e);
                        self.signals.emit(TransportSignal::Error(
                            MessageHandler::describe_connection_error(&e),
                        ));
                    }
                    true
                }
            };

            if !connection_lost {
                continue;
            }
            if self.is_draining() {
                info!("Disconnect flushed, stopping supervisor");
                break;
            }

            self.signals.emit(TransportSignal::Offline);
            match self.reconnect(&mut reconnect_attempts).await {
                Some(new_event_loop) => event_loop = new_event_loop,
                None => break,
            }
        }

        self.signals.emit(TransportSignal::Close);
        info!("MQTT event loop stopped");
    }

    fn is_draining(&self) -> bool {
        *self.shutdown_rx.borrow() != ShutdownMode::Running
    }

    /// Back off, then build a fresh client and event loop
    ///
    /// Returns None when the supervisor should stop.
    async fn reconnect(&mut self, reconnect_attempts: &mut u32) -> Option<EventLoop> {
        loop {
            let decision = HealthMonitor::should_attempt_reconnection(
                *reconnect_attempts,
                &self.reconnect,
                self.is_draining(),
            );
            HealthMonitor::log_decision(&decision, &self.reconnect);

            let ReconnectionDecision::Proceed { attempt, delay } = decision else {
                return None;
            };
            *reconnect_attempts = attempt;

            if !self.interruptible_sleep(delay).await {
                return None;
            }
            self.signals.emit(TransportSignal::Reconnect);

            // Fresh options so a websocket URL is presigned with the newest credential
            let config = self.config.lock().await.clone();
            match MqttTransport::create_connection(&config) {
                Ok((new_client, new_event_loop)) => {
                    // Update the shared client so requests go to the new connection
                    *self.client.lock().await = new_client;
                    info!("Created new connection for reconnection attempt");
                    return Some(new_event_loop);
                }
                Err(e) => {
                    error!("Failed to create new connection: {}", e);
                    self.signals
                        .emit(TransportSignal::Error(format!("Reconnect failed: {e}")));
                }
            }
        }
    }

    /// Sleep unless shutdown is requested first. Returns false on shutdown.
    async fn interruptible_sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            changed = self.shutdown_rx.changed() => {
                if changed.is_err() || *self.shutdown_rx.borrow() != ShutdownMode::Running {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Helper to resubscribe to topics after reconnection
    async fn resubscribe_to_topics(&self) {
        let topics = self.topics.lock().await.clone();
        let client = self.client.lock().await;
        for topic in &topics {
            if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                error!("Failed to re-subscribe to {}: {}", topic, e);
            } else {
                debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic);
            }
        }
    }
}
