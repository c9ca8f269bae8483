//! Session manager: owns the transport lifecycle and subscription bookkeeping
//!
//! A [`SessionManager`] is a cheap, cloneable handle over one logical session.
//! It validates connect requests, resolves the broker endpoint, builds a
//! transport through the injected [`TransportFactory`] and then reacts to the
//! transport's lifecycle signals (see `handlers`). Subscriptions requested
//! before a transport is connected wait in a [`SubscriptionQueue`] and are
//! replayed in order on the next Connect.
//!
//! All session state lives behind a single async mutex that is never held
//! across a call into the transport, the control plane or the codec.

mod handlers;
pub mod queue;
pub mod state;

pub use queue::{HandleStatus, SubscriptionDropped, SubscriptionHandle, SubscriptionQueue};
pub use state::SessionState;

use crate::control_plane::{ControlPlane, ControlPlaneError};
use crate::credentials::{Credential, CredentialProvider};
use crate::error::{SessionError, SessionResult};
use crate::events::{Event, EventBus, EventSubscription};
use crate::transport::{
    ConnectionConfig, Protocol, ReconnectBounds, SignalSink, Transport, TransportFactory,
};
use state::Transition;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Connection settings shared by every connect attempt of a manager
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub protocol: Protocol,
    pub port: u16,
    /// Fixed client id; a unique one is generated per connection when absent
    pub client_id: Option<String>,
    /// Log inbound payloads and transport detail
    pub debug: bool,
    pub keep_alive: Duration,
    pub reconnect: ReconnectBounds,
    /// Region used when a connect request names none
    pub default_region: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::Wss,
            port: Protocol::Wss.default_port(),
            client_id: None,
            debug: false,
            keep_alive: Duration::from_secs(30),
            reconnect: ReconnectBounds::default(),
            default_region: None,
        }
    }
}

/// Parameters of one `connect` call
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub credential: Option<Credential>,
    /// Policy attached to the credential's principal before connecting
    pub policy_name: Option<String>,
    /// Broker host; discovered through the control plane when absent
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

impl ConnectRequest {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential: Some(credential),
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy_name: impl Into<String>) -> Self {
        self.policy_name = Some(policy_name.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Mutable state of the logical session
pub(crate) struct Session {
    state: SessionState,
    transport: Option<Arc<dyn Transport>>,
    /// Bumped whenever the installed transport changes; stale signals and
    /// in-flight replays compare against it
    epoch: u64,
    /// Bumped by every connect attempt and by disconnect
    generation: u64,
    /// Bumped by disconnect only
    session_id: u64,
    queue: SubscriptionQueue,
    draining: bool,
    /// Topics issued on the installed transport, in first-subscribe order
    active_topics: Vec<String>,
    credential: Option<Credential>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            transport: None,
            epoch: 0,
            generation: 0,
            session_id: 0,
            queue: SubscriptionQueue::new(),
            draining: false,
            active_topics: Vec::new(),
            credential: None,
        }
    }

    fn apply(&mut self, transition: Transition) {
        let next = state::next_state(self.state, transition, self.transport.is_some());
        state::log_state_transition(self.state, next);
        self.state = next;
    }

    fn record_active(&mut self, topic: &str) {
        if !self.active_topics.iter().any(|t| t == topic) {
            self.active_topics.push(topic.to_string());
        }
    }

    /// Move active topics of the outgoing transport to the head of the queue
    fn requeue_active(&mut self) {
        let active = std::mem::take(&mut self.active_topics);
        if !active.is_empty() {
            debug!(count = active.len(), "Re-queueing active topics");
            self.queue.requeue_front(active);
        }
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.epoch != epoch
    }
}

pub(crate) struct Shared {
    factory: Arc<dyn TransportFactory>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    options: SessionOptions,
    events: EventBus,
    session: Mutex<Session>,
}

/// Handle over one logical pub/sub session
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, options: SessionOptions) -> Self {
        Self::build(factory, None, options)
    }

    /// Manager that can attach policies and discover the broker endpoint
    pub fn with_control_plane(
        factory: Arc<dyn TransportFactory>,
        control_plane: Arc<dyn ControlPlane>,
        options: SessionOptions,
    ) -> Self {
        Self::build(factory, Some(control_plane), options)
    }

    fn build(
        factory: Arc<dyn TransportFactory>,
        control_plane: Option<Arc<dyn ControlPlane>>,
        options: SessionOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                control_plane,
                options,
                events: EventBus::new(),
                session: Mutex::new(Session::new()),
            }),
        }
    }

    /// Start a connection attempt
    ///
    /// Only input validation fails synchronously. Everything past it
    /// (policy attachment, endpoint lookup, transport construction) reports
    /// failure as an [`Event::Error`] and returns `Ok`. A newer `connect`
    /// supersedes one still in flight.
    pub async fn connect(&self, request: ConnectRequest) -> SessionResult<()> {
        let credential = match request.credential {
            Some(credential) if !credential.is_empty() => credential,
            _ => return Err(SessionError::InvalidCredential),
        };
        let region = request
            .region
            .filter(|r| !r.trim().is_empty())
            .or_else(|| {
                self.shared
                    .options
                    .default_region
                    .clone()
                    .filter(|r| !r.trim().is_empty())
            })
            .ok_or(SessionError::MissingRegion)?;

        let generation = {
            let mut session = self.shared.session.lock().await;
            session.generation += 1;
            session.apply(Transition::ConnectStarted);
            session.generation
        };

        let span = crate::session_span!(op = "connect", generation, region = %region);
        self.run_connect(
            generation,
            credential,
            region,
            request.policy_name,
            request.endpoint,
        )
        .instrument(span)
        .await;
        Ok(())
    }

    /// Obtain a credential from `provider`, then connect with it
    ///
    /// Any credential already in `request` is replaced.
    pub async fn connect_with(
        &self,
        provider: &dyn CredentialProvider,
        mut request: ConnectRequest,
    ) -> SessionResult<()> {
        match provider.credential().await {
            Ok(credential) => {
                request.credential = Some(credential);
                self.connect(request).await
            }
            Err(e) => {
                let error = SessionError::CredentialProvider(e);
                warn!(error = %error, "Credential provider failed");
                self.shared.events.emit(Event::Error {
                    detail: error.event_detail(),
                });
                Ok(())
            }
        }
    }

    async fn run_connect(
        &self,
        generation: u64,
        credential: Credential,
        region: String,
        policy_name: Option<String>,
        endpoint: Option<String>,
    ) {
        info!("Starting connection attempt");

        if let Some(policy) = policy_name.as_deref() {
            let attached = match &self.shared.control_plane {
                Some(plane) => plane.attach_policy(credential.principal(), policy).await,
                None => Err(ControlPlaneError::Unsupported(
                    "no control plane configured".to_string(),
                )),
            };
            if let Err(e) = attached {
                self.abort_connect(generation, SessionError::PolicyAttach(e))
                    .await;
                return;
            }
            debug!(policy, "Policy attached");
        }

        let host = match endpoint.filter(|e| !e.trim().is_empty()) {
            Some(host) => host,
            None => match self.describe_endpoint().await {
                Ok(host) => host,
                Err(e) => {
                    self.abort_connect(generation, SessionError::EndpointLookup(e))
                        .await;
                    return;
                }
            },
        };

        let options = &self.shared.options;
        let config = ConnectionConfig {
            host,
            port: options.port,
            protocol: options.protocol,
            client_id: options.client_id.clone().unwrap_or_else(generate_client_id),
            region,
            credential: credential.clone(),
            debug: options.debug,
            keep_alive: options.keep_alive,
            reconnect: options.reconnect.clone(),
        };

        if self.shared.session.lock().await.generation != generation {
            debug!("Connection attempt superseded before construction");
            return;
        }

        let (sink, signals) = SignalSink::channel();
        let transport = match self.shared.factory.construct(&config, sink) {
            Ok(transport) => transport,
            Err(e) => {
                self.abort_connect(generation, SessionError::Construction(e))
                    .await;
                return;
            }
        };
        info!(
            host = %config.host,
            port = config.port,
            protocol = config.protocol.as_str(),
            client_id = %config.client_id,
            "Transport constructed"
        );

        self.install(generation, transport, signals, credential)
            .await;
    }

    async fn describe_endpoint(&self) -> Result<String, ControlPlaneError> {
        match &self.shared.control_plane {
            Some(plane) => plane.describe_endpoint().await,
            None => Err(ControlPlaneError::EndpointLookup(
                "no endpoint given and no control plane configured".to_string(),
            )),
        }
    }

    /// Swap in a freshly constructed transport and start pumping its signals
    async fn install(
        &self,
        generation: u64,
        transport: Arc<dyn Transport>,
        signals: tokio::sync::mpsc::UnboundedReceiver<crate::transport::TransportSignal>,
        credential: Credential,
    ) {
        let previous = {
            let mut session = self.shared.session.lock().await;
            if session.generation != generation {
                drop(session);
                debug!("Connection attempt superseded, ending its transport");
                if let Err(e) = transport.end(true).await {
                    warn!(error = %e, "Failed to end superseded transport");
                }
                return;
            }

            // Invalidate the old transport before the new one becomes visible
            session.epoch += 1;
            let previous = session.transport.take();
            if previous.is_some() {
                session.requeue_active();
            }
            session.transport = Some(transport);
            session.credential = Some(credential);
            session.draining = false;
            session.apply(Transition::TransportInstalled);

            handlers::spawn_signal_pump(
                Arc::downgrade(&self.shared),
                session.epoch,
                signals,
            );
            previous
        };

        if let Some(previous) = previous {
            info!("Replacing existing transport");
            if let Err(e) = previous.end(true).await {
                warn!(error = %e, "Failed to end replaced transport");
            }
        }
    }

    async fn abort_connect(&self, generation: u64, error: SessionError) {
        let detail = error.event_detail();
        warn!(error = %detail, "Connection attempt failed");

        let mut session = self.shared.session.lock().await;
        if session.generation == generation {
            session.apply(Transition::ConnectAborted);
        }
        self.shared.events.emit(Event::Error { detail });
    }

    /// Tear the session down
    ///
    /// Discards queued subscriptions without resolving their handles and
    /// emits a single [`Event::Close`] once the transport confirmed closure.
    /// Resolves immediately when there is nothing to tear down.
    pub async fn disconnect(&self) -> SessionResult<()> {
        let (transport, discarded) = {
            let mut session = self.shared.session.lock().await;
            let nothing_to_do = session.transport.is_none()
                && session.queue.is_empty()
                && matches!(session.state, SessionState::Idle | SessionState::Closed);
            if nothing_to_do {
                debug!("Disconnect requested with nothing to tear down");
                return Ok(());
            }

            session.generation += 1;
            session.session_id += 1;
            session.epoch += 1;
            let discarded = session.queue.discard();
            session.active_topics.clear();
            session.draining = false;
            session.credential = None;
            let transport = session.transport.take();
            session.apply(Transition::Disconnected);
            (transport, discarded)
        };

        let result = match transport {
            Some(transport) => transport.end(false).await.map_err(SessionError::from),
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!(error = %e, "Transport reported an error while closing");
        }

        self.shared.events.emit(Event::Close);
        info!(discarded, "Session disconnected");
        result
    }

    /// Forward fresh credentials to the live transport without reconnecting
    ///
    /// A no-op when no transport exists; the next `connect` carries its own
    /// credential.
    pub async fn update_credentials(&self, credential: Credential) -> SessionResult<()> {
        if credential.is_empty() {
            return Err(SessionError::InvalidCredential);
        }

        let (transport, epoch) = {
            let session = self.shared.session.lock().await;
            match &session.transport {
                Some(transport) => (transport.clone(), session.epoch),
                None => {
                    debug!("No transport, credential update ignored");
                    return Ok(());
                }
            }
        };

        transport.update_credentials(&credential).await?;

        let mut session = self.shared.session.lock().await;
        if !session.is_stale(epoch) {
            session.credential = Some(credential);
        }
        info!("Credentials updated");
        Ok(())
    }

    /// Publish a payload on the live transport
    pub async fn send(&self, topic: &str, payload: impl Into<Vec<u8>>) -> SessionResult<()> {
        let transport = self
            .shared
            .session
            .lock()
            .await
            .transport
            .clone()
            .ok_or(SessionError::NotConnected)?;

        let payload = payload.into();
        if self.shared.options.debug {
            debug!(topic, bytes = payload.len(), "Publishing");
        }
        transport.publish(topic, payload).await?;
        Ok(())
    }

    /// Subscribe now if the transport is connected, otherwise queue the
    /// request for the next Connect
    ///
    /// A request is never lost: if the immediate call fails it is queued and
    /// an [`Event::Error`] is emitted. While connected, a non-empty queue is
    /// drained behind its head so later requests keep their order.
    pub async fn subscribe(&self, topic: &str) -> SubscriptionHandle {
        let (transport, epoch, session_id) = {
            let mut session = self.shared.session.lock().await;
            let ready = state::accepts_immediate_subscribe(
                session.state,
                session.transport.is_some(),
            ) && session.queue.is_empty()
                && !session.draining;

            let transport = match session.transport.clone() {
                Some(transport) if ready => transport,
                _ => {
                    debug!(topic, state = %session.state, "Deferring subscription");
                    let handle = session.queue.enqueue(topic);
                    // Connected with leftovers from a failed call: drain now
                    if session.state == SessionState::Connected
                        && session.transport.is_some()
                        && !session.draining
                    {
                        session.draining = true;
                        handlers::spawn_drain(Arc::clone(&self.shared), session.epoch);
                    }
                    return handle;
                }
            };
            (transport, session.epoch, session.session_id)
        };

        let result = transport.subscribe(topic).await;

        let mut session = self.shared.session.lock().await;
        if session.session_id != session_id {
            debug!(topic, "Session ended while subscribing");
            return match result {
                Ok(()) => SubscriptionHandle::issued(),
                Err(_) => SubscriptionHandle::dropped(),
            };
        }

        match result {
            Ok(()) if !session.is_stale(epoch) => {
                session.record_active(topic);
                self.shared.events.emit(Event::Subscribed {
                    topic: topic.to_string(),
                });
                debug!(topic, "Subscribed");
                SubscriptionHandle::issued()
            }
            Ok(()) => {
                // Issued on a transport that has since been replaced
                debug!(topic, "Transport changed while subscribing, re-queueing");
                session.queue.enqueue(topic)
            }
            Err(e) => {
                let error = SessionError::Transport(e);
                warn!(topic, error = %error, "Subscribe failed, queueing for replay");
                self.shared.events.emit(Event::Error {
                    detail: error.event_detail(),
                });
                session.queue.enqueue(topic)
            }
        }
    }

    /// Unsubscribe on the live transport; a no-op when none exists
    pub async fn unsubscribe(&self, topic: &str) -> SessionResult<()> {
        let transport = {
            let mut session = self.shared.session.lock().await;
            session.active_topics.retain(|t| t != topic);
            session.transport.clone()
        };

        match transport {
            Some(transport) => {
                transport.unsubscribe(topic).await?;
                debug!(topic, "Unsubscribed");
                Ok(())
            }
            None => {
                debug!(topic, "No transport, unsubscribe ignored");
                Ok(())
            }
        }
    }

    pub async fn state(&self) -> SessionState {
        self.shared.session.lock().await.state
    }

    /// True when a transport is installed and reports Connected
    pub async fn is_connected(&self) -> bool {
        let session = self.shared.session.lock().await;
        session.transport.is_some() && session.state == SessionState::Connected
    }

    /// Register a new event subscriber
    pub fn events(&self) -> EventSubscription {
        self.shared.events.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.shared.events
    }

    /// Topics waiting for the next Connect, head first
    pub async fn pending_subscriptions(&self) -> Vec<String> {
        self.shared.session.lock().await.queue.topics()
    }

    /// Topics issued on the current transport
    pub async fn active_topics(&self) -> Vec<String> {
        self.shared.session.lock().await.active_topics.clone()
    }

    /// Credential of the current session, if connected with one
    pub async fn credential(&self) -> Option<Credential> {
        self.shared.session.lock().await.credential.clone()
    }
}

fn generate_client_id() -> String {
    format!("iot-session-{}", Uuid::new_v4().simple())
}
