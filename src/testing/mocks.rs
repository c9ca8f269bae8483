//! Mock implementations for testing
//!
//! Provides a mock Transport (plus the factory that builds it) and a mock
//! ControlPlane so the session manager can be exercised without a broker.
//! Tests drive the transport's lifecycle by pushing signals through
//! [`MockTransport::emit`] and its shorthands.

use crate::control_plane::{ControlPlane, ControlPlaneError};
use crate::credentials::Credential;
use crate::transport::{
    ConnectionConfig, SignalSink, Transport, TransportError, TransportFactory, TransportSignal,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub type PublishedMessage = (String, Vec<u8>);

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    pub config: ConnectionConfig,
    pub subscribed_topics: Arc<Mutex<Vec<String>>>,
    pub unsubscribed_topics: Arc<Mutex<Vec<String>>>,
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub end_calls: Arc<Mutex<Vec<bool>>>,
    pub credential_updates: Arc<Mutex<Vec<Credential>>>,
    pub should_fail: bool,
    fail_subscribes: AtomicUsize,
    subscribe_delay: Option<Duration>,
    signals: SignalSink,
}

impl MockTransport {
    pub fn new(config: ConnectionConfig, signals: SignalSink) -> Self {
        Self {
            config,
            subscribed_topics: Arc::new(Mutex::new(Vec::new())),
            unsubscribed_topics: Arc::new(Mutex::new(Vec::new())),
            published_messages: Arc::new(Mutex::new(Vec::new())),
            end_calls: Arc::new(Mutex::new(Vec::new())),
            credential_updates: Arc::new(Mutex::new(Vec::new())),
            should_fail: false,
            fail_subscribes: AtomicUsize::new(0),
            subscribe_delay: None,
            signals,
        }
    }

    /// Every request fails
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Each subscribe call sleeps this long before it is recorded
    pub fn with_subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay = Some(delay);
        self
    }

    /// Make the next `count` subscribe calls fail
    pub fn fail_next_subscribes(&self, count: usize) {
        self.fail_subscribes.store(count, Ordering::SeqCst);
    }

    /// Push a lifecycle signal as the real transport would
    pub fn emit(&self, signal: TransportSignal) -> bool {
        self.signals.emit(signal)
    }

    pub fn connect(&self) -> bool {
        self.emit(TransportSignal::Connect)
    }

    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        self.emit(TransportSignal::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        })
    }

    pub fn close(&self) -> bool {
        self.emit(TransportSignal::Close)
    }

    pub async fn get_subscribed_topics(&self) -> Vec<String> {
        self.subscribed_topics.lock().await.clone()
    }

    pub async fn get_unsubscribed_topics(&self) -> Vec<String> {
        self.unsubscribed_topics.lock().await.clone()
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    pub async fn get_end_calls(&self) -> Vec<bool> {
        self.end_calls.lock().await.clone()
    }

    pub async fn get_credential_updates(&self) -> Vec<Credential> {
        self.credential_updates.lock().await.clone()
    }

    fn take_subscribe_failure(&self) -> bool {
        self.fail_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.should_fail {
            return Err(TransportError::Request("Mock publish failure".to_string()));
        }
        self.published_messages
            .lock()
            .await
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if let Some(delay) = self.subscribe_delay {
            tokio::time::sleep(delay).await;
        }
        if self.should_fail || self.take_subscribe_failure() {
            return Err(TransportError::Request(format!(
                "Mock subscribe failure for {topic}"
            )));
        }
        self.subscribed_topics.lock().await.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if self.should_fail {
            return Err(TransportError::Request(
                "Mock unsubscribe failure".to_string(),
            ));
        }
        self.unsubscribed_topics.lock().await.push(topic.to_string());
        Ok(())
    }

    async fn end(&self, force: bool) -> Result<(), TransportError> {
        self.end_calls.lock().await.push(force);
        self.signals.emit(TransportSignal::Close);
        Ok(())
    }

    async fn update_credentials(&self, credential: &Credential) -> Result<(), TransportError> {
        if self.should_fail {
            return Err(TransportError::Request(
                "Mock credential update failure".to_string(),
            ));
        }
        self.credential_updates.lock().await.push(credential.clone());
        Ok(())
    }
}

/// Factory handing out [`MockTransport`]s and keeping them for inspection
#[derive(Debug, Default)]
pub struct MockTransportFactory {
    transports: std::sync::Mutex<Vec<Arc<MockTransport>>>,
    fail_construction: AtomicBool,
    failing_transports: AtomicBool,
    subscribe_delay: Option<Duration>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose `construct` always fails
    pub fn with_construction_failure() -> Self {
        let factory = Self::default();
        factory.set_fail_construction(true);
        factory
    }

    /// Transports built from now on fail every request
    pub fn with_failing_transports() -> Self {
        let factory = Self::default();
        factory.failing_transports.store(true, Ordering::SeqCst);
        factory
    }

    pub fn with_subscribe_delay(delay: Duration) -> Self {
        Self {
            subscribe_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn set_fail_construction(&self, fail: bool) {
        self.fail_construction.store(fail, Ordering::SeqCst);
    }

    pub fn construct_count(&self) -> usize {
        self.lock_transports().len()
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.lock_transports().clone()
    }

    pub fn last_transport(&self) -> Option<Arc<MockTransport>> {
        self.lock_transports().last().cloned()
    }

    fn lock_transports(&self) -> std::sync::MutexGuard<'_, Vec<Arc<MockTransport>>> {
        self.transports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TransportFactory for MockTransportFactory {
    fn construct(
        &self,
        config: &ConnectionConfig,
        signals: SignalSink,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if self.fail_construction.load(Ordering::SeqCst) {
            return Err(TransportError::Construction(
                "Mock construction failure".to_string(),
            ));
        }

        let mut transport = MockTransport::new(config.clone(), signals);
        if self.failing_transports.load(Ordering::SeqCst) {
            transport = transport.with_failure();
        }
        if let Some(delay) = self.subscribe_delay {
            transport = transport.with_subscribe_delay(delay);
        }

        let transport = Arc::new(transport);
        self.lock_transports().push(transport.clone());
        Ok(transport)
    }
}

/// Mock control plane for testing
#[derive(Debug, Default)]
pub struct MockControlPlane {
    pub endpoint: Option<String>,
    pub attach_fails: bool,
    pub attached_policies: Arc<Mutex<Vec<(String, String)>>>,
    pub endpoint_lookups: Arc<AtomicUsize>,
}

impl MockControlPlane {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Default::default()
        }
    }

    /// Control plane that knows no endpoint
    pub fn without_endpoint() -> Self {
        Self::default()
    }

    pub fn with_attach_failure(mut self) -> Self {
        self.attach_fails = true;
        self
    }

    pub async fn get_attached_policies(&self) -> Vec<(String, String)> {
        self.attached_policies.lock().await.clone()
    }

    pub fn endpoint_lookup_count(&self) -> usize {
        self.endpoint_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn attach_policy(
        &self,
        principal: &str,
        policy_name: &str,
    ) -> Result<(), ControlPlaneError> {
        if self.attach_fails {
            return Err(ControlPlaneError::AttachFailed {
                principal: principal.to_string(),
                policy: policy_name.to_string(),
                reason: "Mock attach failure".to_string(),
            });
        }
        self.attached_policies
            .lock()
            .await
            .push((principal.to_string(), policy_name.to_string()));
        Ok(())
    }

    async fn describe_endpoint(&self) -> Result<String, ControlPlaneError> {
        self.endpoint_lookups.fetch_add(1, Ordering::SeqCst);
        self.endpoint.clone().ok_or_else(|| {
            ControlPlaneError::EndpointLookup("Mock control plane has no endpoint".to_string())
        })
    }
}
