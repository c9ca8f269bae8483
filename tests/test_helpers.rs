//! Test helpers and utilities for integration tests

use iot_session::testing::{MockTransport, MockTransportFactory};
use iot_session::transport::Protocol;
use iot_session::{ConnectRequest, Credential, Event, EventSubscription, SessionManager, SessionOptions};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any single wait on the event stream
#[allow(dead_code)]
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Options for a manager talking to the mock transport
#[allow(dead_code)]
pub fn test_options() -> SessionOptions {
    SessionOptions {
        protocol: Protocol::Mqtt,
        port: 1883,
        client_id: Some("test-client".to_string()),
        default_region: Some("eu-west-1".to_string()),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn test_credential() -> Credential {
    Credential::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG")
}

/// Connect request with an explicit endpoint, so no control plane is needed
#[allow(dead_code)]
pub fn test_request() -> ConnectRequest {
    ConnectRequest::new(test_credential()).with_endpoint("broker.local")
}

/// Manager over a fresh mock factory
#[allow(dead_code)]
pub fn test_manager() -> (SessionManager, Arc<MockTransportFactory>) {
    let factory = Arc::new(MockTransportFactory::new());
    let manager = SessionManager::new(factory.clone(), test_options());
    (manager, factory)
}

/// Next event, failing the test if none arrives in time
#[allow(dead_code)]
pub async fn next_event(events: &mut EventSubscription) -> Event {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("Timed out waiting for an event")
        .expect("Event bus closed")
}

/// Skip events until one matches, returning everything seen up to and
/// including it
#[allow(dead_code)]
pub async fn collect_until<F>(events: &mut EventSubscription, mut done: F) -> Vec<Event>
where
    F: FnMut(&Event) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

/// Give the signal pump a chance to run, then assert nothing was emitted
#[allow(dead_code)]
pub async fn assert_no_event(events: &mut EventSubscription) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    let leftover = events.drain();
    assert!(leftover.is_empty(), "Unexpected events: {leftover:?}");
}

/// Connect, let the mock transport report Connect and wait for the event
#[allow(dead_code)]
pub async fn connect_and_wait(
    manager: &SessionManager,
    factory: &MockTransportFactory,
    events: &mut EventSubscription,
) -> Arc<MockTransport> {
    manager.connect(test_request()).await.unwrap();
    let transport = factory
        .last_transport()
        .expect("connect should construct a transport");
    assert!(transport.connect());
    assert_eq!(next_event(events).await, Event::Connect);
    transport
}
