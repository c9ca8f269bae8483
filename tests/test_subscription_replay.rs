//! Deferred subscription tests
//!
//! Subscriptions requested while no connected transport exists are queued
//! and replayed in order on the next Connect, each exactly once.

mod test_helpers;

use iot_session::testing::MockTransportFactory;
use iot_session::{Event, HandleStatus, SessionManager, SubscriptionDropped};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;

fn subscribed(topic: &str) -> Event {
    Event::Subscribed {
        topic: topic.to_string(),
    }
}

#[tokio::test]
async fn test_queued_subscriptions_replay_in_order_once() {
    let (manager, factory) = test_manager();
    let mut events = manager.events();

    let mut first = manager.subscribe("a").await;
    let second = manager.subscribe("b").await;
    let third = manager.subscribe("c").await;
    assert_eq!(first.status(), HandleStatus::Pending);
    assert_eq!(manager.pending_subscriptions().await, vec!["a", "b", "c"]);

    let transport = connect_and_wait(&manager, &factory, &mut events).await;
    assert_eq!(next_event(&mut events).await, subscribed("a"));
    assert_eq!(next_event(&mut events).await, subscribed("b"));
    assert_eq!(next_event(&mut events).await, subscribed("c"));

    assert_eq!(transport.get_subscribed_topics().await, vec!["a", "b", "c"]);
    assert!(manager.pending_subscriptions().await.is_empty());
    assert_eq!(first.await, Ok(()));
    assert_eq!(second.await, Ok(()));
    assert_eq!(third.await, Ok(()));

    // A later Connect on the same transport does not replay again
    transport.connect();
    assert_eq!(next_event(&mut events).await, Event::Connect);
    assert_no_event(&mut events).await;
    assert_eq!(transport.get_subscribed_topics().await.len(), 3);
}

#[tokio::test]
async fn test_duplicate_topics_are_not_deduplicated() {
    let (manager, factory) = test_manager();
    let mut events = manager.events();

    manager.subscribe("t").await;
    manager.subscribe("t").await;
    let transport = connect_and_wait(&manager, &factory, &mut events).await;
    collect_until(&mut events, |e| *e == subscribed("t")).await;
    collect_until(&mut events, |e| *e == subscribed("t")).await;
    assert_eq!(transport.get_subscribed_topics().await, vec!["t", "t"]);

    // Same when connected
    manager.subscribe("u").await.await.unwrap();
    manager.subscribe("u").await.await.unwrap();
    let topics = transport.get_subscribed_topics().await;
    assert_eq!(topics.iter().filter(|t| *t == "u").count(), 2);
}

#[tokio::test]
async fn test_subscribe_while_connecting_is_deferred() {
    let (manager, factory) = test_manager();
    let mut events = manager.events();

    manager.connect(test_request()).await.unwrap();
    let transport = factory.last_transport().unwrap();

    let mut handle = manager.subscribe("sensor/data").await;
    assert_eq!(handle.status(), HandleStatus::Pending);
    assert!(transport.get_subscribed_topics().await.is_empty());

    transport.connect();
    assert_eq!(next_event(&mut events).await, Event::Connect);
    assert_eq!(next_event(&mut events).await, subscribed("sensor/data"));
    assert_eq!(handle.await, Ok(()));
}

#[tokio::test]
async fn test_subscribe_during_replay_joins_the_tail() {
    let factory = Arc::new(MockTransportFactory::with_subscribe_delay(
        Duration::from_millis(50),
    ));
    let manager = SessionManager::new(factory.clone(), test_options());
    let mut events = manager.events();

    manager.subscribe("a").await;
    manager.subscribe("b").await;
    let transport = connect_and_wait(&manager, &factory, &mut events).await;

    // Replay of "a" is still sleeping in the transport
    let late = manager.subscribe("c").await;

    let seen = collect_until(&mut events, |e| *e == subscribed("c")).await;
    assert_eq!(seen, vec![subscribed("a"), subscribed("b"), subscribed("c")]);
    assert_eq!(transport.get_subscribed_topics().await, vec!["a", "b", "c"]);
    assert_eq!(late.await, Ok(()));
}

#[tokio::test]
async fn test_failed_replay_keeps_entry_at_head() {
    let (manager, factory) = test_manager();
    let mut events = manager.events();

    let mut first = manager.subscribe("a").await;
    manager.subscribe("b").await;
    manager.connect(test_request()).await.unwrap();
    let transport = factory.last_transport().unwrap();
    transport.fail_next_subscribes(1);

    transport.connect();
    assert_eq!(next_event(&mut events).await, Event::Connect);
    assert!(matches!(next_event(&mut events).await, Event::Error { .. }));
    assert_eq!(manager.pending_subscriptions().await, vec!["a", "b"]);
    assert_eq!(first.status(), HandleStatus::Pending);

    // The next Connect retries from the head
    transport.connect();
    assert_eq!(next_event(&mut events).await, Event::Connect);
    assert_eq!(next_event(&mut events).await, subscribed("a"));
    assert_eq!(next_event(&mut events).await, subscribed("b"));
    assert_eq!(first.await, Ok(()));
}

#[tokio::test]
async fn test_failed_immediate_subscribe_is_queued() {
    let (manager, factory) = test_manager();
    let mut events = manager.events();
    let transport = connect_and_wait(&manager, &factory, &mut events).await;

    transport.fail_next_subscribes(1);
    let mut handle = manager.subscribe("sensor/data").await;

    assert!(matches!(next_event(&mut events).await, Event::Error { .. }));
    assert_eq!(handle.status(), HandleStatus::Pending);
    assert_eq!(manager.pending_subscriptions().await, vec!["sensor/data"]);

    transport.connect();
    assert_eq!(next_event(&mut events).await, Event::Connect);
    assert_eq!(next_event(&mut events).await, subscribed("sensor/data"));
    assert_eq!(handle.await, Ok(()));
}

#[tokio::test]
async fn test_subscribe_after_failure_is_issued_while_connected() {
    let (manager, factory) = test_manager();
    let mut events = manager.events();
    let transport = connect_and_wait(&manager, &factory, &mut events).await;

    transport.fail_next_subscribes(1);
    let first = manager.subscribe("a").await;
    assert!(matches!(next_event(&mut events).await, Event::Error { .. }));

    // No new Connect arrives; the retained head goes out first
    let mut second = manager.subscribe("b").await;
    assert_eq!(next_event(&mut events).await, subscribed("a"));
    assert_eq!(next_event(&mut events).await, subscribed("b"));

    assert_eq!(transport.get_subscribed_topics().await, vec!["a", "b"]);
    assert!(manager.pending_subscriptions().await.is_empty());
    assert_eq!(manager.active_topics().await, vec!["a", "b"]);
    assert_eq!(second.status(), HandleStatus::Issued);
    assert_eq!(first.await, Ok(()));
}

#[tokio::test]
async fn test_disconnect_discards_queue() {
    let (manager, factory) = test_manager();
    let mut events = manager.events();

    let first = manager.subscribe("a").await;
    let second = manager.subscribe("b").await;

    manager.disconnect().await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Close);
    assert_no_event(&mut events).await;
    assert!(manager.pending_subscriptions().await.is_empty());
    assert_eq!(first.await, Err(SubscriptionDropped));
    assert_eq!(second.await, Err(SubscriptionDropped));

    // The next session starts with an empty queue
    let transport = connect_and_wait(&manager, &factory, &mut events).await;
    assert_no_event(&mut events).await;
    assert!(transport.get_subscribed_topics().await.is_empty());
}

#[tokio::test]
async fn test_disconnect_while_connecting_drops_handles() {
    let (manager, factory) = test_manager();
    let mut events = manager.events();

    manager.connect(test_request()).await.unwrap();
    let transport = factory.last_transport().unwrap();
    let mut handle = manager.subscribe("a").await;

    manager.disconnect().await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Close);
    assert_eq!(handle.status(), HandleStatus::Dropped);
    assert_eq!(transport.get_end_calls().await, vec![false]);

    // Signals from the ended transport do nothing
    transport.connect();
    assert_no_event(&mut events).await;
    assert!(transport.get_subscribed_topics().await.is_empty());
}

#[tokio::test]
async fn test_dropping_a_handle_does_not_cancel() {
    let (manager, factory) = test_manager();
    let mut events = manager.events();

    drop(manager.subscribe("a").await);
    let transport = connect_and_wait(&manager, &factory, &mut events).await;

    assert_eq!(next_event(&mut events).await, subscribed("a"));
    assert_eq!(transport.get_subscribed_topics().await, vec!["a"]);
}

#[tokio::test]
async fn test_replacement_transport_replays_active_topics() {
    let (manager, factory) = test_manager();
    let mut events = manager.events();
    connect_and_wait(&manager, &factory, &mut events).await;

    manager.subscribe("a").await.await.unwrap();
    manager.subscribe("b").await.await.unwrap();
    assert_eq!(manager.active_topics().await, vec!["a", "b"]);
    events.drain();

    let replacement = connect_and_wait(&manager, &factory, &mut events).await;
    assert_eq!(next_event(&mut events).await, subscribed("a"));
    assert_eq!(next_event(&mut events).await, subscribed("b"));
    assert_eq!(replacement.get_subscribed_topics().await, vec!["a", "b"]);
}

#[tokio::test]
async fn test_unsubscribe_stops_tracking() {
    let (manager, factory) = test_manager();
    let mut events = manager.events();

    // No transport: nothing to do
    manager.unsubscribe("a").await.unwrap();

    let transport = connect_and_wait(&manager, &factory, &mut events).await;
    manager.subscribe("a").await.await.unwrap();
    manager.unsubscribe("a").await.unwrap();

    assert_eq!(transport.get_unsubscribed_topics().await, vec!["a"]);
    assert!(manager.active_topics().await.is_empty());

    events.drain();
    transport.close();
    assert_eq!(next_event(&mut events).await, Event::Close);
    assert!(manager.pending_subscriptions().await.is_empty());
}
