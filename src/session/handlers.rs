//! Lifecycle normalization: transport signals in, session events out
//!
//! One pump task per installed transport reads its signal channel and calls
//! the handlers below in arrival order. Handlers are plain functions over the
//! shared state. The pump holds only a weak reference, so dropping the last
//! `SessionManager` handle stops it.

use super::state::Transition;
use super::Shared;
use crate::codec;
use crate::error::{sanitize_detail, SessionError};
use crate::events::Event;
use crate::transport::TransportSignal;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

pub(super) fn spawn_signal_pump(
    shared: Weak<Shared>,
    epoch: u64,
    mut signals: UnboundedReceiver<TransportSignal>,
) -> JoinHandle<()> {
    let span = crate::session_span!(op = "signal_pump", epoch);
    tokio::spawn(
        async move {
            while let Some(signal) = signals.recv().await {
                let Some(shared) = shared.upgrade() else {
                    debug!("Session dropped, stopping signal pump");
                    break;
                };
                if !handle_signal(&shared, epoch, signal).await {
                    break;
                }
            }
            debug!("Signal pump stopped");
        }
        .instrument(span),
    )
}

/// Handle one signal from the transport installed at `epoch`
///
/// Returns false once that transport is no longer installed, which ends the
/// pump.
pub(super) async fn handle_signal(shared: &Shared, epoch: u64, signal: TransportSignal) -> bool {
    match signal {
        TransportSignal::Connect => on_connect(shared, epoch).await,
        TransportSignal::Message { topic, payload } => {
            on_message(shared, epoch, topic, payload).await
        }
        TransportSignal::Error(detail) => on_error(shared, epoch, &detail).await,
        TransportSignal::Reconnect => on_interrupted(shared, epoch, Event::Reconnect).await,
        TransportSignal::Offline => on_interrupted(shared, epoch, Event::Offline).await,
        TransportSignal::Close => on_close(shared, epoch).await,
    }
}

async fn on_connect(shared: &Shared, epoch: u64) -> bool {
    {
        let mut session = shared.session.lock().await;
        if session.is_stale(epoch) {
            return false;
        }
        session.apply(Transition::TransportConnected);
        shared.events.emit(Event::Connect);
        if session.queue.is_empty() {
            return true;
        }
        session.draining = true;
    }

    drain_queue(shared, epoch).await;
    true
}

/// Drain the queue on a task of its own; the caller has set `draining`
pub(super) fn spawn_drain(shared: Arc<Shared>, epoch: u64) -> JoinHandle<()> {
    let span = crate::session_span!(op = "drain_queue", epoch);
    tokio::spawn(async move { drain_queue(&shared, epoch).await }.instrument(span))
}

/// Replay deferred subscriptions one at a time, in queue order
///
/// Subscribes arriving meanwhile join the queue and are drained in the same
/// pass. A failed call puts its entry back at the head and stops the pass.
async fn drain_queue(shared: &Shared, epoch: u64) {
    let mut replayed = 0usize;
    loop {
        let (entry, transport, session_id) = {
            let mut session = shared.session.lock().await;
            if session.is_stale(epoch) {
                return;
            }
            let Some(entry) = session.queue.pop_front() else {
                session.draining = false;
                break;
            };
            let Some(transport) = session.transport.clone() else {
                session.queue.push_front(entry);
                session.draining = false;
                return;
            };
            (entry, transport, session.session_id)
        };

        let result = transport.subscribe(entry.topic()).await;

        let mut session = shared.session.lock().await;
        if session.session_id != session_id {
            // Disconnected mid-replay; the entry goes with the discarded queue
            debug!(topic = entry.topic(), "Session ended during replay");
            return;
        }
        if session.is_stale(epoch) {
            session.queue.push_front(entry);
            return;
        }

        match result {
            Ok(()) => {
                let topic = entry.resolve();
                session.record_active(&topic);
                shared.events.emit(Event::Subscribed {
                    topic: topic.clone(),
                });
                debug!(topic = %topic, "Replayed deferred subscription");
                replayed += 1;
            }
            Err(e) => {
                let error = SessionError::Transport(e);
                warn!(
                    topic = entry.topic(),
                    error = %error,
                    "Deferred subscription failed, keeping it for the next connect"
                );
                session.queue.push_front(entry);
                session.draining = false;
                shared.events.emit(Event::Error {
                    detail: error.event_detail(),
                });
                return;
            }
        }
    }

    if replayed > 0 {
        info!(replayed, "Deferred subscriptions replayed");
    }
}

async fn on_message(shared: &Shared, epoch: u64, topic: String, payload: Bytes) -> bool {
    let decoded = codec::decode_message(&topic, &payload);

    let session = shared.session.lock().await;
    if session.is_stale(epoch) {
        return false;
    }

    match decoded {
        Ok(payload) => {
            if shared.options.debug {
                debug!(topic = %topic, payload = %payload, "Message received");
            }
            shared.events.emit(Event::Message { topic, payload });
        }
        Err(e) => {
            let error = SessionError::payload_decode(topic, e);
            warn!(error = %error, "Dropping undecodable message");
            shared.events.emit(Event::Error {
                detail: error.event_detail(),
            });
        }
    }
    true
}

async fn on_error(shared: &Shared, epoch: u64, detail: &str) -> bool {
    let session = shared.session.lock().await;
    if session.is_stale(epoch) {
        return false;
    }
    let detail = sanitize_detail(detail);
    warn!(error = %detail, "Transport error");
    shared.events.emit(Event::Error { detail });
    true
}

async fn on_interrupted(shared: &Shared, epoch: u64, event: Event) -> bool {
    let mut session = shared.session.lock().await;
    if session.is_stale(epoch) {
        return false;
    }
    session.apply(Transition::TransportInterrupted);
    shared.events.emit(event);
    true
}

async fn on_close(shared: &Shared, epoch: u64) -> bool {
    let mut session = shared.session.lock().await;
    if session.is_stale(epoch) {
        return false;
    }

    // Detach so later signals from this transport are ignored
    session.transport = None;
    session.epoch += 1;
    session.draining = false;
    session.requeue_active();
    session.apply(Transition::TransportClosed);
    info!(
        pending = session.queue.len(),
        "Transport closed, pending subscriptions kept for the next connect"
    );
    shared.events.emit(Event::Close);
    false
}
