//! Deferred subscription queue
//!
//! Holds subscribe requests made while no connected transport exists. Entries
//! are replayed in insertion order on the next Connect, each exactly once.
//! The caller keeps a [`SubscriptionHandle`] that completes once its entry
//! has actually been issued on a transport.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// The entry was discarded by `disconnect` before it reached a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Subscription was discarded before it reached a transport")]
pub struct SubscriptionDropped;

/// One queued subscribe request
#[derive(Debug)]
pub struct DeferredSubscription {
    topic: String,
    // None for topics re-queued from a previous transport
    completion: Option<oneshot::Sender<()>>,
}

impl DeferredSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Signal the caller that the subscribe call was issued
    pub fn resolve(self) -> String {
        if let Some(completion) = self.completion {
            // The caller may have stopped waiting
            let _ = completion.send(());
        }
        self.topic
    }
}

/// FIFO of deferred subscribe requests
#[derive(Debug, Default)]
pub struct SubscriptionQueue {
    entries: VecDeque<DeferredSubscription>,
}

impl SubscriptionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request and hand back the caller's completion handle
    pub fn enqueue(&mut self, topic: impl Into<String>) -> SubscriptionHandle {
        let (tx, rx) = oneshot::channel();
        self.entries.push_back(DeferredSubscription {
            topic: topic.into(),
            completion: Some(tx),
        });
        SubscriptionHandle::pending(rx)
    }

    /// Put topics that were active on a replaced or closed transport ahead of
    /// everything already queued, keeping their relative order
    pub fn requeue_front<I>(&mut self, topics: I)
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: DoubleEndedIterator,
    {
        for topic in topics.into_iter().rev() {
            self.entries.push_front(DeferredSubscription {
                topic,
                completion: None,
            });
        }
    }

    pub fn pop_front(&mut self) -> Option<DeferredSubscription> {
        self.entries.pop_front()
    }

    /// Return an entry whose subscribe call failed or was interrupted
    pub fn push_front(&mut self, entry: DeferredSubscription) {
        self.entries.push_front(entry);
    }

    /// Drop every entry without resolving it. Returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued topics, head first
    pub fn topics(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.topic.clone()).collect()
    }
}

/// Completion status of a subscription handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Pending,
    Issued,
    Dropped,
}

#[derive(Debug)]
enum HandleInner {
    Pending(oneshot::Receiver<()>),
    Issued,
    Dropped,
}

/// Resolves once the subscribe call for its topic has been issued
///
/// Await it for `Ok(())`, or `Err(SubscriptionDropped)` when `disconnect`
/// discarded the entry first. Dropping the handle does not cancel the
/// subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    inner: HandleInner,
}

impl SubscriptionHandle {
    fn pending(rx: oneshot::Receiver<()>) -> Self {
        Self {
            inner: HandleInner::Pending(rx),
        }
    }

    /// Handle for a subscribe call that already went to the transport
    pub fn issued() -> Self {
        Self {
            inner: HandleInner::Issued,
        }
    }

    /// Handle for a request that was discarded before it was issued
    pub fn dropped() -> Self {
        Self {
            inner: HandleInner::Dropped,
        }
    }

    /// Check the handle without waiting
    pub fn status(&mut self) -> HandleStatus {
        if let HandleInner::Pending(rx) = &mut self.inner {
            let settled = match rx.try_recv() {
                Ok(()) => Some(HandleInner::Issued),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Closed) => Some(HandleInner::Dropped),
            };
            if let Some(settled) = settled {
                self.inner = settled;
            }
        }
        match self.inner {
            HandleInner::Pending(_) => HandleStatus::Pending,
            HandleInner::Issued => HandleStatus::Issued,
            HandleInner::Dropped => HandleStatus::Dropped,
        }
    }
}

impl Future for SubscriptionHandle {
    type Output = Result<(), SubscriptionDropped>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let settled = match &mut self.inner {
            HandleInner::Issued => return Poll::Ready(Ok(())),
            HandleInner::Dropped => return Poll::Ready(Err(SubscriptionDropped)),
            HandleInner::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) => HandleInner::Issued,
                Poll::Ready(Err(_)) => HandleInner::Dropped,
            },
        };
        self.inner = settled;
        match self.inner {
            HandleInner::Issued => Poll::Ready(Ok(())),
            _ => Poll::Ready(Err(SubscriptionDropped)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = SubscriptionQueue::new();
        let _a = queue.enqueue("a");
        let _b = queue.enqueue("b");
        let _c = queue.enqueue("c");

        assert_eq!(queue.topics(), vec!["a", "b", "c"]);
        assert_eq!(queue.pop_front().unwrap().topic(), "a");
        assert_eq!(queue.pop_front().unwrap().topic(), "b");
        assert_eq!(queue.pop_front().unwrap().topic(), "c");
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn test_duplicates_are_kept() {
        let mut queue = SubscriptionQueue::new();
        let _first = queue.enqueue("t");
        let _second = queue.enqueue("t");
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_handle_completes_on_resolve() {
        let mut queue = SubscriptionQueue::new();
        let mut handle = queue.enqueue("sensor/data");
        assert_eq!(handle.status(), HandleStatus::Pending);

        let topic = queue.pop_front().unwrap().resolve();
        assert_eq!(topic, "sensor/data");
        assert_eq!(handle.status(), HandleStatus::Issued);
        assert_eq!(handle.await, Ok(()));
    }

    #[tokio::test]
    async fn test_discard_drops_handles() {
        let mut queue = SubscriptionQueue::new();
        let first = queue.enqueue("a");
        let mut second = queue.enqueue("b");

        assert_eq!(queue.discard(), 2);
        assert!(queue.is_empty());
        assert_eq!(second.status(), HandleStatus::Dropped);
        assert_eq!(first.await, Err(SubscriptionDropped));
    }

    #[test]
    fn test_failed_entry_returns_to_head() {
        let mut queue = SubscriptionQueue::new();
        let mut handle = queue.enqueue("a");
        let _b = queue.enqueue("b");

        let entry = queue.pop_front().unwrap();
        queue.push_front(entry);

        assert_eq!(queue.topics(), vec!["a", "b"]);
        assert_eq!(handle.status(), HandleStatus::Pending);
    }

    #[test]
    fn test_requeue_front_keeps_relative_order() {
        let mut queue = SubscriptionQueue::new();
        let _c = queue.enqueue("c");
        queue.requeue_front(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(queue.topics(), vec!["a", "b", "c"]);

        // Re-queued entries have nobody waiting on them
        queue.pop_front().unwrap().resolve();
    }

    #[test]
    fn test_pending_handle_wakes_on_resolve() {
        let mut queue = SubscriptionQueue::new();
        let mut handle = tokio_test::task::spawn(queue.enqueue("a"));
        tokio_test::assert_pending!(handle.poll());

        queue.pop_front().unwrap().resolve();
        assert!(handle.is_woken());
        tokio_test::assert_ready_eq!(handle.poll(), Ok(()));
    }

    #[tokio::test]
    async fn test_issued_handle_is_ready() {
        let mut handle = SubscriptionHandle::issued();
        assert_eq!(handle.status(), HandleStatus::Issued);
        assert_eq!(handle.await, Ok(()));
    }

    proptest! {
        #[test]
        fn test_drain_order_matches_enqueue_order(topics in prop::collection::vec("[a-z/]{1,12}", 0..32)) {
            let mut queue = SubscriptionQueue::new();
            let mut handles: Vec<_> = topics.iter().map(|t| queue.enqueue(t.clone())).collect();

            let mut drained = Vec::new();
            while let Some(entry) = queue.pop_front() {
                drained.push(entry.resolve());
            }

            prop_assert_eq!(&drained, &topics);
            for handle in handles.iter_mut() {
                prop_assert_eq!(handle.status(), HandleStatus::Issued);
            }
        }
    }
}
