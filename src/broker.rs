//! Output multiplexer: fans each session's events out to its subscribers.
//!
//! Every subscriber owns its own queue, so a slow consumer can never stall
//! the publisher or another subscriber. A queue that is full or closed is a
//! [`DeliveryFault`]: the subscriber is dropped and everybody else carries on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::{Payload, SessionId, StreamEvent};

/// Default capacity of a client's delivery queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFault {
    #[error("subscriber queue is full")]
    QueueFull,

    #[error("subscriber has disconnected")]
    Disconnected,
}

/// The receiving end a subscriber registers with the multiplexer.
#[derive(Debug, Clone)]
pub enum SubscriberQueue {
    /// Client-facing queue. Overflow drops the subscriber.
    Bounded(mpsc::Sender<StreamEvent>),
    /// In-process consumer that drains promptly (the monitor aggregator).
    Unbounded(mpsc::UnboundedSender<StreamEvent>),
}

impl SubscriberQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::Bounded(tx), rx)
    }

    pub fn unbounded() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::Unbounded(tx), rx)
    }

    fn deliver(&self, event: StreamEvent) -> Result<(), DeliveryFault> {
        match self {
            Self::Bounded(tx) => tx.try_send(event).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DeliveryFault::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DeliveryFault::Disconnected,
            }),
            Self::Unbounded(tx) => tx.send(event).map_err(|_| DeliveryFault::Disconnected),
        }
    }
}

/// What a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Session(SessionId),
    All,
}

/// Handle returned by the subscribe calls; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriberId,
    pub scope: Scope,
}

struct Subscriber {
    id: SubscriberId,
    queue: SubscriberQueue,
}

#[derive(Default)]
struct Topic {
    closed: bool,
    subscribers: Vec<Subscriber>,
}

/// Sequence counter and all-sessions subscribers, guarded together so the
/// order in which all-sessions subscribers receive events is the sequence
/// order.
#[derive(Default)]
struct Fanout {
    last_seq: u64,
    subscribers: Vec<Subscriber>,
}

#[derive(Default)]
struct BrokerInner {
    topics: RwLock<HashMap<SessionId, Arc<Mutex<Topic>>>>,
    fanout: Mutex<Fanout>,
    next_subscriber: AtomicU64,
}

#[derive(Clone, Default)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a topic for a new session. Re-registering an open topic is a no-op.
    pub fn register(&self, session_id: SessionId) {
        self.inner
            .topics
            .write()
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(Topic::default())));
    }

    /// Whether `session_id` currently accepts publications.
    pub fn is_open(&self, session_id: SessionId) -> bool {
        self.inner.topics.read().contains_key(&session_id)
    }

    /// Publish to a session's subscribers and every all-sessions subscriber.
    ///
    /// Returns the assigned sequence number, or `None` if the session is not
    /// registered (never was, or already closed).
    pub fn publish(&self, session_id: SessionId, payload: Payload) -> Option<u64> {
        let topic = self.inner.topics.read().get(&session_id).cloned()?;
        let mut topic = topic.lock();
        if topic.closed {
            return None;
        }
        Some(self.deliver(&mut topic, session_id, payload))
    }

    /// Publish `last` as the session's final event, detach every subscriber of
    /// the session and unregister it.
    ///
    /// Returns `None` if the session was not registered; closing twice is a
    /// no-op.
    pub fn close(&self, session_id: SessionId, last: Payload) -> Option<u64> {
        let topic = self.inner.topics.write().remove(&session_id)?;
        let mut topic = topic.lock();
        if topic.closed {
            return None;
        }
        let seq = self.deliver(&mut topic, session_id, last);
        topic.closed = true;
        let detached = topic.subscribers.len();
        topic.subscribers.clear();
        tracing::debug!(session = %session_id, detached, "topic closed");
        Some(seq)
    }

    /// Subscribe to one session. Returns `None` if the session is not
    /// registered.
    pub fn subscribe(&self, session_id: SessionId, queue: SubscriberQueue) -> Option<Subscription> {
        let topic = self.inner.topics.read().get(&session_id).cloned()?;
        let mut topic = topic.lock();
        if topic.closed {
            return None;
        }
        let id = self.next_id();
        topic.subscribers.push(Subscriber { id, queue });
        Some(Subscription {
            id,
            scope: Scope::Session(session_id),
        })
    }

    /// Subscribe to every session, present and future.
    ///
    /// Also returns the last sequence number assigned before the
    /// subscription took effect; every later event reaches this subscriber.
    pub fn subscribe_all(&self, queue: SubscriberQueue) -> (Subscription, u64) {
        let id = self.next_id();
        let mut fanout = self.inner.fanout.lock();
        fanout.subscribers.push(Subscriber { id, queue });
        (
            Subscription {
                id,
                scope: Scope::All,
            },
            fanout.last_seq,
        )
    }

    /// Remove a subscription. Returns whether it was still registered; calling
    /// it again is harmless.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let remove = |subs: &mut Vec<Subscriber>| {
            let before = subs.len();
            subs.retain(|s| s.id != subscription.id);
            subs.len() != before
        };
        match subscription.scope {
            Scope::All => remove(&mut self.inner.fanout.lock().subscribers),
            Scope::Session(session_id) => {
                let Some(topic) = self.inner.topics.read().get(&session_id).cloned() else {
                    return false;
                };
                let mut topic = topic.lock();
                remove(&mut topic.subscribers)
            }
        }
    }

    /// Last sequence number handed out (0 before the first publication).
    pub fn last_seq(&self) -> u64 {
        self.inner.fanout.lock().last_seq
    }

    /// Number of subscribers attached to one session.
    pub fn subscriber_count(&self, session_id: SessionId) -> usize {
        self.inner
            .topics
            .read()
            .get(&session_id)
            .map(|t| t.lock().subscribers.len())
            .unwrap_or(0)
    }

    fn next_id(&self) -> SubscriberId {
        SubscriberId(self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed))
    }

    /// Caller holds the topic lock; that is what orders one session's events.
    fn deliver(&self, topic: &mut Topic, session_id: SessionId, payload: Payload) -> u64 {
        let event = {
            let mut fanout = self.inner.fanout.lock();
            fanout.last_seq += 1;
            let event = StreamEvent {
                seq: fanout.last_seq,
                session_id,
                timestamp: Utc::now(),
                payload,
            };
            deliver_all(&mut fanout.subscribers, &event);
            event
        };
        deliver_all(&mut topic.subscribers, &event);
        event.seq
    }
}

fn deliver_all(subscribers: &mut Vec<Subscriber>, event: &StreamEvent) {
    subscribers.retain(|sub| match sub.queue.deliver(event.clone()) {
        Ok(()) => true,
        Err(DeliveryFault::QueueFull) => {
            tracing::warn!(
                subscriber = %sub.id,
                session = %event.session_id,
                seq = event.seq,
                "subscriber queue full, dropping subscriber"
            );
            false
        }
        Err(DeliveryFault::Disconnected) => {
            tracing::debug!(subscriber = %sub.id, "subscriber gone, removing");
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::event::EndReason;

    fn output(s: &'static str) -> Payload {
        Payload::Output(Bytes::from_static(s.as_bytes()))
    }

    fn ended() -> Payload {
        Payload::Ended {
            reason: EndReason::ProcessExit,
            exit_code: Some(0),
        }
    }

    fn data(event: &StreamEvent) -> &[u8] {
        match &event.payload {
            Payload::Output(b) => b,
            other => panic!("expected output, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_publish_to_unknown_session_is_noop() {
        let broker = Broker::new();
        assert_eq!(broker.publish(SessionId::new(), output("x")), None);
        assert_eq!(broker.last_seq(), 0);
    }

    #[tokio::test]
    async fn test_single_subscriber_receives_in_order() {
        let broker = Broker::new();
        let id = SessionId::new();
        broker.register(id);
        let (queue, mut rx) = SubscriberQueue::bounded(16);
        broker.subscribe(id, queue).unwrap();

        broker.publish(id, output("first"));
        broker.publish(id, output("second"));
        broker.publish(id, output("third"));

        assert_eq!(data(&rx.recv().await.unwrap()), b"first");
        assert_eq!(data(&rx.recv().await.unwrap()), b"second");
        assert_eq!(data(&rx.recv().await.unwrap()), b"third");
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let broker = Broker::new();
        let id = SessionId::new();
        broker.register(id);
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (queue, rx) = SubscriberQueue::bounded(16);
            broker.subscribe(id, queue).unwrap();
            receivers.push(rx);
        }

        let seq = broker.publish(id, output("broadcast")).unwrap();

        for rx in receivers.iter_mut() {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.seq, seq);
            assert_eq!(data(&event), b"broadcast");
        }
    }

    #[tokio::test]
    async fn test_no_replay_before_subscribe() {
        let broker = Broker::new();
        let id = SessionId::new();
        broker.register(id);
        broker.publish(id, output("early"));

        let (queue, mut rx) = SubscriberQueue::bounded(16);
        broker.subscribe(id, queue).unwrap();
        broker.publish(id, output("late"));

        assert_eq!(data(&rx.recv().await.unwrap()), b"late");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let broker = Broker::new();
        let a = SessionId::new();
        let b = SessionId::new();
        broker.register(a);
        broker.register(b);
        let (queue, mut rx) = SubscriberQueue::bounded(16);
        broker.subscribe(a, queue).unwrap();

        broker.publish(b, output("for b"));
        broker.publish(a, output("for a"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id, a);
        assert_eq!(data(&event), b"for a");
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_that_subscriber() {
        let broker = Broker::new();
        let id = SessionId::new();
        broker.register(id);
        let (slow, _slow_rx) = SubscriberQueue::bounded(1);
        let (fast, mut fast_rx) = SubscriberQueue::bounded(64);
        broker.subscribe(id, slow).unwrap();
        broker.subscribe(id, fast).unwrap();
        assert_eq!(broker.subscriber_count(id), 2);

        for _ in 0..10 {
            broker.publish(id, output("x"));
        }

        assert_eq!(broker.subscriber_count(id), 1);
        for _ in 0..10 {
            assert_eq!(data(&fast_rx.recv().await.unwrap()), b"x");
        }
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let broker = Broker::new();
        let id = SessionId::new();
        broker.register(id);
        let (queue, rx) = SubscriberQueue::bounded(4);
        broker.subscribe(id, queue).unwrap();
        drop(rx);

        broker.publish(id, output("x"));
        assert_eq!(broker.subscriber_count(id), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let broker = Broker::new();
        let id = SessionId::new();
        broker.register(id);
        let (queue, mut rx) = SubscriberQueue::bounded(4);
        let sub = broker.subscribe(id, queue).unwrap();

        assert!(broker.unsubscribe(&sub));
        assert!(!broker.unsubscribe(&sub));

        broker.publish(id, output("x"));
        assert!(rx.recv().await.is_none(), "queue closes once detached");
    }

    #[tokio::test]
    async fn test_close_delivers_final_event_then_detaches() {
        let broker = Broker::new();
        let id = SessionId::new();
        broker.register(id);
        let (queue, mut rx) = SubscriberQueue::bounded(16);
        broker.subscribe(id, queue).unwrap();

        broker.publish(id, output("bye"));
        assert!(broker.close(id, ended()).is_some());
        assert!(broker.close(id, ended()).is_none());
        assert!(broker.publish(id, output("ghost")).is_none());

        assert_eq!(data(&rx.recv().await.unwrap()), b"bye");
        assert!(rx.recv().await.unwrap().payload.is_terminal());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_after_close_fails() {
        let broker = Broker::new();
        let id = SessionId::new();
        broker.register(id);
        broker.close(id, ended());

        let (queue, _rx) = SubscriberQueue::bounded(4);
        assert!(broker.subscribe(id, queue).is_none());
        assert!(!broker.is_open(id));
    }

    #[tokio::test]
    async fn test_all_sessions_subscriber_sees_increasing_sequence() {
        let broker = Broker::new();
        let a = SessionId::new();
        let b = SessionId::new();
        broker.register(a);
        broker.register(b);
        broker.publish(a, output("before"));

        let (queue, mut rx) = SubscriberQueue::unbounded();
        let (_sub, watermark) = broker.subscribe_all(queue);
        assert_eq!(watermark, 1);

        for _ in 0..5 {
            broker.publish(a, output("a"));
            broker.publish(b, output("b"));
        }
        broker.close(b, ended());

        let mut last = watermark;
        for _ in 0..11 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.seq, last + 1);
            last = event.seq;
        }
    }

    #[tokio::test]
    async fn test_concurrent_publishers_keep_per_session_order() {
        let broker = Broker::new();
        let sessions: Vec<_> = (0..4).map(|_| SessionId::new()).collect();
        let mut receivers = Vec::new();
        for id in &sessions {
            broker.register(*id);
            let (queue, rx) = SubscriberQueue::bounded(1024);
            broker.subscribe(*id, queue).unwrap();
            receivers.push(rx);
        }

        let handles: Vec<_> = sessions
            .iter()
            .map(|id| {
                let broker = broker.clone();
                let id = *id;
                std::thread::spawn(move || {
                    for i in 0..200u32 {
                        broker.publish(id, Payload::Output(Bytes::from(i.to_string())));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for rx in receivers.iter_mut() {
            for i in 0..200u32 {
                let event = rx.recv().await.unwrap();
                assert_eq!(data(&event), i.to_string().as_bytes());
            }
        }
    }
}
