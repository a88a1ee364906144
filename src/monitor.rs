//! Monitor aggregator: a bounded, sequence-ordered history of everything
//! published across all sessions.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::broker::{Broker, SubscriberQueue, Subscription};
use crate::event::{HistoryEntry, StreamEvent};

struct Ring {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl Ring {
    fn push(&mut self, entry: HistoryEntry) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn since(&self, since: Option<u64>) -> Vec<HistoryEntry> {
        let since = since.unwrap_or(0);
        // Sorted by seq, so skip the prefix at or below the watermark.
        let start = self.entries.partition_point(|e| e.seq <= since);
        self.entries.range(start..).cloned().collect()
    }
}

/// Subscribes to every session when constructed and keeps the newest
/// `capacity` entries.
#[derive(Clone)]
pub struct MonitorAggregator {
    broker: Broker,
    ring: Arc<Mutex<Ring>>,
    /// Highest sequence number folded into the ring so far.
    applied: watch::Receiver<u64>,
    subscription: Subscription,
}

impl MonitorAggregator {
    /// Must be called inside a tokio runtime; the drain task is spawned here.
    pub fn new(broker: &Broker, capacity: usize) -> Self {
        let (queue, rx) = SubscriberQueue::unbounded();
        let (subscription, start_seq) = broker.subscribe_all(queue);
        let ring = Arc::new(Mutex::new(Ring {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }));
        let (applied_tx, applied) = watch::channel(start_seq);
        tokio::spawn(drain(rx, ring.clone(), applied_tx));
        tracing::debug!(capacity, start_seq, "monitor aggregator subscribed");
        Self {
            broker: broker.clone(),
            ring,
            applied,
            subscription,
        }
    }

    /// Entries with a sequence number above `since`, oldest first.
    ///
    /// Waits until everything published before the call has been folded in,
    /// so a caller never misses an entry it already knows exists.
    pub async fn request_history(&self, since: Option<u64>) -> Vec<HistoryEntry> {
        let target = self.broker.last_seq();
        let mut applied = self.applied.clone();
        // Err means the drain task is gone; serve what we have.
        let _ = applied.wait_for(|seq| *seq >= target).await;
        self.ring.lock().since(since)
    }

    /// A fresh all-sessions queue for one monitor client.
    pub fn subscribe_live(&self, capacity: usize) -> (Subscription, mpsc::Receiver<StreamEvent>) {
        let (queue, rx) = SubscriberQueue::bounded(capacity);
        let (subscription, _) = self.broker.subscribe_all(queue);
        (subscription, rx)
    }

    pub fn unsubscribe_live(&self, subscription: &Subscription) {
        self.broker.unsubscribe(subscription);
    }

    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop aggregating. The history collected so far stays readable.
    pub fn detach(&self) {
        self.broker.unsubscribe(&self.subscription);
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<StreamEvent>,
    ring: Arc<Mutex<Ring>>,
    applied: watch::Sender<u64>,
) {
    while let Some(event) = rx.recv().await {
        let seq = event.seq;
        ring.lock().push(event);
        applied.send_replace(seq);
    }
    tracing::debug!("monitor aggregator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Payload, SessionId};
    use bytes::Bytes;

    fn chunk(i: usize) -> Payload {
        Payload::Output(Bytes::from(format!("line {i}\n")))
    }

    #[tokio::test]
    async fn history_empty_when_nothing_published() {
        let broker = Broker::new();
        let monitor = MonitorAggregator::new(&broker, 10);
        assert!(monitor.request_history(None).await.is_empty());
    }

    #[tokio::test]
    async fn history_includes_everything_published_before_request() {
        let broker = Broker::new();
        let monitor = MonitorAggregator::new(&broker, 100);
        let id = SessionId::new();
        broker.register(id);
        for i in 0..20 {
            broker.publish(id, chunk(i));
        }
        let history = monitor.request_history(None).await;
        assert_eq!(history.len(), 20);
        assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn history_respects_watermark() {
        let broker = Broker::new();
        let monitor = MonitorAggregator::new(&broker, 100);
        let id = SessionId::new();
        broker.register(id);
        let seqs: Vec<u64> = (0..5).filter_map(|i| broker.publish(id, chunk(i))).collect();

        let after = monitor.request_history(Some(seqs[2])).await;
        let got: Vec<u64> = after.iter().map(|e| e.seq).collect();
        assert_eq!(got, seqs[3..].to_vec());

        assert!(monitor.request_history(Some(seqs[4])).await.is_empty());
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_first() {
        let broker = Broker::new();
        let monitor = MonitorAggregator::new(&broker, 3);
        let id = SessionId::new();
        broker.register(id);
        for i in 0..10 {
            broker.publish(id, chunk(i));
        }
        let history = monitor.request_history(None).await;
        let seqs: Vec<u64> = history.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
        assert_eq!(monitor.len(), 3);
    }

    #[tokio::test]
    async fn repeated_request_is_stable() {
        let broker = Broker::new();
        let monitor = MonitorAggregator::new(&broker, 50);
        let id = SessionId::new();
        broker.register(id);
        for i in 0..7 {
            broker.publish(id, chunk(i));
        }
        let first: Vec<u64> = monitor.request_history(None).await.iter().map(|e| e.seq).collect();
        let second: Vec<u64> = monitor.request_history(None).await.iter().map(|e| e.seq).collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn live_subscribers_are_independent() {
        let broker = Broker::new();
        let monitor = MonitorAggregator::new(&broker, 10);
        let id = SessionId::new();
        broker.register(id);
        let (sub_a, mut a) = monitor.subscribe_live(8);
        let (_sub_b, mut b) = monitor.subscribe_live(8);

        broker.publish(id, chunk(0));
        monitor.unsubscribe_live(&sub_a);
        broker.publish(id, chunk(1));

        assert_eq!(a.recv().await.unwrap().seq, 1);
        assert!(a.recv().await.is_none());
        assert_eq!(b.recv().await.unwrap().seq, 1);
        assert_eq!(b.recv().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn detach_freezes_history() {
        let broker = Broker::new();
        let monitor = MonitorAggregator::new(&broker, 10);
        let id = SessionId::new();
        broker.register(id);
        broker.publish(id, chunk(0));
        assert_eq!(monitor.request_history(None).await.len(), 1);
        monitor.detach();
        broker.publish(id, chunk(1));
        // The barrier gives up once the drain task has exited.
        let history = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            monitor.request_history(None),
        )
        .await
        .expect("history after detach should not hang");
        assert_eq!(history.len(), 1);
    }
}
