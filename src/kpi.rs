//! Single-producer, multi-subscriber KPI publisher with a bounded,
//! drop-oldest ring buffer. Subscribers consume lazily and must not block
//! the producer; overflow silently drops the oldest queued item for that
//! subscriber. No reactive framework is introduced — this is a
//! from-scratch primitive, a `Mutex`-guarded shared sink generalized to
//! many readers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::tensor::Tensor;

pub const DEFAULT_CAPACITY: usize = 1000;

/// One KPI event: a step's worth of named tensors.
pub type KpiEvent = BTreeMap<String, Tensor>;

struct Inner {
    capacity: usize,
    subscribers: Vec<Arc<Mutex<VecDeque<KpiEvent>>>>,
    closed: bool,
}

/// The producer handle, owned exclusively by the Agent/BatchTrainer that
/// emits KPI events.
#[derive(Clone)]
pub struct KpiPublisher {
    inner: Arc<Mutex<Inner>>,
}

pub struct KpiSubscriber {
    queue: Arc<Mutex<VecDeque<KpiEvent>>>,
}

impl KpiPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                capacity,
                subscribers: Vec::new(),
                closed: false,
            })),
        }
    }

    pub fn subscribe(&self) -> KpiSubscriber {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.push(queue.clone());
        KpiSubscriber { queue }
    }

    /// Publish an event to every subscriber; publish errors (a poisoned
    /// subscriber mutex) are swallowed, never fatal.
    pub fn publish(&self, event: KpiEvent) {
        let inner = match self.inner.lock() {
            Ok(i) => i,
            Err(_) => return,
        };
        if inner.closed {
            return;
        }
        for sub in &inner.subscribers {
            if let Ok(mut q) = sub.lock() {
                if q.len() >= inner.capacity {
                    q.pop_front();
                }
                q.push_back(event.clone());
            }
        }
    }

    /// Close the publisher; closed publishers silently drop further
    /// `publish` calls.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
    }
}

impl KpiSubscriber {
    /// Drain all events currently queued for this subscriber.
    pub fn drain(&self) -> Vec<KpiEvent> {
        let mut q = self.queue.lock().unwrap();
        q.drain(..).collect()
    }

    pub fn try_recv(&self) -> Option<KpiEvent> {
        self.queue.lock().unwrap().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_receives_published_events() {
        let publisher = KpiPublisher::new(DEFAULT_CAPACITY);
        let sub = publisher.subscribe();
        let mut event = KpiEvent::new();
        event.insert("reward".to_string(), Tensor::new(vec![1], vec![1.0]));
        publisher.publish(event);
        let drained = sub.drain();
        assert_eq!(drained.len(), 1);
    }

    #[test]
    fn overflow_drops_oldest() {
        let publisher = KpiPublisher::new(2);
        let sub = publisher.subscribe();
        for i in 0..3 {
            let mut event = KpiEvent::new();
            event.insert("i".to_string(), Tensor::new(vec![1], vec![i as f32]));
            publisher.publish(event);
        }
        let drained = sub.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0]["i"].data(), &[1.0]);
        assert_eq!(drained[1]["i"].data(), &[2.0]);
    }

    #[test]
    fn closed_publisher_drops_events() {
        let publisher = KpiPublisher::new(DEFAULT_CAPACITY);
        let sub = publisher.subscribe();
        publisher.close();
        publisher.publish(KpiEvent::new());
        assert!(sub.drain().is_empty());
    }
}
