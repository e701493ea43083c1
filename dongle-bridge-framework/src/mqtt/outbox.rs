//! Messages accepted for delivery but not yet acknowledged by a broker.
//!
//! The outbox belongs to the middleware, not to a broker session, so it
//! survives link loss and fail-over. When full, the oldest message is
//! evicted to make room.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rumqttc::QoS;
use tokio::sync::Notify;

/// One publish request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain,
        }
    }
}

pub(crate) struct Outbox {
    queue: Mutex<VecDeque<Message>>,
    capacity: usize,
    ready: Notify,
    evicted: AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            ready: Notify::new(),
            evicted: AtomicU64::new(0),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Message>> {
        // Critical sections never panic, so the data is consistent.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message, evicting the oldest ones if the outbox is full.
    ///
    /// Returns how many messages were evicted.
    pub fn push(&self, message: Message) -> usize {
        let evicted = {
            let mut queue = self.queue();
            let mut evicted = 0;
            while queue.len() >= self.capacity {
                queue.pop_front();
                evicted += 1;
            }
            queue.push_back(message);
            evicted
        };
        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        self.ready.notify_one();
        evicted
    }

    /// Put messages back at the head, keeping their order.
    pub fn requeue<I>(&self, messages: I)
    where
        I: IntoIterator<Item = Message>,
        I::IntoIter: DoubleEndedIterator,
    {
        let mut queue = self.queue();
        for message in messages.into_iter().rev() {
            queue.push_front(message);
        }
        if !queue.is_empty() {
            self.ready.notify_one();
        }
    }

    pub fn pop(&self) -> Option<Message> {
        self.queue().pop_front()
    }

    /// Wait for the next message.
    ///
    /// Cancel-safe: a message is only removed when the future completes.
    pub async fn next(&self) -> Message {
        loop {
            if let Some(message) = self.pop() {
                return message;
            }
            self.ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Messages evicted since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn message(n: u8) -> Message {
        Message::new("icu/data/d/rad8", vec![n], QoS::AtLeastOnce, false)
    }

    #[test]
    fn test_full_outbox_evicts_oldest() {
        let outbox = Outbox::new(3);
        for n in 0..5 {
            outbox.push(message(n));
        }

        assert_eq!(outbox.len(), 3);
        assert_eq!(outbox.evicted(), 2);
        assert_eq!(outbox.pop(), Some(message(2)));
    }

    #[test]
    fn test_requeue_keeps_order_ahead_of_pending() {
        let outbox = Outbox::new(10);
        outbox.push(message(3));
        outbox.requeue(vec![message(1), message(2)]);

        let drained: Vec<_> = std::iter::from_fn(|| outbox.pop()).collect();
        assert_eq!(drained, vec![message(1), message(2), message(3)]);
    }

    #[tokio::test]
    async fn test_next_waits_for_push() {
        let outbox = std::sync::Arc::new(Outbox::new(4));
        let waiter = tokio::spawn({
            let outbox = outbox.clone();
            async move { outbox.next().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        outbox.push(message(7));
        let received = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, message(7));
    }
}
