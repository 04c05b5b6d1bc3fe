//! Per-recipient FIFOs for messages whose next hop is not known yet.
//!
//! The queue is bounded globally: when an insert would exceed the cap, the
//! resident message with the smallest expiry anywhere in the queue is evicted
//! first. Expired messages are discarded lazily on dequeue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::message::{now_ms, ImmutableMessage};

/// Bounded store of undeliverable messages, keyed by recipient.
#[derive(Debug)]
pub struct MessageQueue {
    queues: HashMap<String, VecDeque<Arc<ImmutableMessage>>>,
    limit: usize,
    len: usize,
}

impl MessageQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            queues: HashMap::new(),
            limit,
            len: 0,
        }
    }

    /// Total number of queued messages.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `message` for `recipient`, evicting the lowest-TTL resident
    /// message first if the global cap would be exceeded.
    ///
    /// Returns the evicted message, if any.
    pub fn queue_message(
        &mut self,
        recipient: &str,
        message: Arc<ImmutableMessage>,
    ) -> Option<Arc<ImmutableMessage>> {
        let evicted = if self.len >= self.limit {
            self.evict_earliest_expiry()
        } else {
            None
        };
        self.queues
            .entry(recipient.to_owned())
            .or_default()
            .push_back(message);
        self.len += 1;
        evicted
    }

    /// Pop the next live message for `recipient`.
    ///
    /// Expired heads are silently discarded along the way.
    pub fn get_next_message_for(&mut self, recipient: &str) -> Option<Arc<ImmutableMessage>> {
        let now = now_ms();
        let queue = self.queues.get_mut(recipient)?;
        let mut next = None;
        while let Some(message) = queue.pop_front() {
            self.len -= 1;
            if message.is_expired_at(now) {
                log::trace!(
                    "[MessageQueue] dropping expired message {} for {recipient}",
                    message.id()
                );
                continue;
            }
            next = Some(message);
            break;
        }
        if queue.is_empty() {
            self.queues.remove(recipient);
        }
        next
    }

    /// Remove a specific message, identified by id, from a recipient's FIFO.
    ///
    /// Used by the router's TTL watcher to take back a message it parked.
    pub fn remove_message(
        &mut self,
        recipient: &str,
        message_id: &str,
    ) -> Option<Arc<ImmutableMessage>> {
        let queue = self.queues.get_mut(recipient)?;
        let position = queue.iter().position(|m| m.id() == message_id)?;
        let message = queue.remove(position)?;
        self.len -= 1;
        if queue.is_empty() {
            self.queues.remove(recipient);
        }
        Some(message)
    }

    fn evict_earliest_expiry(&mut self) -> Option<Arc<ImmutableMessage>> {
        // Linear scan: the global cap bounds the cost.
        let recipient = {
            let mut best: Option<(&String, i64)> = None;
            for (recipient, queue) in &self.queues {
                for message in queue {
                    let expiry = message.expiry_date_ms();
                    if best.is_none_or(|(_, current)| expiry < current) {
                        best = Some((recipient, expiry));
                    }
                }
            }
            best.map(|(recipient, _)| recipient.clone())?
        };
        let queue = self.queues.get_mut(&recipient)?;
        let position = {
            let mut min_index = 0;
            let mut min_expiry = i64::MAX;
            for (index, message) in queue.iter().enumerate() {
                if message.expiry_date_ms() < min_expiry {
                    min_expiry = message.expiry_date_ms();
                    min_index = index;
                }
            }
            min_index
        };
        let evicted = queue.remove(position)?;
        self.len -= 1;
        if queue.is_empty() {
            self.queues.remove(&recipient);
        }
        log::warn!(
            "[MessageQueue] queue limit {} reached, evicting message {} (expiry {})",
            self.limit,
            evicted.id(),
            evicted.expiry_date_ms()
        );
        Some(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, MutableMessage};

    fn message_for(recipient: &str, ttl_ms: i64) -> Arc<ImmutableMessage> {
        let mut builder = MutableMessage::new();
        builder
            .set_sender("sender")
            .set_recipient(recipient)
            .set_type(MessageType::Request)
            .set_ttl_ms(ttl_ms);
        builder.immutable().unwrap()
    }

    #[test]
    fn test_initially_empty() {
        let queue = MessageQueue::new(10);
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_and_dequeue_per_recipient() {
        let mut queue = MessageQueue::new(10);
        let m1 = message_for("alpha", 10_000);
        let m2 = message_for("beta", 10_000);
        queue.queue_message("alpha", Arc::clone(&m1));
        queue.queue_message("beta", Arc::clone(&m2));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get_next_message_for("alpha").unwrap().id(), m1.id());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get_next_message_for("beta").unwrap().id(), m2.id());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_order_within_recipient() {
        let mut queue = MessageQueue::new(10);
        let first = message_for("r", 10_000);
        let second = message_for("r", 10_000);
        queue.queue_message("r", Arc::clone(&first));
        queue.queue_message("r", Arc::clone(&second));
        assert_eq!(queue.get_next_message_for("r").unwrap().id(), first.id());
        assert_eq!(queue.get_next_message_for("r").unwrap().id(), second.id());
    }

    #[test]
    fn test_unknown_recipient_returns_none() {
        let mut queue = MessageQueue::new(10);
        assert!(queue.get_next_message_for("nobody").is_none());
    }

    #[test]
    fn test_cap_evicts_smallest_expiry_across_recipients() {
        let mut queue = MessageQueue::new(3);
        let short = message_for("a", 1_000);
        let medium = message_for("b", 50_000);
        let long = message_for("c", 100_000);
        queue.queue_message("a", Arc::clone(&short));
        queue.queue_message("b", Arc::clone(&medium));
        queue.queue_message("c", Arc::clone(&long));

        let newcomer = message_for("d", 70_000);
        let evicted = queue.queue_message("d", newcomer).expect("one eviction");
        assert_eq!(evicted.id(), short.id(), "smallest expiry must go first");
        assert_eq!(queue.len(), 3);
        assert!(queue.get_next_message_for("a").is_none());
    }

    #[test]
    fn test_cap_holds_after_every_operation() {
        let mut queue = MessageQueue::new(2);
        for i in 0..10 {
            queue.queue_message(&format!("r{i}"), message_for(&format!("r{i}"), 10_000 + i));
            assert!(queue.len() <= 2);
        }
    }

    #[test]
    fn test_expired_head_discarded_on_dequeue() {
        let mut queue = MessageQueue::new(10);
        let mut builder = MutableMessage::new();
        builder
            .set_recipient("r")
            .set_type(MessageType::Request)
            .set_ttl_ms(20);
        let expired = builder.immutable().unwrap();
        let live = message_for("r", 10_000);
        queue.queue_message("r", expired);
        queue.queue_message("r", Arc::clone(&live));

        std::thread::sleep(std::time::Duration::from_millis(40));
        let next = queue.get_next_message_for("r").unwrap();
        assert_eq!(next.id(), live.id());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_message_by_id() {
        let mut queue = MessageQueue::new(10);
        let m1 = message_for("r", 10_000);
        let m2 = message_for("r", 10_000);
        queue.queue_message("r", Arc::clone(&m1));
        queue.queue_message("r", Arc::clone(&m2));

        let removed = queue.remove_message("r", m1.id()).unwrap();
        assert_eq!(removed.id(), m1.id());
        assert_eq!(queue.len(), 1);
        assert!(queue.remove_message("r", m1.id()).is_none());
    }
}
