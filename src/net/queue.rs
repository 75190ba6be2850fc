//! Bounded offline queue for outbound messages.
//!
//! While the broker is unreachable, publishes land here and drain FIFO
//! on reconnect, ahead of any fresh publish. Overflow drops the oldest
//! entry — except that critical entries (error events the controller
//! must see) evict the oldest non-critical instead of being dropped.

use crate::net::QoS;
use crate::topics::TOPIC_CAP;

/// Queue capacity. Sized for a few minutes of telemetry at the default
/// cadences.
pub const QUEUE_CAP: usize = 128;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub topic: heapless::String<TOPIC_CAP>,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub critical: bool,
}

/// Fixed-capacity FIFO with critical-aware eviction.
pub struct OfflineQueue {
    slots: [Option<QueuedMessage>; QUEUE_CAP],
    head: usize,
    len: usize,
    evicted: u32,
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            head: 0,
            len: 0,
            evicted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Messages evicted by overflow since boot.
    pub fn evicted(&self) -> u32 {
        self.evicted
    }

    /// Enqueue a message, applying the overflow policy when full.
    /// Returns false if the message had to be dropped (queue full of
    /// criticals and the newcomer is not critical).
    pub fn push(&mut self, msg: QueuedMessage) -> bool {
        if self.len == QUEUE_CAP {
            let victim = if msg.critical {
                // Criticals displace the oldest non-critical; when even
                // those are all critical, age wins.
                self.oldest_matching(|m| !m.critical)
                    .or_else(|| Some(self.head))
            } else {
                self.oldest_matching(|m| !m.critical)
            };

            match victim {
                Some(index) => {
                    self.remove_at(index);
                    self.evicted = self.evicted.saturating_add(1);
                }
                None => {
                    self.evicted = self.evicted.saturating_add(1);
                    return false;
                }
            }
        }

        let tail = (self.head + self.len) % QUEUE_CAP;
        self.slots[tail] = Some(msg);
        self.len += 1;
        true
    }

    /// Put a message back at the head (drain restoration after a mid-
    /// flight publish failure). Fails only when the queue is full.
    pub fn push_front(&mut self, msg: QueuedMessage) -> bool {
        if self.len == QUEUE_CAP {
            return false;
        }
        self.head = (self.head + QUEUE_CAP - 1) % QUEUE_CAP;
        self.slots[self.head] = Some(msg);
        self.len += 1;
        true
    }

    /// Dequeue the oldest message.
    pub fn pop(&mut self) -> Option<QueuedMessage> {
        if self.len == 0 {
            return None;
        }
        let msg = self.slots[self.head].take();
        self.head = (self.head + 1) % QUEUE_CAP;
        self.len -= 1;
        msg
    }

    /// Index (into `slots`) of the oldest entry satisfying `pred`.
    fn oldest_matching(&self, pred: impl Fn(&QueuedMessage) -> bool) -> Option<usize> {
        for offset in 0..self.len {
            let index = (self.head + offset) % QUEUE_CAP;
            if self.slots[index].as_ref().is_some_and(&pred) {
                return Some(index);
            }
        }
        None
    }

    /// Remove the entry at `index`, compacting toward the head so FIFO
    /// order of the survivors is preserved.
    fn remove_at(&mut self, index: usize) {
        let mut current = index;
        while current != self.head {
            let prev = (current + QUEUE_CAP - 1) % QUEUE_CAP;
            self.slots[current] = self.slots[prev].take();
            current = prev;
        }
        self.slots[self.head] = None;
        self.head = (self.head + 1) % QUEUE_CAP;
        self.len -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(tag: u8, critical: bool) -> QueuedMessage {
        let mut topic = heapless::String::new();
        let _ = topic.push_str("t");
        QueuedMessage {
            topic,
            payload: vec![tag],
            qos: QoS::AtLeastOnce,
            critical,
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let mut q = OfflineQueue::new();
        for i in 0..5u8 {
            assert!(q.push(msg(i, false)));
        }
        for i in 0..5u8 {
            assert_eq!(q.pop().unwrap().payload, vec![i]);
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut q = OfflineQueue::new();
        for i in 0..=QUEUE_CAP as u16 {
            q.push(msg((i % 256) as u8, false));
        }
        assert_eq!(q.len(), QUEUE_CAP);
        assert_eq!(q.evicted(), 1);
        // Entry 0 was evicted; entry 1 is now oldest.
        assert_eq!(q.pop().unwrap().payload, vec![1]);
    }

    #[test]
    fn critical_evicts_oldest_non_critical() {
        let mut q = OfflineQueue::new();
        q.push(msg(0, true));
        q.push(msg(1, false));
        for i in 2..QUEUE_CAP as u16 {
            q.push(msg((i % 256) as u8, false));
        }
        assert_eq!(q.len(), QUEUE_CAP);

        // Non-critical overflow must not displace the critical head.
        q.push(msg(200, false));
        assert_eq!(q.pop().unwrap().payload, vec![0], "critical survived");

        // Refill and push a critical: it also evicts oldest non-critical.
        let mut q = OfflineQueue::new();
        q.push(msg(0, false));
        for i in 1..QUEUE_CAP as u16 {
            q.push(msg((i % 256) as u8, true));
        }
        q.push(msg(99, true));
        let first = q.pop().unwrap();
        assert!(first.critical, "non-critical head should have been evicted");
    }

    #[test]
    fn full_of_criticals_drops_non_critical_newcomer() {
        let mut q = OfflineQueue::new();
        for i in 0..QUEUE_CAP as u16 {
            q.push(msg((i % 256) as u8, true));
        }
        assert!(!q.push(msg(42, false)), "newcomer should be dropped");
        assert_eq!(q.len(), QUEUE_CAP);
    }

    #[test]
    fn full_of_criticals_critical_newcomer_wins_by_age() {
        let mut q = OfflineQueue::new();
        for i in 0..QUEUE_CAP as u16 {
            q.push(msg((i % 256) as u8, true));
        }
        assert!(q.push(msg(42, true)));
        // Oldest critical (tag 0) gone; tag 1 is the new head.
        assert_eq!(q.pop().unwrap().payload, vec![1]);
    }
}
