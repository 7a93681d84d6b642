//! Priority queue with FIFO tiers and aging.
//!
//! Each priority tier is a FIFO. `pop` compares only the tier heads: a
//! message's effective tier is its admitted tier minus one for every full
//! `aging_interval` it has waited, floored at Critical. Ties go to the
//! lower sequence number, so order within equal effective priority is
//! strictly first-in first-out.

use std::collections::VecDeque;
use trustgate_core::{Priority, SecureMessage};

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub seq: u64,
    pub message: SecureMessage,
    /// Priority at admission, after trust and rate policies
    pub priority: Priority,
    pub enqueued_at: u64,
}

impl QueuedMessage {
    fn effective_tier(&self, now_ms: u64, aging_interval_ms: u64) -> usize {
        if aging_interval_ms == 0 {
            return self.priority.tier();
        }
        let promotions = now_ms.saturating_sub(self.enqueued_at) / aging_interval_ms;
        self.priority
            .tier()
            .saturating_sub(promotions.min(usize::MAX as u64) as usize)
    }

    /// Priority after aging.
    pub fn effective_priority(&self, now_ms: u64, aging_interval_ms: u64) -> Priority {
        Priority::from_tier(self.effective_tier(now_ms, aging_interval_ms))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull;

pub struct PriorityQueue {
    tiers: [VecDeque<QueuedMessage>; 4],
    next_seq: u64,
    max_depth: usize,
    aging_interval_ms: u64,
}

impl PriorityQueue {
    pub fn new(max_depth: usize, aging_interval_ms: u64) -> Self {
        Self {
            tiers: Default::default(),
            next_seq: 0,
            max_depth,
            aging_interval_ms,
        }
    }

    pub fn push(
        &mut self,
        message: SecureMessage,
        priority: Priority,
        now_ms: u64,
    ) -> Result<u64, QueueFull> {
        if self.len() >= self.max_depth {
            return Err(QueueFull);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tiers[priority.tier()].push_back(QueuedMessage {
            seq,
            message,
            priority,
            enqueued_at: now_ms,
        });
        Ok(seq)
    }

    /// Remove the message with the lowest (effective tier, seq).
    pub fn pop(&mut self, now_ms: u64) -> Option<QueuedMessage> {
        let aging = self.aging_interval_ms;
        let tier = self
            .tiers
            .iter()
            .enumerate()
            .filter_map(|(tier, queue)| {
                queue
                    .front()
                    .map(|head| ((head.effective_tier(now_ms, aging), head.seq), tier))
            })
            .min()
            .map(|(_, tier)| tier)?;
        self.tiers[tier].pop_front()
    }

    /// Remove every message whose deadline has passed.
    pub fn sweep_expired(&mut self, now_ms: u64) -> Vec<QueuedMessage> {
        let mut expired = Vec::new();
        for queue in self.tiers.iter_mut() {
            if !queue.iter().any(|q| q.message.is_expired(now_ms)) {
                continue;
            }
            let (dead, live): (VecDeque<_>, VecDeque<_>) = queue
                .drain(..)
                .partition(|q| q.message.is_expired(now_ms));
            *queue = live;
            expired.extend(dead);
        }
        expired.sort_by_key(|q| q.seq);
        expired
    }

    pub fn cancel(&mut self, message_id: &str) -> Option<QueuedMessage> {
        for queue in self.tiers.iter_mut() {
            if let Some(pos) = queue.iter().position(|q| q.message.message_id == message_id) {
                return queue.remove(pos);
            }
        }
        None
    }

    #[cfg(test)]
    fn contains(&self, message_id: &str) -> bool {
        self.tiers
            .iter()
            .any(|queue| queue.iter().any(|q| q.message.message_id == message_id))
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    /// Queue depth per tier, Critical first.
    #[cfg(test)]
    fn depths(&self) -> [usize; 4] {
        [
            self.tiers[0].len(),
            self.tiers[1].len(),
            self.tiers[2].len(),
            self.tiers[3].len(),
        ]
    }
}
