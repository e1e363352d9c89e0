//! `Batch` and the two ordered queues that hold it across its lifetime
//! (spec §3 "Batch", "Batch Queues").

use crate::cursor::Cursor;
use crate::pk_multiset::BatchId;
use serde_json::Value;
use std::collections::VecDeque;

/// A row payload ready for SMS delivery.
#[derive(Debug, Clone)]
pub struct Message {
    pub primary_key: crate::cursor::PrimaryKey,
    pub payload: Value,
    /// Set when the message is assigned for push (§4.4 step 6).
    pub commit_lsn: Option<i64>,
    pub commit_idx: Option<u64>,
}

/// An immutable-once-produced unit of work (spec §3).
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub cursor: Cursor,
    pub approximate_lsn: i64,
    pub messages: Vec<Message>,
    pub size: usize,
    /// Number of messages actually delivered to the SMS after PK-multiset
    /// filtering at flush time (spec §4.6.2 `check_sms` rows-ingested
    /// counter). Starts equal to `size` and is narrowed by `flush`.
    pub delivered: usize,
}

impl Batch {
    pub fn new(id: BatchId, cursor: Cursor, approximate_lsn: i64, messages: Vec<Message>) -> Self {
        let size = messages.len();
        Self {
            id,
            cursor,
            approximate_lsn,
            messages,
            size,
            delivered: size,
        }
    }

    /// Clear messages once flushed to SMS to reclaim memory, keeping `size`.
    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    pub fn set_delivered(&mut self, delivered: usize) {
        self.delivered = delivered;
    }
}

/// The two ordered sequences of in-flight batches (spec §3 invariant 6:
/// `|unflushed| + |flushed| <= max_batches_in_memory`, default 3).
#[derive(Debug, Default)]
pub struct BatchQueues {
    pub unflushed: VecDeque<Batch>,
    pub flushed: VecDeque<Batch>,
    max_in_memory: usize,
}

impl BatchQueues {
    pub fn new(max_in_memory: usize) -> Self {
        Self {
            unflushed: VecDeque::new(),
            flushed: VecDeque::new(),
            max_in_memory,
        }
    }

    pub fn depth(&self) -> usize {
        self.unflushed.len() + self.flushed.len()
    }

    pub fn is_at_capacity(&self) -> bool {
        self.depth() >= self.max_in_memory
    }

    pub fn is_empty(&self) -> bool {
        self.unflushed.is_empty() && self.flushed.is_empty()
    }

    /// Strictly increasing in keyset order (spec §3 invariant 4).
    pub fn push_unflushed(&mut self, batch: Batch) {
        debug_assert!(
            self.unflushed
                .back()
                .map(|b| b.cursor.is_strictly_before(&batch.cursor))
                .unwrap_or(true),
            "unflushed batches must be strictly increasing in keyset order"
        );
        self.unflushed.push_back(batch);
    }

    pub fn head_unflushed(&self) -> Option<&Batch> {
        self.unflushed.front()
    }

    pub fn pop_head_unflushed(&mut self) -> Option<Batch> {
        self.unflushed.pop_front()
    }

    pub fn move_head_to_flushed(&mut self, mut batch: Batch) {
        batch.clear_messages();
        self.flushed.push_back(batch);
    }

    pub fn contains_flushed(&self, batch_id: BatchId) -> bool {
        self.flushed.iter().any(|b| b.id == batch_id)
    }

    /// Drop flushed batches whose ids are no longer in `unpersisted_ids`, in
    /// queue order, returning them so the caller can persist their cursor
    /// and update counters (spec §4.6.2 `check_sms`).
    pub fn drain_committed(&mut self, unpersisted_ids: &[BatchId]) -> Vec<Batch> {
        let mut committed = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some(batch) = self.flushed.pop_front() {
            if unpersisted_ids.contains(&batch.id) {
                remaining.push_back(batch);
            } else {
                committed.push(batch);
            }
        }
        self.flushed = remaining;
        committed
    }
}
