//! Slot Message Store (SMS) interface (spec §1 "out of scope", §6).

pub mod client;
pub mod http;

use crate::batch::Message;
use crate::error::AppResult;
use crate::pk_multiset::BatchId;
use async_trait::async_trait;

/// Outcome of a single `push` attempt (spec §4.5).
#[derive(Debug)]
pub enum PushOutcome {
    Ok,
    PayloadTooLarge,
}

#[async_trait]
pub trait Sms: Send + Sync {
    async fn put_table_reader_batch(
        &self,
        consumer_id: &str,
        messages: &[Message],
        batch_id: BatchId,
    ) -> AppResult<PushOutcome>;

    async fn unpersisted_table_reader_batch_ids(
        &self,
        consumer_id: &str,
    ) -> AppResult<Vec<BatchId>>;

    async fn count_messages(&self, consumer_id: &str) -> AppResult<u64>;

    /// Whether the SMS process this worker monitors is still alive (spec
    /// §4.6.1 "monitor the SMS process").
    async fn is_alive(&self) -> bool;
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        pushed: Vec<Message>,
        unpersisted: HashSet<BatchId>,
        pending_count: u64,
        alive: bool,
        fail_next_n_with_payload_too_large: usize,
        fail_next_with_fatal: bool,
    }

    /// In-memory SMS used across the owner-loop integration tests.
    pub struct FakeSms {
        state: Mutex<State>,
    }

    impl Default for FakeSms {
        fn default() -> Self {
            Self {
                state: Mutex::new(State {
                    alive: true,
                    ..Default::default()
                }),
            }
        }
    }

    impl FakeSms {
        pub fn set_pending_count(&self, n: u64) {
            self.state.lock().unwrap().pending_count = n;
        }

        pub fn set_alive(&self, alive: bool) {
            self.state.lock().unwrap().alive = alive;
        }

        pub fn fail_next_push_with_payload_too_large(&self, n: usize) {
            self.state.lock().unwrap().fail_next_n_with_payload_too_large = n;
        }

        pub fn fail_next_push_fatally(&self) {
            self.state.lock().unwrap().fail_next_with_fatal = true;
        }

        pub fn pushed_messages(&self) -> Vec<Message> {
            self.state.lock().unwrap().pushed.clone()
        }
    }

    #[async_trait]
    impl Sms for FakeSms {
        async fn put_table_reader_batch(
            &self,
            _consumer_id: &str,
            messages: &[Message],
            batch_id: BatchId,
        ) -> AppResult<PushOutcome> {
            let mut state = self.state.lock().unwrap();
            if state.fail_next_with_fatal {
                state.fail_next_with_fatal = false;
                return Err(crate::error::AppError::SmsFatal("simulated".into()));
            }
            if state.fail_next_n_with_payload_too_large > 0 {
                state.fail_next_n_with_payload_too_large -= 1;
                return Ok(PushOutcome::PayloadTooLarge);
            }
            state.pushed.extend(messages.iter().cloned());
            state.unpersisted.insert(batch_id);
            Ok(PushOutcome::Ok)
        }

        async fn unpersisted_table_reader_batch_ids(
            &self,
            _consumer_id: &str,
        ) -> AppResult<Vec<BatchId>> {
            Ok(self.state.lock().unwrap().unpersisted.iter().copied().collect())
        }

        async fn count_messages(&self, _consumer_id: &str) -> AppResult<u64> {
            Ok(self.state.lock().unwrap().pending_count)
        }

        async fn is_alive(&self) -> bool {
            self.state.lock().unwrap().alive
        }
    }

    impl FakeSms {
        /// Mark a batch as committed (removed from the unpersisted set), as
        /// if the SMS had flushed it to its own durable store.
        pub fn mark_committed(&self, batch_id: BatchId) {
            self.state.lock().unwrap().unpersisted.remove(&batch_id);
        }
    }
}
