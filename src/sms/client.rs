//! Push-with-retry wrapper around an `Sms` implementation, grounded on the
//! teacher's `db/writer.rs::write_batch_with_retry` retry loop but
//! generalized from a fixed linear backoff to the bounded exponential
//! envelope spec'd for SMS pushes: start at 50 ms, double each attempt,
//! cap any single wait at 1 s, give up once 1 minute of total elapsed
//! retrying has passed.

use crate::batch::Message;
use crate::error::{AppError, AppResult};
use crate::pk_multiset::BatchId;
use crate::sms::{PushOutcome, Sms};
use std::time::{Duration, Instant};
use tokio_retry::strategy::{jitter, ExponentialBackoff};

const INITIAL_BACKOFF_MS: u64 = 50;
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const MAX_TOTAL_ELAPSED: Duration = Duration::from_secs(60);

/// Pushes `messages` to the SMS under `consumer_id`, retrying a
/// payload-too-large response with jittered exponential backoff until it
/// either succeeds or the total elapsed retry time exceeds a minute, in
/// which case it gives up with `AppError::SmsPayloadTooLarge`. Any other
/// error is surfaced immediately, with no retry.
pub async fn push_with_retry(
    sms: &dyn Sms,
    consumer_id: &str,
    messages: &[Message],
    batch_id: BatchId,
) -> AppResult<PushOutcome> {
    let started = Instant::now();
    let mut backoff = ExponentialBackoff::from_millis(2)
        .factor(INITIAL_BACKOFF_MS)
        .max_delay(MAX_BACKOFF)
        .map(jitter);

    loop {
        match sms.put_table_reader_batch(consumer_id, messages, batch_id).await {
            Ok(PushOutcome::Ok) => return Ok(PushOutcome::Ok),
            Ok(PushOutcome::PayloadTooLarge) => {
                if started.elapsed() >= MAX_TOTAL_ELAPSED {
                    return Err(AppError::SmsPayloadTooLarge);
                }
                let wait = backoff.next().unwrap_or(MAX_BACKOFF);
                tracing::warn!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "sms reported payload too large, retrying"
                );
                tokio::time::sleep(wait).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::PrimaryKey;
    use crate::error::AppError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_message() -> Message {
        Message {
            primary_key: PrimaryKey::new(vec!["1".into()]),
            payload: serde_json::json!({"a": 1}),
            commit_lsn: None,
            commit_idx: None,
        }
    }

    #[tokio::test]
    async fn payload_too_large_is_retried_until_it_fits() {
        struct ShrinksOnRetry {
            too_large_times: AtomicUsize,
            calls: AtomicUsize,
        }

        #[async_trait]
        impl Sms for ShrinksOnRetry {
            async fn put_table_reader_batch(
                &self,
                _: &str,
                _: &[Message],
                _: BatchId,
            ) -> AppResult<PushOutcome> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.too_large_times.fetch_sub(1, Ordering::SeqCst) > 0 {
                    return Ok(PushOutcome::PayloadTooLarge);
                }
                Ok(PushOutcome::Ok)
            }
            async fn unpersisted_table_reader_batch_ids(&self, _: &str) -> AppResult<Vec<BatchId>> {
                Ok(vec![])
            }
            async fn count_messages(&self, _: &str) -> AppResult<u64> {
                Ok(0)
            }
            async fn is_alive(&self) -> bool {
                true
            }
        }

        let sms = ShrinksOnRetry {
            too_large_times: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
        };
        let messages = vec![sample_message()];
        let outcome = push_with_retry(&sms, "consumer-a", &messages, BatchId::new_v4())
            .await
            .unwrap();
        assert!(matches!(outcome, PushOutcome::Ok));
        assert_eq!(sms.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_error_is_not_retried() {
        struct AlwaysTransient;

        #[async_trait]
        impl Sms for AlwaysTransient {
            async fn put_table_reader_batch(
                &self,
                _: &str,
                _: &[Message],
                _: BatchId,
            ) -> AppResult<PushOutcome> {
                Err(AppError::TransientDb("connection reset".into()))
            }
            async fn unpersisted_table_reader_batch_ids(&self, _: &str) -> AppResult<Vec<BatchId>> {
                Ok(vec![])
            }
            async fn count_messages(&self, _: &str) -> AppResult<u64> {
                Ok(0)
            }
            async fn is_alive(&self) -> bool {
                true
            }
        }

        let sms = AlwaysTransient;
        let messages = vec![sample_message()];
        let err = push_with_retry(&sms, "consumer-a", &messages, BatchId::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TransientDb(_)));
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        struct AlwaysFatal;

        #[async_trait]
        impl Sms for AlwaysFatal {
            async fn put_table_reader_batch(
                &self,
                _: &str,
                _: &[Message],
                _: BatchId,
            ) -> AppResult<PushOutcome> {
                Err(AppError::SmsFatal("duplicate key".into()))
            }
            async fn unpersisted_table_reader_batch_ids(&self, _: &str) -> AppResult<Vec<BatchId>> {
                Ok(vec![])
            }
            async fn count_messages(&self, _: &str) -> AppResult<u64> {
                Ok(0)
            }
            async fn is_alive(&self) -> bool {
                true
            }
        }

        let sms = AlwaysFatal;
        let messages = vec![sample_message()];
        let err = push_with_retry(&sms, "consumer-a", &messages, BatchId::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SmsFatal(_)));
    }
}
