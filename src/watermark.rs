//! Watermark Emitter interface (spec §4.3, §6).
//!
//! The two-stage fetcher must bracket Stage 2's row fetch with a low and a
//! high watermark written into the replication slot, so that the CDC
//! pipeline can later deliver a `flush_batch` call whose `commit_lsn`
//! reflects the high-water mark. The core only needs the bracketing
//! contract; how markers are physically injected into the stream is an
//! external collaborator's concern.

use crate::error::AppResult;
use crate::pk_multiset::BatchId;
use async_trait::async_trait;

#[async_trait]
pub trait WatermarkEmitter: Send + Sync {
    /// Emit the low watermark for `batch_id` just before the row fetch
    /// begins.
    async fn emit_low(&self, slot_id: &str, backfill_id: &str, batch_id: BatchId) -> AppResult<()>;

    /// Emit the high watermark for `batch_id` just after the row fetch
    /// completes, returning the replication-slot write position observed at
    /// that moment (`approximate_lsn`).
    async fn emit_high(
        &self,
        slot_id: &str,
        backfill_id: &str,
        batch_id: BatchId,
        table_oid: &str,
    ) -> AppResult<i64>;
}

/// Brackets `body` with a low and a high watermark, returning the body's
/// result alongside the `approximate_lsn` observed at the high watermark
/// (spec `db.with_watermark`).
pub async fn with_watermark<F, Fut, T>(
    emitter: &dyn WatermarkEmitter,
    slot_id: &str,
    backfill_id: &str,
    batch_id: BatchId,
    table_oid: &str,
    body: F,
) -> AppResult<(T, i64)>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = AppResult<T>>,
{
    emitter.emit_low(slot_id, backfill_id, batch_id).await?;
    let result = body().await?;
    let approximate_lsn = emitter
        .emit_high(slot_id, backfill_id, batch_id, table_oid)
        .await?;
    Ok((result, approximate_lsn))
}

/// Postgres-backed `WatermarkEmitter`, grounded on the same pool-acquire
/// pattern as `source_db::sqlx_impl::PgSourceDb`. Markers are written as
/// transactional logical-decoding messages on the backfill's own
/// replication slot, so the CDC pipeline observes them in commit order
/// alongside the row changes it is already streaming.
pub mod pg_impl {
    use super::*;
    use sqlx::{PgPool, Row};

    pub struct PgWatermarkEmitter {
        pool: PgPool,
    }

    impl PgWatermarkEmitter {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        async fn emit_message(&self, prefix: &str, content: &str) -> AppResult<()> {
            sqlx::query("SELECT pg_logical_emit_message(true, $1, $2)")
                .bind(prefix)
                .bind(content)
                .execute(&self.pool)
                .await
                .map_err(crate::error::AppError::Sqlx)?;
            Ok(())
        }

        async fn current_lsn(&self, slot_id: &str) -> AppResult<i64> {
            let row = sqlx::query(
                "SELECT (confirmed_flush_lsn - '0/0'::pg_lsn) AS lsn \
                 FROM pg_replication_slots WHERE slot_name = $1",
            )
            .bind(slot_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(crate::error::AppError::Sqlx)?;

            match row {
                Some(row) => row.try_get::<i64, _>("lsn").map_err(crate::error::AppError::Sqlx),
                None => Err(crate::error::AppError::SlotNotFound(slot_id.to_string())),
            }
        }
    }

    #[async_trait]
    impl WatermarkEmitter for PgWatermarkEmitter {
        async fn emit_low(
            &self,
            slot_id: &str,
            backfill_id: &str,
            batch_id: BatchId,
        ) -> AppResult<()> {
            let content = format!("{{\"backfill_id\":\"{backfill_id}\",\"batch_id\":\"{batch_id}\"}}");
            self.emit_message(&format!("table_reader.low.{slot_id}"), &content).await
        }

        async fn emit_high(
            &self,
            slot_id: &str,
            backfill_id: &str,
            batch_id: BatchId,
            table_oid: &str,
        ) -> AppResult<i64> {
            let content = format!(
                "{{\"backfill_id\":\"{backfill_id}\",\"batch_id\":\"{batch_id}\",\"table_oid\":\"{table_oid}\"}}"
            );
            self.emit_message(&format!("table_reader.high.{slot_id}"), &content).await?;
            self.current_lsn(slot_id).await
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeWatermarkEmitter;
    use super::*;

    #[tokio::test]
    async fn brackets_body_and_returns_lsn() {
        let emitter = FakeWatermarkEmitter::new(42);
        let (value, lsn) = with_watermark(&emitter, "slot", "bf", BatchId::new_v4(), "table", || async {
            Ok(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(lsn, 42);
    }
}
