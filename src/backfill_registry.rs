//! Backfill Registry interface (spec §1 "out of scope", §6).
//!
//! Persists the advancing keyset cursor and the rows-processed counters, and
//! signals when a backfill has been deactivated out from under the worker.
//! The sqlx-backed implementation mirrors the teacher's
//! `upsert_stream_registry` / `update_stream_knobs` upsert-then-update shape
//! in `db/writer.rs`.

use crate::cursor::Cursor;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use sqlx::PgPool;

#[async_trait]
pub trait BackfillRegistry: Send + Sync {
    /// Persist the advancing cursor for `backfill_id`.
    async fn update_cursor(&self, backfill_id: &str, cursor: &Cursor) -> AppResult<()>;

    /// Delete the persisted cursor (backfill finished).
    async fn delete_cursor(&self, backfill_id: &str) -> AppResult<()>;

    /// Load the persisted cursor, if any (worker resumption, spec §4.6.1).
    async fn load_cursor(&self, backfill_id: &str) -> AppResult<Option<Cursor>>;

    /// Mark the consumer's backfill as finished.
    async fn finished(&self, consumer_id: &str) -> AppResult<()>;

    /// Increment the rows-processed / rows-ingested counters by `n`.
    async fn update_counters(&self, backfill_id: &str, rows_processed: u64, rows_ingested: u64) -> AppResult<()>;

    /// Whether the backfill is still active; `false` (or missing) means the
    /// owner should stop normally (spec §4.6.2 `check_state`).
    async fn is_active(&self, backfill_id: &str) -> AppResult<bool>;
}

pub struct PgBackfillRegistry {
    pool: PgPool,
}

impl PgBackfillRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BackfillRegistry for PgBackfillRegistry {
    async fn update_cursor(&self, backfill_id: &str, cursor: &Cursor) -> AppResult<()> {
        let cursor_json = serde_json::to_value(&cursor.0).map_err(AppError::Json)?;
        sqlx::query(
            r#"
            INSERT INTO table_reader.backfills (backfill_id, cursor, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (backfill_id) DO UPDATE SET
                cursor = EXCLUDED.cursor,
                updated_at = now()
            "#,
        )
        .bind(backfill_id)
        .bind(cursor_json)
        .execute(&self.pool)
        .await
        .map_err(AppError::Sqlx)?;
        Ok(())
    }

    async fn delete_cursor(&self, backfill_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE table_reader.backfills SET cursor = NULL, updated_at = now() WHERE backfill_id = $1")
            .bind(backfill_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::Sqlx)?;
        Ok(())
    }

    async fn load_cursor(&self, backfill_id: &str) -> AppResult<Option<Cursor>> {
        let row: Option<(Option<serde_json::Value>,)> =
            sqlx::query_as("SELECT cursor FROM table_reader.backfills WHERE backfill_id = $1")
                .bind(backfill_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::Sqlx)?;

        match row {
            Some((Some(json),)) => {
                let parts: Vec<serde_json::Value> = serde_json::from_value(json).map_err(AppError::Json)?;
                Ok(Some(Cursor::new(parts)))
            }
            _ => Ok(None),
        }
    }

    async fn finished(&self, consumer_id: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE table_reader.consumers SET backfill_finished = true, updated_at = now() WHERE consumer_id = $1",
        )
        .bind(consumer_id)
        .execute(&self.pool)
        .await
        .map_err(AppError::Sqlx)?;
        Ok(())
    }

    async fn update_counters(&self, backfill_id: &str, rows_processed: u64, rows_ingested: u64) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE table_reader.backfills
            SET rows_processed = rows_processed + $2,
                rows_ingested = rows_ingested + $3,
                updated_at = now()
            WHERE backfill_id = $1
            "#,
        )
        .bind(backfill_id)
        .bind(rows_processed as i64)
        .bind(rows_ingested as i64)
        .execute(&self.pool)
        .await
        .map_err(AppError::Sqlx)?;
        Ok(())
    }

    async fn is_active(&self, backfill_id: &str) -> AppResult<bool> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT active FROM table_reader.backfills WHERE backfill_id = $1")
                .bind(backfill_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(AppError::Sqlx)?;
        Ok(row.map(|(active,)| active).unwrap_or(false))
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        cursors: HashMap<String, Option<Cursor>>,
        active: HashMap<String, bool>,
        finished_consumers: Vec<String>,
        rows_processed: HashMap<String, u64>,
        rows_ingested: HashMap<String, u64>,
    }

    /// In-memory `BackfillRegistry` for owner-loop integration tests.
    #[derive(Default)]
    pub struct FakeBackfillRegistry {
        state: Mutex<State>,
    }

    impl FakeBackfillRegistry {
        pub fn new(backfill_id: &str, initial_cursor: Option<Cursor>) -> Self {
            let mut state = State::default();
            state.cursors.insert(backfill_id.to_string(), initial_cursor);
            state.active.insert(backfill_id.to_string(), true);
            Self {
                state: Mutex::new(state),
            }
        }

        pub fn deactivate(&self, backfill_id: &str) {
            self.state
                .lock()
                .unwrap()
                .active
                .insert(backfill_id.to_string(), false);
        }

        pub fn finished_consumers(&self) -> Vec<String> {
            self.state.lock().unwrap().finished_consumers.clone()
        }

        pub fn rows_processed(&self, backfill_id: &str) -> u64 {
            *self
                .state
                .lock()
                .unwrap()
                .rows_processed
                .get(backfill_id)
                .unwrap_or(&0)
        }
    }

    #[async_trait]
    impl BackfillRegistry for FakeBackfillRegistry {
        async fn update_cursor(&self, backfill_id: &str, cursor: &Cursor) -> AppResult<()> {
            self.state
                .lock()
                .unwrap()
                .cursors
                .insert(backfill_id.to_string(), Some(cursor.clone()));
            Ok(())
        }

        async fn delete_cursor(&self, backfill_id: &str) -> AppResult<()> {
            self.state
                .lock()
                .unwrap()
                .cursors
                .insert(backfill_id.to_string(), None);
            Ok(())
        }

        async fn load_cursor(&self, backfill_id: &str) -> AppResult<Option<Cursor>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .cursors
                .get(backfill_id)
                .cloned()
                .flatten())
        }

        async fn finished(&self, consumer_id: &str) -> AppResult<()> {
            self.state
                .lock()
                .unwrap()
                .finished_consumers
                .push(consumer_id.to_string());
            Ok(())
        }

        async fn update_counters(
            &self,
            backfill_id: &str,
            rows_processed: u64,
            rows_ingested: u64,
        ) -> AppResult<()> {
            let mut state = self.state.lock().unwrap();
            *state.rows_processed.entry(backfill_id.to_string()).or_insert(0) += rows_processed;
            *state.rows_ingested.entry(backfill_id.to_string()).or_insert(0) += rows_ingested;
            Ok(())
        }

        async fn is_active(&self, backfill_id: &str) -> AppResult<bool> {
            Ok(*self
                .state
                .lock()
                .unwrap()
                .active
                .get(backfill_id)
                .unwrap_or(&false))
        }
    }
}
