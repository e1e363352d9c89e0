//! Source Database Adapter interface (spec §1 "out of scope", §6).
//!
//! The core only depends on this trait; a concrete sqlx/Postgres
//! implementation is provided in `sqlx_impl` and grounded on the teacher's
//! `db/writer.rs` pool-acquire-and-time pattern.

pub mod sqlx_impl;

use crate::batch::Message;
use crate::cursor::{Cursor, PrimaryKey};
use crate::error::AppResult;
use async_trait::async_trait;

pub struct ScanPksArgs<'a> {
    pub table_oid: &'a str,
    pub cursor: &'a Cursor,
    pub limit: usize,
    pub include_min: bool,
}

pub struct ScanPksResult {
    pub primary_keys: Vec<PrimaryKey>,
    pub next_cursor: Cursor,
}

pub struct FetchRowsArgs<'a> {
    pub table_oid: &'a str,
    pub cursor: &'a Cursor,
    pub limit: usize,
    pub include_min: bool,
}

pub struct FetchRowsResult {
    pub messages: Vec<Message>,
}

/// Executes the primary-key scan and the follow-up row fetch, and reports
/// the replication slot's current write position.
#[async_trait]
pub trait SourceDb: Send + Sync {
    /// Stage 1: keyset-paginated PK scan (spec §4.3).
    async fn scan_pks(&self, args: ScanPksArgs<'_>) -> AppResult<ScanPksResult>;

    /// Stage 2: row fetch for the same page (spec §4.3). Callers wrap this
    /// in `watermark::with_watermark` to bracket it and obtain
    /// `approximate_lsn`.
    async fn fetch_rows(&self, args: FetchRowsArgs<'_>) -> AppResult<FetchRowsResult>;

    /// Current replication-slot write position, used for staleness
    /// detection (spec §4.6.2 `check_state`).
    async fn fetch_slot_lsn(&self, slot_name: &str) -> AppResult<i64>;
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// An in-memory `SourceDb` used across the owner-loop integration tests.
    /// Rows are seeded once and paginated deterministically by a shared
    /// cursor position; `fail_next_scan`/`fail_next_fetch` let a test force
    /// a single query-timeout or transient error.
    pub struct FakeSourceDb {
        rows: Vec<(PrimaryKey, serde_json::Value)>,
        slot_lsn: Mutex<i64>,
        pub filter: Box<dyn Fn(&PrimaryKey) -> bool + Send + Sync>,
    }

    impl FakeSourceDb {
        pub fn new(rows: Vec<(PrimaryKey, serde_json::Value)>, slot_lsn: i64) -> Self {
            Self {
                rows,
                slot_lsn: Mutex::new(slot_lsn),
                filter: Box::new(|_| true),
            }
        }

        pub fn set_slot_lsn(&self, lsn: i64) {
            *self.slot_lsn.lock().unwrap() = lsn;
        }

        fn position_of(&self, cursor: &Cursor, include_min: bool) -> usize {
            self.rows
                .iter()
                .position(|(pk, _)| {
                    let row_cursor = Cursor::new(vec![serde_json::Value::String(pk.0[0].clone())]);
                    if include_min {
                        !row_cursor.is_strictly_before(cursor)
                    } else {
                        cursor.is_strictly_before(&row_cursor)
                    }
                })
                .unwrap_or(self.rows.len())
        }
    }

    #[async_trait]
    impl SourceDb for FakeSourceDb {
        async fn scan_pks(&self, args: ScanPksArgs<'_>) -> AppResult<ScanPksResult> {
            let start = self.position_of(args.cursor, args.include_min);
            let end = (start + args.limit).min(self.rows.len());
            let page = &self.rows[start..end];
            let primary_keys = page.iter().map(|(pk, _)| pk.clone()).collect();
            let next_cursor = if let Some((pk, _)) = page.last() {
                Cursor::new(vec![serde_json::Value::String(pk.0[0].clone())])
            } else {
                args.cursor.clone()
            };
            Ok(ScanPksResult {
                primary_keys,
                next_cursor,
            })
        }

        async fn fetch_rows(&self, args: FetchRowsArgs<'_>) -> AppResult<FetchRowsResult> {
            let start = self.position_of(args.cursor, args.include_min);
            let end = (start + args.limit).min(self.rows.len());
            let messages = self.rows[start..end]
                .iter()
                .filter(|(pk, _)| (self.filter)(pk))
                .map(|(pk, payload)| Message {
                    primary_key: pk.clone(),
                    payload: payload.clone(),
                    commit_lsn: None,
                    commit_idx: None,
                })
                .collect();
            Ok(FetchRowsResult { messages })
        }

        async fn fetch_slot_lsn(&self, _slot_name: &str) -> AppResult<i64> {
            Ok(*self.slot_lsn.lock().unwrap())
        }
    }
}
