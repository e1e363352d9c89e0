//! Postgres-backed `SourceDb`, grounded on the teacher's `db/writer.rs`
//! pool-acquire-and-time pattern: acquire a connection from a shared pool,
//! run the query under a per-query timeout, translate sqlx errors into the
//! typed `AppError` variants the state machine switches on.

use crate::batch::Message;
use crate::cursor::{Cursor, PrimaryKey};
use crate::error::{AppError, AppResult};
use crate::source_db::{
    FetchRowsArgs, FetchRowsResult, ScanPksArgs, ScanPksResult, SourceDb,
};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;

#[derive(Clone)]
pub struct PgSourceDb {
    pool: PgPool,
    /// The sort column(s) used for keyset pagination, in leading-key order.
    sort_columns: Vec<String>,
    /// The primary-key column(s) returned by the PK scan.
    pk_columns: Vec<String>,
    query_timeout: Duration,
}

impl PgSourceDb {
    pub async fn connect(
        dsn: &str,
        pool_min: u32,
        pool_max: u32,
        connect_timeout: Duration,
        idle_timeout: Duration,
        query_timeout: Duration,
        sort_columns: Vec<String>,
        pk_columns: Vec<String>,
    ) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(pool_min)
            .max_connections(pool_max)
            .acquire_timeout(connect_timeout)
            .idle_timeout(idle_timeout)
            .connect(dsn)
            .await
            .map_err(AppError::Sqlx)?;

        Ok(Self {
            pool,
            sort_columns,
            pk_columns,
            query_timeout,
        })
    }

    fn leading_sort_column(&self) -> &str {
        &self.sort_columns[0]
    }

    async fn run_timed<T>(
        &self,
        page_size: usize,
        fut: impl std::future::Future<Output = Result<T, sqlx::Error>>,
    ) -> AppResult<T> {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(AppError::TransientDb(e.to_string())),
            Err(_) => Err(AppError::QueryTimeout { page_size }),
        }
    }
}

#[async_trait]
impl SourceDb for PgSourceDb {
    async fn scan_pks(&self, args: ScanPksArgs<'_>) -> AppResult<ScanPksResult> {
        let comparator = if args.include_min { ">=" } else { ">" };
        let leading = self.leading_sort_column();

        let pk_col_list = self.pk_columns.join(", ");
        let sql = format!(
            "SELECT {pk_col_list}, {leading} AS __next_cursor \
             FROM \"{table}\" WHERE {leading} {comparator} $1 \
             ORDER BY {leading} ASC LIMIT $2",
            table = args.table_oid,
        );

        let cursor_value = cursor_head_as_i64(args.cursor);

        let rows_fut = sqlx::query(&sql)
            .bind(cursor_value)
            .bind(args.limit as i64)
            .fetch_all(&self.pool);

        let rows = self.run_timed(args.limit, rows_fut).await?;

        let mut primary_keys = Vec::with_capacity(rows.len());
        let mut last_cursor_value: Option<i64> = None;
        for row in &rows {
            let mut parts = Vec::with_capacity(self.pk_columns.len());
            for col in &self.pk_columns {
                let v: String = row
                    .try_get::<i64, _>(col.as_str())
                    .map(|n| n.to_string())
                    .or_else(|_| row.try_get::<String, _>(col.as_str()))
                    .map_err(AppError::Sqlx)?;
                parts.push(v);
            }
            primary_keys.push(PrimaryKey::new(parts));
            last_cursor_value = row.try_get::<i64, _>("__next_cursor").ok();
        }

        let next_cursor = match last_cursor_value {
            Some(v) => Cursor::new(vec![serde_json::json!(v)]),
            None => args.cursor.clone(),
        };

        Ok(ScanPksResult {
            primary_keys,
            next_cursor,
        })
    }

    async fn fetch_rows(&self, args: FetchRowsArgs<'_>) -> AppResult<FetchRowsResult> {
        let comparator = if args.include_min { ">=" } else { ">" };
        let leading = self.leading_sort_column();

        let sql = format!(
            "SELECT * FROM \"{table}\" WHERE {leading} {comparator} $1 \
             ORDER BY {leading} ASC LIMIT $2",
            table = args.table_oid,
        );

        let cursor_value = cursor_head_as_i64(args.cursor);

        let rows_fut = sqlx::query(&sql)
            .bind(cursor_value)
            .bind(args.limit as i64)
            .fetch_all(&self.pool);

        let rows = self.run_timed(args.limit, rows_fut).await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut parts = Vec::with_capacity(self.pk_columns.len());
            for col in &self.pk_columns {
                let v: String = row
                    .try_get::<i64, _>(col.as_str())
                    .map(|n| n.to_string())
                    .or_else(|_| row.try_get::<String, _>(col.as_str()))
                    .map_err(AppError::Sqlx)?;
                parts.push(v);
            }
            messages.push(Message {
                primary_key: PrimaryKey::new(parts),
                payload: row_to_json(row),
                commit_lsn: None,
                commit_idx: None,
            });
        }

        Ok(FetchRowsResult { messages })
    }

    async fn fetch_slot_lsn(&self, slot_name: &str) -> AppResult<i64> {
        let row = sqlx::query(
            "SELECT (confirmed_flush_lsn - '0/0'::pg_lsn) AS lsn \
             FROM pg_replication_slots WHERE slot_name = $1",
        )
        .bind(slot_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Sqlx)?;

        match row {
            Some(row) => row.try_get::<i64, _>("lsn").map_err(AppError::Sqlx),
            None => Err(AppError::SlotNotFound(slot_name.to_string())),
        }
    }
}

fn cursor_head_as_i64(cursor: &Cursor) -> i64 {
    cursor
        .0
        .first()
        .and_then(|v| v.as_i64())
        .unwrap_or(i64::MIN)
}

/// Best-effort row -> JSON projection used to build a message payload. A
/// production adapter would use the consumer's schema to decode columns
/// precisely; this crate's core does not interpret payload contents, so a
/// generic projection is sufficient.
fn row_to_json(row: &sqlx::postgres::PgRow) -> serde_json::Value {
    use sqlx::Column;
    use sqlx::TypeInfo;

    let mut map = serde_json::Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let value = match column.type_info().name() {
            "INT8" | "INT4" | "INT2" => row
                .try_get::<i64, _>(i)
                .map(serde_json::Value::from)
                .unwrap_or(serde_json::Value::Null),
            "FLOAT4" | "FLOAT8" => row
                .try_get::<f64, _>(i)
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            "BOOL" => row
                .try_get::<bool, _>(i)
                .map(serde_json::Value::from)
                .unwrap_or(serde_json::Value::Null),
            _ => row
                .try_get::<String, _>(i)
                .map(serde_json::Value::from)
                .unwrap_or(serde_json::Value::Null),
        };
        map.insert(name, value);
    }
    serde_json::Value::Object(map)
}
