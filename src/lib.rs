pub mod appconfig;
pub mod backfill_registry;
pub mod batch;
pub mod cli;
pub mod cursor;
pub mod error;
pub mod fetch;
pub mod flush;
pub mod metrics;
pub mod page_size;
pub mod pk_multiset;
pub mod prometheus_server;
pub mod sms;
pub mod source_db;
pub mod state_machine;
pub mod watermark;

use crate::appconfig::TableReaderConfig;
use crate::backfill_registry::BackfillRegistry;
use crate::cursor::{Cursor, PrimaryKey};
use crate::error::{AppResult, StopReason};
use crate::metrics::TableReaderMetrics;
use crate::sms::Sms;
use crate::source_db::SourceDb;
use crate::state_machine::{Owner, OwnerHandle};
use crate::watermark::WatermarkEmitter;
use std::sync::Arc;
use tokio::sync::Notify;

/// A handle to a running Table Reader worker, exposing the operations spec'd
/// as peer-facing (spec §6): `flush_batch`, `drop_pks`, and the hot-path
/// `pks_seen` that bypasses the owner entirely.
#[derive(Clone)]
pub struct TableReaderHandle {
    owner: OwnerHandle,
    consumer_id: String,
    batches_changed: Arc<Notify>,
    metrics: Arc<TableReaderMetrics>,
}

impl TableReaderHandle {
    pub async fn flush_batch(&self, batch_id: pk_multiset::BatchId, commit_lsn: i64) {
        self.owner.flush_batch(batch_id, commit_lsn).await;
    }

    pub async fn drop_pks(&self, pks: Vec<PrimaryKey>) {
        self.owner.drop_pks(pks).await;
    }

    /// Hot path: bypasses the owner's mailbox entirely (spec §4.2, §6).
    pub fn pks_seen(&self, pks: &[PrimaryKey]) {
        pk_multiset::pks_seen(&self.consumer_id, pks);
    }

    /// Opportunistic trigger for `check_sms`, corresponding to the external
    /// `{table_reader_batches_changed, consumer_id}` pub/sub notification
    /// (spec §6).
    pub fn notify_batches_changed(&self) {
        self.batches_changed.notify_one();
    }

    /// Renders this worker's metrics in Prometheus text format, for wiring
    /// into `prometheus_server::run_metrics_server`'s gather closure.
    pub fn gather_metrics(&self) -> AppResult<String> {
        self.metrics.encode_text()
    }
}

/// Builds and runs a Table Reader worker to completion, returning the
/// reason it stopped (spec §7). Callers obtain a `TableReaderHandle` before
/// the worker starts processing by splitting construction from `run`; most
/// callers should use `spawn` instead.
pub async fn spawn(
    config: TableReaderConfig,
    initial_min_cursor: Cursor,
    source_db: Arc<dyn SourceDb>,
    watermark_emitter: Arc<dyn WatermarkEmitter>,
    sms: Arc<dyn Sms>,
    backfill_registry: Arc<dyn BackfillRegistry>,
) -> AppResult<(TableReaderHandle, tokio::task::JoinHandle<StopReason>)> {
    let metrics = Arc::new(TableReaderMetrics::new()?);
    let batches_changed = Arc::new(Notify::new());
    let consumer_id = config.consumer_id.clone();

    let (owner, owner_handle) = Owner::initialize(
        config,
        initial_min_cursor,
        source_db,
        watermark_emitter,
        sms,
        backfill_registry,
        metrics.clone(),
        batches_changed.clone(),
    )
    .await?;

    let join = tokio::spawn(owner.run());

    let handle = TableReaderHandle {
        owner: owner_handle,
        consumer_id,
        batches_changed,
        metrics,
    };

    Ok((handle, join))
}
