//! The owner loop (spec §4.6, §5): a single-threaded cooperative state
//! machine. All state mutation happens here; the two fetch stages run as
//! off-loop tasks whose results arrive as tagged events, and `flush_batch` /
//! `drop_pks` arrive as RPC-shaped events with a reply channel. The PK
//! multiset is the only state this loop doesn't own exclusively — CDC event
//! handlers mutate it concurrently through `pk_multiset::pks_seen`.

use crate::appconfig::TableReaderConfig;
use crate::backfill_registry::BackfillRegistry;
use crate::batch::{Batch, BatchQueues};
use crate::cursor::{Cursor, PrimaryKey};
use crate::error::{AppError, AppResult, StopReason};
use crate::fetch::{self, FetchTaskSlot, Stage, Stage1Outcome, Stage2Outcome};
use crate::flush::{self, FlushContext, FlushOutcome};
use crate::metrics::TableReaderMetrics;
use crate::page_size::PageSizeOptimizer;
use crate::pk_multiset::{BatchId, PkMultiset, PkMultisetRegistry};
use crate::sms::Sms;
use crate::source_db::SourceDb;
use crate::watermark::WatermarkEmitter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};

const MAYBE_FETCH_FALLBACK: Duration = Duration::from_secs(1);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

pub enum OwnerEvent {
    Stage1(Stage1Outcome),
    Stage2(Stage2Outcome),
    FlushBatch {
        batch_id: BatchId,
        commit_lsn: i64,
        reply: oneshot::Sender<()>,
    },
    DropPks {
        pks: Vec<PrimaryKey>,
        reply: oneshot::Sender<()>,
    },
}

/// A cheap handle for submitting `flush_batch`/`drop_pks` to a running
/// owner loop without going through its internals (spec §6 "Operations
/// exposed to peers").
#[derive(Clone)]
pub struct OwnerHandle {
    events_tx: mpsc::UnboundedSender<OwnerEvent>,
}

impl OwnerHandle {
    pub async fn flush_batch(&self, batch_id: BatchId, commit_lsn: i64) {
        let (reply, rx) = oneshot::channel();
        if self
            .events_tx
            .send(OwnerEvent::FlushBatch {
                batch_id,
                commit_lsn,
                reply,
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn drop_pks(&self, pks: Vec<PrimaryKey>) {
        let (reply, rx) = oneshot::channel();
        if self
            .events_tx
            .send(OwnerEvent::DropPks { pks, reply })
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

pub struct Owner {
    config: TableReaderConfig,
    source_db: Arc<dyn SourceDb>,
    watermark_emitter: Arc<dyn WatermarkEmitter>,
    sms: Arc<dyn Sms>,
    backfill_registry: Arc<dyn BackfillRegistry>,
    pk_multiset: Arc<PkMultiset>,
    metrics: Arc<TableReaderMetrics>,

    optimizer: PageSizeOptimizer,
    queues: BatchQueues,
    ignorable: HashSet<BatchId>,

    cursor: Cursor,
    next_cursor: Cursor,
    initial_min_cursor: Cursor,

    current_id_fetch_task: Option<FetchTaskSlot>,
    current_batch_fetch_task: Option<FetchTaskSlot>,
    /// The batch whose Stage-1 PKs are live but whose Stage-2 fetch hasn't
    /// completed yet; consulted by `flush_batch` rule 1.
    stage2_pending_for: Option<BatchId>,

    done_fetching: bool,
    successive_failure_count: u32,
    last_fetch_request_at: Option<Instant>,
    last_known_sms_pending: u64,

    stage1_accum_ms: u64,
    stage2_accum_ms: u64,
    last_stage1_elapsed_ms: u64,

    events_tx: mpsc::UnboundedSender<OwnerEvent>,
    events_rx: mpsc::UnboundedReceiver<OwnerEvent>,
    batches_changed: Arc<Notify>,
}

impl Owner {
    /// Initialization (spec §4.6.1): registers the public PK-multiset
    /// handle, resumes from the persisted cursor if present.
    pub async fn initialize(
        config: TableReaderConfig,
        initial_min_cursor: Cursor,
        source_db: Arc<dyn SourceDb>,
        watermark_emitter: Arc<dyn WatermarkEmitter>,
        sms: Arc<dyn Sms>,
        backfill_registry: Arc<dyn BackfillRegistry>,
        metrics: Arc<TableReaderMetrics>,
        batches_changed: Arc<Notify>,
    ) -> AppResult<(Self, OwnerHandle)> {
        let pk_multiset = PkMultisetRegistry::global().register(&config.consumer_id);

        let cursor = backfill_registry
            .load_cursor(&config.backfill_id)
            .await?
            .unwrap_or_else(|| initial_min_cursor.clone());

        let optimizer = PageSizeOptimizer::new(
            config.initial_page_size,
            config.max_timeout_ms,
            config.max_page_size,
        );
        let queues = BatchQueues::new(config.max_batches_in_memory);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = OwnerHandle {
            events_tx: events_tx.clone(),
        };

        let owner = Self {
            next_cursor: cursor.clone(),
            cursor,
            initial_min_cursor,
            config,
            source_db,
            watermark_emitter,
            sms,
            backfill_registry,
            pk_multiset,
            metrics,
            optimizer,
            queues,
            ignorable: HashSet::new(),
            current_id_fetch_task: None,
            current_batch_fetch_task: None,
            stage2_pending_for: None,
            done_fetching: false,
            successive_failure_count: 0,
            last_fetch_request_at: None,
            last_known_sms_pending: 0,
            stage1_accum_ms: 0,
            stage2_accum_ms: 0,
            last_stage1_elapsed_ms: 0,
            events_tx,
            events_rx,
            batches_changed,
        };

        Ok((owner, handle))
    }

    pub fn handle(&self) -> OwnerHandle {
        OwnerHandle {
            events_tx: self.events_tx.clone(),
        }
    }

    /// Runs until a terminal stop condition is reached (spec §7). On
    /// `StopReason::Finished` the persisted cursor has already been deleted
    /// and `backfill.finished` called.
    pub async fn run(mut self) -> StopReason {
        let consumer_id = self.config.consumer_id.clone();
        let mut check_state_interval =
            tokio::time::interval(Duration::from_millis(self.config.check_state_timeout_ms));
        let mut check_sms_interval =
            tokio::time::interval(Duration::from_millis(self.config.check_sms_timeout_ms));
        let mut process_logging_interval = tokio::time::interval(Duration::from_secs(30));
        check_state_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        check_sms_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        process_logging_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let stop_reason = loop {
            let maybe_fetch_delay = if self.should_fetch() {
                Duration::ZERO
            } else {
                MAYBE_FETCH_FALLBACK
            };

            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    if let Some(stop) = self.handle_event(event).await {
                        break stop;
                    }
                }
                _ = tokio::time::sleep(maybe_fetch_delay) => {
                    self.maybe_fetch().await;
                }
                _ = check_state_interval.tick() => {
                    if let Some(stop) = self.check_state().await {
                        break stop;
                    }
                }
                _ = check_sms_interval.tick() => {
                    if let Some(stop) = self.check_sms(&consumer_id).await {
                        break stop;
                    }
                }
                _ = self.batches_changed.notified() => {
                    if let Some(stop) = self.check_sms(&consumer_id).await {
                        break stop;
                    }
                }
                _ = process_logging_interval.tick() => {
                    self.process_logging();
                }
                join_result = join_or_pending(&mut self.current_id_fetch_task), if self.current_id_fetch_task.is_some() => {
                    if let Err(join_err) = join_result {
                        self.handle_task_crash(Stage::Stage1, join_err);
                    }
                }
                join_result = join_or_pending(&mut self.current_batch_fetch_task), if self.current_batch_fetch_task.is_some() => {
                    if let Err(join_err) = join_result {
                        self.handle_task_crash(Stage::Stage2, join_err);
                    }
                }
            }
        };

        if let Some(slot) = self.current_id_fetch_task.take() {
            slot.abort();
        }
        if let Some(slot) = self.current_batch_fetch_task.take() {
            slot.abort();
        }

        PkMultisetRegistry::global().unregister(&consumer_id);
        stop_reason
    }

    // ---- §4.6.7 Task crash ----

    /// A fetch task's `JoinHandle` resolved with an error (it panicked or
    /// was cancelled) before ever sending its tagged `OwnerEvent`. Treat
    /// this the same as any other stage failure: free the slot and any
    /// PK-multiset reservation it held, and count it toward the backoff
    /// `should_fetch?` already applies to other failures.
    fn handle_task_crash(&mut self, stage: Stage, join_err: tokio::task::JoinError) {
        match stage {
            Stage::Stage1 => {
                if let Some(slot) = self.current_id_fetch_task.take() {
                    tracing::error!(error = %join_err, batch_id = %slot.batch_id, "stage 1 fetch task crashed");
                }
            }
            Stage::Stage2 => {
                if let Some(slot) = self.current_batch_fetch_task.take() {
                    self.pk_multiset.delete(slot.batch_id);
                    self.stage2_pending_for = None;
                    tracing::error!(error = %join_err, batch_id = %slot.batch_id, "stage 2 fetch task crashed");
                }
            }
        }
        self.register_failure();
    }

    async fn handle_event(&mut self, event: OwnerEvent) -> Option<StopReason> {
        match event {
            OwnerEvent::Stage1(outcome) => self.handle_stage1(outcome).await,
            OwnerEvent::Stage2(outcome) => self.handle_stage2(outcome).await,
            OwnerEvent::FlushBatch {
                batch_id,
                commit_lsn,
                reply,
            } => {
                let stop = self.handle_flush_batch(batch_id, commit_lsn).await;
                let _ = reply.send(());
                stop
            }
            OwnerEvent::DropPks { pks, reply } => {
                self.pk_multiset.remove_from_all(&pks);
                let _ = reply.send(());
                None
            }
        }
    }

    // ---- §4.6.3 should_fetch? ----

    fn should_fetch(&self) -> bool {
        if self.done_fetching {
            return false;
        }
        if self.current_id_fetch_task.is_some() || self.current_batch_fetch_task.is_some() {
            return false;
        }
        if self.queues.is_at_capacity() {
            return false;
        }
        if self.last_known_sms_pending >= self.config.max_pending_messages {
            return false;
        }
        if self.successive_failure_count > 0 {
            let delay = backoff_delay(self.successive_failure_count);
            if let Some(last) = self.last_fetch_request_at {
                if last.elapsed() < delay {
                    return false;
                }
            }
        }
        true
    }

    async fn maybe_fetch(&mut self) {
        if !self.should_fetch() {
            return;
        }
        self.last_fetch_request_at = Some(Instant::now());
        let batch_id = BatchId::new_v4();
        let include_min = self.cursor == self.initial_min_cursor;
        let slot = fetch::spawn_stage1(
            self.source_db.clone(),
            self.config.table_oid.clone(),
            self.cursor.clone(),
            self.optimizer.size(),
            include_min,
            batch_id,
            self.events_tx.clone(),
        );
        self.current_id_fetch_task = Some(slot);
    }

    // ---- §4.6.4 Stage-1 completion ----

    async fn handle_stage1(&mut self, outcome: Stage1Outcome) -> Option<StopReason> {
        if !self.matches_current(outcome.tag.stage, outcome.tag.batch_id, true) {
            return None; // stray result, spec §4.6.6
        }
        self.current_id_fetch_task = None;
        self.stage1_accum_ms += outcome.elapsed_ms;
        self.metrics.observe_stage1(outcome.elapsed_ms as f64 / 1000.0);

        match outcome.result {
            Ok(scan) => {
                if scan.primary_keys.is_empty() {
                    if self.queues.is_empty() {
                        return self.finish_backfill().await;
                    }
                    self.done_fetching = true;
                    self.ignorable.insert(outcome.tag.batch_id);
                    self.metrics.inc_batches_ignored();
                    None
                } else {
                    self.last_stage1_elapsed_ms = outcome.elapsed_ms;
                    self.pk_multiset.add(outcome.tag.batch_id, scan.primary_keys);
                    self.stage2_pending_for = Some(outcome.tag.batch_id);
                    let include_min = self.cursor == self.initial_min_cursor;
                    let slot = fetch::spawn_stage2(
                        self.source_db.clone(),
                        self.watermark_emitter.clone(),
                        self.config.database.slot_name.clone(),
                        self.config.backfill_id.clone(),
                        self.config.table_oid.clone(),
                        self.cursor.clone(),
                        self.optimizer.size(),
                        include_min,
                        outcome.tag.batch_id,
                        self.events_tx.clone(),
                    );
                    self.current_batch_fetch_task = Some(slot);
                    self.next_cursor = scan.next_cursor;
                    None
                }
            }
            Err(AppError::QueryTimeout { page_size }) => {
                self.optimizer.record_timeout(page_size);
                self.metrics.inc_query_timeout();
                None
            }
            Err(err) => {
                self.register_failure();
                tracing::warn!(error = %err, "stage 1 fetch failed");
                None
            }
        }
    }

    // ---- §4.6.5 Stage-2 completion ----

    async fn handle_stage2(&mut self, outcome: Stage2Outcome) -> Option<StopReason> {
        if !self.matches_current(outcome.tag.stage, outcome.tag.batch_id, false) {
            return None;
        }
        self.current_batch_fetch_task = None;
        self.stage2_pending_for = None;
        self.stage2_accum_ms += outcome.elapsed_ms;
        self.metrics.observe_stage2(outcome.elapsed_ms as f64 / 1000.0);

        match outcome.result {
            Ok((messages, approximate_lsn)) => {
                // Feed the optimizer the slower of the two legs, never the
                // faster one (spec §4.3 "Timing accounting").
                let bottleneck_ms = self.last_stage1_elapsed_ms.max(outcome.elapsed_ms).max(1);
                self.optimizer.record_timing(self.optimizer.size(), bottleneck_ms);

                let batch_id = outcome.tag.batch_id;
                if messages.is_empty() {
                    self.pk_multiset.delete(batch_id);
                    self.ignorable.insert(batch_id);
                    self.metrics.inc_batches_ignored();
                    self.cursor = self.next_cursor.clone();
                    self.reset_failures();
                    None
                } else {
                    let batch = Batch::new(batch_id, self.cursor.clone(), approximate_lsn, messages);
                    self.queues.push_unflushed(batch);
                    self.metrics.inc_batches_fetched();
                    self.cursor = self.next_cursor.clone();
                    self.reset_failures();
                    None
                }
            }
            Err(AppError::QueryTimeout { page_size }) => {
                self.optimizer.record_timeout(page_size);
                self.metrics.inc_query_timeout();
                self.pk_multiset.delete(outcome.tag.batch_id);
                None
            }
            Err(err) => {
                self.pk_multiset.delete(outcome.tag.batch_id);
                self.register_failure();
                tracing::warn!(error = %err, "stage 2 fetch failed");
                None
            }
        }
    }

    fn matches_current(&self, stage: Stage, batch_id: BatchId, is_stage1: bool) -> bool {
        let slot = if is_stage1 {
            &self.current_id_fetch_task
        } else {
            &self.current_batch_fetch_task
        };
        stage
            == if is_stage1 {
                Stage::Stage1
            } else {
                Stage::Stage2
            }
            && slot.as_ref().map(|s| s.batch_id) == Some(batch_id)
    }

    fn register_failure(&mut self) {
        self.successive_failure_count += 1;
    }

    fn reset_failures(&mut self) {
        self.successive_failure_count = 0;
    }

    async fn finish_backfill(&mut self) -> Option<StopReason> {
        if let Err(err) = self.backfill_registry.delete_cursor(&self.config.backfill_id).await {
            tracing::error!(error = %err, "failed to delete cursor on finish");
        }
        if let Err(err) = self.backfill_registry.finished(&self.config.consumer_id).await {
            tracing::error!(error = %err, "failed to mark consumer finished");
        }
        Some(StopReason::Finished)
    }

    // ---- §4.4 flush_batch ----

    async fn handle_flush_batch(&mut self, batch_id: BatchId, commit_lsn: i64) -> Option<StopReason> {
        let mut ctx = FlushContext {
            queues: &mut self.queues,
            ignorable: &mut self.ignorable,
            stage2_in_flight: self.stage2_pending_for,
            pk_multiset: &self.pk_multiset,
            sms: self.sms.as_ref(),
            backfill_registry: self.backfill_registry.as_ref(),
            backfill_id: &self.config.backfill_id,
            consumer_id: &self.config.consumer_id,
        };

        match flush::flush_batch(&mut ctx, batch_id, commit_lsn).await {
            Ok(FlushOutcome::Deferred) => {
                let events_tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    let (reply, _rx) = oneshot::channel();
                    let _ = events_tx.send(OwnerEvent::FlushBatch {
                        batch_id,
                        commit_lsn,
                        reply,
                    });
                });
                None
            }
            Ok(FlushOutcome::DuplicateFatal) => {
                tracing::error!(batch_id = %batch_id, "duplicate flush of already-flushed batch, stopping");
                Some(StopReason::Error)
            }
            Ok(FlushOutcome::CommittedEmpty { .. }) => {
                self.metrics.inc_batches_committed(0, 0);
                self.maybe_fetch().await;
                None
            }
            Ok(FlushOutcome::PushedToSms) => {
                self.metrics.inc_batches_flushed();
                None
            }
            Ok(FlushOutcome::IgnorableAcked) | Ok(FlushOutcome::OutOfOrderAcked) | Ok(FlushOutcome::UnknownAcked) => None,
            Err(AppError::SmsFatal(msg)) => {
                tracing::error!(error = %msg, "sms push failed fatally, stopping worker");
                Some(StopReason::SmsFatal)
            }
            Err(err) => {
                tracing::error!(error = %err, "flush_batch failed");
                Some(StopReason::Error)
            }
        }
    }

    // ---- §4.6.2 check_state ----

    async fn check_state(&mut self) -> Option<StopReason> {
        match self.backfill_registry.is_active(&self.config.backfill_id).await {
            Ok(false) => return Some(StopReason::BackfillDeactivated),
            Err(err) => {
                tracing::warn!(error = %err, "check_state: is_active query failed");
            }
            Ok(true) => {}
        }

        if !self.sms.is_alive().await {
            return Some(StopReason::SmsDown);
        }

        match self.sms.count_messages(&self.config.consumer_id).await {
            Ok(count) => self.last_known_sms_pending = count,
            Err(err) => tracing::warn!(error = %err, "check_state: count_messages failed"),
        }

        match self.source_db.fetch_slot_lsn(&self.config.database.slot_name).await {
            Ok(slot_lsn) => {
                for batch in &self.queues.unflushed {
                    if batch.approximate_lsn < slot_lsn {
                        return Some(StopReason::StaleBatch);
                    }
                }
            }
            Err(AppError::SlotNotFound(name)) => {
                tracing::error!(slot = %name, "replication slot not found");
                return Some(StopReason::Error);
            }
            Err(err) => tracing::warn!(error = %err, "check_state: slot lsn probe failed"),
        }

        None
    }

    // ---- §4.6.2 check_sms ----

    async fn check_sms(&mut self, consumer_id: &str) -> Option<StopReason> {
        let unpersisted = match self.sms.unpersisted_table_reader_batch_ids(consumer_id).await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(error = %err, "check_sms: unpersisted_table_reader_batch_ids failed");
                return None;
            }
        };

        let committed = self.queues.drain_committed(&unpersisted);
        let mut rows_processed = 0u64;
        let mut rows_ingested = 0u64;
        for batch in &committed {
            if let Err(err) = self
                .backfill_registry
                .update_cursor(&self.config.backfill_id, &batch.cursor)
                .await
            {
                tracing::error!(error = %err, batch_id = %batch.id, "failed to persist cursor on commit");
            }
            rows_processed += batch.size as u64;
            rows_ingested += batch.delivered as u64;
        }
        if !committed.is_empty() {
            if let Err(err) = self
                .backfill_registry
                .update_counters(&self.config.backfill_id, rows_processed, rows_ingested)
                .await
            {
                tracing::error!(error = %err, "failed to update backfill counters");
            }
            self.metrics.inc_batches_committed(rows_processed, rows_ingested);
        }

        // Stage 1 latched `done_fetching` on seeing an empty PK scan while
        // batches were still in flight (§4.6.4); once every batch drains
        // through here there's nothing left to fetch or flush.
        if self.done_fetching && self.queues.is_empty() {
            return self.finish_backfill().await;
        }
        None
    }

    // ---- §4.6.2 process_logging ----

    fn process_logging(&mut self) {
        self.metrics.set_queue_depth(self.queues.depth() as i64);
        self.metrics.set_page_size(self.optimizer.size() as i64);
        self.metrics
            .set_successive_failures(self.successive_failure_count as i64);
        tracing::info!(
            backfill_id = %self.config.backfill_id,
            queue_depth = self.queues.depth(),
            page_size = self.optimizer.size(),
            successive_failures = self.successive_failure_count,
            stage1_accum_ms = self.stage1_accum_ms,
            stage2_accum_ms = self.stage2_accum_ms,
            "table reader status"
        );
        self.stage1_accum_ms = 0;
        self.stage2_accum_ms = 0;
    }
}

/// Awaits a live task's `JoinHandle`, or never resolves if the slot is
/// empty. `Ok(())` is the task's normal exit (it already sent its tagged
/// event, which `events_rx.recv()` will observe on a future poll) and is
/// not itself actionable here; only the `Err` case (panic or cancellation)
/// needs handling by the caller.
async fn join_or_pending(slot: &mut Option<FetchTaskSlot>) -> Result<(), tokio::task::JoinError> {
    match slot {
        Some(slot) => (&mut slot.handle).await,
        None => std::future::pending().await,
    }
}

/// `successive_failure_count` is always >= 1 when this is consulted (the
/// caller skips the backoff check entirely at 0). The first failure backs
/// off by exactly `BACKOFF_BASE` (spec §4.6.4/§4.6.7 "schedule fetch with a
/// 1 s delay"), doubling per additional failure up to `BACKOFF_CAP`.
fn backoff_delay(successive_failure_count: u32) -> Duration {
    let exponent = successive_failure_count.saturating_sub(1).min(16);
    let factor = 1u64 << exponent;
    BACKOFF_BASE.saturating_mul(factor as u32).min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appconfig::{DatabaseConfig, LoggingConfig, MetricsConfig, SmsConfig, TableReaderConfig};
    use crate::backfill_registry::test_support::FakeBackfillRegistry;
    use crate::cursor::PrimaryKey;
    use crate::source_db::test_support::FakeSourceDb;
    use crate::sms::test_support::FakeSms;
    use crate::watermark::test_support::FakeWatermarkEmitter;

    #[test]
    fn backoff_delay_starts_at_one_second() {
        assert_eq!(backoff_delay(1), BACKOFF_BASE);
    }

    #[test]
    fn backoff_delay_caps_at_five_minutes() {
        assert_eq!(backoff_delay(20), BACKOFF_CAP);
    }

    #[test]
    fn backoff_delay_grows() {
        assert!(backoff_delay(3) > backoff_delay(2));
    }

    fn test_config(consumer_id: &str, backfill_id: &str, max_pending_messages: u64) -> TableReaderConfig {
        TableReaderConfig {
            backfill_id: backfill_id.to_string(),
            table_oid: "16420".to_string(),
            consumer_id: consumer_id.to_string(),
            max_pending_messages,
            initial_page_size: 10,
            max_timeout_ms: 5_000,
            max_page_size: 1_000,
            check_state_timeout_ms: 1_000,
            check_sms_timeout_ms: 1_000,
            max_batches_in_memory: 3,
            max_backoff_ms: 1_000,
            max_backoff_time_ms: 60_000,
            database: DatabaseConfig {
                source_dsn_env: "UNUSED_SOURCE_DSN".to_string(),
                registry_dsn_env: "UNUSED_REGISTRY_DSN".to_string(),
                pool_min: 1,
                pool_max: 1,
                connect_timeout_ms: 1_000,
                idle_timeout_sec: 60,
                slot_name: "slot_1".to_string(),
                sort_columns: vec!["id".to_string()],
                pk_columns: vec!["id".to_string()],
            },
            sms: SmsConfig {
                consumer_id: consumer_id.to_string(),
                endpoint_env: "UNUSED_SMS_ENDPOINT".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            metrics: MetricsConfig {
                enabled: false,
                bind_addr: "0.0.0.0".to_string(),
                port: 9464,
                metrics_path: "/metrics".to_string(),
            },
        }
    }

    async fn init_owner(consumer_id: &str, backfill_id: &str, max_pending_messages: u64) -> Owner {
        let config = test_config(consumer_id, backfill_id, max_pending_messages);
        let source_db: Arc<dyn SourceDb> = Arc::new(FakeSourceDb::new(
            vec![(PrimaryKey::new(vec!["1".into()]), serde_json::json!({"id": 1}))],
            0,
        ));
        let watermark_emitter: Arc<dyn WatermarkEmitter> = Arc::new(FakeWatermarkEmitter::new(1));
        let sms: Arc<dyn Sms> = Arc::new(FakeSms::default());
        let backfill_registry: Arc<dyn BackfillRegistry> =
            Arc::new(FakeBackfillRegistry::new(backfill_id, None));
        let metrics = Arc::new(TableReaderMetrics::new().unwrap());
        let batches_changed = Arc::new(Notify::new());

        let (owner, _handle) = Owner::initialize(
            config,
            Cursor::new(vec![serde_json::json!(0)]),
            source_db,
            watermark_emitter,
            sms,
            backfill_registry,
            metrics,
            batches_changed,
        )
        .await
        .unwrap();

        owner
    }

    #[tokio::test]
    async fn should_fetch_true_initially() {
        let owner = init_owner("consumer_a", "bf_a", 1_000).await;
        assert!(owner.should_fetch());
    }

    #[tokio::test]
    async fn should_fetch_false_once_over_pending_cap() {
        let mut owner = init_owner("consumer_b", "bf_b", 0).await;
        owner.last_known_sms_pending = 0;
        // max_pending_messages is 0, so even a pending count of 0 is already
        // at the cap (spec §4.6.3: `pending >= max_pending_messages`).
        assert!(!owner.should_fetch());
    }

    #[tokio::test]
    async fn should_fetch_false_while_a_fetch_task_is_in_flight() {
        let mut owner = init_owner("consumer_c", "bf_c", 1_000).await;
        owner.maybe_fetch().await;
        assert!(owner.current_id_fetch_task.is_some());
        assert!(!owner.should_fetch());
    }

    #[tokio::test]
    async fn should_fetch_false_during_backoff_window() {
        let mut owner = init_owner("consumer_d", "bf_d", 1_000).await;
        owner.successive_failure_count = 1;
        owner.last_fetch_request_at = Some(Instant::now());
        assert!(!owner.should_fetch());
    }

    #[tokio::test]
    async fn stage1_task_crash_frees_the_slot_and_counts_as_a_failure() {
        let mut owner = init_owner("consumer_e", "bf_e", 1_000).await;
        let handle = tokio::spawn(async { panic!("stage 1 task crashed") });
        owner.current_id_fetch_task = Some(FetchTaskSlot {
            batch_id: BatchId::new_v4(),
            page_size: 10,
            started_at: Instant::now(),
            handle,
        });

        let join_err = (&mut owner.current_id_fetch_task.as_mut().unwrap().handle)
            .await
            .unwrap_err();
        owner.handle_task_crash(Stage::Stage1, join_err);

        assert!(owner.current_id_fetch_task.is_none());
        assert_eq!(owner.successive_failure_count, 1);
        assert!(owner.should_fetch());
    }

    #[tokio::test]
    async fn stage2_task_crash_releases_the_pk_multiset_reservation() {
        let mut owner = init_owner("consumer_f", "bf_f", 1_000).await;
        let batch_id = BatchId::new_v4();
        owner
            .pk_multiset
            .add(batch_id, vec![PrimaryKey::new(vec!["1".into()])]);
        owner.stage2_pending_for = Some(batch_id);

        let handle = tokio::spawn(async { panic!("stage 2 task crashed") });
        owner.current_batch_fetch_task = Some(FetchTaskSlot {
            batch_id,
            page_size: 10,
            started_at: Instant::now(),
            handle,
        });

        let join_err = (&mut owner.current_batch_fetch_task.as_mut().unwrap().handle)
            .await
            .unwrap_err();
        owner.handle_task_crash(Stage::Stage2, join_err);

        assert!(owner.current_batch_fetch_task.is_none());
        assert!(owner.stage2_pending_for.is_none());
        assert_eq!(owner.successive_failure_count, 1);
        assert!(!owner.pk_multiset.keys().contains(&batch_id));
    }
}
