//! Prometheus metrics for one Table Reader worker, modeled on the teacher's
//! `ingest/metrics.rs`: a `Registry` plus a handful of public handles, inert
//! behind the `metrics` feature so a build without it still compiles and
//! just does nothing.

use crate::error::{AppError, AppResult};

#[cfg(feature = "metrics")]
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};

#[derive(Clone, Debug)]
pub struct TableReaderMetrics {
    #[cfg(feature = "metrics")]
    registry: Registry,

    #[cfg(feature = "metrics")]
    pub batches_fetched_total: IntCounter,
    #[cfg(feature = "metrics")]
    pub batches_flushed_total: IntCounter,
    #[cfg(feature = "metrics")]
    pub batches_committed_total: IntCounter,
    #[cfg(feature = "metrics")]
    pub batches_ignored_total: IntCounter,

    #[cfg(feature = "metrics")]
    pub rows_processed_total: IntCounter,
    #[cfg(feature = "metrics")]
    pub rows_ingested_total: IntCounter,

    #[cfg(feature = "metrics")]
    pub stage1_latency_seconds: Histogram,
    #[cfg(feature = "metrics")]
    pub stage2_latency_seconds: Histogram,

    #[cfg(feature = "metrics")]
    pub queue_depth: IntGauge,
    #[cfg(feature = "metrics")]
    pub page_size: IntGauge,

    #[cfg(feature = "metrics")]
    pub sms_retries_total: IntCounter,
    #[cfg(feature = "metrics")]
    pub successive_failures: IntGauge,
    #[cfg(feature = "metrics")]
    pub query_timeouts_total: IntCounter,

    #[cfg(not(feature = "metrics"))]
    _noop: (),
}

impl TableReaderMetrics {
    pub fn new() -> AppResult<Self> {
        #[cfg(feature = "metrics")]
        {
            let registry = Registry::new();

            let batches_fetched_total = IntCounter::with_opts(Opts::new(
                "table_reader_batches_fetched_total",
                "Batches that completed Stage 2 and joined the unflushed queue",
            ))?;
            let batches_flushed_total = IntCounter::with_opts(Opts::new(
                "table_reader_batches_flushed_total",
                "Batches pushed to the SMS",
            ))?;
            let batches_committed_total = IntCounter::with_opts(Opts::new(
                "table_reader_batches_committed_total",
                "Batches confirmed persisted by the SMS and dropped",
            ))?;
            let batches_ignored_total = IntCounter::with_opts(Opts::new(
                "table_reader_batches_ignored_total",
                "Batches marked ignorable (Stage 2 yielded zero deliverable rows)",
            ))?;

            let rows_processed_total = IntCounter::with_opts(Opts::new(
                "table_reader_rows_processed_total",
                "Rows scanned by Stage 2, committed batches only",
            ))?;
            let rows_ingested_total = IntCounter::with_opts(Opts::new(
                "table_reader_rows_ingested_total",
                "Rows actually delivered to the SMS, committed batches only",
            ))?;

            let stage1_latency_seconds = Histogram::with_opts(HistogramOpts::new(
                "table_reader_stage1_latency_seconds",
                "Stage-1 PK scan latency",
            ))?;
            let stage2_latency_seconds = Histogram::with_opts(HistogramOpts::new(
                "table_reader_stage2_latency_seconds",
                "Stage-2 row fetch latency",
            ))?;

            let queue_depth = IntGauge::with_opts(Opts::new(
                "table_reader_queue_depth",
                "unflushed + flushed batch count",
            ))?;
            let page_size = IntGauge::with_opts(Opts::new(
                "table_reader_page_size",
                "Current recommended page size",
            ))?;

            let sms_retries_total = IntCounter::with_opts(Opts::new(
                "table_reader_sms_retries_total",
                "SMS push attempts beyond the first, across all batches",
            ))?;
            let successive_failures = IntGauge::with_opts(Opts::new(
                "table_reader_successive_failures",
                "Current successive fetch failure count driving backoff",
            ))?;
            let query_timeouts_total = IntCounter::with_opts(Opts::new(
                "table_reader_query_timeouts_total",
                "Query-timeout samples fed to the page-size optimizer",
            ))?;

            registry.register(Box::new(batches_fetched_total.clone()))?;
            registry.register(Box::new(batches_flushed_total.clone()))?;
            registry.register(Box::new(batches_committed_total.clone()))?;
            registry.register(Box::new(batches_ignored_total.clone()))?;
            registry.register(Box::new(rows_processed_total.clone()))?;
            registry.register(Box::new(rows_ingested_total.clone()))?;
            registry.register(Box::new(stage1_latency_seconds.clone()))?;
            registry.register(Box::new(stage2_latency_seconds.clone()))?;
            registry.register(Box::new(queue_depth.clone()))?;
            registry.register(Box::new(page_size.clone()))?;
            registry.register(Box::new(sms_retries_total.clone()))?;
            registry.register(Box::new(successive_failures.clone()))?;
            registry.register(Box::new(query_timeouts_total.clone()))?;

            Ok(Self {
                registry,
                batches_fetched_total,
                batches_flushed_total,
                batches_committed_total,
                batches_ignored_total,
                rows_processed_total,
                rows_ingested_total,
                stage1_latency_seconds,
                stage2_latency_seconds,
                queue_depth,
                page_size,
                sms_retries_total,
                successive_failures,
                query_timeouts_total,
            })
        }

        #[cfg(not(feature = "metrics"))]
        {
            Ok(Self { _noop: () })
        }
    }

    #[cfg(feature = "metrics")]
    pub fn encode_text(&self) -> AppResult<String> {
        use prometheus::{Encoder, TextEncoder};
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&mf, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    #[cfg(not(feature = "metrics"))]
    pub fn encode_text(&self) -> AppResult<String> {
        Err(AppError::InvalidConfig("metrics feature is disabled".into()))
    }

    #[inline]
    pub fn inc_batches_fetched(&self) {
        #[cfg(feature = "metrics")]
        self.batches_fetched_total.inc();
    }

    #[inline]
    pub fn inc_batches_flushed(&self) {
        #[cfg(feature = "metrics")]
        self.batches_flushed_total.inc();
    }

    #[inline]
    pub fn inc_batches_committed(&self, rows_processed: u64, rows_ingested: u64) {
        #[cfg(feature = "metrics")]
        {
            self.batches_committed_total.inc();
            self.rows_processed_total.inc_by(rows_processed);
            self.rows_ingested_total.inc_by(rows_ingested);
        }
        #[cfg(not(feature = "metrics"))]
        {
            let _ = (rows_processed, rows_ingested);
        }
    }

    #[inline]
    pub fn inc_batches_ignored(&self) {
        #[cfg(feature = "metrics")]
        self.batches_ignored_total.inc();
    }

    #[inline]
    pub fn observe_stage1(&self, _secs: f64) {
        #[cfg(feature = "metrics")]
        self.stage1_latency_seconds.observe(_secs);
    }

    #[inline]
    pub fn observe_stage2(&self, _secs: f64) {
        #[cfg(feature = "metrics")]
        self.stage2_latency_seconds.observe(_secs);
    }

    #[inline]
    pub fn set_queue_depth(&self, _depth: i64) {
        #[cfg(feature = "metrics")]
        self.queue_depth.set(_depth);
    }

    #[inline]
    pub fn set_page_size(&self, _size: i64) {
        #[cfg(feature = "metrics")]
        self.page_size.set(_size);
    }

    #[inline]
    pub fn inc_sms_retry(&self) {
        #[cfg(feature = "metrics")]
        self.sms_retries_total.inc();
    }

    #[inline]
    pub fn set_successive_failures(&self, _n: i64) {
        #[cfg(feature = "metrics")]
        self.successive_failures.set(_n);
    }

    #[inline]
    pub fn inc_query_timeout(&self) {
        #[cfg(feature = "metrics")]
        self.query_timeouts_total.inc();
    }
}
