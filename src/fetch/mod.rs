//! Two-stage fetcher (spec §4.3): Stage 1 scans primary keys past the
//! cursor, Stage 2 fetches the corresponding rows bracketed by watermarks.
//! Both stages run as tasks off the owner loop so the owner's mailbox stays
//! responsive (spec §5); their outcomes are delivered back to the owner as
//! tagged events so stray results (spec §4.6.6, §9 "tagged results") can be
//! told apart from the current live task.

use crate::cursor::Cursor;
use crate::error::AppError;
use crate::pk_multiset::BatchId;
use crate::source_db::{FetchRowsArgs, ScanPksArgs, ScanPksResult, SourceDb};
use crate::state_machine::OwnerEvent;
use crate::watermark::{with_watermark, WatermarkEmitter};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Stage1,
    Stage2,
}

/// Identifies which in-flight task a result belongs to, so the owner can
/// discard stray results for abandoned batches (spec §4.6.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTag {
    pub stage: Stage,
    pub batch_id: BatchId,
}

/// Bookkeeping for a live Stage-1 or Stage-2 task (spec §3 "Two Fetch
/// Tasks").
pub struct FetchTaskSlot {
    pub batch_id: BatchId,
    pub page_size: usize,
    pub started_at: Instant,
    pub handle: JoinHandle<()>,
}

impl FetchTaskSlot {
    pub fn abort(&self) {
        self.handle.abort();
    }
}

pub struct Stage1Outcome {
    pub tag: FetchTag,
    pub result: Result<ScanPksResult, AppError>,
    pub elapsed_ms: u64,
}

pub struct Stage2Outcome {
    pub tag: FetchTag,
    pub result: Result<(Vec<crate::batch::Message>, i64), AppError>,
    pub elapsed_ms: u64,
}

#[allow(clippy::too_many_arguments)]
pub fn spawn_stage1(
    source_db: Arc<dyn SourceDb>,
    table_oid: String,
    cursor: Cursor,
    page_size: usize,
    include_min: bool,
    batch_id: BatchId,
    events: UnboundedSender<OwnerEvent>,
) -> FetchTaskSlot {
    let started_at = Instant::now();
    let tag = FetchTag {
        stage: Stage::Stage1,
        batch_id,
    };

    let handle = tokio::spawn(async move {
        let result = source_db
            .scan_pks(ScanPksArgs {
                table_oid: &table_oid,
                cursor: &cursor,
                limit: page_size,
                include_min,
            })
            .await
            .map_err(|e| tag_page_size(e, page_size));

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        let _ = events.send(OwnerEvent::Stage1(Stage1Outcome {
            tag,
            result,
            elapsed_ms,
        }));
    });

    FetchTaskSlot {
        batch_id,
        page_size,
        started_at,
        handle,
    }
}

#[allow(clippy::too_many_arguments)]
pub fn spawn_stage2(
    source_db: Arc<dyn SourceDb>,
    watermark_emitter: Arc<dyn WatermarkEmitter>,
    slot_id: String,
    backfill_id: String,
    table_oid: String,
    cursor: Cursor,
    page_size: usize,
    include_min: bool,
    batch_id: BatchId,
    events: UnboundedSender<OwnerEvent>,
) -> FetchTaskSlot {
    let started_at = Instant::now();
    let tag = FetchTag {
        stage: Stage::Stage2,
        batch_id,
    };

    let handle = tokio::spawn(async move {
        let db = source_db.clone();
        let watermark_table_oid = table_oid.clone();
        let result = with_watermark(
            watermark_emitter.as_ref(),
            &slot_id,
            &backfill_id,
            batch_id,
            &watermark_table_oid,
            || async move {
                db.fetch_rows(FetchRowsArgs {
                    table_oid: &table_oid,
                    cursor: &cursor,
                    limit: page_size,
                    include_min,
                })
                .await
                .map(|r| r.messages)
            },
        )
        .await
        .map_err(|e| tag_page_size(e, page_size));

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        let _ = events.send(OwnerEvent::Stage2(Stage2Outcome {
            tag,
            result,
            elapsed_ms,
        }));
    });

    FetchTaskSlot {
        batch_id,
        page_size,
        started_at,
        handle,
    }
}

/// Query-timeout errors carry the page size they were attempted at, so the
/// owner can feed the optimizer regardless of which call site produced the
/// timeout (`sqlx_impl` already tags its own timeouts; the in-memory test
/// double does not, so this fills it in defensively).
fn tag_page_size(err: AppError, page_size: usize) -> AppError {
    match err {
        AppError::QueryTimeout { .. } => AppError::QueryTimeout { page_size },
        other => other,
    }
}
