//! Flush coordinator: `flush_batch` semantics (spec §4.4), evaluated in the
//! order given there. Kept free of timer/task-scheduling concerns so it can
//! be exercised directly in tests; the owner loop in `state_machine` decides
//! what "defer to self" and "shut down the worker" actually do.

use crate::batch::{Batch, BatchQueues};
use crate::backfill_registry::BackfillRegistry;
use crate::error::{AppError, AppResult};
use crate::pk_multiset::{BatchId, PkMultiset};
use crate::sms::client::push_with_retry;
use crate::sms::{PushOutcome, Sms};
use std::collections::HashSet;

/// What happened as a result of a `flush_batch` call, for the owner to log
/// and feed into metrics.
#[derive(Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Stage 2 for this batch hasn't landed yet; caller must re-deliver
    /// after a short delay (spec §4.4 rule 1, §9 re-entrancy note).
    Deferred,
    /// `batch_id` was in the ignorable set (spec rule 2).
    IgnorableAcked,
    /// No unflushed batches and an unknown id: late/duplicate (rule 3).
    UnknownAcked,
    /// `batch_id` already in `flushed_batches`: logic error upstream
    /// (rule 4). The worker must stop.
    DuplicateFatal,
    /// `batch_id` isn't the head of `unflushed_batches` (rule 5).
    OutOfOrderAcked,
    /// Every message was filtered out by the PK multiset; the batch is
    /// considered committed in place (rule 6, empty branch).
    CommittedEmpty { cursor: crate::cursor::Cursor },
    /// Surviving messages were pushed to the SMS and the batch moved to
    /// `flushed_batches` (rule 6, non-empty branch).
    PushedToSms,
}

pub struct FlushContext<'a> {
    pub queues: &'a mut BatchQueues,
    pub ignorable: &'a mut HashSet<BatchId>,
    pub stage2_in_flight: Option<BatchId>,
    pub pk_multiset: &'a PkMultiset,
    pub sms: &'a dyn Sms,
    pub backfill_registry: &'a dyn BackfillRegistry,
    pub backfill_id: &'a str,
    pub consumer_id: &'a str,
}

/// Implements the six ordered `flush_batch` rules. On success the caller
/// still owns deciding what to do with `FlushOutcome::Deferred` (reschedule)
/// and `FlushOutcome::DuplicateFatal` (stop the worker); everything else is
/// a terminal outcome for this call.
pub async fn flush_batch(
    ctx: &mut FlushContext<'_>,
    batch_id: BatchId,
    commit_lsn: i64,
) -> AppResult<FlushOutcome> {
    // Rule 1: Stage 2 still in flight for this batch.
    if ctx.stage2_in_flight == Some(batch_id) {
        return Ok(FlushOutcome::Deferred);
    }

    // Rule 2: ignorable batch.
    if ctx.ignorable.remove(&batch_id) {
        ctx.pk_multiset.delete(batch_id);
        return Ok(FlushOutcome::IgnorableAcked);
    }

    // Rule 3: unknown id with nothing unflushed.
    if ctx.queues.unflushed.is_empty() && !ctx.queues.contains_flushed(batch_id) {
        tracing::info!(batch_id = %batch_id, "flush_batch for unknown batch id, acking");
        return Ok(FlushOutcome::UnknownAcked);
    }

    // Rule 4: duplicate delivery of an already-flushed batch.
    if ctx.queues.contains_flushed(batch_id) {
        return Ok(FlushOutcome::DuplicateFatal);
    }

    // Rule 5: out-of-order flush.
    let head_id = ctx.queues.head_unflushed().map(|b| b.id);
    if head_id != Some(batch_id) {
        tracing::warn!(
            batch_id = %batch_id,
            head = ?head_id,
            "out-of-order flush_batch, acking without mutation"
        );
        return Ok(FlushOutcome::OutOfOrderAcked);
    }

    // Rule 6: normal flush of the head.
    let batch = ctx.queues.pop_head_unflushed().expect("head_unflushed just matched");
    normal_flush(ctx, batch, commit_lsn).await
}

async fn normal_flush(
    ctx: &mut FlushContext<'_>,
    mut batch: Batch,
    commit_lsn: i64,
) -> AppResult<FlushOutcome> {
    let batch_id = batch.id;
    let survivors: Vec<usize> = batch
        .messages
        .iter()
        .enumerate()
        .filter(|(_, m)| ctx.pk_multiset.contains(batch_id, &m.primary_key))
        .map(|(i, _)| i)
        .collect();

    ctx.pk_multiset.delete(batch_id);

    if survivors.is_empty() {
        batch.clear_messages();
        batch.set_delivered(0);
        ctx.backfill_registry
            .update_cursor(ctx.backfill_id, &batch.cursor)
            .await?;
        return Ok(FlushOutcome::CommittedEmpty { cursor: batch.cursor });
    }

    let mut idx: u64 = 0;
    let survivor_set: std::collections::HashSet<usize> = survivors.into_iter().collect();
    let messages: Vec<_> = batch
        .messages
        .iter()
        .enumerate()
        .filter(|(i, _)| survivor_set.contains(i))
        .map(|(_, m)| {
            let mut m = m.clone();
            m.commit_lsn = Some(commit_lsn);
            m.commit_idx = Some(idx);
            idx += 1;
            m
        })
        .collect();

    let delivered = messages.len();
    match push_with_retry(ctx.sms, ctx.consumer_id, &messages, batch_id).await {
        Ok(PushOutcome::Ok) => {
            batch.clear_messages();
            batch.set_delivered(delivered);
            ctx.queues.move_head_to_flushed(batch);
            Ok(FlushOutcome::PushedToSms)
        }
        Ok(PushOutcome::PayloadTooLarge) => Err(AppError::SmsPayloadTooLarge),
        Err(err) => Err(err),
    }
}
