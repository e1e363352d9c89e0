//! Per-batch primary-key multiset (spec §3, §4.2).
//!
//! Stage 1 populates this under a fresh `batch_id` as soon as it has a page
//! of primary keys; CDC events (the hot path, via `pks_seen`) and the
//! `drop_pks` admin operation remove entries concurrently; flush consults it
//! to filter a batch's messages; the key is deleted at flush completion or
//! batch discard.
//!
//! This must be reachable without routing through the owner's mailbox, so it
//! is a `DashMap` behind a process-global named registry rather than
//! owner-private state (spec §9 "Global per-consumer state").

use crate::cursor::PrimaryKey;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, OnceLock};

pub type BatchId = uuid::Uuid;

/// Concurrently readable/writable mapping `batch_id -> set<primary_key>`.
#[derive(Debug, Default)]
pub struct PkMultiset {
    inner: DashMap<BatchId, DashSet<PrimaryKey>>,
}

impl PkMultiset {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Union-insert; idempotent.
    pub fn add(&self, batch_id: BatchId, pks: impl IntoIterator<Item = PrimaryKey>) {
        let entry = self.inner.entry(batch_id).or_default();
        for pk in pks {
            entry.insert(pk);
        }
    }

    /// Set difference; idempotent, ignores missing keys and missing members.
    pub fn remove(&self, batch_id: BatchId, pks: &[PrimaryKey]) {
        if let Some(set) = self.inner.get(&batch_id) {
            for pk in pks {
                set.remove(pk);
            }
        }
    }

    /// Remove the given PKs from every batch currently tracked (the
    /// `drop_pks` admin operation, spec §4.6.8).
    pub fn remove_from_all(&self, pks: &[PrimaryKey]) {
        for entry in self.inner.iter() {
            for pk in pks {
                entry.value().remove(pk);
            }
        }
    }

    pub fn contains(&self, batch_id: BatchId, pk: &PrimaryKey) -> bool {
        self.inner
            .get(&batch_id)
            .map(|set| set.contains(pk))
            .unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<BatchId> {
        self.inner.iter().map(|e| *e.key()).collect()
    }

    /// Drop the entire key. No-op if missing.
    pub fn delete(&self, batch_id: BatchId) {
        self.inner.remove(&batch_id);
    }
}

/// Process-global registry of `PkMultiset` handles keyed by consumer id, so
/// the CDC message handler can reach a running worker's multiset without
/// going through the state machine (spec §4.2, §9).
///
/// Registration is idempotent on startup and released on worker termination.
/// If no worker is registered for a consumer (not running, or between
/// shutdown and restart), `remove`/`remove_from_all` on the returned handle
/// are silent no-ops by construction — callers that can't find a handle
/// simply have nothing to do.
#[derive(Debug, Default)]
pub struct PkMultisetRegistry {
    handles: DashMap<String, Arc<PkMultiset>>,
}

impl PkMultisetRegistry {
    fn new() -> Self {
        Self {
            handles: DashMap::new(),
        }
    }

    pub fn global() -> &'static PkMultisetRegistry {
        static REGISTRY: OnceLock<PkMultisetRegistry> = OnceLock::new();
        REGISTRY.get_or_init(PkMultisetRegistry::new)
    }

    /// Idempotent: returns the existing handle if one is already registered
    /// for this consumer, else creates and registers a fresh one.
    pub fn register(&self, consumer_id: &str) -> Arc<PkMultiset> {
        self.handles
            .entry(consumer_id.to_string())
            .or_insert_with(|| Arc::new(PkMultiset::new()))
            .clone()
    }

    pub fn lookup(&self, consumer_id: &str) -> Option<Arc<PkMultiset>> {
        self.handles.get(consumer_id).map(|h| h.clone())
    }

    pub fn unregister(&self, consumer_id: &str) {
        self.handles.remove(consumer_id);
    }
}

/// Hot-path entry point for the CDC message handler: `pks_seen(consumer_id,
/// pks)` bypasses the owner's mailbox entirely (spec §6).
pub fn pks_seen(consumer_id: &str, pks: &[PrimaryKey]) {
    if let Some(multiset) = PkMultisetRegistry::global().lookup(consumer_id) {
        for batch_id in multiset.keys() {
            multiset.remove(batch_id, pks);
        }
    }
    // No worker registered: silent no-op (spec §4.2).
}
