#![deny(clippy::all)]
//! The two cache tiers.
//!
//! The done-marker store records, per task and per machine, the fingerprint
//! of the last successful run. The shared store is content-addressed: one
//! directory per fingerprint holding a manifest and the task's output files.
//! Corruption in either tier is demoted to a cache miss; user-visible files
//! are never deleted in response to a bad cache entry.

/// File system shared artifact store.
pub mod fs;
/// Per-task done markers stored inside package directories.
pub mod marker;

use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
};

pub use fs::{CacheEntry, CacheManifest, InputDescriptor, OutputDescriptor, RestoreOutcome,
             SharedStore};
pub use marker::{
    compute_outputs_digest, outputs_digest_from_pairs, DoneMarker, DoneMarkerStore, TASK_STATE_DIR,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid cache metadata: {0}")]
    InvalidMetadata(#[source] serde_json::Error),
    #[error("restored file {path} does not match its manifest hash")]
    HashMismatch { path: String },
    #[error("cache entry refers to a path outside its package: {path}")]
    PathEscape { path: String },
}

/// Which tier satisfied a cache probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheSource {
    Local,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHitMetadata {
    pub source: CacheSource,
    /// Original wall-clock runtime of the cached execution, in milliseconds.
    pub time_saved: u64,
}

/// Counters the shared store accumulates across a build. Cheap to share
/// between worker threads.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_restored: AtomicU64,
    time_saved_ms: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self, bytes_restored: u64, time_saved_ms: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_restored
            .fetch_add(bytes_restored, Ordering::Relaxed);
        self.time_saved_ms
            .fetch_add(time_saved_ms, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_restored: self.bytes_restored.load(Ordering::Relaxed),
            time_saved_ms: self.time_saved_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub bytes_restored: u64,
    pub time_saved_ms: u64,
}
