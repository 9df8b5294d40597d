//! Lightweight counters shared with collaborators during bootstrap.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters a tablet's log and bootstrap feed while running.
///
/// A `MetricContext` is scoped to one tablet and shared by reference with
/// the collaborators that produce the numbers.
#[derive(Debug, Default)]
pub struct MetricContext {
    entries_appended: AtomicU64,
    bytes_appended: AtomicU64,
    segments_created: AtomicU64,
}

impl MetricContext {
    /// A fresh context with all counters at zero.
    pub fn new() -> Self {
        MetricContext::default()
    }

    /// Record one appended log entry of `bytes` encoded size.
    pub fn record_append(&self, bytes: u64) {
        self.entries_appended.fetch_add(1, Ordering::Relaxed);
        self.bytes_appended.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record creation of a new log segment.
    pub fn record_segment_created(&self) {
        self.segments_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Total entries appended.
    pub fn entries_appended(&self) -> u64 {
        self.entries_appended.load(Ordering::Relaxed)
    }

    /// Total encoded bytes appended.
    pub fn bytes_appended(&self) -> u64 {
        self.bytes_appended.load(Ordering::Relaxed)
    }

    /// Total segments created.
    pub fn segments_created(&self) -> u64 {
        self.segments_created.load(Ordering::Relaxed)
    }
}
