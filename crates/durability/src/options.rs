//! Log writer configuration.

/// Configuration for the log writer.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Maximum segment size in bytes (default: 64MB).
    ///
    /// When an append would push the active segment past this size, the
    /// writer rotates to a new segment first.
    pub segment_size_bytes: u64,

    /// Whether every append is synced to stable storage (default: true).
    ///
    /// Bootstrap disables sync temporarily while rewriting the log; see
    /// `Log::disable_sync`.
    pub sync_on_append: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            segment_size_bytes: 64 * 1024 * 1024,
            sync_on_append: true,
        }
    }
}

impl LogOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the segment size (builder pattern).
    pub fn with_segment_size_bytes(mut self, bytes: u64) -> Self {
        self.segment_size_bytes = bytes;
        self
    }

    /// Set sync-on-append (builder pattern).
    pub fn with_sync_on_append(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }

    /// Options for tests: tiny segments so rotation is cheap to trigger.
    pub fn for_testing() -> Self {
        LogOptions {
            segment_size_bytes: 4 * 1024,
            sync_on_append: true,
        }
    }
}
