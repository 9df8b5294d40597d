//! Log writer.
//!
//! The writer owns the active segment of a tablet's WAL directory. Appends
//! are framed through the entry codec and synced according to the options;
//! when an append would push the active segment past the size limit, the
//! writer rotates to a new segment first.
//!
//! During bootstrap the engine disables sync to speed up the rewrite of
//! replayed entries; the caller re-enables it once bootstrap returns. This
//! is safe because the recovery directory holding the originals is not
//! removed until the new log is fully written.

use crate::entry::{encode_entry, EntryCodecError, LogEntry};
use crate::options::LogOptions;
use crate::segment::{parse_segment_file_name, WritableSegment};
use plateau_core::{FsManager, MetricContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Log writer errors.
#[derive(Debug, thiserror::Error)]
pub enum LogWriteError {
    /// I/O failure.
    #[error("I/O error writing log: {0}")]
    Io(#[from] std::io::Error),

    /// The entry could not be encoded.
    #[error("could not encode log entry: {0}")]
    Codec(#[from] EntryCodecError),
}

/// Writer for one tablet's WAL.
pub struct Log {
    dir: PathBuf,
    options: LogOptions,
    metrics: Arc<MetricContext>,
    active: WritableSegment,
    sync_disabled: bool,
    unsynced_appends: bool,
}

impl Log {
    /// Open a log in the tablet's WAL directory, creating a fresh active
    /// segment numbered after any segments already present.
    pub fn open(
        options: LogOptions,
        fs: &FsManager,
        tablet_id: &str,
        metrics: Arc<MetricContext>,
    ) -> Result<Self, LogWriteError> {
        let dir = fs.tablet_wal_dir(tablet_id);
        fs.create_dir_if_missing(&dir)?;

        let mut max_existing = 0;
        for name in fs.list_dir(&dir)? {
            if let Some(seq) = parse_segment_file_name(&name) {
                max_existing = max_existing.max(seq);
            }
        }
        let sequence_number = max_existing + 1;

        let active = WritableSegment::create(&dir, sequence_number)?;
        metrics.record_segment_created();
        info!(
            target: "plateau::wal",
            tablet_id,
            segment = sequence_number,
            "opened log"
        );

        Ok(Log {
            dir,
            options,
            metrics,
            active,
            sync_disabled: false,
            unsynced_appends: false,
        })
    }

    /// Append an entry, rotating and syncing per the options.
    pub fn append(&mut self, entry: &LogEntry) -> Result<(), LogWriteError> {
        let bytes = encode_entry(entry)?;

        if self.active.size() + bytes.len() as u64 > self.options.segment_size_bytes {
            self.rotate()?;
        }

        self.active.write(&bytes)?;
        self.metrics.record_append(bytes.len() as u64);

        if self.options.sync_on_append && !self.sync_disabled {
            self.active.sync()?;
        } else {
            self.unsynced_appends = true;
        }
        Ok(())
    }

    /// Force the active segment to stable storage.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.active.sync()?;
        self.unsynced_appends = false;
        Ok(())
    }

    /// Stop syncing appends until `re_enable_sync_if_required` is called.
    pub fn disable_sync(&mut self) {
        self.sync_disabled = true;
    }

    /// Re-enable syncing, flushing anything appended while it was off.
    pub fn re_enable_sync_if_required(&mut self) -> std::io::Result<()> {
        self.sync_disabled = false;
        if self.unsynced_appends {
            self.sync()?;
        }
        Ok(())
    }

    /// The WAL directory this log writes into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sequence number of the active segment.
    pub fn active_segment_sequence_number(&self) -> u64 {
        self.active.sequence_number()
    }

    /// Close the current segment and start a new one.
    ///
    /// The outgoing segment is synced unconditionally: once rotated away
    /// from, it can no longer be flushed by `re_enable_sync_if_required`.
    fn rotate(&mut self) -> Result<(), LogWriteError> {
        self.active.sync()?;
        let next = self.active.sequence_number() + 1;
        debug!(
            target: "plateau::wal",
            segment = next,
            "rotating to new log segment"
        );
        self.active = WritableSegment::create(&self.dir, next)?;
        self.metrics.record_segment_created();
        Ok(())
    }
}
