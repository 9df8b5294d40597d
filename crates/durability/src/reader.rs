//! Recovery-side log reader.
//!
//! The reader enumerates a directory's segments in sequence order and
//! decodes their entries. Decoding is best-effort: entries before a bad
//! frame are always returned together with the failure, so a caller can
//! replay the valid prefix of a segment that was being appended to when the
//! process died and then surface the corruption with full context.

use crate::entry::{decode_entry, EntryCodecError, LogEntry};
use crate::segment::{parse_segment_file_name, read_segment_file, SegmentHeader};
use plateau_core::FsManager;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Log reader errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogReadError {
    /// I/O failure while listing or reading.
    #[error("I/O error reading log: {0}")]
    Io(String),

    /// A segment file's header is unreadable or inconsistent.
    #[error("invalid segment header in {path}: {detail}")]
    InvalidHeader {
        /// Path of the offending file.
        path: PathBuf,
        /// What was wrong with it.
        detail: String,
    },

    /// A segment's entry stream stops making sense partway through.
    #[error(
        "segment {sequence_number} ({path}) is corrupt after entry {entries_read}: {detail}"
    )]
    CorruptSegment {
        /// Sequence number of the segment.
        sequence_number: u64,
        /// Path of the segment file.
        path: PathBuf,
        /// Entries successfully decoded before the failure.
        entries_read: usize,
        /// The decoding failure.
        detail: String,
    },
}

/// One readable segment discovered by the reader.
#[derive(Debug, Clone)]
pub struct ReadableSegment {
    header: SegmentHeader,
    path: PathBuf,
}

impl ReadableSegment {
    /// The segment's header.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Path of the segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode the segment's entries in file order.
    ///
    /// Returns every entry decoded before the first failure, plus the
    /// failure itself if there was one. A partial frame at the tail (a
    /// crashed append) and a checksum mismatch are both failures.
    pub fn read_entries(&self) -> (Vec<LogEntry>, Result<(), LogReadError>) {
        let (_, body) = match read_segment_file(&self.path) {
            Ok(read) => read,
            Err(e) => return (Vec::new(), Err(LogReadError::Io(e.to_string()))),
        };

        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < body.len() {
            match decode_entry(&body[offset..]) {
                Ok((entry, consumed)) => {
                    entries.push(entry);
                    offset += consumed;
                }
                Err(EntryCodecError::InsufficientData) => {
                    let err = LogReadError::CorruptSegment {
                        sequence_number: self.header.sequence_number(),
                        path: self.path.clone(),
                        entries_read: entries.len(),
                        detail: "segment ends mid-entry (truncated append)".to_string(),
                    };
                    return (entries, Err(err));
                }
                Err(e) => {
                    let err = LogReadError::CorruptSegment {
                        sequence_number: self.header.sequence_number(),
                        path: self.path.clone(),
                        entries_read: entries.len(),
                        detail: e.to_string(),
                    };
                    return (entries, Err(err));
                }
            }
        }
        (entries, Ok(()))
    }
}

/// Reader over the segments of one log directory.
pub struct LogReader {
    dir: PathBuf,
    segments: Vec<ReadableSegment>,
}

impl LogReader {
    /// Open a reader over a tablet's recovery directory.
    pub fn open_from_recovery_dir(
        fs: &FsManager,
        tablet_id: &str,
    ) -> Result<Self, LogReadError> {
        Self::open(fs.tablet_wal_recovery_dir(tablet_id))
    }

    /// Open a reader over an arbitrary log directory.
    ///
    /// Non-segment files are ignored. Every segment's header is validated
    /// eagerly so a reader, once open, hands out segments in a consistent
    /// order.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LogReadError> {
        let dir = dir.into();

        let mut numbered: Vec<(u64, PathBuf)> = Vec::new();
        let listing = std::fs::read_dir(&dir).map_err(|e| LogReadError::Io(e.to_string()))?;
        for dirent in listing {
            let dirent = dirent.map_err(|e| LogReadError::Io(e.to_string()))?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            if let Some(seq) = parse_segment_file_name(&name) {
                numbered.push((seq, dirent.path()));
            }
        }
        numbered.sort_by_key(|(seq, _)| *seq);

        let mut segments = Vec::with_capacity(numbered.len());
        for (seq, path) in numbered {
            let (header, _) = read_segment_file(&path).map_err(|e| LogReadError::InvalidHeader {
                path: path.clone(),
                detail: e.to_string(),
            })?;
            if header.sequence_number() != seq {
                return Err(LogReadError::InvalidHeader {
                    path,
                    detail: format!(
                        "file name says segment {} but header says {}",
                        seq,
                        header.sequence_number()
                    ),
                });
            }
            segments.push(ReadableSegment { header, path });
        }

        debug!(
            target: "plateau::wal",
            dir = %dir.display(),
            segments = segments.len(),
            "opened log reader"
        );
        Ok(LogReader { dir, segments })
    }

    /// The directory this reader covers.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The segments, in ascending sequence order.
    pub fn segments_snapshot(&self) -> &[ReadableSegment] {
        &self.segments
    }

    /// Number of segments.
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{encode_entry, CommitMsg, OpType, ReplicateMsg, TxResult};
    use crate::entry::{OperationBody, WriteRequest};
    use crate::segment::WritableSegment;
    use plateau_core::clock::Timestamp;
    use plateau_core::schema::Schema;
    use plateau_core::OpId;
    use std::io::Write;
    use tempfile::tempdir;

    fn replicate(term: u64, index: u64) -> LogEntry {
        LogEntry::Replicate(ReplicateMsg {
            id: OpId::new(term, index),
            timestamp: Timestamp::from_u64(index),
            body: OperationBody::Write(WriteRequest {
                tablet_id: "t1".to_string(),
                schema: Schema::simple(),
                row_operations: vec![],
            }),
        })
    }

    fn commit(term: u64, index: u64) -> LogEntry {
        LogEntry::Commit(CommitMsg {
            committed_op_id: OpId::new(term, index),
            op_type: OpType::Write,
            timestamp: Timestamp::from_u64(index),
            result: TxResult::default(),
        })
    }

    fn write_segment(dir: &Path, seq: u64, entries: &[LogEntry]) {
        let mut segment = WritableSegment::create(dir, seq).unwrap();
        for entry in entries {
            segment.write(&encode_entry(entry).unwrap()).unwrap();
        }
        segment.sync().unwrap();
    }

    #[test]
    fn test_open_empty_dir() {
        let dir = tempdir().unwrap();
        let reader = LogReader::open(dir.path()).unwrap();
        assert_eq!(reader.num_segments(), 0);
    }

    #[test]
    fn test_segments_ordered_by_sequence_number() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), 3, &[replicate(1, 3)]);
        write_segment(dir.path(), 1, &[replicate(1, 1)]);
        write_segment(dir.path(), 2, &[replicate(1, 2)]);

        let reader = LogReader::open(dir.path()).unwrap();
        let seqs: Vec<u64> = reader
            .segments_snapshot()
            .iter()
            .map(|s| s.header().sequence_number())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_non_segment_files_ignored() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), 1, &[replicate(1, 1)]);
        std::fs::write(dir.path().join("wal-000001.tmp"), b"junk").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"junk").unwrap();

        let reader = LogReader::open(dir.path()).unwrap();
        assert_eq!(reader.num_segments(), 1);
    }

    #[test]
    fn test_read_entries_roundtrip() {
        let dir = tempdir().unwrap();
        let entries = vec![replicate(1, 1), commit(1, 1), replicate(1, 2)];
        write_segment(dir.path(), 1, &entries);

        let reader = LogReader::open(dir.path()).unwrap();
        let (read, status) = reader.segments_snapshot()[0].read_entries();
        status.unwrap();
        assert_eq!(read, entries);
    }

    #[test]
    fn test_truncated_tail_returns_prefix_and_error() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), 1, &[replicate(1, 1), commit(1, 1)]);

        // Simulate a crash mid-append: a partial frame at the tail.
        let path = crate::segment::segment_path(dir.path(), 1);
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x20, 0x00, 0x00, 0x00, 0x01, 0xAB]).unwrap();

        let reader = LogReader::open(dir.path()).unwrap();
        let (read, status) = reader.segments_snapshot()[0].read_entries();
        assert_eq!(read.len(), 2);
        match status.unwrap_err() {
            LogReadError::CorruptSegment {
                sequence_number,
                entries_read,
                ..
            } => {
                assert_eq!(sequence_number, 1);
                assert_eq!(entries_read, 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_flipped_bit_returns_prefix_and_error() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), 1, &[replicate(1, 1), commit(1, 1)]);

        let path = crate::segment::segment_path(dir.path(), 1);
        let mut data = std::fs::read(&path).unwrap();
        // Flip a byte inside the second entry's frame.
        let first_len = encode_entry(&replicate(1, 1)).unwrap().len();
        let target = crate::segment::SEGMENT_HEADER_SIZE + first_len + 8;
        data[target] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let reader = LogReader::open(dir.path()).unwrap();
        let (read, status) = reader.segments_snapshot()[0].read_entries();
        assert_eq!(read.len(), 1);
        assert!(matches!(
            status,
            Err(LogReadError::CorruptSegment { entries_read: 1, .. })
        ));
    }

    #[test]
    fn test_header_file_name_mismatch_rejected() {
        let dir = tempdir().unwrap();
        write_segment(dir.path(), 5, &[replicate(1, 1)]);

        // Rename the file so its name disagrees with the header.
        std::fs::rename(
            crate::segment::segment_path(dir.path(), 5),
            crate::segment::segment_path(dir.path(), 6),
        )
        .unwrap();

        assert!(matches!(
            LogReader::open(dir.path()),
            Err(LogReadError::InvalidHeader { .. })
        ));
    }
}
