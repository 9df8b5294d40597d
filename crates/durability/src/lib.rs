//! Write-ahead log for the plateau tablet store.
//!
//! This crate implements the durable log a tablet replays at bootstrap:
//! - `LogEntry` model: REPLICATE and COMMIT records
//! - Entry encoding/decoding with CRC32 checksums
//! - Segment files (`wal-NNNNNN.seg`) with a validated header
//! - `Log`: the writer, with size-based rotation and sync control
//! - `LogReader`: the recovery-side reader with best-effort entry decoding

pub mod entry;
pub mod options;
pub mod reader;
pub mod segment;
pub mod writer;

pub use entry::{
    CommitMsg, LogEntry, MemStoreTarget, OpResult, OpType, OperationBody, ReplicateMsg, TxResult,
};
pub use options::LogOptions;
pub use reader::{LogReadError, LogReader, ReadableSegment};
pub use segment::{is_segment_file_name, parse_segment_file_name, SegmentHeader};
pub use writer::{Log, LogWriteError};
