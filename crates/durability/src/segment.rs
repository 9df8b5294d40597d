//! WAL segment files.
//!
//! Segments are named `wal-NNNNNN.seg` where `NNNNNN` is the zero-padded
//! segment sequence number. Each file begins with a fixed 16-byte header,
//! followed by framed entries (see `entry`).
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Segment Header (16 bytes)          │
//! ├────────────────────────────────────┤
//! │ Entry 1                            │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! Only the active segment is writable; closed segments are immutable.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a segment file: "PLWL".
pub const SEGMENT_MAGIC: [u8; 4] = *b"PLWL";

/// Current segment format version.
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of the segment header in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 16;

/// Segment header, written at the start of every segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes.
    pub magic: [u8; 4],
    /// Format version for forward compatibility.
    pub format_version: u32,
    /// Sequence number, monotonically increasing per tablet log.
    pub sequence_number: u64,
}

impl SegmentHeader {
    /// Create a header for a new segment.
    pub fn new(sequence_number: u64) -> Self {
        SegmentHeader {
            magic: SEGMENT_MAGIC,
            format_version: SEGMENT_FORMAT_VERSION,
            sequence_number,
        }
    }

    /// This segment's sequence number.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.sequence_number.to_le_bytes());
        bytes
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8; SEGMENT_HEADER_SIZE]) -> Option<Self> {
        Some(SegmentHeader {
            magic: bytes[0..4].try_into().ok()?,
            format_version: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            sequence_number: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
        })
    }

    /// Whether the magic bytes are correct.
    pub fn is_valid(&self) -> bool {
        self.magic == SEGMENT_MAGIC
    }
}

/// Path of a segment within a log directory.
pub fn segment_path(dir: &Path, sequence_number: u64) -> PathBuf {
    dir.join(format!("wal-{:06}.seg", sequence_number))
}

/// Whether `name` looks like a WAL segment file name.
pub fn is_segment_file_name(name: &str) -> bool {
    parse_segment_file_name(name).is_some()
}

/// Extract the sequence number from a segment file name, if it is one.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("wal-")?.strip_suffix(".seg")?;
    if digits.len() < 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()
}

/// Handle on one writable segment file.
pub struct WritableSegment {
    file: File,
    sequence_number: u64,
    write_position: u64,
    path: PathBuf,
}

impl WritableSegment {
    /// Create a new segment file and write its header.
    pub fn create(dir: &Path, sequence_number: u64) -> std::io::Result<Self> {
        let path = segment_path(dir, sequence_number);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)?;

        let header = SegmentHeader::new(sequence_number);
        file.write_all(&header.to_bytes())?;

        Ok(WritableSegment {
            file,
            sequence_number,
            write_position: SEGMENT_HEADER_SIZE as u64,
            path,
        })
    }

    /// Append raw encoded bytes.
    pub fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes)?;
        self.write_position += bytes.len() as u64;
        Ok(())
    }

    /// Flush written data to stable storage.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_data()
    }

    /// Current size in bytes, including the header.
    pub fn size(&self) -> u64 {
        self.write_position
    }

    /// This segment's sequence number.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read a segment file's header, returning the header and the remaining
/// entry bytes.
pub fn read_segment_file(path: &Path) -> std::io::Result<(SegmentHeader, Vec<u8>)> {
    let mut file = File::open(path)?;

    let mut header_bytes = [0u8; SEGMENT_HEADER_SIZE];
    file.read_exact(&mut header_bytes)?;
    let header = SegmentHeader::from_bytes(&header_bytes).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "unreadable segment header")
    })?;
    if !header.is_valid() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad segment magic bytes",
        ));
    }

    file.seek(SeekFrom::Start(SEGMENT_HEADER_SIZE as u64))?;
    let mut body = Vec::new();
    file.read_to_end(&mut body)?;
    Ok((header, body))
}
