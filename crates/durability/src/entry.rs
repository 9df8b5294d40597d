//! Log entry model and encoding.
//!
//! A tablet's WAL holds two kinds of records. A REPLICATE proposes an
//! operation: it carries the operation id assigned by consensus and the
//! operation body. A COMMIT finalizes an earlier proposal: it carries the
//! committed operation's id (never its own), the commit timestamp, and the
//! per-row outcomes.
//!
//! ## Entry Format
//!
//! ```text
//! [length: u32][tag: u8][payload: bytes][crc32: u32]
//! ```
//!
//! - **length**: size of tag + payload + crc (NOT including length itself)
//! - **tag**: entry type tag (1=Replicate, 2=Commit)
//! - **payload**: bincode-serialized `LogEntry`
//! - **crc32**: checksum over \[tag\]\[payload\]
//!
//! The length prefix enables reading variable-sized entries, the tag keeps
//! the format open to new record kinds, and the CRC detects bit flips and
//! partial writes at the tail of a crashed segment.

use crc32fast::Hasher;
use plateau_core::clock::Timestamp;
use plateau_core::quorum::Quorum;
use plateau_core::row_ops::RowOperation;
use plateau_core::schema::Schema;
use plateau_core::OpId;
use serde::{Deserialize, Serialize};

/// Entry type tags.
const TAG_REPLICATE: u8 = 1;
const TAG_COMMIT: u8 = 2;

/// Cap on the entry description strings embedded in error messages.
const MAX_DEBUG_LEN: usize = 500;

/// One record in a WAL segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    /// A tentative operation proposed by consensus.
    Replicate(ReplicateMsg),
    /// The outcome of an earlier proposal.
    Commit(CommitMsg),
}

impl LogEntry {
    /// A truncated human-readable description for error messages.
    ///
    /// Capped at 500 characters so a large write body cannot drown the
    /// information that follows it in a log line.
    pub fn short_debug(&self) -> String {
        let mut s = format!("{:?}", self);
        if s.len() > MAX_DEBUG_LEN {
            s.truncate(MAX_DEBUG_LEN);
            s.push_str("...");
        }
        s
    }

    fn tag(&self) -> u8 {
        match self {
            LogEntry::Replicate(_) => TAG_REPLICATE,
            LogEntry::Commit(_) => TAG_COMMIT,
        }
    }
}

/// A proposed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateMsg {
    /// Operation id assigned by consensus.
    pub id: OpId,
    /// Timestamp assigned at proposal time.
    pub timestamp: Timestamp,
    /// The proposed operation.
    pub body: OperationBody,
}

/// The body of a proposed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationBody {
    /// A batch of row operations.
    Write(WriteRequest),
    /// A schema change.
    AlterSchema(AlterSchemaRequest),
    /// A replica configuration change.
    ChangeConfig(ChangeConfigRequest),
}

impl OperationBody {
    /// The operation kind as a log-friendly name.
    pub fn kind_name(&self) -> &'static str {
        match self {
            OperationBody::Write(_) => "WRITE",
            OperationBody::AlterSchema(_) => "ALTER_SCHEMA",
            OperationBody::ChangeConfig(_) => "CHANGE_CONFIG",
        }
    }
}

/// The finalization of an earlier proposal.
///
/// A commit never carries its own operation id; it references the
/// replicate it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitMsg {
    /// Id of the replicate this commit finalizes.
    pub committed_op_id: OpId,
    /// What kind of operation was committed, or `Abort`.
    pub op_type: OpType,
    /// Commit timestamp. Invalid for aborts.
    pub timestamp: Timestamp,
    /// Per-row outcomes of the committed operation.
    pub result: TxResult,
}

/// Operation kind carried by a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    /// A row write batch.
    Write,
    /// A schema change.
    AlterSchema,
    /// A replica configuration change.
    ChangeConfig,
    /// The proposal was abandoned.
    Abort,
}

/// A batch of row operations against one tablet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Target tablet.
    pub tablet_id: String,
    /// Client schema the operations were encoded against.
    pub schema: Schema,
    /// The row operations, in client order.
    pub row_operations: Vec<RowOperation>,
}

/// A schema change request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlterSchemaRequest {
    /// The new schema, including its bumped version.
    pub schema: Schema,
}

/// A replica configuration change request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConfigRequest {
    /// The proposed configuration.
    pub new_config: Quorum,
}

/// Per-operation outcomes of a committed write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxResult {
    /// One result per row operation, in the same order.
    pub ops: Vec<OpResult>,
}

/// Outcome of a single row operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    /// Why the operation failed, if it did.
    pub failed_status: Option<String>,
    /// The in-memory stores the operation mutated. Empty for failed ops.
    pub mutated_stores: Vec<MemStoreTarget>,
}

impl OpResult {
    /// A successful outcome that mutated the given stores.
    pub fn success(mutated_stores: Vec<MemStoreTarget>) -> Self {
        OpResult {
            failed_status: None,
            mutated_stores,
        }
    }

    /// A failed outcome.
    pub fn failed(status: impl Into<String>) -> Self {
        OpResult {
            failed_status: Some(status.into()),
            mutated_stores: Vec::new(),
        }
    }

    /// Whether the operation failed.
    pub fn is_failed(&self) -> bool {
        self.failed_status.is_some()
    }
}

/// The in-memory store a row operation was written into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemStoreTarget {
    /// Written into the memrowset with this id.
    MemRowSet {
        /// Memrowset id, compared against the tablet's last durable one.
        mrs_id: u64,
    },
    /// Written into a delta memstore belonging to an on-disk rowset.
    DeltaMemStore {
        /// Owning rowset id.
        rs_id: u64,
        /// Delta memstore id, compared against the rowset's last durable
        /// redo delta id.
        dms_id: u64,
    },
}

/// Entry codec errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryCodecError {
    /// The buffer ends before the entry does. Expected at the tail of a
    /// segment that was being appended to when the process died.
    #[error("incomplete entry: buffer ends mid-record")]
    InsufficientData,

    /// The stored checksum does not match the recomputed one.
    #[error("entry checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum read from the entry frame.
        stored: u32,
        /// Checksum recomputed over the frame contents.
        computed: u32,
    },

    /// The type tag is not one this version understands.
    #[error("unknown entry tag {0}")]
    UnknownTag(u8),

    /// The checksum was valid but the payload could not be deserialized.
    /// This is a format incompatibility, not data corruption.
    #[error("entry payload could not be decoded: {0}")]
    Payload(String),
}

/// Encode an entry into its framed byte representation.
pub fn encode_entry(entry: &LogEntry) -> Result<Vec<u8>, EntryCodecError> {
    let payload = bincode::serialize(entry).map_err(|e| EntryCodecError::Payload(e.to_string()))?;

    let total_len = 1 + payload.len() + 4;
    let mut buf = Vec::with_capacity(4 + total_len);
    buf.extend_from_slice(&(total_len as u32).to_le_bytes());
    buf.push(entry.tag());
    buf.extend_from_slice(&payload);

    let mut hasher = Hasher::new();
    hasher.update(&[entry.tag()]);
    hasher.update(&payload);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());

    Ok(buf)
}

/// Decode one entry from the front of `buf`.
///
/// Returns the entry and the number of bytes consumed.
pub fn decode_entry(buf: &[u8]) -> Result<(LogEntry, usize), EntryCodecError> {
    if buf.len() < 4 {
        return Err(EntryCodecError::InsufficientData);
    }
    let total_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if total_len < 5 {
        // A frame is at least tag + empty payload + crc. Anything shorter
        // means the length field itself is garbage.
        return Err(EntryCodecError::Payload(format!(
            "frame length {} is impossibly small",
            total_len
        )));
    }
    if buf.len() < 4 + total_len {
        return Err(EntryCodecError::InsufficientData);
    }

    let frame = &buf[4..4 + total_len];
    let tag = frame[0];
    let payload = &frame[1..total_len - 4];
    let stored = u32::from_le_bytes([
        frame[total_len - 4],
        frame[total_len - 3],
        frame[total_len - 2],
        frame[total_len - 1],
    ]);

    let mut hasher = Hasher::new();
    hasher.update(&[tag]);
    hasher.update(payload);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(EntryCodecError::ChecksumMismatch { stored, computed });
    }

    if tag != TAG_REPLICATE && tag != TAG_COMMIT {
        return Err(EntryCodecError::UnknownTag(tag));
    }

    let entry: LogEntry =
        bincode::deserialize(payload).map_err(|e| EntryCodecError::Payload(e.to_string()))?;
    if entry.tag() != tag {
        return Err(EntryCodecError::Payload(format!(
            "entry tag {} disagrees with payload variant",
            tag
        )));
    }

    Ok((entry, 4 + total_len))
}
