//! Replica configuration types.

use serde::{Deserialize, Serialize};

/// One peer in a quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumPeer {
    /// Permanent UUID of the peer's server instance.
    pub uuid: String,
    /// Last known RPC address.
    pub address: String,
}

/// A replica configuration, versioned by a sequence number.
///
/// Config changes are replicated through the WAL like any other operation;
/// the sequence number decides which configuration wins during replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quorum {
    /// Sequence number of this configuration. Strictly increases with every
    /// accepted config change.
    pub seqno: u64,
    /// Member peers.
    pub peers: Vec<QuorumPeer>,
}

impl Quorum {
    /// Create a quorum.
    pub fn new(seqno: u64, peers: Vec<QuorumPeer>) -> Self {
        Quorum { seqno, peers }
    }

    /// A single-peer quorum, the shape used by most tests.
    pub fn single(seqno: u64, uuid: impl Into<String>) -> Self {
        Quorum {
            seqno,
            peers: vec![QuorumPeer {
                uuid: uuid.into(),
                address: "127.0.0.1:0".to_string(),
            }],
        }
    }
}
