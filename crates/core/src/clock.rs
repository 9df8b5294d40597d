//! Logical clock used to order replayed operations.
//!
//! The tablet store timestamps every committed operation. During WAL replay
//! the bootstrap engine feeds commit timestamps back into the clock so that
//! timestamps handed out after recovery are never behind anything already
//! durable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque monotone timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The smallest timestamp.
    pub const MIN: Timestamp = Timestamp(0);

    /// Wrap a raw timestamp value.
    pub fn from_u64(value: u64) -> Self {
        Timestamp(value)
    }

    /// The raw timestamp value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Clock errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    /// The supplied timestamp cannot be represented by this clock.
    #[error("timestamp {0} is not representable")]
    Unrepresentable(u64),
}

/// A shared, thread-safe monotone clock.
///
/// `update` must be idempotent and monotone-safe: feeding a timestamp the
/// clock has already seen, or an older one, is a no-op.
pub trait Clock: Send + Sync {
    /// Produce the next timestamp, strictly greater than any produced or
    /// observed before.
    fn now(&self) -> Timestamp;

    /// Advance the clock to at least `ts`.
    fn update(&self, ts: Timestamp) -> Result<(), ClockError>;
}

/// A plain logical clock backed by an atomic counter.
#[derive(Debug, Default)]
pub struct LogicalClock {
    now: AtomicU64,
}

impl LogicalClock {
    /// Create a clock whose next timestamp is `initial + 1`.
    pub fn new(initial: u64) -> Self {
        LogicalClock {
            now: AtomicU64::new(initial),
        }
    }

    /// Read the latest value without advancing the clock.
    pub fn peek(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::Acquire))
    }
}

impl Clock for LogicalClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn update(&self, ts: Timestamp) -> Result<(), ClockError> {
        self.now.fetch_max(ts.as_u64(), Ordering::AcqRel);
        Ok(())
    }
}
