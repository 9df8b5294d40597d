//! Error type for tablet operations and bootstrap.
//!
//! Errors at this layer are classified by kind rather than by module: the
//! consensus layer treats any bootstrap error as fatal for the tablet, and
//! the kind tells an operator whether they are looking at missing state,
//! a logic violation, corrupted durable data, or a plain I/O failure.

use plateau_durability::reader::LogReadError;
use plateau_durability::writer::LogWriteError;

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, TabletError>;

/// Tablet and bootstrap errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TabletError {
    /// Required persistent state is missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The on-disk state combination is not one a correct system produces.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Durable data contradicts itself.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// A filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// An internal invariant was violated.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TabletError {
    /// Prefix the message with context, preserving the kind.
    pub fn prepend(self, context: impl AsRef<str>) -> Self {
        let context = context.as_ref();
        match self {
            TabletError::NotFound(msg) => TabletError::NotFound(format!("{}: {}", context, msg)),
            TabletError::IllegalState(msg) => {
                TabletError::IllegalState(format!("{}: {}", context, msg))
            }
            TabletError::Corruption(msg) => {
                TabletError::Corruption(format!("{}: {}", context, msg))
            }
            TabletError::Io(msg) => TabletError::Io(format!("{}: {}", context, msg)),
            TabletError::Internal(msg) => TabletError::Internal(format!("{}: {}", context, msg)),
        }
    }

    /// Whether this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(self, TabletError::Corruption(_))
    }
}

impl From<std::io::Error> for TabletError {
    fn from(e: std::io::Error) -> Self {
        TabletError::Io(e.to_string())
    }
}

impl From<LogReadError> for TabletError {
    fn from(e: LogReadError) -> Self {
        match e {
            LogReadError::Io(msg) => TabletError::Io(msg),
            other => TabletError::Corruption(other.to_string()),
        }
    }
}

impl From<LogWriteError> for TabletError {
    fn from(e: LogWriteError) -> Self {
        match e {
            LogWriteError::Io(io) => TabletError::Io(io.to_string()),
            LogWriteError::Codec(c) => TabletError::Internal(c.to_string()),
        }
    }
}

impl From<plateau_core::clock::ClockError> for TabletError {
    fn from(e: plateau_core::clock::ClockError) -> Self {
        TabletError::Internal(e.to_string())
    }
}
