//! Core types for the plateau tablet store.
//!
//! This crate holds the leaf types shared by the durability layer and the
//! tablet engine:
//! - `OpId`: consensus operation identifiers
//! - `Clock` / `LogicalClock`: monotone logical timestamps
//! - `Schema` and row operations: the client-visible write model
//! - `Quorum`: replica configuration
//! - `FsManager`: per-tablet filesystem layout and primitive operations
//! - `MetricContext`: lightweight counters shared with collaborators

pub mod clock;
pub mod fs;
pub mod metrics;
pub mod opid;
pub mod quorum;
pub mod row_ops;
pub mod schema;

pub use clock::{Clock, LogicalClock, Timestamp};
pub use fs::FsManager;
pub use metrics::MetricContext;
pub use opid::OpId;
