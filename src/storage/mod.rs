//! The single-node segmented log storage engine.
//!
//! A [`Log`] is an ordered set of segments; each [`segment`](Segment) pairs
//! an append-only [`store`](store::Store) file with a memory-mapped
//! [`index`](index::Index) under a base offset. Appends go to the active
//! (last) segment and rotate to a fresh segment when either file reaches
//! its configured limit.

mod index;
mod log;
mod segment;
mod store;

pub use self::log::{Log, LogReader};
pub use self::index::ENTRY_WIDTH;
pub use self::store::LEN_WIDTH;

pub(crate) use self::index::Index;
pub(crate) use self::segment::Segment;
pub(crate) use self::store::Store;

/// Sizing and placement knobs for a [`Log`] and its segments.
#[derive(Debug, Clone, Copy)]
pub struct LogConfig {
    /// Rotation limit for a segment's store file, in bytes.
    pub max_store_bytes: u64,
    /// Pre-allocation size and rotation limit for a segment's index file.
    pub max_index_bytes: u64,
    /// Offset the first record of an empty log receives.
    pub initial_offset: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        }
    }
}
