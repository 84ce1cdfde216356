//! Crate-level error types and wire status codes.
//!
//! The crate uses a layered error hierarchy:
//!
//! - [`LogError`]: storage-engine errors surfaced by the segmented log.
//!   `OffsetOutOfRange` is the one domain error clients are expected to
//!   handle; everything else is an I/O or codec failure.
//! - [`ClusterError`]: consensus-layer errors. Wraps [`LogError`] (local
//!   reads go straight to the storage engine) and adds the leadership and
//!   timeout failures Raft operations can produce.
//! - [`StatusCode`]: the wire-level status vocabulary of the RPC surface.
//!   The server maps internal errors onto these codes; see
//!   [`Status::from_cluster_error`].

use std::io;

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the segmented log storage engine.
#[derive(Debug, Error)]
pub enum LogError {
    /// The requested offset is below the lowest or above the highest offset
    /// held by the log.
    #[error("offset out of range: {offset}")]
    OffsetOutOfRange { offset: u64 },

    /// End of file. Returned by the index when the pre-allocated region is
    /// exhausted (the segment-rotation signal) or a read lands past the last
    /// entry. Handled internally by the log; callers see
    /// `OffsetOutOfRange` instead.
    #[error("end of file")]
    Eof,

    /// Underlying file I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Record encode/decode failure.
    #[error("codec: {0}")]
    Codec(String),

    /// The store or index has been closed.
    #[error("log is closed")]
    Closed,
}

impl LogError {
    /// Offset carried by an `OffsetOutOfRange` error, if that is what this is.
    pub fn out_of_range_offset(&self) -> Option<u64> {
        match self {
            LogError::OffsetOutOfRange { offset } => Some(*offset),
            _ => None,
        }
    }
}

pub type LogResult<T> = std::result::Result<T, LogError>;

/// Errors surfaced by the replicated log and its Raft plumbing.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The operation must run on the leader and this node is not it.
    #[error("not the cluster leader")]
    NotLeader,

    /// Leadership was lost while the operation was in flight.
    #[error("leadership lost")]
    LeadershipLost,

    /// The Raft apply did not commit within the configured timeout.
    #[error("timed out waiting for raft apply")]
    ApplyTimeout,

    /// No leader emerged within the caller-supplied window.
    #[error("timed out waiting for leader")]
    LeaderWaitTimeout,

    /// Storage-engine error from the local log.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Any other consensus-library failure.
    #[error("raft: {0}")]
    Raft(String),

    /// Gossip or transport failure.
    #[error("io: {0}")]
    Io(String),
}

impl From<io::Error> for ClusterError {
    fn from(e: io::Error) -> Self {
        ClusterError::Io(e.to_string())
    }
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Wire-level status codes for the RPC surface.
///
/// Serialized as a `u16` inside [`Status`] frames; decode with
/// [`StatusCode::from_u16`](num_traits::FromPrimitive::from_u16).
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, Default)]
pub enum StatusCode {
    #[default]
    Ok = 0,
    /// The requested offset is outside the log's range.
    NotFound = 1,
    /// The authenticated principal is not allowed to call this procedure.
    PermissionDenied = 2,
    /// No mutual-TLS identity could be established for the connection.
    Unauthenticated = 3,
    /// Unexpected server-side failure.
    Internal = 4,
    /// The node cannot serve the request right now (typically: not leader).
    Unavailable = 5,
}

/// A wire status: code plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
    pub detail: String,
}

impl Status {
    pub fn new(code: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            code: code as u16,
            detail: detail.into(),
        }
    }

    pub fn code(&self) -> StatusCode {
        num_traits::FromPrimitive::from_u16(self.code).unwrap_or(StatusCode::Internal)
    }

    /// Map a cluster error onto its wire status.
    ///
    /// `OffsetOutOfRange` is the only error that gets the localized
    /// detail treatment; everything unknown collapses to `Internal`.
    pub fn from_cluster_error(err: &ClusterError) -> Self {
        match err {
            ClusterError::Log(log_err) => {
                if let Some(offset) = log_err.out_of_range_offset() {
                    Status::new(
                        StatusCode::NotFound,
                        format!("The requested offset is outside the log's range: {offset}"),
                    )
                } else {
                    Status::new(StatusCode::Internal, log_err.to_string())
                }
            }
            ClusterError::NotLeader | ClusterError::LeadershipLost => {
                Status::new(StatusCode::Unavailable, err.to_string())
            }
            other => Status::new(StatusCode::Internal, other.to_string()),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code(), self.detail)
    }
}

impl std::error::Error for Status {}
