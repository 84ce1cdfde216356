//! The replicated log: Raft consensus over the segmented storage engine.
//!
//! - [`raft`] holds the openraft type configuration and the storage
//!   adapter that persists Raft's own log in a segmented [`Log`] and
//!   applies committed entries into the data log.
//! - [`stream`] is the connection multiplexer: one TCP listener serves
//!   both Raft RPCs and application RPCs, demultiplexed by the first byte
//!   of each connection.
//! - [`network`] carries Raft RPCs between peers over the stream layer.
//! - [`distributed`] wraps it all into the [`DistributedLog`] the RPC
//!   surface talks to.
//!
//! [`Log`]: crate::storage::Log

pub mod distributed;
pub mod network;
pub mod raft;
pub mod stream;

pub use distributed::{DistributedConfig, DistributedLog};
pub use stream::{BoxedConn, StreamLayer, RAFT_RPC};
