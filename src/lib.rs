//! # Scrivener
//! A Raft-replicated, segmented, append-only commit log.
//!
//! Scrivener is a Kafka-style log engine: clients append opaque record
//! payloads and read them back by monotonically increasing offset, while a
//! cluster of peers agrees on the global order of appended records through
//! Raft consensus.
//!
//! The crate is layered bottom-up:
//!
//! - [`storage`]: the single-node segmented log engine, made of an
//!   append-only store file, a memory-mapped index, and segment rotation.
//! - [`cluster`]: the replicated log, an [openraft](https://docs.rs/openraft)
//!   state machine backed by the storage engine, plus the multiplexed
//!   transport that carries Raft RPCs and application RPCs over one
//!   listener.
//! - [`discovery`]: gossip-based membership that maps join/leave events
//!   into Raft voter changes.
//! - [`server`] and [`client`]: the typed produce/consume RPC surface,
//!   including streaming variants, with mutual-TLS authentication and
//!   ACL-based authorization.
//! - [`agent`]: the composition root that ties all of the above into a
//!   single node process.
//!
//! ## Running a node
//!
//! ```rust,no_run
//! use scrivener::agent::Agent;
//! use scrivener::config::AgentConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = AgentConfig::default();
//!     config.node_name = "node-0".to_string();
//!     config.bind_addr = "127.0.0.1:8401".to_string();
//!     config.rpc_port = 8400;
//!     config.data_dir = "/var/lib/scrivener".into();
//!     config.bootstrap = true;
//!
//!     let agent = Agent::new(config).await?;
//!     tokio::signal::ctrl_c().await?;
//!     agent.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod api;
pub mod auth;
pub mod client;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod error;
pub mod server;
pub mod storage;
pub mod telemetry;

pub mod prelude {
    //! Commonly used types for building and talking to a scrivener node.
    pub use crate::agent::Agent;
    pub use crate::api::{ConsumeRequest, ProduceRequest, Record};
    pub use crate::client::LogClient;
    pub use crate::config::AgentConfig;
    pub use crate::error::{ClusterError, LogError, StatusCode};
    pub use crate::storage::{Log, LogConfig};
}
