//! Type definitions for the Raft consensus layer.

use std::io::Cursor;

use openraft::BasicNode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::api::ProduceRequest;
use crate::error::{ClusterError, ClusterResult};

/// Node ID type for Raft nodes.
pub type NodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Vec<u8>,
        R = ApplyResponse,
        NodeId = NodeId,
        Node = BasicNode,
        SnapshotData = Cursor<Vec<u8>>,
);

/// Result of applying one committed entry to the state machine.
///
/// Apply errors travel inside the response rather than as storage errors,
/// so a failed append surfaces to the caller that proposed it instead of
/// faulting the Raft node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApplyResponse {
    /// The record was appended at this offset.
    Appended { offset: u64 },
    /// Blank and membership entries produce no application result.
    Noop,
    /// The append failed; the message describes why.
    Error(String),
}

/// Request-type tag for append commands. The first byte of every proposed
/// entry selects the request type; append is the only one.
pub const APPEND_REQUEST: u8 = 0;

/// Frame a produce request for consensus: `[request_type][bincode body]`.
pub fn encode_append_request(req: &ProduceRequest) -> ClusterResult<Vec<u8>> {
    let body = bincode::serialize(req).map_err(|e| ClusterError::Raft(e.to_string()))?;
    let mut buf = Vec::with_capacity(1 + body.len());
    buf.push(APPEND_REQUEST);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode a proposed entry back into its produce request.
pub fn decode_append_request(data: &[u8]) -> ClusterResult<ProduceRequest> {
    match data.split_first() {
        Some((&APPEND_REQUEST, body)) => {
            bincode::deserialize(body).map_err(|e| ClusterError::Raft(e.to_string()))
        }
        Some((tag, _)) => Err(ClusterError::Raft(format!("unknown request type {tag}"))),
        None => Err(ClusterError::Raft("empty raft entry".to_string())),
    }
}

/// Derive the Raft node id for a node name.
///
/// Gossip names nodes with strings; Raft wants a fixed-width id. The first
/// eight bytes of the name's SHA-256 are stable across processes and
/// collision-safe at cluster scale.
pub fn node_id_for(name: &str) -> NodeId {
    let digest = Sha256::digest(name.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}
