//! openraft integration: type configuration and storage.

mod storage;
mod types;

pub use storage::RaftStore;
pub use types::{
    decode_append_request, encode_append_request, node_id_for, ApplyResponse, NodeId, TypeConfig,
    APPEND_REQUEST,
};
