//! Network transport for Raft RPCs between peers.
//!
//! Raft traffic rides the multiplexed port through the
//! [`StreamLayer`](crate::cluster::stream::StreamLayer): the dialer writes
//! the Raft tag byte, optionally completes a TLS handshake, then exchanges
//! length-prefixed bincode frames. Connections are cached per peer and
//! re-dialed on failure with jittered exponential backoff.

use std::time::Duration;

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::api::{read_frame, write_frame};
use crate::cluster::raft::{NodeId, TypeConfig};
use crate::cluster::stream::{BoxedConn, StreamLayer};

/// Timeout for establishing a peer connection.
const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for one RPC exchange on an established connection.
const RPC_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// RPC retry attempts before giving up.
const RPC_MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff between retries.
const RPC_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Ceiling for the backoff delay.
const RPC_RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Raft RPC request frames.
#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRpcMessage {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<NodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

/// Raft RPC response frames.
#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRpcReply {
    AppendEntries(AppendEntriesResponse<NodeId>),
    Vote(VoteResponse<NodeId>),
    InstallSnapshot(InstallSnapshotResponse<NodeId>),
    Error(String),
}

/// Creates per-peer Raft connections over the stream layer.
#[derive(Clone)]
pub struct RaftTransport {
    stream_layer: StreamLayer,
}

impl RaftTransport {
    pub fn new(stream_layer: StreamLayer) -> Self {
        RaftTransport { stream_layer }
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftTransport {
    type Network = RaftPeerConnection;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        RaftPeerConnection {
            target_addr: node.addr.clone(),
            stream_layer: self.stream_layer.clone(),
            cached_conn: Mutex::new(None),
        }
    }
}

/// A connection to one remote Raft peer.
pub struct RaftPeerConnection {
    target_addr: String,
    stream_layer: StreamLayer,
    /// Cached connection, re-dialed on failure.
    cached_conn: Mutex<Option<BoxedConn>>,
}

impl RaftPeerConnection {
    /// Send an RPC with retries and jittered exponential backoff.
    async fn send_rpc(&self, message: &RaftRpcMessage) -> std::io::Result<RaftRpcReply> {
        let mut last_error = None;
        for attempt in 0..=RPC_MAX_RETRIES {
            if attempt > 0 {
                let delay = std::cmp::min(
                    RPC_RETRY_BASE_DELAY * (1 << (attempt - 1)),
                    RPC_RETRY_MAX_DELAY,
                );
                // +-25% jitter keeps peers from retrying in lockstep.
                let jitter = 0.75 + fastrand::f64() * 0.5;
                let delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                tracing::debug!(
                    target = %self.target_addr,
                    attempt,
                    delay_ms = delay.as_millis(),
                    "retrying raft rpc after backoff"
                );
                tokio::time::sleep(delay).await;
            }
            match self.try_send_rpc(message).await {
                Ok(reply) => return Ok(reply),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| std::io::Error::other("rpc failed with no error")))
    }

    /// One attempt: reuse the cached connection, falling back to a fresh
    /// dial when it has gone stale.
    async fn try_send_rpc(&self, message: &RaftRpcMessage) -> std::io::Result<RaftRpcReply> {
        let mut guard = self.cached_conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            match Self::do_rpc(conn, message).await {
                Ok(reply) => return Ok(reply),
                Err(_) => {
                    *guard = None;
                }
            }
        }
        let mut conn = self
            .stream_layer
            .dial(&self.target_addr, RPC_CONNECT_TIMEOUT)
            .await?;
        let reply = Self::do_rpc(&mut conn, message).await?;
        *guard = Some(conn);
        Ok(reply)
    }

    async fn do_rpc(
        conn: &mut BoxedConn,
        message: &RaftRpcMessage,
    ) -> std::io::Result<RaftRpcReply> {
        timeout(RPC_OPERATION_TIMEOUT, async {
            write_frame(conn, message).await?;
            match read_frame::<RaftRpcReply, _>(conn).await? {
                Some(reply) => Ok(reply),
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed the connection mid-rpc",
                )),
            }
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "rpc operation timeout"))?
    }
}

fn network_err<E: std::error::Error + 'static>(e: &std::io::Error) -> RPCError<NodeId, BasicNode, E> {
    RPCError::Network(NetworkError::new(e))
}

fn unexpected_reply<E: std::error::Error + 'static>(
    reply: RaftRpcReply,
) -> RPCError<NodeId, BasicNode, E> {
    let err = match reply {
        RaftRpcReply::Error(message) => std::io::Error::other(message),
        other => std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected reply type: {other:?}"),
        ),
    };
    RPCError::Network(NetworkError::new(&err))
}

impl RaftNetwork<TypeConfig> for RaftPeerConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>>
    {
        let reply = self
            .send_rpc(&RaftRpcMessage::AppendEntries(req))
            .await
            .map_err(|e| network_err(&e))?;
        match reply {
            RaftRpcReply::AppendEntries(resp) => Ok(resp),
            other => Err(unexpected_reply(other)),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let reply = self
            .send_rpc(&RaftRpcMessage::Vote(req))
            .await
            .map_err(|e| network_err(&e))?;
        match reply {
            RaftRpcReply::Vote(resp) => Ok(resp),
            other => Err(unexpected_reply(other)),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let reply = self
            .send_rpc(&RaftRpcMessage::InstallSnapshot(req))
            .await
            .map_err(|e| network_err(&e))?;
        match reply {
            RaftRpcReply::InstallSnapshot(resp) => Ok(resp),
            other => Err(unexpected_reply(other)),
        }
    }
}

/// Serve Raft RPCs on one accepted connection until the peer hangs up.
pub(crate) async fn serve_raft_connection(
    raft: openraft::Raft<TypeConfig>,
    mut conn: BoxedConn,
) -> std::io::Result<()> {
    loop {
        let message = match read_frame::<RaftRpcMessage, _>(&mut conn).await? {
            Some(message) => message,
            None => return Ok(()),
        };
        let reply = match message {
            RaftRpcMessage::AppendEntries(req) => match raft.append_entries(req).await {
                Ok(resp) => RaftRpcReply::AppendEntries(resp),
                Err(e) => RaftRpcReply::Error(e.to_string()),
            },
            RaftRpcMessage::Vote(req) => match raft.vote(req).await {
                Ok(resp) => RaftRpcReply::Vote(resp),
                Err(e) => RaftRpcReply::Error(e.to_string()),
            },
            RaftRpcMessage::InstallSnapshot(req) => match raft.install_snapshot(req).await {
                Ok(resp) => RaftRpcReply::InstallSnapshot(resp),
                Err(e) => RaftRpcReply::Error(e.to_string()),
            },
        };
        write_frame(&mut conn, &reply).await?;
    }
}
