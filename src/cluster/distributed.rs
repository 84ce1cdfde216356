//! The replicated log: a local segmented log driven by Raft consensus.
//!
//! Appends are proposed to the Raft leader and come back with the offset
//! the state machine assigned; reads are served from the local log, which
//! followers converge onto as committed entries apply. Voter membership is
//! managed through [`join`](DistributedLog::join) and
//! [`leave`](DistributedLog::leave), normally driven by gossip discovery.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openraft::error::{ClientWriteError, RaftError};
use openraft::storage::Adaptor;
use openraft::{BasicNode, Raft};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::api::{ProduceRequest, Record};
use crate::cluster::network::{serve_raft_connection, RaftTransport};
use crate::cluster::raft::{
    encode_append_request, node_id_for, ApplyResponse, NodeId, RaftStore, TypeConfig,
};
use crate::cluster::stream::{BoxedConn, StreamLayer};
use crate::error::{ClusterError, ClusterResult};
use crate::storage::{Log, LogConfig};

/// Settings for one replicated-log node.
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// Raft local id and gossip name.
    pub node_name: String,
    /// Address peers dial this node at (the muxed port).
    pub rpc_addr: String,
    /// Install a single-voter configuration when no prior state exists.
    pub bootstrap: bool,
    /// Segment sizing for both the data log and the raft log.
    pub segment: LogConfig,
    /// Raft leader heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Raft election timeout window.
    pub election_timeout: (Duration, Duration),
    /// How long an append may wait for commit.
    pub apply_timeout: Duration,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        DistributedConfig {
            node_name: String::new(),
            rpc_addr: String::new(),
            bootstrap: false,
            segment: LogConfig::default(),
            heartbeat_interval: Duration::from_millis(100),
            election_timeout: (Duration::from_millis(200), Duration::from_millis(400)),
            apply_timeout: Duration::from_secs(10),
        }
    }
}

/// A segmented log replicated by a Raft consensus group.
pub struct DistributedLog {
    log: Arc<Log>,
    raft: Raft<TypeConfig>,
    node_id: NodeId,
    config: DistributedConfig,
}

impl DistributedLog {
    /// Open the data log and raft state under `data_dir` and start the
    /// Raft node. If configured as bootstrap and no prior Raft state
    /// exists, a single-voter cluster is initialized with this node.
    pub async fn new(
        data_dir: &Path,
        stream_layer: StreamLayer,
        config: DistributedConfig,
    ) -> ClusterResult<Arc<Self>> {
        let log = Arc::new(Log::open(data_dir.join("log"), config.segment)?);
        let store = RaftStore::open(&data_dir.join("raft"), Arc::clone(&log), config.segment)?;
        let has_state = store.has_existing_state();

        let node_id = node_id_for(&config.node_name);
        let raft_config = Arc::new(openraft::Config {
            cluster_name: "scrivener".to_string(),
            heartbeat_interval: config.heartbeat_interval.as_millis() as u64,
            election_timeout_min: config.election_timeout.0.as_millis() as u64,
            election_timeout_max: config.election_timeout.1.as_millis() as u64,
            ..Default::default()
        });

        let (log_store, sm_store) = Adaptor::new(store);
        let network = RaftTransport::new(stream_layer);
        let raft = Raft::new(node_id, raft_config, network, log_store, sm_store)
            .await
            .map_err(|e| ClusterError::Raft(format!("start raft: {e}")))?;

        if config.bootstrap && !has_state {
            info!(
                node = %config.node_name,
                addr = %config.rpc_addr,
                "bootstrapping new raft cluster"
            );
            let mut members = std::collections::BTreeMap::new();
            members.insert(
                node_id,
                BasicNode {
                    addr: config.rpc_addr.clone(),
                },
            );
            raft.initialize(members)
                .await
                .map_err(|e| ClusterError::Raft(format!("bootstrap: {e}")))?;
        }

        Ok(Arc::new(DistributedLog {
            log,
            raft,
            node_id,
            config,
        }))
    }

    /// Propose an append through consensus and return the offset the state
    /// machine assigned.
    pub async fn append(&self, record: Record) -> ClusterResult<u64> {
        let framed = encode_append_request(&ProduceRequest { record })?;
        let response = match timeout(
            self.config.apply_timeout,
            self.raft.client_write(framed),
        )
        .await
        {
            Err(_) => return Err(ClusterError::ApplyTimeout),
            Ok(Err(e)) => return Err(map_write_error(e)),
            Ok(Ok(response)) => response,
        };
        match response.data {
            ApplyResponse::Appended { offset } => Ok(offset),
            ApplyResponse::Error(message) => Err(ClusterError::Raft(message)),
            ApplyResponse::Noop => Err(ClusterError::Raft(
                "append applied as a no-op".to_string(),
            )),
        }
    }

    /// Read a record from the local log. Serviceable on any replica; only
    /// guaranteed to reflect committed state on the leader.
    pub fn read(&self, offset: u64) -> ClusterResult<Record> {
        Ok(self.log.read(offset)?)
    }

    /// Add `(name, addr)` to the voter set.
    ///
    /// If a voter already exists with the same id or the same address but
    /// not both, it is removed first. A voter with both is left alone.
    pub async fn join(&self, name: &str, addr: &str) -> ClusterResult<()> {
        info!(name, addr, "received join request");
        let id = node_id_for(name);
        let membership = { self.raft.metrics().borrow().membership_config.clone() };
        let membership = membership.membership();
        let mut voters: BTreeSet<NodeId> = membership.voter_ids().collect();

        let current_addr = membership.get_node(&id).map(|n| n.addr.clone());
        if voters.contains(&id) && current_addr.as_deref() == Some(addr) {
            debug!(name, addr, "node already a voter, ignoring join");
            return Ok(());
        }

        let mut stale: BTreeSet<NodeId> = BTreeSet::new();
        if voters.contains(&id) {
            stale.insert(id);
        }
        for (other, node) in membership.nodes() {
            if *other != id && node.addr == addr && voters.contains(other) {
                stale.insert(*other);
            }
        }
        if !stale.is_empty() {
            for gone in &stale {
                voters.remove(gone);
            }
            self.change_membership(voters.clone()).await?;
        }

        self.raft
            .add_learner(
                id,
                BasicNode {
                    addr: addr.to_string(),
                },
                true,
            )
            .await
            .map_err(map_write_error)?;
        voters.insert(id);
        self.change_membership(voters).await
    }

    /// Remove `name` from the voter set. A no-op when it is not a voter.
    pub async fn leave(&self, name: &str) -> ClusterResult<()> {
        info!(name, "received leave request");
        let id = node_id_for(name);
        let membership = { self.raft.metrics().borrow().membership_config.clone() };
        let mut voters: BTreeSet<NodeId> = membership.membership().voter_ids().collect();
        if !voters.remove(&id) {
            return Ok(());
        }
        self.change_membership(voters).await
    }

    async fn change_membership(&self, voters: BTreeSet<NodeId>) -> ClusterResult<()> {
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    /// Poll once a second until a leader is known, failing after `window`.
    pub async fn wait_for_leader(&self, window: Duration) -> ClusterResult<()> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            if self.raft.metrics().borrow().current_leader.is_some() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClusterError::LeaderWaitTimeout);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Whether this node currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        let metrics = self.raft.metrics().borrow().clone();
        metrics.current_leader == Some(self.node_id)
    }

    /// Handle one accepted Raft connection from the multiplexer.
    pub async fn serve_raft_connection(&self, conn: BoxedConn) -> std::io::Result<()> {
        serve_raft_connection(self.raft.clone(), conn).await
    }

    /// Notified on every local append; consume streams wait on this.
    pub fn append_notify(&self) -> Arc<Notify> {
        self.log.append_notify()
    }

    /// Shut down Raft, then close the log.
    pub async fn close(&self) -> ClusterResult<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| ClusterError::Raft(format!("shutdown: {e}")))?;
        self.log.close()?;
        Ok(())
    }
}

#[async_trait]
impl crate::discovery::Handler for DistributedLog {
    async fn join(&self, name: &str, rpc_addr: &str) -> ClusterResult<()> {
        DistributedLog::join(self, name, rpc_addr).await
    }

    async fn leave(&self, name: &str) -> ClusterResult<()> {
        DistributedLog::leave(self, name).await
    }
}

fn map_write_error(
    err: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>,
) -> ClusterError {
    match err {
        RaftError::APIError(ClientWriteError::ForwardToLeader(_)) => ClusterError::NotLeader,
        RaftError::APIError(ClientWriteError::ChangeMembershipError(e)) => {
            ClusterError::Raft(e.to_string())
        }
        RaftError::Fatal(e) => ClusterError::Raft(e.to_string()),
    }
}
