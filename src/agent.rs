//! The composition root: one running node.
//!
//! An [`Agent`] binds the multiplexed listener, starts the replicated log,
//! the RPC server, and gossip membership, and tears them down in order on
//! shutdown: membership leaves gossip, the RPC server stops, Raft shuts
//! down, the log closes.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info};

use crate::auth::Authorizer;
use crate::cluster::{DistributedConfig, DistributedLog, StreamLayer, RAFT_RPC};
use crate::config::AgentConfig;
use crate::discovery::{DiscoveryConfig, Membership, RPC_ADDR_TAG};
use crate::error::{ClusterError, ClusterResult};
use crate::server::tls::{PeerTls, ServerTls};
use crate::server::RpcServer;

/// A fully wired node.
pub struct Agent {
    config: AgentConfig,
    log: Arc<DistributedLog>,
    membership: Membership,
    server: Arc<RpcServer<DistributedLog>>,
    shutdown_tx: broadcast::Sender<()>,
    shut_down: Mutex<bool>,
}

impl Agent {
    /// Build and start every component. The returned agent is serving.
    pub async fn new(config: AgentConfig) -> ClusterResult<Agent> {
        config.validate()?;

        let server_tls = config
            .server_tls
            .as_ref()
            .map(ServerTls::from_paths)
            .transpose()?;
        let peer_tls = config
            .peer_tls
            .as_ref()
            .map(PeerTls::from_paths)
            .transpose()?;
        let stream_layer = StreamLayer::new(server_tls.clone(), peer_tls);

        let listener = TcpListener::bind(config.rpc_listen_addr()?).await?;
        let rpc_addr = config.rpc_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        let log = DistributedLog::new(
            &config.data_dir,
            stream_layer.clone(),
            DistributedConfig {
                node_name: config.node_name.clone(),
                rpc_addr: rpc_addr.clone(),
                bootstrap: config.bootstrap,
                segment: config.segment,
                ..Default::default()
            },
        )
        .await?;
        if config.bootstrap {
            log.wait_for_leader(Duration::from_secs(3)).await?;
        }

        let authorizer = match (&config.acl_model_file, &config.acl_policy_file) {
            (Some(model), Some(policy)) => Some(Arc::new(
                Authorizer::new(model, policy)
                    .map_err(|e| ClusterError::Io(e.to_string()))?,
            )),
            _ => None,
        };
        let server = Arc::new(RpcServer::new(
            Arc::clone(&log),
            authorizer,
            server_tls,
        ));

        let (conn_tx, conn_rx) = mpsc::channel(64);
        tokio::spawn(Arc::clone(&server).serve(conn_rx));
        tokio::spawn(run_mux(
            listener,
            stream_layer,
            Arc::clone(&log),
            conn_tx,
            shutdown_tx.subscribe(),
        ));

        let mut tags = std::collections::HashMap::new();
        tags.insert(RPC_ADDR_TAG.to_string(), rpc_addr.clone());
        let mut discovery =
            DiscoveryConfig::new(config.node_name.clone(), config.bind_addr.clone());
        discovery.tags = tags;
        discovery.start_join_addrs = config.start_join_addrs.clone();
        let membership =
            Membership::new(Arc::clone(&log) as Arc<dyn crate::discovery::Handler>, discovery)
                .await?;

        info!(
            node = %config.node_name,
            rpc_addr = %rpc_addr,
            bind_addr = %config.bind_addr,
            "agent started"
        );

        Ok(Agent {
            config,
            log,
            membership,
            server,
            shutdown_tx,
            shut_down: Mutex::new(false),
        })
    }

    /// The address clients and peers dial this node at.
    pub fn rpc_addr(&self) -> ClusterResult<String> {
        self.config.rpc_addr()
    }

    /// The replicated log this agent serves.
    pub fn log(&self) -> Arc<DistributedLog> {
        Arc::clone(&self.log)
    }

    /// Members this node currently sees via gossip.
    pub fn members(&self) -> Vec<crate::discovery::Member> {
        self.membership.members()
    }

    /// Tear everything down in order. Idempotent.
    pub async fn shutdown(&self) -> ClusterResult<()> {
        let mut shut_down = self.shut_down.lock().await;
        if *shut_down {
            return Ok(());
        }
        *shut_down = true;

        self.membership.leave().await?;
        self.server.shutdown();
        let _ = self.shutdown_tx.send(());
        self.log.close().await?;
        info!(node = %self.config.node_name, "agent shut down");
        Ok(())
    }
}

/// Accept loop: read the first byte of each connection and route it to
/// the Raft transport or the application RPC server.
async fn run_mux(
    listener: TcpListener,
    stream_layer: StreamLayer,
    log: Arc<DistributedLog>,
    conn_tx: mpsc::Sender<tokio::net::TcpStream>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("mux shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (mut stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                };
                let stream_layer = stream_layer.clone();
                let log = Arc::clone(&log);
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    let mut tag = [0u8; 1];
                    if let Err(e) = stream.read_exact(&mut tag).await {
                        debug!(peer = %peer, error = %e, "connection closed before the mux tag");
                        return;
                    }
                    if tag[0] == RAFT_RPC {
                        match stream_layer.accept_raft(stream, tag[0]).await {
                            Ok(conn) => {
                                if let Err(e) = log.serve_raft_connection(conn).await {
                                    debug!(peer = %peer, error = %e, "raft connection ended");
                                }
                            }
                            Err(e) => debug!(peer = %peer, error = %e, "raft accept failed"),
                        }
                    } else if conn_tx.send(stream).await.is_err() {
                        debug!(peer = %peer, "rpc server is gone, dropping connection");
                    }
                });
            }
        }
    }
}
