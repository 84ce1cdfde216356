//! Gossip-based cluster membership.
//!
//! Each node binds a UDP socket and periodically gossips a heartbeat
//! carrying its own descriptor and its current member list. Unseen members
//! trigger a join event; a member that stays silent past the failure
//! window, or announces its departure, triggers a leave event. Events are
//! routed serially into a [`Handler`] on every node, but only the Raft
//! leader acts on them, so `NotLeader` from the handler is demoted to a
//! debug log.
//!
//! Gossip decides liveness; Raft decides the voter set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ClusterError, ClusterResult};

/// The gossip tag under which a member advertises its RPC address.
pub const RPC_ADDR_TAG: &str = "rpc_addr";

/// Receives membership events. Implemented by the replicated log, which
/// maps joins and leaves onto Raft voter changes.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn join(&self, name: &str, rpc_addr: &str) -> ClusterResult<()>;
    async fn leave(&self, name: &str) -> ClusterResult<()>;
}

/// Configuration for the membership component.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// This node's unique name.
    pub node_name: String,
    /// UDP bind address for gossip.
    pub bind_addr: String,
    /// Tags advertised to peers. Must include [`RPC_ADDR_TAG`].
    pub tags: HashMap<String, String>,
    /// Seed peers contacted at startup.
    pub start_join_addrs: Vec<String>,
    /// Heartbeat gossip interval.
    pub heartbeat_interval: Duration,
    /// Missed heartbeats before a member is declared failed.
    pub failure_threshold: u32,
}

impl DiscoveryConfig {
    pub fn new(node_name: impl Into<String>, bind_addr: impl Into<String>) -> Self {
        DiscoveryConfig {
            node_name: node_name.into(),
            bind_addr: bind_addr.into(),
            tags: HashMap::new(),
            start_join_addrs: Vec::new(),
            heartbeat_interval: Duration::from_millis(500),
            failure_threshold: 5,
        }
    }

    fn failure_window(&self) -> Duration {
        self.heartbeat_interval * self.failure_threshold
    }
}

/// One member as carried in gossip messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    /// Gossip (UDP) address.
    pub gossip_addr: String,
    pub tags: HashMap<String, String>,
}

impl Member {
    pub fn rpc_addr(&self) -> Option<&str> {
        self.tags.get(RPC_ADDR_TAG).map(String::as_str)
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum GossipMessage {
    Heartbeat { from: Member, members: Vec<Member> },
    Leave { name: String },
}

struct PeerState {
    member: Member,
    last_seen: Instant,
}

type PeerMap = HashMap<String, PeerState>;

/// The local node's view of the gossip cluster.
pub struct Membership {
    local: Member,
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<PeerMap>>,
    shutdown_tx: broadcast::Sender<()>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Membership {
    /// Bind the gossip socket, start the event loop, and contact any seed
    /// peers.
    pub async fn new(handler: Arc<dyn Handler>, config: DiscoveryConfig) -> ClusterResult<Self> {
        if !config.tags.contains_key(RPC_ADDR_TAG) {
            return Err(ClusterError::Io(format!(
                "membership tags must include {RPC_ADDR_TAG}"
            )));
        }
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        let local = Member {
            name: config.node_name.clone(),
            gossip_addr: socket.local_addr()?.to_string(),
            tags: config.tags.clone(),
        };
        let peers: Arc<Mutex<PeerMap>> = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let event_loop = tokio::spawn(run_event_loop(
            handler,
            config.clone(),
            local.clone(),
            Arc::clone(&socket),
            Arc::clone(&peers),
            shutdown_rx,
        ));
        info!(node = %local.name, addr = %local.gossip_addr, "membership started");

        Ok(Membership {
            local,
            socket,
            peers,
            shutdown_tx,
            event_loop: Mutex::new(Some(event_loop)),
        })
    }

    /// Every member this node currently knows about, itself included.
    pub fn members(&self) -> Vec<Member> {
        let peers = self.peers.lock().unwrap();
        let mut members: Vec<Member> = peers.values().map(|p| p.member.clone()).collect();
        members.push(self.local.clone());
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Gracefully leave the cluster: announce departure to every known
    /// peer and stop the event loop.
    pub async fn leave(&self) -> ClusterResult<()> {
        let targets: Vec<String> = {
            let peers = self.peers.lock().unwrap();
            peers.values().map(|p| p.member.gossip_addr.clone()).collect()
        };
        let message = encode_message(&GossipMessage::Leave {
            name: self.local.name.clone(),
        })?;
        for addr in targets {
            if let Err(e) = self.socket.send_to(&message, &addr).await {
                debug!(peer = %addr, error = %e, "failed to announce departure");
            }
        }
        let _ = self.shutdown_tx.send(());
        let handle = self.event_loop.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(node = %self.local.name, "left the cluster");
        Ok(())
    }
}

fn encode_message(message: &GossipMessage) -> ClusterResult<Vec<u8>> {
    bincode::serialize(message).map_err(|e| ClusterError::Io(e.to_string()))
}

async fn run_event_loop(
    handler: Arc<dyn Handler>,
    config: DiscoveryConfig,
    local: Member,
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<PeerMap>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = ticker.tick() => {
                gossip_heartbeat(&config, &local, &socket, &peers).await;
                reap_failed(&handler, &config, &peers).await;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, _) = match received {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(error = %e, "gossip socket receive failed");
                        continue;
                    }
                };
                let message: GossipMessage = match bincode::deserialize(&buf[..len]) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(error = %e, "ignoring malformed gossip datagram");
                        continue;
                    }
                };
                handle_message(&handler, &local, &peers, message).await;
            }
        }
    }
}

/// Send a heartbeat with the full member list to every known peer, plus
/// the seed list until someone answers.
async fn gossip_heartbeat(
    config: &DiscoveryConfig,
    local: &Member,
    socket: &UdpSocket,
    peers: &Mutex<PeerMap>,
) {
    let (mut targets, members) = {
        let peers = peers.lock().unwrap();
        let targets: Vec<String> = peers.values().map(|p| p.member.gossip_addr.clone()).collect();
        let members: Vec<Member> = peers.values().map(|p| p.member.clone()).collect();
        (targets, members)
    };
    if targets.is_empty() {
        targets.extend(config.start_join_addrs.iter().cloned());
    }
    if targets.is_empty() {
        return;
    }
    let message = match encode_message(&GossipMessage::Heartbeat {
        from: local.clone(),
        members,
    }) {
        Ok(message) => message,
        Err(e) => {
            error!(error = %e, "failed to encode heartbeat");
            return;
        }
    };
    for addr in targets {
        if let Err(e) = socket.send_to(&message, &addr).await {
            debug!(peer = %addr, error = %e, "heartbeat send failed");
        }
    }
}

/// Declare members that stayed silent past the failure window as failed.
async fn reap_failed(handler: &Arc<dyn Handler>, config: &DiscoveryConfig, peers: &Mutex<PeerMap>) {
    let window = config.failure_window();
    let failed: Vec<Member> = {
        let mut peers = peers.lock().unwrap();
        let gone: Vec<String> = peers
            .iter()
            .filter(|(_, state)| state.last_seen.elapsed() > window)
            .map(|(name, _)| name.clone())
            .collect();
        gone.iter()
            .filter_map(|name| peers.remove(name))
            .map(|state| state.member)
            .collect()
    };
    for member in failed {
        warn!(name = %member.name, "member failed");
        handle_leave(handler, &member.name).await;
    }
}

async fn handle_message(
    handler: &Arc<dyn Handler>,
    local: &Member,
    peers: &Mutex<PeerMap>,
    message: GossipMessage,
) {
    match message {
        GossipMessage::Heartbeat { from, members } => {
            let mut unseen = Vec::new();
            {
                let mut peers = peers.lock().unwrap();
                for member in members.into_iter().chain(std::iter::once(from.clone())) {
                    if member.name == local.name {
                        continue;
                    }
                    let fresh = member.name == from.name;
                    match peers.get_mut(&member.name) {
                        Some(state) => {
                            if fresh {
                                state.last_seen = Instant::now();
                                state.member = member;
                            }
                        }
                        None => {
                            peers.insert(
                                member.name.clone(),
                                PeerState {
                                    member: member.clone(),
                                    last_seen: Instant::now(),
                                },
                            );
                            unseen.push(member);
                        }
                    }
                }
            }
            for member in unseen {
                info!(name = %member.name, "member joined");
                match member.rpc_addr() {
                    Some(rpc_addr) => {
                        if let Err(e) = handler.join(&member.name, rpc_addr).await {
                            log_handler_error("join", &member.name, &e);
                        }
                    }
                    None => warn!(
                        name = %member.name,
                        "member advertises no {RPC_ADDR_TAG} tag, ignoring"
                    ),
                }
            }
        }
        GossipMessage::Leave { name } => {
            if name == local.name {
                return;
            }
            let known = peers.lock().unwrap().remove(&name).is_some();
            if known {
                info!(name = %name, "member left");
                handle_leave(handler, &name).await;
            }
        }
    }
}

async fn handle_leave(handler: &Arc<dyn Handler>, name: &str) {
    if let Err(e) = handler.leave(name).await {
        log_handler_error("leave", name, &e);
    }
}

/// Every node observes every event, but only the leader may change the
/// voter set; `NotLeader` from followers is routine.
fn log_handler_error(event: &str, name: &str, err: &ClusterError) {
    if matches!(err, ClusterError::NotLeader) {
        debug!(event, name, error = %err, "membership handler: not the leader");
    } else {
        error!(event, name, error = %err, "membership handler failed");
    }
}
