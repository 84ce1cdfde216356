//! Node configuration.
//!
//! An [`AgentConfig`] describes one node: where it listens for RPC and
//! gossip traffic, where its data lives, how it authenticates peers and
//! clients, and whether it bootstraps a fresh cluster.

use std::path::PathBuf;

use crate::error::{ClusterError, ClusterResult};
use crate::storage::LogConfig;

/// PEM material for one TLS identity.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    /// PEM-encoded certificate (chain).
    pub cert_file: PathBuf,
    /// PEM-encoded private key.
    pub key_file: PathBuf,
    /// PEM-encoded CA used to verify the other side.
    pub ca_file: PathBuf,
    /// Name the peer's certificate is verified against when dialing.
    pub server_name: String,
}

/// Configuration for a single node.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Raft local id and gossip node name. Must be unique in the cluster.
    pub node_name: String,
    /// Gossip bind address, `host:port`.
    pub bind_addr: String,
    /// Port advertised (and bound) for RPC and Raft traffic. The host part
    /// is taken from `bind_addr`.
    pub rpc_port: u16,
    /// RPC bind address used when `rpc_port` is zero.
    pub listen_addr: String,
    /// Root directory for segments and Raft state.
    pub data_dir: PathBuf,
    /// Seed gossip peers to join at startup.
    pub start_join_addrs: Vec<String>,
    /// Bootstrap a single-voter cluster when no prior Raft state exists.
    pub bootstrap: bool,
    /// Certificate material served to clients and peers; enables mutual
    /// TLS with mandatory client verification.
    pub server_tls: Option<TlsPaths>,
    /// Certificate material presented when dialing peers.
    pub peer_tls: Option<TlsPaths>,
    /// Casbin-format ACL model file.
    pub acl_model_file: Option<PathBuf>,
    /// Casbin-format ACL policy file.
    pub acl_policy_file: Option<PathBuf>,
    /// Segment sizing for the data log.
    pub segment: LogConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            node_name: String::new(),
            bind_addr: "127.0.0.1:8401".to_string(),
            rpc_port: 0,
            listen_addr: ":8080".to_string(),
            data_dir: PathBuf::from("data"),
            start_join_addrs: Vec::new(),
            bootstrap: false,
            server_tls: None,
            peer_tls: None,
            acl_model_file: None,
            acl_policy_file: None,
            segment: LogConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Build a config from `SCRIVENER_*` environment variables.
    pub fn from_env() -> ClusterResult<Self> {
        let mut config = AgentConfig::default();
        if let Ok(v) = std::env::var("SCRIVENER_NODE_NAME") {
            config.node_name = v;
        }
        if let Ok(v) = std::env::var("SCRIVENER_BIND_ADDR") {
            config.bind_addr = v;
        }
        if let Ok(v) = std::env::var("SCRIVENER_RPC_PORT") {
            config.rpc_port = v
                .parse()
                .map_err(|_| ClusterError::Raft(format!("invalid SCRIVENER_RPC_PORT: {v}")))?;
        }
        if let Ok(v) = std::env::var("SCRIVENER_LISTEN_ADDR") {
            config.listen_addr = v;
        }
        if let Ok(v) = std::env::var("SCRIVENER_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SCRIVENER_START_JOIN_ADDRS") {
            config.start_join_addrs = v
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(v) = std::env::var("SCRIVENER_BOOTSTRAP") {
            config.bootstrap = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        config.server_tls = tls_paths_from_env("SCRIVENER_SERVER_TLS");
        config.peer_tls = tls_paths_from_env("SCRIVENER_PEER_TLS");
        if let Ok(v) = std::env::var("SCRIVENER_ACL_MODEL_FILE") {
            config.acl_model_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("SCRIVENER_ACL_POLICY_FILE") {
            config.acl_policy_file = Some(PathBuf::from(v));
        }
        Ok(config)
    }

    /// The address peers dial this node at for RPC and Raft traffic:
    /// the gossip bind host paired with `rpc_port`.
    pub fn rpc_addr(&self) -> ClusterResult<String> {
        let host = self
            .bind_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .ok_or_else(|| {
                ClusterError::Raft(format!("bind_addr {} has no port", self.bind_addr))
            })?;
        Ok(format!("{host}:{}", self.rpc_port))
    }

    /// The address the multiplexed listener binds.
    pub fn rpc_listen_addr(&self) -> ClusterResult<String> {
        if self.rpc_port != 0 {
            self.rpc_addr()
        } else {
            Ok(self.listen_addr.clone())
        }
    }

    /// Check the config for mistakes that would only surface later.
    pub fn validate(&self) -> ClusterResult<()> {
        if self.node_name.is_empty() {
            return Err(ClusterError::Raft("node_name must not be empty".into()));
        }
        if !self.bind_addr.contains(':') {
            return Err(ClusterError::Raft(format!(
                "bind_addr {} must be host:port",
                self.bind_addr
            )));
        }
        if self.acl_model_file.is_some() != self.acl_policy_file.is_some() {
            return Err(ClusterError::Raft(
                "acl_model_file and acl_policy_file must be set together".into(),
            ));
        }
        Ok(())
    }
}

fn tls_paths_from_env(prefix: &str) -> Option<TlsPaths> {
    let cert = std::env::var(format!("{prefix}_CERT")).ok()?;
    let key = std::env::var(format!("{prefix}_KEY")).ok()?;
    let ca = std::env::var(format!("{prefix}_CA")).ok()?;
    let server_name =
        std::env::var(format!("{prefix}_SERVER_NAME")).unwrap_or_else(|_| "localhost".to_string());
    Some(TlsPaths {
        cert_file: PathBuf::from(cert),
        key_file: PathBuf::from(key),
        ca_file: PathBuf::from(ca),
        server_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_addr_uses_bind_host() {
        let config = AgentConfig {
            bind_addr: "10.0.0.7:8401".to_string(),
            rpc_port: 8400,
            ..Default::default()
        };
        assert_eq!(config.rpc_addr().unwrap(), "10.0.0.7:8400");
    }

    #[test]
    fn test_rpc_listen_addr_falls_back_when_port_unset() {
        let config = AgentConfig {
            rpc_port: 0,
            listen_addr: ":8080".to_string(),
            ..Default::default()
        };
        assert_eq!(config.rpc_listen_addr().unwrap(), ":8080");
    }

    #[test]
    fn test_validate_rejects_empty_node_name() {
        let config = AgentConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_paired_acl_files() {
        let config = AgentConfig {
            node_name: "node-0".to_string(),
            acl_model_file: Some(PathBuf::from("model.conf")),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_complete_config() {
        let config = AgentConfig {
            node_name: "node-0".to_string(),
            rpc_port: 8400,
            ..Default::default()
        };
        config.validate().unwrap();
    }
}
