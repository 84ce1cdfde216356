//! The application RPC service.
//!
//! Connections arrive from the multiplexer (any first byte other than the
//! Raft tag), complete a mutual-TLS handshake when the server carries
//! certificate material, and then exchange length-prefixed frames. Four
//! procedures are served: `Produce`, `Consume`, and their streaming
//! variants.

mod connection;
pub mod tls;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, error};

use crate::api::{read_frame, write_frame, ApiRequest, ApiResponse, Record};
use crate::auth::{identity_from_certs, Authorizer};
use crate::cluster::DistributedLog;
use crate::error::{ClusterResult, Status, StatusCode};
use crate::server::tls::ServerTls;
use crate::storage::Log;

/// The log the RPC surface serves: appends and offset reads, plus the
/// append notification consume streams wait on.
#[async_trait]
pub trait CommitLog: Send + Sync + 'static {
    async fn append(&self, record: Record) -> ClusterResult<u64>;
    fn read(&self, offset: u64) -> ClusterResult<Record>;
    fn append_notify(&self) -> Arc<Notify>;
}

#[async_trait]
impl CommitLog for Log {
    async fn append(&self, record: Record) -> ClusterResult<u64> {
        Ok(Log::append(self, record)?)
    }

    fn read(&self, offset: u64) -> ClusterResult<Record> {
        Ok(Log::read(self, offset)?)
    }

    fn append_notify(&self) -> Arc<Notify> {
        Log::append_notify(self)
    }
}

#[async_trait]
impl CommitLog for DistributedLog {
    async fn append(&self, record: Record) -> ClusterResult<u64> {
        DistributedLog::append(self, record).await
    }

    fn read(&self, offset: u64) -> ClusterResult<Record> {
        DistributedLog::read(self, offset)
    }

    fn append_notify(&self) -> Arc<Notify> {
        DistributedLog::append_notify(self)
    }
}

/// The RPC server: takes connections handed over by the multiplexer and
/// dispatches procedures against the commit log.
pub struct RpcServer<C: CommitLog> {
    log: Arc<C>,
    authorizer: Option<Arc<Authorizer>>,
    server_tls: Option<ServerTls>,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
}

impl<C: CommitLog> RpcServer<C> {
    pub fn new(
        log: Arc<C>,
        authorizer: Option<Arc<Authorizer>>,
        server_tls: Option<ServerTls>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        RpcServer {
            log,
            authorizer,
            server_tls,
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Signal the server to stop taking connections; in-flight streams
    /// observe the signal and wind down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Serve connections from the multiplexer until shutdown or until the
    /// channel closes.
    pub async fn serve(self: Arc<Self>, mut incoming: mpsc::Receiver<TcpStream>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("rpc server shutting down");
                    return;
                }
                next = incoming.recv() => {
                    let stream = match next {
                        Some(stream) => stream,
                        None => return,
                    };
                    let server = Arc::clone(&self);
                    server.active_connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        server.handle_connection(stream).await;
                        server.active_connections.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        match &self.server_tls {
            Some(tls) => {
                let tls_stream = match tls.acceptor().accept(stream).await {
                    Ok(tls_stream) => tls_stream,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "tls handshake failed");
                        return;
                    }
                };
                let certs = tls_stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .map(<[_]>::to_vec)
                    .unwrap_or_default();
                match identity_from_certs(&certs) {
                    Ok(identity) => {
                        debug!(peer = %peer, identity = %identity, "authenticated");
                        self.run_connection(Box::new(tls_stream), peer, Some(identity))
                            .await;
                    }
                    Err(e) => {
                        // Answer the first request so the client learns
                        // why it is being turned away, then hang up.
                        let mut conn: crate::cluster::BoxedConn = Box::new(tls_stream);
                        let status = Status::new(StatusCode::Unauthenticated, e.to_string());
                        let _ = read_frame::<ApiRequest, _>(&mut conn).await;
                        let _ = write_frame(&mut conn, &ApiResponse::Error(status)).await;
                        debug!(peer = %peer, error = %e, "rejected unauthenticated connection");
                    }
                }
            }
            None => {
                self.run_connection(Box::new(stream), peer, None).await;
            }
        }
    }

    async fn run_connection(
        &self,
        stream: crate::cluster::BoxedConn,
        peer: String,
        identity: Option<String>,
    ) {
        let conn = connection::ServerConnection::new(
            stream,
            Arc::clone(&self.log),
            self.authorizer.clone(),
            identity,
            self.shutdown_tx.subscribe(),
        );
        if let Err(e) = conn.run().await {
            error!(peer = %peer, error = %e, "error handling connection");
        }
    }
}
