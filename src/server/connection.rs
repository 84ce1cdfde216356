//! Per-connection request dispatch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use crate::api::{
    read_frame, write_frame, ApiRequest, ApiResponse, ConsumeResponse, ProduceResponse,
    ProduceStreamFrame,
};
use crate::auth::Authorizer;
use crate::cluster::BoxedConn;
use crate::error::{ClusterError, LogError, Status, StatusCode};
use crate::server::CommitLog;

/// Fallback poll interval for consume streams. Append notifications wake
/// waiters promptly; the poll bounds the wait when a notification races
/// the out-of-range check.
const CONSUME_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct ServerConnection<C: CommitLog> {
    stream: BoxedConn,
    log: Arc<C>,
    authorizer: Option<Arc<Authorizer>>,
    identity: Option<String>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<C: CommitLog> ServerConnection<C> {
    pub(crate) fn new(
        stream: BoxedConn,
        log: Arc<C>,
        authorizer: Option<Arc<Authorizer>>,
        identity: Option<String>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        ServerConnection {
            stream,
            log,
            authorizer,
            identity,
            shutdown_rx,
        }
    }

    pub(crate) async fn run(mut self) -> std::io::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => return Ok(()),
                frame = read_frame::<ApiRequest, _>(&mut self.stream) => {
                    match frame? {
                        None => return Ok(()),
                        Some(request) => {
                            if !self.dispatch(request).await? {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    /// Handle one request. Returns `false` when the connection should end.
    async fn dispatch(&mut self, request: ApiRequest) -> std::io::Result<bool> {
        if let Err(status) = self.authorize(request.procedure()) {
            self.send(&ApiResponse::Error(status)).await?;
            return Ok(true);
        }
        match request {
            ApiRequest::Produce(req) => {
                let response = match self.log.append(req.record).await {
                    Ok(offset) => ApiResponse::Produce(ProduceResponse { offset }),
                    Err(e) => ApiResponse::Error(Status::from_cluster_error(&e)),
                };
                self.send(&response).await?;
                Ok(true)
            }
            ApiRequest::Consume(req) => {
                let response = match self.log.read(req.offset) {
                    Ok(record) => ApiResponse::Consume(ConsumeResponse { record }),
                    Err(e) => ApiResponse::Error(Status::from_cluster_error(&e)),
                };
                self.send(&response).await?;
                Ok(true)
            }
            ApiRequest::ProduceStream => self.produce_stream().await,
            ApiRequest::ConsumeStream(req) => self.consume_stream(req.offset).await,
        }
    }

    /// Bidirectional stream: every incoming append is acknowledged with
    /// its offset, in request order. Ends cleanly on the end frame or EOF.
    async fn produce_stream(&mut self) -> std::io::Result<bool> {
        loop {
            let frame = match read_frame::<ProduceStreamFrame, _>(&mut self.stream).await? {
                Some(frame) => frame,
                None => return Ok(false),
            };
            match frame {
                ProduceStreamFrame::End => return Ok(true),
                ProduceStreamFrame::Append(req) => match self.log.append(req.record).await {
                    Ok(offset) => {
                        self.send(&ApiResponse::Produce(ProduceResponse { offset }))
                            .await?;
                    }
                    Err(e) => {
                        self.send(&ApiResponse::Error(Status::from_cluster_error(&e)))
                            .await?;
                        return Ok(false);
                    }
                },
            }
        }
    }

    /// Server stream: emit records starting at `offset`, waiting out reads
    /// past the high watermark so followers and slow producers catch up.
    /// Ends when the client hangs up or the server shuts down.
    async fn consume_stream(&mut self, mut offset: u64) -> std::io::Result<bool> {
        let notify = self.log.append_notify();
        loop {
            match self.log.read(offset) {
                Ok(record) => {
                    self.send(&ApiResponse::Consume(ConsumeResponse { record }))
                        .await?;
                    offset += 1;
                }
                Err(ClusterError::Log(LogError::OffsetOutOfRange { .. })) => {
                    let notified = notify.notified();
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(CONSUME_POLL_INTERVAL) => {}
                        _ = self.shutdown_rx.recv() => return Ok(false),
                        frame = read_frame::<ApiRequest, _>(&mut self.stream) => {
                            // Anything from the client here, EOF included,
                            // is a cancellation.
                            debug!(got_frame = frame.is_ok(), "consume stream cancelled");
                            return Ok(false);
                        }
                    }
                }
                Err(e) => {
                    self.send(&ApiResponse::Error(Status::from_cluster_error(&e)))
                        .await?;
                    return Ok(false);
                }
            }
        }
    }

    fn authorize(&self, procedure: &str) -> Result<(), Status> {
        let authorizer = match &self.authorizer {
            Some(authorizer) => authorizer,
            None => return Ok(()),
        };
        let subject = self.identity.as_deref().unwrap_or_default();
        if authorizer.enforce(subject, "*", procedure) {
            Ok(())
        } else {
            Err(Status::new(StatusCode::PermissionDenied, "permission denied"))
        }
    }

    async fn send(&mut self, response: &ApiResponse) -> std::io::Result<()> {
        write_frame(&mut self.stream, response).await
    }
}
