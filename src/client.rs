//! A typed client for the application RPC surface.
//!
//! One [`LogClient`] owns one connection to a node's multiplexed port.
//! Unary calls and streams share the connection; a consume stream
//! dedicates it until the client is dropped.

use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::api::{
    read_frame, write_frame, ApiRequest, ApiResponse, ConsumeRequest, ProduceRequest,
    ProduceStreamFrame, Record, APP_RPC,
};
use crate::cluster::BoxedConn;
use crate::error::Status;
use crate::server::tls::PeerTls;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with an error status.
    #[error("{0}")]
    Status(Status),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The server sent something the protocol does not allow here.
    #[error("protocol: {0}")]
    Protocol(String),
}

impl ClientError {
    /// The wire status, when the server rejected the call.
    pub fn status(&self) -> Option<&Status> {
        match self {
            ClientError::Status(status) => Some(status),
            _ => None,
        }
    }
}

/// A connection to one node's RPC service.
pub struct LogClient {
    stream: BoxedConn,
}

impl LogClient {
    /// Dial `addr`, tag the connection for the application service, and
    /// complete the TLS handshake when credentials are given.
    pub async fn connect(addr: &str, tls: Option<&PeerTls>) -> std::io::Result<Self> {
        let mut tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connection timeout to {addr}"),
                )
            })??;
        tcp.set_nodelay(true)?;
        tcp.write_all(&[APP_RPC]).await?;
        let stream: BoxedConn = match tls {
            Some(tls) => Box::new(tls.connect(tcp).await?),
            None => Box::new(tcp),
        };
        Ok(LogClient { stream })
    }

    /// Append one record; returns the offset it was assigned.
    pub async fn produce(&mut self, record: Record) -> Result<u64, ClientError> {
        self.call(&ApiRequest::Produce(ProduceRequest { record }))
            .await
            .and_then(|response| match response {
                ApiResponse::Produce(resp) => Ok(resp.offset),
                other => Err(unexpected(other)),
            })
    }

    /// Read the record at `offset`.
    pub async fn consume(&mut self, offset: u64) -> Result<Record, ClientError> {
        self.call(&ApiRequest::Consume(ConsumeRequest { offset }))
            .await
            .and_then(|response| match response {
                ApiResponse::Consume(resp) => Ok(resp.record),
                other => Err(unexpected(other)),
            })
    }

    /// Append a batch through the bidirectional stream; offsets come back
    /// in request order.
    pub async fn produce_stream(
        &mut self,
        records: Vec<Record>,
    ) -> Result<Vec<u64>, ClientError> {
        write_frame(&mut self.stream, &ApiRequest::ProduceStream).await?;
        let expected = records.len();
        for record in records {
            write_frame(
                &mut self.stream,
                &ProduceStreamFrame::Append(ProduceRequest { record }),
            )
            .await?;
        }
        let mut offsets = Vec::with_capacity(expected);
        for _ in 0..expected {
            match self.read_response().await? {
                ApiResponse::Produce(resp) => offsets.push(resp.offset),
                ApiResponse::Error(status) => return Err(ClientError::Status(status)),
                other => return Err(unexpected(other)),
            }
        }
        write_frame(&mut self.stream, &ProduceStreamFrame::End).await?;
        Ok(offsets)
    }

    /// Open a server stream starting at `offset`. Records are pulled with
    /// [`next_record`](Self::next_record); dropping the client cancels.
    pub async fn start_consume_stream(&mut self, offset: u64) -> Result<(), ClientError> {
        write_frame(
            &mut self.stream,
            &ApiRequest::ConsumeStream(ConsumeRequest { offset }),
        )
        .await?;
        Ok(())
    }

    /// The next record of an open consume stream.
    pub async fn next_record(&mut self) -> Result<Record, ClientError> {
        match self.read_response().await? {
            ApiResponse::Consume(resp) => Ok(resp.record),
            ApiResponse::Error(status) => Err(ClientError::Status(status)),
            other => Err(unexpected(other)),
        }
    }

    async fn call(&mut self, request: &ApiRequest) -> Result<ApiResponse, ClientError> {
        write_frame(&mut self.stream, request).await?;
        let response = self.read_response().await?;
        if let ApiResponse::Error(status) = response {
            return Err(ClientError::Status(status));
        }
        Ok(response)
    }

    async fn read_response(&mut self) -> Result<ApiResponse, ClientError> {
        match read_frame::<ApiResponse, _>(&mut self.stream).await? {
            Some(response) => Ok(response),
            None => Err(ClientError::Protocol(
                "server closed the connection".to_string(),
            )),
        }
    }
}

fn unexpected(response: ApiResponse) -> ClientError {
    ClientError::Protocol(format!("unexpected response: {response:?}"))
}
