//! The connection multiplexer.
//!
//! One TCP listener serves both Raft RPCs and application RPCs. The first
//! byte a client sends selects the stream: [`RAFT_RPC`] routes to the Raft
//! transport, anything else to the application RPC service. The tag byte
//! travels in plaintext; TLS, when configured, wraps the connection after
//! the tag on both sides.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::server::tls::{PeerTls, ServerTls};

/// First-byte tag identifying a Raft connection.
pub const RAFT_RPC: u8 = 0x01;

/// A muxed connection: plain TCP or TLS on either side of the handshake.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

pub type BoxedConn = Box<dyn Conn>;

/// Accept/dial layer for the Raft side of the multiplexed port.
#[derive(Clone)]
pub struct StreamLayer {
    server_tls: Option<ServerTls>,
    peer_tls: Option<PeerTls>,
}

impl StreamLayer {
    pub fn new(server_tls: Option<ServerTls>, peer_tls: Option<PeerTls>) -> Self {
        StreamLayer {
            server_tls,
            peer_tls,
        }
    }

    /// Server side: adopt a freshly accepted connection whose first byte
    /// has already been read by the mux. Rejects anything that is not a
    /// Raft connection, then runs the server TLS handshake if configured.
    pub async fn accept_raft(&self, stream: TcpStream, tag: u8) -> io::Result<BoxedConn> {
        if tag != RAFT_RPC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not a raft rpc"));
        }
        match &self.server_tls {
            Some(tls) => Ok(Box::new(tls.acceptor().accept(stream).await?)),
            None => Ok(Box::new(stream)),
        }
    }

    /// Client side: dial a peer's muxed port for Raft traffic. Writes the
    /// tag byte, then runs the client TLS handshake with the configured
    /// peer certificate.
    pub async fn dial(&self, addr: &str, connect_timeout: Duration) -> io::Result<BoxedConn> {
        let mut stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connection timeout to {addr}"),
                )
            })??;
        stream.set_nodelay(true)?;
        stream.write_all(&[RAFT_RPC]).await?;
        match &self.peer_tls {
            Some(tls) => Ok(Box::new(tls.connect(stream).await?)),
            None => Ok(Box::new(stream)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_writes_the_raft_tag() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let layer = StreamLayer::new(None, None);

        let dialer = tokio::spawn(async move {
            layer.dial(&addr, Duration::from_secs(1)).await.unwrap();
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut tag = [0u8; 1];
        stream.read_exact(&mut tag).await.unwrap();
        assert_eq!(tag[0], RAFT_RPC);
        dialer.await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_rejects_non_raft_tag() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let layer = StreamLayer::new(None, None);

        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let err = match layer.accept_raft(stream, 0x7f).await {
            Err(e) => e,
            Ok(_) => panic!("expected accept_raft to reject a non-raft tag"),
        };
        assert_eq!(err.to_string(), "not a raft rpc");
    }

    #[tokio::test]
    async fn test_dial_unreachable_peer_fails() {
        // RFC 5737 TEST-NET-1: guaranteed unroutable. Depending on the
        // host this surfaces as a timeout or an unreachable error.
        let layer = StreamLayer::new(None, None);
        let err = layer
            .dial("192.0.2.1:9999", Duration::from_millis(50))
            .await;
        assert!(err.is_err());
    }
}
