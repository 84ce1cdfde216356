//! Wire types and framing for the application RPC surface.
//!
//! Every peer-facing message in the crate (application RPC, Raft RPC,
//! gossip) travels as a length-prefixed bincode frame:
//!
//! ```text
//! [u32 BE length][bincode payload]
//! ```
//!
//! A client opens an application connection by writing the [`APP_RPC`] tag
//! byte (any value other than the Raft tag routes to this service), then
//! optionally completing a TLS handshake, then exchanging frames.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{LogError, LogResult, Status};

/// Connection tag byte for application RPC connections.
///
/// The multiplexer routes any first byte other than the Raft tag to the
/// application service; clients write this one by convention.
pub const APP_RPC: u8 = 0x00;

/// Frames larger than this are rejected before allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// The unit of data in the log: an opaque payload plus metadata assigned
/// by the system at append time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Opaque client payload.
    pub value: Vec<u8>,
    /// Absolute position in the log. Assigned on append, never reused.
    pub offset: u64,
    /// Raft term at the time the record was committed.
    pub term: u64,
    /// Entry kind tag, used by the Raft log-store adapter.
    pub kind: u32,
}

impl Record {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Record {
            value: value.into(),
            ..Default::default()
        }
    }

    /// Decode a record from its stored bytes.
    pub fn decode(bytes: &[u8]) -> LogResult<Self> {
        bincode::deserialize(bytes).map_err(|e| LogError::Codec(e.to_string()))
    }

    /// Encode a record into its stored bytes.
    pub fn encode(&self) -> LogResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| LogError::Codec(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceRequest {
    pub record: Record,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeRequest {
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeResponse {
    pub record: Record,
}

/// First frame on an application connection (or after a completed stream):
/// selects the procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiRequest {
    Produce(ProduceRequest),
    Consume(ConsumeRequest),
    /// Opens a bidirectional stream: the client follows up with
    /// [`ProduceStreamFrame`]s, the server acknowledges each append with a
    /// `Produce` response in request order.
    ProduceStream,
    /// Opens a server stream starting at the requested offset; the server
    /// emits one `Consume` response per record until the client hangs up.
    ConsumeStream(ConsumeRequest),
}

impl ApiRequest {
    /// Procedure name, as evaluated against the ACL policy.
    pub fn procedure(&self) -> &'static str {
        match self {
            ApiRequest::Produce(_) => "produce",
            ApiRequest::Consume(_) => "consume",
            ApiRequest::ProduceStream => "produce_stream",
            ApiRequest::ConsumeStream(_) => "consume_stream",
        }
    }
}

/// Client frames inside an open produce stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProduceStreamFrame {
    Append(ProduceRequest),
    /// Graceful end of the stream; the server returns to request dispatch.
    End,
}

/// Server-to-client frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiResponse {
    Produce(ProduceResponse),
    Consume(ConsumeResponse),
    Error(Status),
}

/// Read one length-prefixed bincode frame from `reader`.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<T, R>(reader: &mut R) -> std::io::Result<Option<T>>
where
    T: for<'de> Deserialize<'de>,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let frame = bincode::deserialize(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(frame))
}

/// Write one length-prefixed bincode frame to `writer`.
pub async fn write_frame<T, W>(writer: &mut W, frame: &T) -> std::io::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let data = bincode::serialize(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await
}
