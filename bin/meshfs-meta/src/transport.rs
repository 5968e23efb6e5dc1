//! Back channel wire exchange
//!
//! One request per connection: the metadata server writes a single JSON line
//! and reads a single JSON line reply. Writing the request and reading the
//! reply are separate steps; both together are bounded by the request
//! timeout.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use meshfs_common::{Error, FileRef, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::time::Instant;
use tracing::trace;

/// Load and capacity report returned by a status probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostStatus {
    pub loadavg_1min: f64,
    pub loadavg_5min: f64,
    pub loadavg_15min: f64,
    pub disk_used: u64,
    pub disk_avail: u64,
}

/// Request sent to a storage node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Status,
    FhRemove {
        file: FileRef,
    },
    ReplicationRequest {
        source_address: String,
        file: FileRef,
    },
}

/// Reply from a storage node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Status { status: HostStatus },
    Busy,
    NoSuchObject { file: FileRef },
    Error { message: String },
}

impl Reply {
    /// Turn an error reply into the matching [`Error`]
    pub fn into_result(self) -> Result<Option<HostStatus>> {
        match self {
            Self::Ok => Ok(None),
            Self::Status { status } => Ok(Some(status)),
            Self::Busy => Err(Error::Busy),
            Self::NoSuchObject { file } => Err(Error::NoSuchObject {
                inode: file.inode,
                generation: file.generation,
            }),
            Self::Error { message } => Err(Error::Remote(message)),
        }
    }
}

/// Reply to a request that has been written
pub type ReplyFuture = BoxFuture<'static, Result<Reply>>;

/// Request/reply exchanges with storage nodes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write `request` to the node at `address`; the returned future reads
    /// its reply
    async fn send(&self, address: &str, request: &Request) -> Result<ReplyFuture>;

    /// Write `request` and wait for the reply
    async fn exchange(&self, address: &str, request: &Request) -> Result<Reply> {
        self.send(address, request).await?.await
    }
}

/// JSON lines over TCP
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn write_request(address: &str, request: &Request) -> Result<OwnedReadHalf> {
        let mut line =
            serde_json::to_vec(request).map_err(|e| Error::Serialization(e.to_string()))?;
        line.push(b'\n');

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{address}: {e}")))?;
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(&line).await?;
        write_half.flush().await?;
        Ok(read_half)
    }

    async fn read_reply(address: &str, read_half: OwnedReadHalf) -> Result<Reply> {
        let mut reply = String::new();
        let n = BufReader::new(read_half).read_line(&mut reply).await?;
        if n == 0 {
            return Err(Error::protocol(format!("{address} closed without reply")));
        }
        serde_json::from_str(reply.trim_end())
            .map_err(|e| Error::protocol(format!("bad reply from {address}: {e}")))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, address: &str, request: &Request) -> Result<ReplyFuture> {
        trace!("-> {}: {:?}", address, request);
        let deadline = Instant::now() + self.timeout;
        let read_half = tokio::time::timeout_at(deadline, Self::write_request(address, request))
            .await
            .map_err(|_| Error::Timeout)??;

        let address = address.to_string();
        Ok(async move {
            let reply = tokio::time::timeout_at(deadline, Self::read_reply(&address, read_half))
                .await
                .map_err(|_| Error::Timeout)??;
            trace!("<- {}: {:?}", address, reply);
            Ok(reply)
        }
        .boxed())
    }
}
