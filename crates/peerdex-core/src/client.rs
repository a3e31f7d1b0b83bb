//! Peer-side registry client.
//!
//! One `RegistryClient` is one registry connection, and the registry ties a
//! peer's record to that connection: dropping the client withdraws the
//! peer's files from search.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::wire::{PeerLocation, Request, SearchReply, WireError, WireLimits, SEARCH_REPLY_LEN};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("registry connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("registry closed the connection")]
    Closed,
    #[error("malformed search reply")]
    BadReply,
}

pub struct RegistryClient {
    stream: TcpStream,
    limits: WireLimits,
    buf: BytesMut,
}

impl RegistryClient {
    /// Connect to a registry. `limits` must match the registry's.
    pub async fn connect(addr: impl ToSocketAddrs, limits: WireLimits) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            limits,
            buf: BytesMut::with_capacity(limits.max_message_bytes),
        })
    }

    /// The address the registry will observe for this peer.
    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.stream.local_addr()?)
    }

    pub async fn join(&mut self, peer_id: u32) -> Result<(), ClientError> {
        self.send(&Request::Join { peer_id }).await
    }

    /// Replace this peer's advertised file list.
    pub async fn publish<S: AsRef<str>>(&mut self, files: &[S]) -> Result<(), ClientError> {
        let files = files.iter().map(|f| f.as_ref().to_owned()).collect();
        self.send(&Request::Publish { files }).await
    }

    /// Ask which peer holds `filename`. `None` is the registry's not-found
    /// sentinel.
    pub async fn search(&mut self, filename: &str) -> Result<Option<PeerLocation>, ClientError> {
        self.send(&Request::Search {
            filename: filename.to_owned(),
        })
        .await?;

        let mut reply = [0u8; SEARCH_REPLY_LEN];
        match self.stream.read_exact(&mut reply).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ClientError::Closed)
            }
            Err(e) => return Err(e.into()),
        }
        let reply = SearchReply::from_bytes(&reply).ok_or(ClientError::BadReply)?;
        Ok(reply.location())
    }

    /// Write raw bytes, bypassing the encoder. Lets callers exercise the
    /// registry's handling of malformed input.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Resolve once the registry closes the connection. The registry never
    /// sends unsolicited data, so any byte read here is a protocol error.
    pub async fn closed(&mut self) -> Result<(), ClientError> {
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte).await? {
            0 => Ok(()),
            _ => Err(ClientError::BadReply),
        }
    }

    async fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        self.buf.clear();
        request.encode(&self.limits, &mut self.buf)?;
        self.stream.write_all(&self.buf).await?;
        tracing::trace!(opcode = ?request.opcode(), len = self.buf.len(), "request sent");
        Ok(())
    }
}
