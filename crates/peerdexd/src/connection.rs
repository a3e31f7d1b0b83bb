//! Per-connection I/O task.
//!
//! Owns one accepted stream and its read buffer. Bytes are decoded into
//! requests as they arrive, so a peer that stalls mid-message only holds up
//! its own task. Each request is handed to the event loop and the task waits
//! for the verdict before decoding the next one, which keeps a connection's
//! requests in receipt order.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use zerocopy::AsBytes;

use peerdex_core::wire::{Request, RequestDecoder, WireError};
use peerdex_services::ConnectionId;

use crate::handler::Reply;

/// Connection task → event loop.
#[derive(Debug)]
pub enum ConnectionEvent {
    Request {
        connection: ConnectionId,
        request: Request,
        reply: oneshot::Sender<Reply>,
    },
    /// Sent exactly once, as the task's last act.
    Closed {
        connection: ConnectionId,
        reason: CloseReason,
    },
}

/// Why a connection ended. None of these are reported to the peer.
#[derive(Debug, thiserror::Error)]
pub enum CloseReason {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("read failed: {0}")]
    Read(std::io::Error),
    #[error("write failed: {0}")]
    Write(std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),
    #[error("rejected by registry")]
    Rejected,
    #[error("registry event loop gone")]
    RegistryGone,
}

pub struct Connection<S> {
    id: ConnectionId,
    stream: S,
    decoder: RequestDecoder,
    buf: BytesMut,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        id: ConnectionId,
        stream: S,
        decoder: RequestDecoder,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            id,
            stream,
            decoder,
            buf: BytesMut::with_capacity(decoder.limits().max_message_bytes),
            events,
        }
    }

    /// Serve until the connection ends, then report the close. Dropping the
    /// stream closes the socket.
    pub async fn run(mut self) {
        let reason = self.serve().await;
        match &reason {
            CloseReason::PeerClosed | CloseReason::RegistryGone => {
                tracing::debug!(connection = %self.id, %reason, "connection ending")
            }
            _ => tracing::warn!(connection = %self.id, %reason, "connection ending"),
        }
        let _ = self.events.send(ConnectionEvent::Closed {
            connection: self.id,
            reason,
        });
    }

    async fn serve(&mut self) -> CloseReason {
        loop {
            let request = match self.next_request().await {
                Ok(Some(request)) => request,
                Ok(None) => return CloseReason::PeerClosed,
                Err(reason) => return reason,
            };

            let (reply_tx, reply_rx) = oneshot::channel();
            let event = ConnectionEvent::Request {
                connection: self.id,
                request,
                reply: reply_tx,
            };
            if self.events.send(event).is_err() {
                return CloseReason::RegistryGone;
            }

            match reply_rx.await {
                Ok(Reply::Nothing) => {}
                Ok(Reply::Search(reply)) => {
                    if let Err(e) = self.stream.write_all(reply.as_bytes()).await {
                        return CloseReason::Write(e);
                    }
                }
                Ok(Reply::Disconnect) => return CloseReason::Rejected,
                Err(_) => return CloseReason::RegistryGone,
            }
        }
    }

    /// Next complete request, reading as many times as it takes.
    /// `Ok(None)` is a clean close between requests.
    async fn next_request(&mut self) -> Result<Option<Request>, CloseReason> {
        loop {
            if let Some(request) = self.decoder.decode(&mut self.buf)? {
                return Ok(Some(request));
            }
            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .map_err(CloseReason::Read)?;
            if n == 0 {
                return Ok(self.decoder.decode_eof(&mut self.buf)?);
            }
        }
    }
}
