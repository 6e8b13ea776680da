//! TCP listener and stream types for the virtual interface
//!
//! A `TunnelTcpStream` does not touch smoltcp directly. It exchanges byte
//! chunks with the netstack driver over two bounded channels and wakes the
//! driver through a shared `Notify` whenever it frees or fills capacity:
//!
//! - driver -> stream: `io::Result<Bytes>` chunks read from the smoltcp
//!   socket. The driver dropping its sender is end-of-stream; an `Err` item
//!   reports a reset.
//! - stream -> driver: `Bytes` chunks to write. Closing the sender is the
//!   write half-close (FIN once every queued chunk is in the socket).
//!
//! Back-pressure is end to end: a full channel leaves data in the socket
//! buffer, which shrinks the advertised TCP window.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::PollSender;

use crate::error::AcceptError;

/// Largest chunk a single `poll_write` hands to the driver
pub const MAX_WRITE_CHUNK: usize = 16 * 1024;

/// Item delivered to a listener: an accepted stream or a transient error
pub(crate) type AcceptItem = Result<(TunnelTcpStream, SocketAddr), AcceptError>;

/// A TCP listener bound to one port of the virtual interface
///
/// Dropping the listener stops accepting on its port; established streams
/// are unaffected.
#[derive(Debug)]
pub struct TunnelTcpListener {
    accept_rx: mpsc::Receiver<AcceptItem>,
    local_addr: SocketAddr,
}

impl TunnelTcpListener {
    pub(crate) fn new(accept_rx: mpsc::Receiver<AcceptItem>, local_addr: SocketAddr) -> Self {
        Self {
            accept_rx,
            local_addr,
        }
    }

    /// Wait for the next connection
    ///
    /// # Errors
    ///
    /// - `AcceptError::SocketLimit` when the interface ran out of sockets
    ///   (transient, retry later)
    /// - `AcceptError::Closed` when the virtual interface has shut down
    pub async fn accept(&mut self) -> Result<(TunnelTcpStream, SocketAddr), AcceptError> {
        self.accept_rx.recv().await.unwrap_or(Err(AcceptError::Closed))
    }

    /// Address the listener accepts on (intercept address and port)
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// A TCP connection accepted on the virtual interface
pub struct TunnelTcpStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    tx: PollSender<Bytes>,
    read_buf: Bytes,
    notify: Arc<Notify>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl TunnelTcpStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<io::Result<Bytes>>,
        tx: mpsc::Sender<Bytes>,
        notify: Arc<Notify>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            rx,
            tx: PollSender::new(tx),
            read_buf: Bytes::new(),
            notify,
            local_addr,
            peer_addr,
        }
    }

    /// Local (intercept) address of the connection
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the tunnel client
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl std::fmt::Debug for TunnelTcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelTcpStream")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("buffered", &self.read_buf.len())
            .finish()
    }
}

impl AsyncRead for TunnelTcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.read_buf.is_empty() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.read_buf = chunk;
                    // Channel capacity freed; the driver may move more data
                    this.notify.notify_one();
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                // Sender dropped: end of stream
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let to_copy = this.read_buf.len().min(buf.remaining());
        buf.put_slice(&this.read_buf[..to_copy]);
        this.read_buf.advance(to_copy);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TunnelTcpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let this = &mut *self;
        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let len = buf.len().min(MAX_WRITE_CHUNK);
                match this.tx.send_item(Bytes::copy_from_slice(&buf[..len])) {
                    Ok(()) => {
                        this.notify.notify_one();
                        Poll::Ready(Ok(len))
                    }
                    Err(_) => Poll::Ready(Err(broken_pipe())),
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(broken_pipe())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Chunks are handed to the driver as they are written
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.tx.is_closed() {
            self.tx.close();
            self.notify.notify_one();
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelTcpStream {
    fn drop(&mut self) {
        // Let the driver notice both channel ends going away
        self.notify.notify_one();
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel connection closed")
}
