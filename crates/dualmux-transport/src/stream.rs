//! Virtual byte stream carried by a session

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::Protocol;

/// Raw duplex I/O a transport hands to [`MuxStream`]
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// One virtual stream within a session
///
/// Implements [`AsyncRead`] and [`AsyncWrite`] so byte-stream protocols can
/// run on top without knowing which transport produced it. Read and write
/// deadlines are absolute; once a deadline passes, operations in that
/// direction fail with [`io::ErrorKind::TimedOut`] until it is cleared or
/// moved.
pub struct MuxStream {
    io: Box<dyn StreamIo>,
    stream_id: u64,
    protocol: Protocol,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("stream_id", &self.stream_id)
            .field("protocol", &self.protocol)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl MuxStream {
    pub fn new<T: StreamIo + 'static>(io: T, stream_id: u64, protocol: Protocol) -> Self {
        Self {
            io: Box::new(io),
            stream_id,
            protocol,
            local_addr: None,
            peer_addr: None,
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn with_addrs(mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self.peer_addr = peer;
        self
    }

    /// Stream ID, unique within its session
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Set both the read and the write deadline
    ///
    /// Must be called from within a tokio runtime.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    /// Gracefully close the write side of the stream
    pub async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

fn deadline_expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

fn timed_out(direction: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{} deadline exceeded", direction),
    )
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if deadline_expired(&mut this.read_deadline, cx) {
            return Poll::Ready(Err(timed_out("read")));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if deadline_expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if deadline_expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}
