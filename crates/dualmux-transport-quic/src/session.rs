//! QUIC session adapter

use async_trait::async_trait;
use dualmux_transport::{MuxSession, MuxStream, Protocol, TransportError, TransportResult};
use quinn::{Connection, ConnectionError, Endpoint};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

use crate::stream::QuicStreamIo;

/// A QUIC connection exposed as a [`MuxSession`]
///
/// QUIC streams are native, so opening and accepting map one-to-one onto
/// bidirectional QUIC streams. A session produced by a dial also owns the
/// client endpoint (and its UDP socket) it was dialed from.
#[derive(Debug)]
pub struct QuicSession {
    connection: Option<Connection>,
    endpoint: Option<Endpoint>,
    local_addr: Option<SocketAddr>,
    closed: AtomicBool,
}

impl QuicSession {
    /// Wrap a connection accepted by a server endpoint
    pub fn accepted(connection: Connection, local_addr: SocketAddr) -> Self {
        Self {
            connection: Some(connection),
            endpoint: None,
            local_addr: Some(local_addr),
            closed: AtomicBool::new(false),
        }
    }

    /// Wrap a dialed connection together with the endpoint that owns its socket
    pub fn dialed(connection: Connection, endpoint: Endpoint) -> Self {
        let local_addr = endpoint.local_addr().ok();
        Self {
            connection: Some(connection),
            endpoint: Some(endpoint),
            local_addr,
            closed: AtomicBool::new(false),
        }
    }

    /// A session with no connection behind it
    ///
    /// Stream operations fail with [`TransportError::NotConnected`].
    pub fn unbound() -> Self {
        Self {
            connection: None,
            endpoint: None,
            local_addr: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().map(Connection::remote_address)
    }

    fn connection(&self) -> TransportResult<&Connection> {
        let connection = self.connection.as_ref().ok_or(TransportError::NotConnected)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        Ok(connection)
    }

    fn wrap(&self, io: QuicStreamIo) -> MuxStream {
        let id = io.id();
        MuxStream::new(io, id, Protocol::Quic).with_addrs(self.local_addr, self.remote_addr())
    }
}

fn map_connection_error(e: ConnectionError) -> TransportError {
    match e {
        ConnectionError::ApplicationClosed(_)
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::LocallyClosed
        | ConnectionError::Reset
        | ConnectionError::TimedOut => {
            debug!("QUIC connection ended: {}", e);
            TransportError::SessionClosed
        }
        other => TransportError::ConnectionError(other.to_string()),
    }
}

#[async_trait]
impl MuxSession for QuicSession {
    async fn accept_stream(&self) -> TransportResult<MuxStream> {
        let (send, recv) = self
            .connection()?
            .accept_bi()
            .await
            .map_err(map_connection_error)?;

        let stream = self.wrap(QuicStreamIo::new(send, recv));
        trace!("Accepted QUIC stream {}", stream.stream_id());
        Ok(stream)
    }

    async fn open_stream(&self) -> TransportResult<MuxStream> {
        let (send, recv) = self
            .connection()?
            .open_bi()
            .await
            .map_err(map_connection_error)?;

        let stream = self.wrap(QuicStreamIo::new(send, recv));
        trace!("Opened QUIC stream {}", stream.stream_id());
        Ok(stream)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Quic
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(connection) = &self.connection {
            connection.close(0u32.into(), b"session closed");
            debug!("QUIC session to {} closed", connection.remote_address());
        }
        if let Some(endpoint) = &self.endpoint {
            endpoint.close(0u32.into(), b"session closed");
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for QuicSession {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Some(endpoint) = &self.endpoint {
                endpoint.close(0u32.into(), b"session dropped");
            }
        }
    }
}
