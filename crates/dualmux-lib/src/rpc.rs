//! gRPC over session streams
//!
//! The session is already encrypted, so gRPC runs as plaintext HTTP/2 on
//! top of it. A client [`Channel`] opens a fresh stream whenever tonic wants
//! a new connection; the serving side hands every stream the peer opens to
//! a tonic server as one connection.

use dualmux_transport::{MuxSession, MuxStream, Protocol, TransportError};
use futures::stream;
use hyper::Uri;
use hyper_util::rt::TokioIo;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;
use tonic::transport::server::{Connected, Router};
use tonic::transport::{Channel, Endpoint};
use tower::service_fn;
use tracing::{debug, info, warn};

/// HTTP/2 ping interval on client channels
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// A ping unanswered for this long marks the channel broken
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(2);

// Never resolved; the connector ignores it
const SESSION_URI: &str = "http://dualmux.session";

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Default endpoint settings for [`dial_rpc`]
///
/// Pings every [`KEEPALIVE_INTERVAL`], also while no call is active, so a
/// dead session is noticed quickly.
pub fn rpc_endpoint() -> Endpoint {
    Endpoint::from_static(SESSION_URI)
        .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
        .keep_alive_timeout(KEEPALIVE_TIMEOUT)
        .keep_alive_while_idle(true)
}

/// Turn a session into a gRPC client channel
pub async fn dial_rpc(session: Arc<dyn MuxSession>) -> Result<Channel, RpcError> {
    dial_rpc_with(session, rpc_endpoint()).await
}

/// Like [`dial_rpc`] with caller-supplied endpoint settings
///
/// The endpoint's URI is only used for request authority; every connection
/// is a new stream on `session`.
pub async fn dial_rpc_with(
    session: Arc<dyn MuxSession>,
    endpoint: Endpoint,
) -> Result<Channel, RpcError> {
    let protocol = session.protocol();
    let connector = service_fn(move |_: Uri| {
        let session = session.clone();
        async move {
            let stream = session.open_stream().await?;
            debug!(
                "Opened gRPC stream {} on {} session",
                stream.stream_id(),
                stream.protocol()
            );
            Ok::<_, TransportError>(TokioIo::new(stream))
        }
    });

    let channel = endpoint.connect_with_connector(connector).await?;
    info!("gRPC channel ready over {} session", protocol);
    Ok(channel)
}

/// Serve `router` on every stream the peer opens
///
/// The returned task finishes once the session stops yielding streams,
/// which makes it usable as a stopped signal.
pub fn serve_rpc(session: Arc<dyn MuxSession>, router: Router) -> JoinHandle<()> {
    info!("Serving gRPC on {} session", session.protocol());

    let incoming = stream::unfold(session, |session| async move {
        match session.accept_stream().await {
            Ok(stream) => Some((Ok::<_, TransportError>(RpcStream::new(stream)), session)),
            Err(e) => {
                debug!("gRPC incoming streams ended: {}", e);
                None
            }
        }
    });

    tokio::spawn(async move {
        match router.serve_with_incoming(incoming).await {
            Ok(()) => debug!("gRPC server finished"),
            Err(e) => warn!("gRPC server stopped: {}", e),
        }
    })
}

/// Connection details tonic attaches to each request's extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcConnectInfo {
    pub protocol: Protocol,
    pub stream_id: u64,
    pub peer_addr: Option<SocketAddr>,
}

struct RpcStream {
    inner: MuxStream,
    info: RpcConnectInfo,
}

impl RpcStream {
    fn new(inner: MuxStream) -> Self {
        let info = RpcConnectInfo {
            protocol: inner.protocol(),
            stream_id: inner.stream_id(),
            peer_addr: inner.peer_addr(),
        };
        Self { inner, info }
    }
}

impl Connected for RpcStream {
    type ConnectInfo = RpcConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info
    }
}

impl AsyncRead for RpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
