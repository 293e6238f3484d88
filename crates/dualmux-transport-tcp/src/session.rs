//! yamux session over a TLS byte stream
//!
//! A yamux `Connection` is a poll-driven state machine that must be polled
//! continuously for any stream to make progress. Each session therefore owns
//! a driver task; the session handle talks to it over a command channel and
//! receives inbound streams over a second channel.

use async_trait::async_trait;
use dualmux_transport::{
    first_failure, MuxSession, MuxStream, Protocol, TransportError, TransportResult,
};
use futures::future::poll_fn;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, trace, warn};

use crate::config::TcpConfig;

type OpenReply = oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>;
type CloseReply = oneshot::Sender<TransportResult<()>>;

enum Command {
    Open(OpenReply),
    Close(CloseReply),
}

struct Link {
    commands: mpsc::UnboundedSender<Command>,
    inbound: Mutex<mpsc::UnboundedReceiver<yamux::Stream>>,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// A TLS-over-TCP connection multiplexed with yamux, exposed as a [`MuxSession`]
pub struct TcpSession {
    session_id: String,
    link: Option<Link>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSession")
            .field("session_id", &self.session_id)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TcpSession {
    /// Start the client side of a session over an established TLS stream
    pub fn client<T>(
        io: T,
        config: &TcpConfig,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, yamux::Mode::Client, config, local_addr, peer_addr)
    }

    /// Start the server side of a session over an accepted TLS stream
    pub fn server<T>(
        io: T,
        config: &TcpConfig,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, yamux::Mode::Server, config, local_addr, peer_addr)
    }

    /// A session with no connection behind it
    ///
    /// Stream operations fail with [`TransportError::NotConnected`].
    pub fn unbound() -> Self {
        Self {
            session_id: format!("tcp-{}", uuid::Uuid::new_v4()),
            link: None,
            local_addr: None,
            peer_addr: None,
            closed: AtomicBool::new(false),
        }
    }

    fn start<T>(
        io: T,
        mode: yamux::Mode,
        config: &TcpConfig,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let session_id = format!("tcp-{}", uuid::Uuid::new_v4());
        let connection = yamux::Connection::new(io.compat(), config.yamux_config(), mode);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(
            connection,
            command_rx,
            inbound_tx,
            session_id.clone(),
        ));

        debug!("[{}] yamux session started ({:?})", session_id, mode);

        Self {
            session_id,
            link: Some(Link {
                commands: command_tx,
                inbound: Mutex::new(inbound_rx),
                driver: std::sync::Mutex::new(Some(driver)),
            }),
            local_addr,
            peer_addr,
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn link(&self) -> TransportResult<&Link> {
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        Ok(link)
    }

    fn wrap(&self, stream: yamux::Stream) -> MuxStream {
        let id = u64::from(stream.id().val());
        MuxStream::new(stream.compat(), id, Protocol::Tcp)
            .with_addrs(self.local_addr, self.peer_addr)
    }
}

#[async_trait]
impl MuxSession for TcpSession {
    async fn accept_stream(&self) -> TransportResult<MuxStream> {
        let link = self.link()?;
        let stream = link
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::SessionClosed)?;

        trace!("[{}] Accepted yamux stream {}", self.session_id, stream.id().val());
        Ok(self.wrap(stream))
    }

    async fn open_stream(&self) -> TransportResult<MuxStream> {
        let link = self.link()?;
        let (tx, rx) = oneshot::channel();
        link.commands
            .send(Command::Open(tx))
            .map_err(|_| TransportError::SessionClosed)?;

        let stream = rx
            .await
            .map_err(|_| TransportError::SessionClosed)?
            .map_err(map_yamux_error)?;

        trace!("[{}] Opened yamux stream {}", self.session_id, stream.id().val());
        Ok(self.wrap(stream))
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(link) = &self.link else {
            return Ok(());
        };

        // The driver owns the connection; it flushes the yamux close and
        // then drops the TLS stream, which closes the socket.
        let (tx, rx) = oneshot::channel();
        let close_result = if link.commands.send(Command::Close(tx)).is_ok() {
            rx.await.unwrap_or(Ok(()))
        } else {
            Ok(())
        };

        let driver = link.driver.lock().ok().and_then(|mut slot| slot.take());
        let join_result = match driver {
            Some(handle) => handle
                .await
                .map_err(|e| TransportError::ConnectionError(format!("yamux driver failed: {}", e))),
            None => Ok(()),
        };

        link.inbound.lock().await.close();
        debug!("[{}] Session closed", self.session_id);

        first_failure([close_result, join_result])
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

fn map_yamux_error(e: yamux::ConnectionError) -> TransportError {
    match e {
        yamux::ConnectionError::Closed => TransportError::SessionClosed,
        other => TransportError::ConnectionError(other.to_string()),
    }
}

/// Whether a teardown error only says the peer hung up first
fn peer_already_gone(e: &yamux::ConnectionError) -> bool {
    match e {
        yamux::ConnectionError::Closed => true,
        yamux::ConnectionError::Io(io) => matches!(
            io.kind(),
            ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::NotConnected
                | ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

async fn drive<T>(
    mut connection: yamux::Connection<T>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedSender<yamux::Stream>,
    session_id: String,
) where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    let mut pending_opens: VecDeque<OpenReply> = VecDeque::new();
    let mut close_waiters: Vec<CloseReply> = Vec::new();
    let mut closing = false;

    let outcome = poll_fn(|cx| loop {
        if closing {
            return connection.poll_close(cx);
        }

        let mut progress = false;

        loop {
            match commands.poll_recv(cx) {
                Poll::Ready(Some(Command::Open(reply))) => {
                    pending_opens.push_back(reply);
                    progress = true;
                }
                Poll::Ready(Some(Command::Close(reply))) => {
                    close_waiters.push(reply);
                    closing = true;
                    break;
                }
                // Every handle is gone
                Poll::Ready(None) => {
                    closing = true;
                    break;
                }
                Poll::Pending => break,
            }
        }
        if closing {
            continue;
        }

        while !pending_opens.is_empty() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(result) => {
                    if let Some(reply) = pending_opens.pop_front() {
                        let _ = reply.send(result);
                    }
                    progress = true;
                }
                Poll::Pending => break,
            }
        }

        match connection.poll_next_inbound(cx) {
            Poll::Ready(Some(Ok(stream))) => {
                // Dropping the stream resets it when nobody accepts any more
                let _ = inbound.send(stream);
                progress = true;
            }
            Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
            Poll::Ready(None) => return Poll::Ready(Ok(())),
            Poll::Pending => {}
        }

        if !progress {
            return Poll::Pending;
        }
    })
    .await;

    // Waiters only exist for a locally requested close, where a peer that
    // is already gone still counts as a clean teardown.
    let requested = !close_waiters.is_empty();
    let failure = match &outcome {
        Ok(()) => {
            debug!("[{}] yamux connection finished", session_id);
            None
        }
        Err(e) if requested && peer_already_gone(e) => {
            debug!("[{}] yamux connection closed after peer left: {}", session_id, e);
            None
        }
        Err(e) => {
            warn!("[{}] yamux connection ended with error: {}", session_id, e);
            Some(e.to_string())
        }
    };

    for waiter in close_waiters {
        let result = match &failure {
            None => Ok(()),
            Some(reason) => Err(TransportError::ConnectionError(reason.clone())),
        };
        let _ = waiter.send(result);
    }
}
