//! TLS-over-TCP listener and connector implementations

use async_trait::async_trait;
use dualmux_transport::{
    addr, Protocol, Session, TransportConnector, TransportError, TransportListener,
    TransportResult,
};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TcpConfig;
use crate::session::TcpSession;

/// Accepts TLS connections and runs a server-side yamux session on each
pub struct TcpSessionListener {
    listener: Mutex<Option<Arc<TcpListener>>>,
    acceptor: TlsAcceptor,
    config: TcpConfig,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for TcpSessionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSessionListener")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl TcpSessionListener {
    pub async fn bind(
        bind_addr: &str,
        config: TcpConfig,
        tls: Arc<rustls::ServerConfig>,
    ) -> TransportResult<Self> {
        config.validate()?;

        let listener =
            TcpListener::bind(bind_addr)
                .await
                .map_err(|e| TransportError::BindError {
                    protocol: Protocol::Tcp,
                    address: bind_addr.to_string(),
                    reason: e.to_string(),
                })?;
        let local_addr = listener.local_addr()?;

        info!("TCP listener bound to {}", local_addr);

        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            acceptor: TlsAcceptor::from(tls),
            config,
            local_addr,
            shutdown: CancellationToken::new(),
        })
    }

    fn current(&self) -> TransportResult<Arc<TcpListener>> {
        self.listener
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(TransportError::ListenerClosed)
    }

    async fn next_session(&self, listener: &TcpListener) -> TransportResult<TcpSession> {
        loop {
            let (tcp, remote) = listener.accept().await?;
            debug!("Incoming TCP connection from {}", remote);
            let _ = tcp.set_nodelay(true);

            let handshake = self.acceptor.accept(tcp);
            match tokio::time::timeout(self.config.handshake_timeout, handshake).await {
                Ok(Ok(tls)) => {
                    info!("TLS session established from {}", remote);
                    return Ok(TcpSession::server(
                        tls,
                        &self.config,
                        Some(self.local_addr),
                        Some(remote),
                    ));
                }
                Ok(Err(e)) => warn!("TLS handshake failed from {}: {}", remote, e),
                Err(_) => warn!("TLS handshake from {} timed out", remote),
            }
        }
    }
}

#[async_trait]
impl TransportListener for TcpSessionListener {
    async fn accept(&self) -> TransportResult<Session> {
        let listener = self.current()?;

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::ListenerClosed),
            session = self.next_session(&listener) => Ok(Box::new(session?) as Session),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(&self) -> TransportResult<()> {
        let taken = self.listener.lock().ok().and_then(|mut slot| slot.take());
        if taken.is_none() {
            return Ok(());
        }
        // The socket closes once any in-flight accept releases its handle
        self.shutdown.cancel();
        info!("TCP listener on {} closed", self.local_addr);
        Ok(())
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }
}

/// Dials TLS-over-TCP sessions
pub struct TcpConnector {
    connector: TlsConnector,
    config: TcpConfig,
}

impl std::fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnector")
            .field("config", &self.config)
            .finish()
    }
}

impl TcpConnector {
    pub fn new(config: TcpConfig, tls: Arc<rustls::ClientConfig>) -> TransportResult<Self> {
        config.validate()?;

        debug!("TCP connector created");

        Ok(Self {
            connector: TlsConnector::from(tls),
            config,
        })
    }

    async fn connect(&self, target: &str) -> Result<TcpSession, String> {
        let tcp = TcpStream::connect(target)
            .await
            .map_err(|e| format!("TCP connect failed: {}", e))?;
        let _ = tcp.set_nodelay(true);
        let local_addr = tcp.local_addr().ok();
        let peer_addr = tcp.peer_addr().ok();

        let server_name = ServerName::try_from(addr::server_name(target))
            .map_err(|e| format!("Invalid server name: {}", e))?;

        let tls = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| format!("TLS handshake failed: {}", e))?;

        Ok(TcpSession::client(tls, &self.config, local_addr, peer_addr))
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn dial(&self, target: &str) -> TransportResult<Session> {
        debug!("Connecting to TCP server: {}", target);

        let dial_error = |reason: String| TransportError::DialError {
            protocol: Protocol::Tcp,
            target: target.to_string(),
            reason,
        };

        let session = tokio::time::timeout(self.config.dial_timeout, self.connect(target))
            .await
            .map_err(|_| dial_error("timed out".to_string()))?
            .map_err(dial_error)?;

        info!("TCP session established to {}", target);
        Ok(Box::new(session))
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }
}
