//! QUIC listener and connector implementations

use async_trait::async_trait;
use dualmux_transport::{
    addr, Protocol, Session, TransportConnector, TransportError, TransportListener,
    TransportResult,
};
use quinn::Endpoint;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QuicConfig;
use crate::session::QuicSession;

/// Accepts QUIC connections and hands them out as sessions
#[derive(Debug)]
pub struct QuicSessionListener {
    endpoint: Mutex<Option<Endpoint>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl QuicSessionListener {
    pub fn bind(
        bind_addr: SocketAddr,
        config: &QuicConfig,
        tls: Arc<rustls::ServerConfig>,
    ) -> TransportResult<Self> {
        config.validate()?;
        let server_config = config.build_server_config(tls)?;

        let endpoint =
            Endpoint::server(server_config, bind_addr).map_err(|e| TransportError::BindError {
                protocol: Protocol::Quic,
                address: bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = endpoint.local_addr()?;

        info!("QUIC listener bound to {}", local_addr);

        Ok(Self {
            endpoint: Mutex::new(Some(endpoint)),
            local_addr,
            shutdown: CancellationToken::new(),
        })
    }

    fn current(&self) -> TransportResult<Endpoint> {
        self.endpoint
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(TransportError::ListenerClosed)
    }

    async fn next_connection(&self, endpoint: &Endpoint) -> TransportResult<quinn::Connection> {
        loop {
            let incoming = endpoint
                .accept()
                .await
                .ok_or(TransportError::ListenerClosed)?;
            let remote = incoming.remote_address();

            debug!("Incoming QUIC connection from {}", remote);

            match incoming.await {
                Ok(connection) => {
                    info!("QUIC connection established from {}", remote);
                    return Ok(connection);
                }
                Err(e) => {
                    warn!("QUIC handshake with {} failed: {}", remote, e);
                    continue;
                }
            }
        }
    }
}

#[async_trait]
impl TransportListener for QuicSessionListener {
    async fn accept(&self) -> TransportResult<Session> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::ListenerClosed);
        }
        let endpoint = self.current()?;

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::ListenerClosed),
            connection = self.next_connection(&endpoint) => {
                let session = QuicSession::accepted(connection?, self.local_addr);
                Ok(Box::new(session) as Session)
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(&self) -> TransportResult<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();

        // Refuse new handshakes and drop our handle. The UDP socket is
        // released once the sessions already handed out have ended.
        let endpoint = self.endpoint.lock().ok().and_then(|mut slot| slot.take());
        if let Some(endpoint) = endpoint {
            endpoint.set_server_config(None);
        }
        info!("QUIC listener on {} closed", self.local_addr);
        Ok(())
    }

    fn protocol(&self) -> Protocol {
        Protocol::Quic
    }
}

/// Dials QUIC sessions, one client endpoint per session
#[derive(Debug)]
pub struct QuicConnector {
    client_config: quinn::ClientConfig,
    handshake_timeout: std::time::Duration,
}

impl QuicConnector {
    pub fn new(config: &QuicConfig, tls: Arc<rustls::ClientConfig>) -> TransportResult<Self> {
        config.validate()?;
        let client_config = config.build_client_config(tls)?;

        debug!("QUIC connector created");

        Ok(Self {
            client_config,
            handshake_timeout: config.max_idle_timeout,
        })
    }

    fn dial_error(target: &str, reason: impl ToString) -> TransportError {
        TransportError::DialError {
            protocol: Protocol::Quic,
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl TransportConnector for QuicConnector {
    async fn dial(&self, target: &str) -> TransportResult<Session> {
        let remote = addr::resolve(target)
            .await
            .map_err(|e| Self::dial_error(target, e))?;
        let server_name = addr::server_name(target);

        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = Endpoint::client(local).map_err(|e| Self::dial_error(target, e))?;
        endpoint.set_default_client_config(self.client_config.clone());

        debug!("Connecting to QUIC server: {} ({})", server_name, remote);

        let connecting = endpoint
            .connect(remote, &server_name)
            .map_err(|e| Self::dial_error(target, e))?;

        let connection = match tokio::time::timeout(self.handshake_timeout, connecting).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                endpoint.close(0u32.into(), b"handshake failed");
                return Err(Self::dial_error(target, e));
            }
            Err(_) => {
                endpoint.close(0u32.into(), b"handshake timed out");
                return Err(Self::dial_error(target, "handshake timed out"));
            }
        };

        info!("QUIC connection established to {} ({})", server_name, remote);

        Ok(Box::new(QuicSession::dialed(connection, endpoint)))
    }

    fn protocol(&self) -> Protocol {
        Protocol::Quic
    }
}
