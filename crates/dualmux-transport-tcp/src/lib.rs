//! TLS-over-TCP transport with yamux stream multiplexing
//!
//! The fallback for networks that drop UDP. Each session is a single TLS
//! connection; yamux splits it into independent virtual streams, opened
//! lazily (a new stream is announced to the peer with its first write).

pub mod config;
pub mod listener;
pub mod session;

pub use config::TcpConfig;
pub use listener::{TcpConnector, TcpSessionListener};
pub use session::TcpSession;

use async_trait::async_trait;
use dualmux_cert::{ensure_client_config, ensure_server_config, TlsOptions};
use dualmux_transport::{
    Protocol, TransportConnector, TransportError, TransportFactory, TransportListener,
    TransportResult,
};
use std::sync::Arc;

/// Factory for TLS-over-TCP listeners and connectors
#[derive(Debug, Clone, Default)]
pub struct TcpTransportFactory {
    config: TcpConfig,
    tls: TlsOptions,
}

impl TcpTransportFactory {
    pub fn new(config: TcpConfig, tls: TlsOptions) -> Self {
        Self { config, tls }
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    fn create_connector(&self) -> TransportResult<Arc<dyn TransportConnector>> {
        let tls = ensure_client_config(self.tls.client.clone());
        Ok(Arc::new(TcpConnector::new(self.config.clone(), tls)?))
    }

    async fn create_listener(
        &self,
        bind_addr: &str,
    ) -> TransportResult<Arc<dyn TransportListener>> {
        let tls = ensure_server_config(self.tls.server.clone())
            .map_err(|e| TransportError::TlsError(e.to_string()))?;

        Ok(Arc::new(
            TcpSessionListener::bind(bind_addr, self.config.clone(), tls).await?,
        ))
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }
}
