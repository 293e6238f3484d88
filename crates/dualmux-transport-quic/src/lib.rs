//! QUIC transport implementation using quinn
//!
//! Each session is one QUIC connection; virtual streams are native QUIC
//! bidirectional streams. TLS 1.3 is mandatory and comes from
//! `dualmux-cert`, either supplied by the caller or provisioned on demand.
//!
//! # Example
//!
//! ```no_run
//! use dualmux_transport::TransportFactory;
//! use dualmux_transport_quic::{QuicConfig, QuicTransportFactory};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = QuicTransportFactory::new(QuicConfig::default(), Default::default());
//!
//! // Server side
//! let listener = factory.create_listener("0.0.0.0:7443").await?;
//!
//! // Client side
//! let connector = factory.create_connector()?;
//! let session = connector.dial("127.0.0.1:7443").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod listener;
pub mod session;
pub mod stream;

pub use config::QuicConfig;
pub use listener::{QuicConnector, QuicSessionListener};
pub use session::QuicSession;

use async_trait::async_trait;
use dualmux_cert::{ensure_client_config, ensure_server_config, TlsOptions};
use dualmux_transport::{
    addr, Protocol, TransportConnector, TransportError, TransportFactory, TransportListener,
    TransportResult,
};
use std::sync::Arc;

/// Factory for QUIC listeners and connectors
#[derive(Debug, Clone, Default)]
pub struct QuicTransportFactory {
    config: QuicConfig,
    tls: TlsOptions,
}

impl QuicTransportFactory {
    pub fn new(config: QuicConfig, tls: TlsOptions) -> Self {
        Self { config, tls }
    }
}

#[async_trait]
impl TransportFactory for QuicTransportFactory {
    fn create_connector(&self) -> TransportResult<Arc<dyn TransportConnector>> {
        let tls = ensure_client_config(self.tls.client.clone());
        Ok(Arc::new(QuicConnector::new(&self.config, tls)?))
    }

    async fn create_listener(
        &self,
        bind_addr: &str,
    ) -> TransportResult<Arc<dyn TransportListener>> {
        let tls = ensure_server_config(self.tls.server.clone())
            .map_err(|e| TransportError::TlsError(e.to_string()))?;

        let socket_addr = addr::resolve(bind_addr)
            .await
            .map_err(|e| TransportError::BindError {
                protocol: Protocol::Quic,
                address: bind_addr.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Arc::new(QuicSessionListener::bind(
            socket_addr,
            &self.config,
            tls,
        )?))
    }

    fn protocol(&self) -> Protocol {
        Protocol::Quic
    }
}
