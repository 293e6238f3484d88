//! DualMux library - client/server entry point over QUIC or TLS-over-TCP
//!
//! Re-exports the transport crates and adds a small facade driven by a
//! [`DualMuxConfig`], plus HTTP forwarding and gRPC over session streams.
//!
//! # Quick Start
//!
//! ```ignore
//! use dualmux_lib::{DualMux, DualMuxConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Server: forward every HTTP request to a local service
//!     let server = DualMux::new(DualMuxConfig::default())?;
//!     let listener = server.listen().await?;
//!     tokio::spawn(async move {
//!         while let Ok(session) = listener.accept().await {
//!             let _ = dualmux_lib::serve_http(Arc::from(session), "http://127.0.0.1:8080");
//!         }
//!     });
//!
//!     // Client
//!     let config = DualMuxConfig {
//!         server_addr: Some("127.0.0.1:7443".to_string()),
//!         ..Default::default()
//!     };
//!     let session = DualMux::new(config)?.dial().await?;
//!     println!("connected over {}", session.protocol());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod http;
pub mod rpc;

pub use config::{DualMuxConfig, TlsFiles, DEFAULT_LISTEN_ADDR};
pub use http::{
    serve_http, serve_http_with_tls, upstream_tls_config, validate_target, ForwardError,
    HttpTunnelClient,
};
pub use rpc::{dial_rpc, dial_rpc_with, rpc_endpoint, serve_rpc, RpcConnectInfo, RpcError};

pub use dualmux_cert::{ensure_crypto_provider, CertError, TlsOptions};
pub use dualmux_dialer::{Config, Dialer, Listener};
pub use dualmux_transport::{
    MuxSession, MuxStream, Protocol, Session, TransportError, TransportMode, TransportResult,
};
pub use dualmux_transport_quic::QuicConfig;
pub use dualmux_transport_tcp::TcpConfig;

use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum DualMuxError {
    #[error("Failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No server address configured")]
    MissingServerAddr,

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Client and server facade over a [`DualMuxConfig`]
#[derive(Debug, Clone)]
pub struct DualMux {
    config: DualMuxConfig,
    transport: Config,
    dialer: Dialer,
}

impl DualMux {
    /// Resolve TLS files and build the dialer
    pub fn new(config: DualMuxConfig) -> Result<Self, DualMuxError> {
        let transport = config.to_transport_config()?;
        Self::with_transport_config(config, transport)
    }

    /// Use an already built orchestrator config instead of the file TLS settings
    pub fn with_transport_config(
        config: DualMuxConfig,
        transport: Config,
    ) -> Result<Self, DualMuxError> {
        let dialer = Dialer::new(&transport)?;
        Ok(Self {
            config,
            transport,
            dialer,
        })
    }

    pub fn config(&self) -> &DualMuxConfig {
        &self.config
    }

    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    /// Dial the configured server address
    pub async fn dial(&self) -> Result<Session, DualMuxError> {
        let target = self
            .config
            .server_addr
            .as_deref()
            .ok_or(DualMuxError::MissingServerAddr)?;
        let session = self.dialer.dial(target).await?;
        info!("Connected to {} over {}", target, session.protocol());
        Ok(session)
    }

    /// Bind a listener on the configured listen address
    pub async fn listen(&self) -> Result<Listener, DualMuxError> {
        let listener = Listener::bind(&self.config.listen_addr, &self.transport).await?;
        Ok(listener)
    }
}
