//! Orchestrator configuration

use dualmux_cert::TlsOptions;
use dualmux_transport::TransportMode;
use dualmux_transport_quic::{QuicConfig, QuicTransportFactory};
use dualmux_transport_tcp::{TcpConfig, TcpTransportFactory};

/// Settings shared by [`crate::Dialer`] and [`crate::Listener`]
///
/// The default is auto mode with no TLS material, which makes servers
/// generate a self-signed certificate and clients skip verification.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub mode: TransportMode,
    pub tls: TlsOptions,
    pub quic: QuicConfig,
    pub tcp: TcpConfig,
}

impl Config {
    pub fn new(mode: TransportMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_quic(mut self, quic: QuicConfig) -> Self {
        self.quic = quic;
        self
    }

    pub fn with_tcp(mut self, tcp: TcpConfig) -> Self {
        self.tcp = tcp;
        self
    }

    pub(crate) fn quic_factory(&self) -> QuicTransportFactory {
        QuicTransportFactory::new(self.quic.clone(), self.tls.clone())
    }

    pub(crate) fn tcp_factory(&self) -> TcpTransportFactory {
        TcpTransportFactory::new(self.tcp.clone(), self.tls.clone())
    }
}
