//! Dialer orchestrator

use dualmux_transport::{
    Session, TransportConnector, TransportFactory, TransportMode, TransportResult,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Dials sessions over QUIC, TCP, or QUIC with TCP fallback
///
/// Holds one connector per transport and no per-dial state, so a single
/// `Dialer` can be shared between tasks dialing different targets.
///
/// In [`TransportMode::Auto`] the attempts are sequential: QUIC first, then
/// TCP if QUIC fails for any reason. Each attempt is bounded only by its own
/// transport timeout, so a failing auto dial can take the sum of both.
#[derive(Debug, Clone)]
pub struct Dialer {
    mode: TransportMode,
    quic: Arc<dyn TransportConnector>,
    tcp: Arc<dyn TransportConnector>,
}

impl Dialer {
    /// Build a dialer with both transport connectors from `config`
    pub fn new(config: &Config) -> TransportResult<Self> {
        let quic = config.quic_factory().create_connector()?;
        let tcp = config.tcp_factory().create_connector()?;
        Ok(Self::with_connectors(config.mode, quic, tcp))
    }

    /// Build a dialer around existing connectors
    pub fn with_connectors(
        mode: TransportMode,
        quic: Arc<dyn TransportConnector>,
        tcp: Arc<dyn TransportConnector>,
    ) -> Self {
        Self { mode, quic, tcp }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Establish one session to `target`
    ///
    /// Forced modes return the chosen transport's result unchanged. Auto
    /// mode discards a QUIC failure after logging it and returns whatever
    /// the TCP attempt produces.
    pub async fn dial(&self, target: &str) -> TransportResult<Session> {
        match self.mode {
            TransportMode::Quic => self.quic.dial(target).await,
            TransportMode::Tcp => self.tcp.dial(target).await,
            TransportMode::Auto => self.dial_auto(target).await,
        }
    }

    async fn dial_auto(&self, target: &str) -> TransportResult<Session> {
        debug!("Trying QUIC to {}", target);
        match self.quic.dial(target).await {
            Ok(session) => {
                info!("Connected to {} over QUIC", target);
                Ok(session)
            }
            Err(e) => {
                warn!("QUIC dial to {} failed: {}, falling back to TCP", target, e);
                self.tcp.dial(target).await
            }
        }
    }
}
