//! QUIC transport configuration

use dualmux_transport::{TransportError, TransportResult};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use std::sync::Arc;
use std::time::Duration;

/// QUIC-specific tunables
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout, also the upper bound on a dial handshake
    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams the peer may open
    pub max_concurrent_streams: u64,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(3),
            max_idle_timeout: Duration::from_secs(10),
            max_concurrent_streams: 100,
        }
    }
}

impl QuicConfig {
    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set custom idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    /// Set maximum concurrent streams
    pub fn with_max_streams(mut self, max: u64) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                "Idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }

        Ok(())
    }

    fn transport_config(&self) -> TransportResult<quinn::TransportConfig> {
        let idle = quinn::IdleTimeout::try_from(self.max_idle_timeout).map_err(|e| {
            TransportError::ConfigurationError(format!("Idle timeout out of range: {}", e))
        })?;
        let streams = quinn::VarInt::from_u64(self.max_concurrent_streams).map_err(|e| {
            TransportError::ConfigurationError(format!("Stream limit out of range: {}", e))
        })?;

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(streams);
        Ok(transport)
    }

    /// Build quinn ClientConfig around a rustls client config
    pub(crate) fn build_client_config(
        &self,
        tls: Arc<rustls::ClientConfig>,
    ) -> TransportResult<quinn::ClientConfig> {
        let crypto =
            QuicClientConfig::try_from(tls).map_err(|e| TransportError::TlsError(e.to_string()))?;

        let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
        client_config.transport_config(Arc::new(self.transport_config()?));
        Ok(client_config)
    }

    /// Build quinn ServerConfig around a rustls server config
    pub(crate) fn build_server_config(
        &self,
        tls: Arc<rustls::ServerConfig>,
    ) -> TransportResult<quinn::ServerConfig> {
        let crypto =
            QuicServerConfig::try_from(tls).map_err(|e| TransportError::TlsError(e.to_string()))?;

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(self.transport_config()?));
        Ok(server_config)
    }
}
