//! TCP transport configuration

use dualmux_transport::{TransportError, TransportResult};
use std::time::Duration;

/// Tunables for TLS-over-TCP sessions
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Upper bound on TCP connect plus TLS handshake when dialing
    pub dial_timeout: Duration,

    /// Upper bound on the server-side TLS handshake per connection
    pub handshake_timeout: Duration,

    /// Maximum number of concurrent yamux streams per session
    pub max_concurrent_streams: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_concurrent_streams: 512,
        }
    }
}

impl TcpConfig {
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_streams(mut self, max: usize) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.dial_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Timeouts must be > 0".to_string(),
            ));
        }
        if self.max_concurrent_streams == 0 {
            return Err(TransportError::ConfigurationError(
                "Max concurrent streams must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn yamux_config(&self) -> yamux::Config {
        let mut config = yamux::Config::default();
        config.set_max_num_streams(self.max_concurrent_streams);
        config
    }
}
