//! Transport selection mode

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::str::FromStr;
use tracing::debug;

/// Which transport(s) a dialer or listener may use
///
/// Parsing is lenient: any value other than `quic` or `tcp` selects
/// [`TransportMode::Auto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransportMode {
    /// Prefer QUIC, fall back to TCP
    #[default]
    Auto,
    /// QUIC only
    Quic,
    /// TCP + yamux only
    Tcp,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Auto => "auto",
            TransportMode::Quic => "quic",
            TransportMode::Tcp => "tcp",
        }
    }

    /// Parse a mode string, treating unknown values as `Auto`
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => TransportMode::Auto,
            "quic" => TransportMode::Quic,
            "tcp" => TransportMode::Tcp,
            other => {
                debug!("Unknown transport mode {:?}, using auto", other);
                TransportMode::Auto
            }
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse_lenient(s))
    }
}

impl From<&str> for TransportMode {
    fn from(value: &str) -> Self {
        Self::parse_lenient(value)
    }
}

impl From<String> for TransportMode {
    fn from(value: String) -> Self {
        Self::parse_lenient(&value)
    }
}

impl From<TransportMode> for String {
    fn from(mode: TransportMode) -> Self {
        mode.as_str().to_string()
    }
}
