//! File-based configuration
//!
//! A config file is YAML (`.yaml`, `.yml`) or JSON (`.json`):
//!
//! ```yaml
//! mode: auto
//! server_addr: "example.com:7443"
//! listen_addr: "0.0.0.0:7443"
//! tls:
//!   cert: /etc/dualmux/cert.pem
//!   key: /etc/dualmux/key.pem
//!   ca: /etc/dualmux/ca.pem
//!   insecure: false
//! ```

use dualmux_cert::{client_config_from_pem, server_config_from_pem, TlsOptions};
use dualmux_dialer::Config;
use dualmux_transport::TransportMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::DualMuxError;

/// Default listen address for servers
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7443";

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

/// Client and server settings loaded from a file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualMuxConfig {
    /// Transport mode (`auto`, `quic`, `tcp`)
    #[serde(default)]
    pub mode: TransportMode,

    /// Address clients dial
    #[serde(default)]
    pub server_addr: Option<String>,

    /// Address servers bind
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub tls: TlsFiles,
}

impl Default for DualMuxConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Auto,
            server_addr: None,
            listen_addr: default_listen_addr(),
            tls: TlsFiles::default(),
        }
    }
}

/// PEM files for TLS
///
/// With no files at all, servers use a generated self-signed certificate and
/// clients skip verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsFiles {
    /// Server certificate chain
    pub cert: Option<PathBuf>,
    /// Server private key
    pub key: Option<PathBuf>,
    /// CA that client verification trusts
    pub ca: Option<PathBuf>,
    /// Skip server certificate verification on clients
    #[serde(default)]
    pub insecure: bool,
}

impl DualMuxConfig {
    /// Load a config file, choosing the format by extension
    pub fn load(path: &Path) -> Result<Self, DualMuxError> {
        let content = std::fs::read_to_string(path).map_err(|source| DualMuxError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let config = match extension.as_deref() {
            Some("yaml") | Some("yml") => Self::parse_yaml(&content),
            Some("json") => Self::parse_json(&content),
            _ => Err(DualMuxError::InvalidConfig(format!(
                "{} must end in .yaml, .yml or .json",
                path.display()
            ))),
        }?;

        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse_yaml(content: &str) -> Result<Self, DualMuxError> {
        serde_yaml::from_str(content).map_err(|e| DualMuxError::InvalidConfig(e.to_string()))
    }

    pub fn parse_json(content: &str) -> Result<Self, DualMuxError> {
        serde_json::from_str(content).map_err(|e| DualMuxError::InvalidConfig(e.to_string()))
    }

    /// Resolve the PEM files into an orchestrator [`Config`]
    pub fn to_transport_config(&self) -> Result<Config, DualMuxError> {
        Ok(Config::new(self.mode).with_tls(self.tls.resolve()?))
    }
}

impl TlsFiles {
    fn resolve(&self) -> Result<TlsOptions, DualMuxError> {
        let mut options = TlsOptions::default();

        match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => {
                options = options.with_server(server_config_from_pem(cert, key)?);
            }
            (None, None) => {}
            _ => {
                return Err(DualMuxError::InvalidConfig(
                    "tls.cert and tls.key must be set together".to_string(),
                ))
            }
        }

        if self.ca.is_some() || self.insecure {
            options = options.with_client(client_config_from_pem(self.ca.as_deref(), self.insecure)?);
        }

        Ok(options)
    }
}
