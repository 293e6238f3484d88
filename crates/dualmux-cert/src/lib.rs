//! TLS provisioning for dualmux transports
//!
//! Both transports run TLS 1.3 with the same ALPN identifier. Servers that
//! bring no certificate get an ephemeral self-signed one; clients that bring
//! no configuration skip certificate verification. The insecure defaults are
//! meant for development and for peers that pin trust out of band.

pub mod provision;
pub mod self_signed;
mod verifier;

pub use provision::{
    client_config_from_pem, ensure_client_config, ensure_server_config, insecure_client_config,
    load_certs, load_private_key, server_config_from_pem, TlsOptions,
};
pub use self_signed::{generate_cert_pair, generate_self_signed_cert, SelfSignedCertificate};

use std::path::PathBuf;
use thiserror::Error;

/// ALPN protocol identifier advertised by both transports
pub const ALPN_PROTOCOL: &[u8] = b"dualmux";

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse PEM in {path}: {reason}")]
    InvalidPem { path: PathBuf, reason: String },

    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("Invalid root certificate: {0}")]
    InvalidRoot(String),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the `ring` crypto provider as the process default, once
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}
