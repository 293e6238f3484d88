//! Client and server TLS configuration
//!
//! `ensure_*` fill in a default when the caller supplied nothing; the
//! `*_from_pem` builders resolve configurations from files on disk.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::self_signed::generate_self_signed_cert;
use crate::verifier::SkipVerification;
use crate::{ensure_crypto_provider, CertError, ALPN_PROTOCOL};

/// TLS material handed to dialers and listeners
///
/// `None` on either side means "use the default": an insecure client, or a
/// freshly generated self-signed server certificate.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub client: Option<Arc<ClientConfig>>,
    pub server: Option<Arc<ServerConfig>>,
}

impl TlsOptions {
    pub fn with_client(mut self, config: Arc<ClientConfig>) -> Self {
        self.client = Some(config);
        self
    }

    pub fn with_server(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }
}

/// Return `config`, or a client config that skips certificate verification
pub fn ensure_client_config(config: Option<Arc<ClientConfig>>) -> Arc<ClientConfig> {
    match config {
        Some(config) => config,
        None => insecure_client_config(),
    }
}

/// Return `config`, or a server config backed by a new self-signed certificate
pub fn ensure_server_config(
    config: Option<Arc<ServerConfig>>,
) -> Result<Arc<ServerConfig>, CertError> {
    if let Some(config) = config {
        return Ok(config);
    }

    debug!("No server TLS config supplied, generating self-signed certificate");
    let cert = generate_self_signed_cert()?;
    build_server_config(vec![cert.cert_der], cert.key_der)
}

/// Client config that accepts any server certificate (INSECURE)
pub fn insecure_client_config() -> Arc<ClientConfig> {
    ensure_crypto_provider();

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipVerification::new())
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    Arc::new(config)
}

/// Build a server config from a PEM certificate chain and private key
pub fn server_config_from_pem(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<ServerConfig>, CertError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    build_server_config(certs, key)
}

/// Build a client config
///
/// With `insecure` set, certificates are not verified. Otherwise the server
/// must chain to the CA in `ca_path`, or to the bundled web PKI roots when no
/// CA file is given.
pub fn client_config_from_pem(
    ca_path: Option<&Path>,
    insecure: bool,
) -> Result<Arc<ClientConfig>, CertError> {
    if insecure {
        return Ok(insecure_client_config());
    }

    ensure_crypto_provider();

    let mut roots = RootCertStore::empty();
    match ca_path {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| CertError::InvalidRoot(e.to_string()))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    Ok(Arc::new(config))
}

/// Load every certificate from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let mut reader = open(path)?;

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::InvalidPem {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(CertError::InvalidPem {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

/// Load the first private key from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let mut reader = open(path)?;

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CertError::InvalidPem {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| CertError::NoPrivateKey(path.to_path_buf()))
}

fn open(path: &Path) -> Result<BufReader<File>, CertError> {
    let file = File::open(path).map_err(|source| CertError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, CertError> {
    ensure_crypto_provider();

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    Ok(Arc::new(config))
}
