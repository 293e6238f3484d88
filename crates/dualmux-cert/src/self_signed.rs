//! Self-signed certificate generation
//!
//! Used when a server is started without a certificate of its own.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType, SerialNumber};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime};

use crate::CertError;

const VALIDITY_DAYS: u64 = 3650;

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    /// Certificate in DER format
    pub cert_der: CertificateDer<'static>,

    /// Private key in DER format
    pub key_der: PrivateKeyDer<'static>,

    /// Certificate in PEM format
    pub pem_cert: String,

    /// Private key in PEM format
    pub pem_key: String,
}

impl std::fmt::Debug for SelfSignedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedCertificate")
            .field("cert_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

impl SelfSignedCertificate {
    /// Write certificate and key as PEM files
    pub fn save_to_files(
        &self,
        cert_path: impl AsRef<std::path::Path>,
        key_path: impl AsRef<std::path::Path>,
    ) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }
}

/// Generate a certificate for `localhost`, `127.0.0.1` and `::1`
///
/// The certificate is valid for ten years from now, carries the
/// organization name "DualMux" and a random serial number. Keys are
/// ECDSA P-256.
pub fn generate_self_signed_cert() -> Result<SelfSignedCertificate, CertError> {
    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .map_err(|e| CertError::GenerationFailed(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "DualMux Self-Signed");
    dn.push(DnType::OrganizationName, "DualMux");
    params.distinguished_name = dn;

    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| CertError::GenerationFailed(e.to_string()))?;
    let not_after = now + Duration::from_secs(VALIDITY_DAYS * 24 * 60 * 60);
    params.not_before = unix_to_offset(now)?;
    params.not_after = unix_to_offset(not_after)?;

    params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

    let key_pair = KeyPair::generate().map_err(|e| CertError::GenerationFailed(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::GenerationFailed(e.to_string()))?;

    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| CertError::GenerationFailed(e.to_string()))?;

    Ok(SelfSignedCertificate {
        cert_der: cert.der().clone(),
        key_der,
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

/// Generate a self-signed certificate and return it as `(cert_pem, key_pem)`
pub fn generate_cert_pair() -> Result<(String, String), CertError> {
    let cert = generate_self_signed_cert()?;
    Ok((cert.pem_cert, cert.pem_key))
}

fn unix_to_offset(since_epoch: Duration) -> Result<time::OffsetDateTime, CertError> {
    time::OffsetDateTime::from_unix_timestamp(since_epoch.as_secs() as i64)
        .map_err(|e| CertError::GenerationFailed(e.to_string()))
}
