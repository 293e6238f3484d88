//! Helpers for opaque `host:port` address strings
//!
//! Addresses are passed through to the transports untouched; these helpers
//! only split out what a transport needs (a socket address to bind or
//! connect, a TLS server name).

use std::net::SocketAddr;

/// Resolve `target` to the first socket address it names
pub async fn resolve(target: &str) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host(target)
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("{} did not resolve to any address", target),
            )
        })
}

/// Host part of `target`, usable as a TLS server name
///
/// An empty host (e.g. `":7443"`) maps to `localhost`.
pub fn server_name(target: &str) -> String {
    let host = if let Some(rest) = target.strip_prefix('[') {
        rest.split(']').next().unwrap_or_default()
    } else {
        match target.rsplit_once(':') {
            Some((host, _)) => host,
            None => target,
        }
    };

    if host.is_empty() {
        "localhost".to_string()
    } else {
        host.to_string()
    }
}

/// Same address as `addr` with its port replaced
///
/// Returns `None` if `addr` is not a literal socket address.
pub fn with_port(addr: &str, port: u16) -> Option<String> {
    let mut parsed: SocketAddr = addr.parse().ok()?;
    parsed.set_port(port);
    Some(parsed.to_string())
}

/// Whether `addr` is a literal socket address asking for an ephemeral port
pub fn is_ephemeral(addr: &str) -> bool {
    addr.parse::<SocketAddr>()
        .map(|a| a.port() == 0)
        .unwrap_or(false)
}
