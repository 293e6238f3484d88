//! Session abstraction layer for dual-transport multiplexed connections
//!
//! This crate defines the contract every transport-specific session must
//! satisfy, so that callers can open and accept virtual streams without
//! knowing whether QUIC or TCP+yamux carries them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Application (HTTP forwarding, CLI)          │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Dial / Accept
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │        dualmux-dialer (Dialer / Listener orchestrators)  │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            dualmux-transport (this crate)                │
//! │  - MuxSession           - MuxStream                      │
//! │  - TransportConnector   - TransportListener              │
//! │  - TransportFactory     - TransportMode                  │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌────────────────────────────┬────────────────────────────┐
//! │ dualmux-transport-quic     │ dualmux-transport-tcp      │
//! │ (quinn)                    │ (TLS + yamux)              │
//! └────────────────────────────┴────────────────────────────┘
//! ```

pub mod addr;
pub mod mode;
pub mod stream;

pub use mode::TransportMode;
pub use stream::{MuxStream, StreamIo};

use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind {protocol} listener on {address}: {reason}")]
    BindError {
        protocol: Protocol,
        address: String,
        reason: String,
    },

    #[error("Failed to dial {target} over {protocol}: {reason}")]
    DialError {
        protocol: Protocol,
        target: String,
        reason: String,
    },

    #[error("Session closed")]
    SessionClosed,

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Session is not connected")]
    NotConnected,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// The transport that instantiated a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// QUIC over UDP
    Quic,
    /// TLS over TCP with yamux multiplexing
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Quic => "QUIC",
            Protocol::Tcp => "TCP",
        }
    }

    /// Returns whether this protocol runs over UDP
    pub fn is_udp(&self) -> bool {
        matches!(self, Protocol::Quic)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A multiplexed connection carrying many independent virtual streams
///
/// A session owns the underlying transport connection. Its lifetime is the
/// lifetime of that connection; `close` releases everything beneath it.
///
/// A stream opened with [`MuxSession::open_stream`] is announced to the peer
/// when the opener writes its first byte, so the side that opens a stream
/// should also speak first.
#[async_trait]
pub trait MuxSession: Send + Sync + Debug {
    /// Wait for the peer to open a new virtual stream
    ///
    /// Returns [`TransportError::SessionClosed`] once the session has been
    /// closed by either side.
    async fn accept_stream(&self) -> TransportResult<MuxStream>;

    /// Open a new virtual stream towards the peer
    ///
    /// Safe to call concurrently; every call yields an independent stream.
    async fn open_stream(&self) -> TransportResult<MuxStream>;

    /// Which transport backs this session
    fn protocol(&self) -> Protocol;

    /// Close the session and every resource it owns
    ///
    /// Calling `close` again after the first call returns `Ok(())` without
    /// blocking.
    async fn close(&self) -> TransportResult<()>;

    /// Local address of the underlying connection, `None` for an unbound session
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Boxed session handed out by dialers and listeners
pub type Session = Box<dyn MuxSession>;

/// Client-side: establishes outgoing sessions over one transport
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    /// Dial `target` (an opaque `host:port` string) and return a ready session
    async fn dial(&self, target: &str) -> TransportResult<Session>;

    /// Transport used by this connector
    fn protocol(&self) -> Protocol;
}

/// Server-side: accepts incoming sessions over one transport
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// Wait for the next fully established session
    ///
    /// After [`TransportListener::close`] this must fail promptly, which is
    /// what ends any loop blocked on it.
    async fn accept(&self) -> TransportResult<Session>;

    /// Local address this listener is bound to
    fn local_addr(&self) -> SocketAddr;

    /// Stop accepting new sessions
    async fn close(&self) -> TransportResult<()>;

    /// Transport used by this listener
    fn protocol(&self) -> Protocol;
}

/// Factory for creating transport listeners and connectors
///
/// TLS material is resolved by the factory itself, before any network
/// operation happens.
#[async_trait]
pub trait TransportFactory: Send + Sync + Debug {
    /// Create a connector for outgoing sessions
    fn create_connector(&self) -> TransportResult<Arc<dyn TransportConnector>>;

    /// Bind a listener to `bind_addr` (an opaque `host:port` string)
    async fn create_listener(&self, bind_addr: &str) -> TransportResult<Arc<dyn TransportListener>>;

    /// Transport produced by this factory
    fn protocol(&self) -> Protocol;
}

/// Return the first failure of a sequence of close results
///
/// Every result has already been produced by the time this is called, so all
/// sub-resources were attempted; only the first error is surfaced.
pub fn first_failure<I>(results: I) -> TransportResult<()>
where
    I: IntoIterator<Item = TransportResult<()>>,
{
    let mut first = None;
    for result in results {
        if let Err(e) = result {
            if first.is_none() {
                first = Some(e);
            }
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}


#[cfg(test)]
mod simple_tests {
    use super::*;

    #[test]
    fn test_protocol_names() {
        assert_eq!(Protocol::Quic.to_string(), "QUIC");
        assert_eq!(Protocol::Tcp.to_string(), "TCP");
        assert!(Protocol::Quic.is_udp());
        assert!(!Protocol::Tcp.is_udp());
    }

    #[test]
    fn test_first_failure_all_ok() {
        assert!(first_failure(vec![Ok(()), Ok(()), Ok(())]).is_ok());
        assert!(first_failure(Vec::new()).is_ok());
    }

    #[test]
    fn test_first_failure_returns_first_error() {
        let result = first_failure(vec![
            Ok(()),
            Err(TransportError::Timeout),
            Err(TransportError::SessionClosed),
        ]);
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[test]
    fn test_bind_error_message() {
        let err = TransportError::BindError {
            protocol: Protocol::Tcp,
            address: "0.0.0.0:80".to_string(),
            reason: "permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to bind TCP listener on 0.0.0.0:80: permission denied"
        );
    }
}
