//! Dual-transport dial and listen orchestration
//!
//! [`Dialer`] and [`Listener`] pick between QUIC and TLS-over-TCP according
//! to a [`TransportMode`], so callers get a [`Session`] without caring which
//! transport carries it.
//!
//! # Example
//!
//! ```no_run
//! use dualmux_dialer::{Config, Dialer, Listener};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//!
//! let listener = Listener::bind("127.0.0.1:7443", &config).await?;
//! tokio::spawn(async move {
//!     while let Ok(session) = listener.accept().await {
//!         println!("accepted {} session", session.protocol());
//!     }
//! });
//!
//! let session = Dialer::new(&config)?.dial("127.0.0.1:7443").await?;
//! println!("dialed over {}", session.protocol());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dialer;
pub mod listener;

pub use config::Config;
pub use dialer::Dialer;
pub use listener::Listener;

pub use dualmux_cert::TlsOptions;
pub use dualmux_transport::{Session, TransportError, TransportMode, TransportResult};

#[cfg(test)]
mod tests;
