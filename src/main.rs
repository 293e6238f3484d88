//! DualMux CLI - serve, probe and fetch over QUIC or TLS-over-TCP sessions

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use dualmux_lib::{
    serve_http, validate_target, DualMux, DualMuxConfig, HttpTunnelClient, MuxSession, MuxStream,
    TransportError, TransportMode,
};
use http_body_util::Full;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// DualMux - multiplexed sessions over QUIC with TLS-over-TCP fallback
#[derive(Parser, Debug)]
#[command(name = "dualmux")]
#[command(about = "DualMux - multiplexed sessions over QUIC with TLS-over-TCP fallback")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (.yaml, .yml or .json); flags override it
    #[arg(short, long, global = true, env = "DUALMUX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept sessions and echo their streams, or forward HTTP
    #[command(long_about = r#"
Bind a listener and serve every accepted session. Without --forward each
stream is echoed back; with --forward each stream carries one HTTP request
that is forwarded to the given URL.

EXAMPLES:
  # Echo server on both transports
  dualmux serve --listen 0.0.0.0:7443

  # Forward HTTP to a local service, TCP only, with a real certificate
  dualmux serve --mode tcp --forward http://127.0.0.1:8080 \
    --cert cert.pem --key key.pem
    "#)]
    Serve {
        /// Address to bind (e.g., 0.0.0.0:7443)
        #[arg(long, env = "DUALMUX_LISTEN")]
        listen: Option<String>,

        /// Transport mode: auto, quic or tcp
        #[arg(long, env = "DUALMUX_MODE")]
        mode: Option<String>,

        /// Forward HTTP requests to this URL instead of echoing
        #[arg(long)]
        forward: Option<String>,

        /// Server certificate chain (PEM)
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// Server private key (PEM)
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
    },

    /// Dial a server and time one echo round trip
    Probe {
        #[command(flatten)]
        client: ClientArgs,

        /// Payload to send
        #[arg(long, default_value = "ping")]
        payload: String,
    },

    /// Send an HTTP GET through the tunnel and print the response
    Fetch {
        #[command(flatten)]
        client: ClientArgs,

        /// Request path (e.g., /healthz)
        path: String,
    },
}

#[derive(clap::Args, Debug)]
struct ClientArgs {
    /// Server address (e.g., relay.example.com:7443)
    #[arg(long, env = "DUALMUX_SERVER")]
    server: Option<String>,

    /// Transport mode: auto, quic or tcp
    #[arg(long, env = "DUALMUX_MODE")]
    mode: Option<String>,

    /// CA certificate to verify the server against (PEM)
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,
}

impl ClientArgs {
    fn apply(self, config: &mut DualMuxConfig) {
        if let Some(server) = self.server {
            config.server_addr = Some(server);
        }
        if let Some(mode) = self.mode {
            config.mode = TransportMode::parse_lenient(&mode);
        }
        if let Some(ca) = self.ca {
            config.tls.ca = Some(ca);
        }
        if self.insecure {
            config.tls.insecure = true;
        }
    }
}

/// Setup logging; RUST_LOG takes precedence over --verbose
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<DualMuxConfig> {
    match path {
        Some(path) => DualMuxConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(DualMuxConfig::default()),
    }
}

async fn serve(config: DualMuxConfig, forward: Option<String>) -> Result<()> {
    if let Some(url) = &forward {
        validate_target(url).with_context(|| format!("Invalid --forward URL {}", url))?;
    }

    let dualmux = DualMux::new(config).context("Failed to prepare transports")?;
    let listener = dualmux.listen().await.context("Failed to bind listener")?;

    if listener.is_dual() {
        info!("Serving QUIC and TCP on {}", listener.addr());
    } else {
        info!("Serving {} on {}", listener.mode(), listener.addr());
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let accepted = tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        let session: Arc<dyn MuxSession> = match accepted {
            Ok(session) => Arc::from(session),
            Err(TransportError::ListenerClosed) => break,
            Err(e) => {
                error!("Accept failed: {}", e);
                break;
            }
        };
        info!("Accepted {} session", session.protocol());

        match &forward {
            Some(url) => {
                if let Err(e) = serve_http(session, url) {
                    error!("Forwarding to {} failed: {}", url, e);
                }
            }
            None => {
                tokio::spawn(echo_session(session));
            }
        }
    }

    listener.close().await.context("Failed to close listener")?;
    info!("DualMux stopped");
    Ok(())
}

async fn echo_session(session: Arc<dyn MuxSession>) {
    loop {
        match session.accept_stream().await {
            Ok(stream) => {
                tokio::spawn(echo_stream(stream));
            }
            Err(e) => {
                debug!("{} session ended: {}", session.protocol(), e);
                break;
            }
        }
    }
    if let Err(e) = session.close().await {
        debug!("Closing session failed: {}", e);
    }
}

async fn echo_stream(stream: MuxStream) {
    let stream_id = stream.stream_id();
    let (mut reader, mut writer) = tokio::io::split(stream);

    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => debug!("Stream {} echoed {} bytes", stream_id, bytes),
        Err(e) => warn!("Stream {} echo failed: {}", stream_id, e),
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Stream {} shutdown failed: {}", stream_id, e);
    }
}

async fn probe(config: DualMuxConfig, payload: String) -> Result<()> {
    let dualmux = DualMux::new(config).context("Failed to prepare transports")?;

    let started = Instant::now();
    let session = dualmux.dial().await.context("Failed to connect")?;
    let connect_time = started.elapsed();
    println!(
        "Connected over {} in {:?} (local {})",
        session.protocol(),
        connect_time,
        session
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );

    let started = Instant::now();
    let mut stream = session.open_stream().await.context("Failed to open stream")?;
    stream
        .write_all(payload.as_bytes())
        .await
        .context("Failed to send payload")?;
    stream.flush().await?;

    let mut echoed = vec![0u8; payload.len()];
    stream
        .read_exact(&mut echoed)
        .await
        .context("Failed to read echo")?;
    let round_trip = started.elapsed();

    if echoed != payload.as_bytes() {
        anyhow::bail!("Echo mismatch: got {:?}", String::from_utf8_lossy(&echoed));
    }
    println!(
        "Stream {} echoed {} bytes in {:?}",
        stream.stream_id(),
        echoed.len(),
        round_trip
    );

    stream.close().await.ok();
    session.close().await.context("Failed to close session")?;
    Ok(())
}

async fn fetch(config: DualMuxConfig, path: String) -> Result<()> {
    let dualmux = DualMux::new(config).context("Failed to prepare transports")?;
    let session = dualmux.dial().await.context("Failed to connect")?;
    let session: Arc<dyn MuxSession> = Arc::from(session);

    let request = hyper::Request::get(path.as_str())
        .body(Full::new(Bytes::new()))
        .context("Invalid request path")?;
    let response = HttpTunnelClient::new(session.clone())
        .send(request)
        .await
        .context("Request failed")?;

    println!("{}", response.status());
    println!("{}", String::from_utf8_lossy(response.body()));

    session.close().await.context("Failed to close session")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve {
            listen,
            mode,
            forward,
            cert,
            key,
        } => {
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if let Some(mode) = mode {
                config.mode = TransportMode::parse_lenient(&mode);
            }
            if cert.is_some() {
                config.tls.cert = cert;
                config.tls.key = key;
            }
            serve(config, forward).await
        }
        Commands::Probe { client, payload } => {
            client.apply(&mut config);
            probe(config, payload).await
        }
        Commands::Fetch { client, path } => {
            client.apply(&mut config);
            fetch(config, path).await
        }
    }
}
