//! HTTP/1.1 over session streams
//!
//! Every request travels on its own stream. The serving side forwards each
//! request to a fixed upstream and writes the response back on the stream.
//! Upstreams may be plain `http://` or `https://`; the latter are verified
//! against the webpki roots unless a client config is supplied.

use bytes::Bytes;
use dualmux_transport::{MuxSession, MuxStream, TransportError};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::header::{HeaderValue, CONNECTION, HOST, TRANSFER_ENCODING};
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Deadline applied to every stream carrying an HTTP exchange
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Invalid target URL {url}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("Unsupported target scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Upstream connection failed: {0}")]
    Upstream(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Upstream that forwarded requests are sent to
#[derive(Debug, Clone)]
struct Target {
    authority: String,
    /// Set for `https` targets
    server_name: Option<ServerName<'static>>,
}

impl Target {
    fn parse(url: &str) -> Result<Self, ForwardError> {
        let invalid = |reason: &str| ForwardError::InvalidTarget {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let uri: Uri = url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| invalid(&e.to_string()))?;

        let tls = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            Some(other) => return Err(ForwardError::UnsupportedScheme(other.to_string())),
            None => return Err(invalid("missing scheme")),
        };

        let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;

        let server_name = if tls {
            let host = authority
                .host()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            let name = ServerName::try_from(host).map_err(|e| invalid(&e.to_string()))?;
            Some(name)
        } else {
            None
        };

        Ok(Self {
            authority: authority.as_str().to_string(),
            server_name,
        })
    }

    fn default_port(&self) -> u16 {
        if self.server_name.is_some() {
            443
        } else {
            80
        }
    }

    /// `host:port` to connect to
    fn socket_addr(&self) -> String {
        if self.authority.rsplit_once(':').is_some_and(|(_, port)| {
            !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())
        }) {
            self.authority.clone()
        } else {
            format!("{}:{}", self.authority, self.default_port())
        }
    }
}

/// Target plus the TLS connector used for `https` upstreams
#[derive(Clone)]
struct Upstream {
    target: Target,
    tls: Option<TlsConnector>,
}

/// Check that `target_url` can be forwarded to
///
/// [`serve_http`] performs the same check; this lets callers fail before
/// any session exists.
pub fn validate_target(target_url: &str) -> Result<(), ForwardError> {
    Target::parse(target_url).map(|_| ())
}

/// Client config for `https` upstreams: webpki roots, HTTP/1.1 ALPN
pub fn upstream_tls_config() -> Arc<rustls::ClientConfig> {
    dualmux_cert::ensure_crypto_provider();
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Serve HTTP on every stream the peer opens, forwarding to `target_url`
///
/// `http://` and `https://` targets are supported. The returned task ends
/// when the session stops yielding streams.
pub fn serve_http(
    session: Arc<dyn MuxSession>,
    target_url: &str,
) -> Result<JoinHandle<()>, ForwardError> {
    serve_http_with_tls(session, target_url, upstream_tls_config())
}

/// Like [`serve_http`], verifying `https` upstreams with `tls` instead
pub fn serve_http_with_tls(
    session: Arc<dyn MuxSession>,
    target_url: &str,
    tls: Arc<rustls::ClientConfig>,
) -> Result<JoinHandle<()>, ForwardError> {
    let target = Target::parse(target_url)?;
    let tls = target
        .server_name
        .is_some()
        .then(|| TlsConnector::from(tls));
    let upstream = Upstream { target, tls };
    info!(
        "Forwarding HTTP from {} session to {}",
        session.protocol(),
        target_url
    );

    Ok(tokio::spawn(async move {
        loop {
            let stream = match session.accept_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("HTTP forwarding stopped: {}", e);
                    return;
                }
            };
            tokio::spawn(handle_stream(stream, upstream.clone()));
        }
    }))
}

async fn handle_stream(mut stream: MuxStream, upstream: Upstream) {
    let stream_id = stream.stream_id();
    stream.set_deadline(Some(Instant::now() + STREAM_TIMEOUT));

    let service = service_fn(move |req| {
        let upstream = upstream.clone();
        async move { Ok::<_, Infallible>(forward(req, &upstream).await) }
    });

    // One exchange per stream
    let result = server_http1::Builder::new()
        .keep_alive(false)
        .serve_connection(TokioIo::new(stream), service)
        .await;
    if let Err(e) = result {
        debug!("Stream {} HTTP exchange ended: {}", stream_id, e);
    }
}

async fn forward(req: Request<Incoming>, upstream: &Upstream) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match send_upstream(req, upstream).await {
        Ok(response) => {
            info!("{} {} -> {}", method, path, response.status().as_u16());
            response
        }
        Err(e) => {
            warn!("Forwarding {} {} failed: {}", method, path, e);
            bad_gateway(&e)
        }
    }
}

async fn send_upstream(
    req: Request<Incoming>,
    upstream: &Upstream,
) -> Result<Response<Full<Bytes>>, ForwardError> {
    let target = &upstream.target;
    let (mut parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();

    parts.uri = origin_form(&parts.uri)?;
    let host = HeaderValue::from_str(&target.authority)
        .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
    parts.headers.insert(HOST, host);
    parts.headers.remove(CONNECTION);
    let request = Request::from_parts(parts, Full::new(body));

    let tcp = TcpStream::connect(target.socket_addr()).await?;
    let response = match (&upstream.tls, &target.server_name) {
        (Some(connector), Some(server_name)) => {
            let tls = connector.connect(server_name.clone(), tcp).await?;
            exchange(tls, request).await?
        }
        _ => exchange(tcp, request).await?,
    };

    let (mut parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();
    parts.headers.remove(CONNECTION);
    parts.headers.remove(TRANSFER_ENCODING);

    Ok(Response::from_parts(parts, Full::new(body)))
}

/// One HTTP/1.1 request on a fresh upstream connection
async fn exchange<I>(
    io: I,
    request: Request<Full<Bytes>>,
) -> Result<Response<Incoming>, ForwardError>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, conn) = client_http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection closed: {}", e);
        }
    });
    Ok(sender.send_request(request).await?)
}

/// Reduce a request URI to its path and query
fn origin_form(uri: &Uri) -> Result<Uri, ForwardError> {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    path.parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ForwardError::InvalidRequest(e.to_string()))
}

fn bad_gateway(error: &ForwardError) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(format!(
        "Bad Gateway: {}",
        error
    ))));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}

/// Sends HTTP requests to the peer, one stream per request
#[derive(Debug, Clone)]
pub struct HttpTunnelClient {
    session: Arc<dyn MuxSession>,
}

impl HttpTunnelClient {
    pub fn new(session: Arc<dyn MuxSession>) -> Self {
        Self { session }
    }

    /// Perform one request and collect the full response
    ///
    /// A missing `Host` header is filled from the request URI, or with
    /// `localhost` for origin-form URIs.
    pub async fn send(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Bytes>, ForwardError> {
        let (mut parts, body) = req.into_parts();
        if !parts.headers.contains_key(HOST) {
            let host = parts
                .uri
                .authority()
                .map(|a| a.as_str().to_string())
                .unwrap_or_else(|| "localhost".to_string());
            let host = HeaderValue::from_str(&host)
                .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
            parts.headers.insert(HOST, host);
        }
        parts.uri = origin_form(&parts.uri)?;

        let mut stream = self.session.open_stream().await?;
        let stream_id = stream.stream_id();
        stream.set_deadline(Some(Instant::now() + STREAM_TIMEOUT));
        debug!("Sending {} {} on stream {}", parts.method, parts.uri, stream_id);

        let (mut sender, conn) = client_http1::handshake(TokioIo::new(stream)).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Stream {} HTTP connection ended: {}", stream_id, e);
            }
        });

        let result = async {
            let response = sender.send_request(Request::from_parts(parts, body)).await?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok(Response::from_parts(parts, body))
        }
        .await;

        drop(sender);
        driver.abort();
        result
    }
}
