//! End-to-end dial/listen tests over loopback

use dualmux_dialer::{Config, Dialer, Listener, TransportError, TransportMode};
use dualmux_transport::Protocol;
use dualmux_transport_quic::QuicConfig;
use dualmux_transport_tcp::TcpConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn fast_config(mode: TransportMode) -> Config {
    init_logging();
    Config::new(mode)
        .with_quic(
            QuicConfig::default()
                .with_keep_alive(Duration::from_millis(250))
                .with_idle_timeout(Duration::from_secs(1)),
        )
        .with_tcp(
            TcpConfig::default()
                .with_dial_timeout(Duration::from_secs(2))
                .with_handshake_timeout(Duration::from_secs(2)),
        )
}

/// Accept one session and echo one stream on it
fn spawn_echo(listener: Arc<Listener>) -> tokio::task::JoinHandle<Protocol> {
    tokio::spawn(async move {
        let session = listener.accept().await.expect("accept failed");
        let protocol = session.protocol();
        let mut stream = session.accept_stream().await.expect("accept stream failed");
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
        stream.close().await.unwrap();
        // Hold the session until the client has read the echo
        tokio::time::sleep(Duration::from_millis(200)).await;
        session.close().await.unwrap();
        protocol
    })
}

async fn dial_and_echo(dialer: &Dialer, target: &str) -> Protocol {
    let session = timeout(Duration::from_secs(5), dialer.dial(target))
        .await
        .expect("dial timed out")
        .expect("dial failed");

    let mut stream = session.open_stream().await.unwrap();
    stream.write_all(b"hello").await.unwrap();
    stream.flush().await.unwrap();
    let mut reply = [0u8; 5];
    timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&reply, b"hello");

    let protocol = session.protocol();
    session.close().await.unwrap();
    protocol
}

#[tokio::test]
async fn test_forced_tcp_round_trip() {
    let config = fast_config(TransportMode::Tcp);
    let listener = Arc::new(Listener::bind("127.0.0.1:0", &config).await.unwrap());
    assert!(!listener.is_dual());
    assert!(listener.quic_addr().is_none());

    let server = spawn_echo(listener.clone());
    let dialer = Dialer::new(&config).unwrap();
    let protocol = dial_and_echo(&dialer, &listener.addr().to_string()).await;

    assert_eq!(protocol, Protocol::Tcp);
    assert_eq!(server.await.unwrap(), Protocol::Tcp);
    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_forced_quic_round_trip() {
    let config = fast_config(TransportMode::Quic);
    let listener = Arc::new(Listener::bind("127.0.0.1:0", &config).await.unwrap());
    assert!(listener.tcp_addr().is_none());

    let server = spawn_echo(listener.clone());
    let dialer = Dialer::new(&config).unwrap();
    let protocol = dial_and_echo(&dialer, &listener.addr().to_string()).await;

    assert_eq!(protocol, Protocol::Quic);
    assert_eq!(server.await.unwrap(), Protocol::Quic);
    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_auto_listener_serves_both_transports() {
    let config = fast_config(TransportMode::Auto);
    let listener = Arc::new(Listener::bind("127.0.0.1:0", &config).await.unwrap());
    assert!(listener.is_dual());

    let quic_addr = listener.quic_addr().unwrap();
    let tcp_addr = listener.tcp_addr().unwrap();
    assert_eq!(quic_addr.port(), tcp_addr.port());

    let server = spawn_echo(listener.clone());
    let auto = Dialer::new(&config).unwrap();
    assert_eq!(
        dial_and_echo(&auto, &quic_addr.to_string()).await,
        Protocol::Quic
    );
    assert_eq!(server.await.unwrap(), Protocol::Quic);

    let server = spawn_echo(listener.clone());
    let tcp_only = Dialer::new(&fast_config(TransportMode::Tcp)).unwrap();
    assert_eq!(
        dial_and_echo(&tcp_only, &tcp_addr.to_string()).await,
        Protocol::Tcp
    );
    assert_eq!(server.await.unwrap(), Protocol::Tcp);

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_auto_dial_falls_back_when_only_tcp_listens() {
    let listener = Arc::new(
        Listener::bind("127.0.0.1:0", &fast_config(TransportMode::Tcp))
            .await
            .unwrap(),
    );
    let server = spawn_echo(listener.clone());

    let auto = Dialer::new(&fast_config(TransportMode::Auto)).unwrap();
    let protocol = dial_and_echo(&auto, &listener.addr().to_string()).await;

    assert_eq!(protocol, Protocol::Tcp);
    assert_eq!(server.await.unwrap(), Protocol::Tcp);
    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_auto_dial_to_nothing_reports_tcp_error() {
    // Reserve a port, then free it so nothing listens there
    let port = {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };

    let dialer = Dialer::new(&fast_config(TransportMode::Auto)).unwrap();
    let result = timeout(
        Duration::from_secs(10),
        dialer.dial(&format!("127.0.0.1:{}", port)),
    )
    .await
    .expect("auto dial did not give up");

    match result {
        Err(TransportError::DialError { protocol, .. }) => assert_eq!(protocol, Protocol::Tcp),
        other => panic!("unexpected result: {:?}", other.map(|s| s.protocol())),
    }
}

#[tokio::test]
async fn test_listener_close_lifecycle() {
    let config = fast_config(TransportMode::Auto);
    let listener = Listener::bind("127.0.0.1:0", &config).await.unwrap();
    assert_eq!(listener.worker_count(), 2);

    listener.close().await.unwrap();
    assert_eq!(listener.worker_count(), 0);
    assert!(listener.close().await.is_ok());

    let result = timeout(Duration::from_secs(1), listener.accept())
        .await
        .expect("accept after close hung");
    assert!(matches!(result, Err(TransportError::ListenerClosed)));
}

#[tokio::test]
async fn test_auto_listener_degrades_when_udp_port_taken() {
    let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = udp.local_addr().unwrap().port();

    let listener = Listener::bind(
        &format!("127.0.0.1:{}", port),
        &fast_config(TransportMode::Auto),
    )
    .await
    .unwrap();

    assert!(!listener.is_dual());
    assert_eq!(listener.addr().port(), port);
    assert_eq!(listener.tcp_addr().map(|a| a.port()), Some(port));
    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_auto_listener_fails_when_tcp_port_taken() {
    let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = tcp.local_addr().unwrap().port();

    let result = Listener::bind(
        &format!("127.0.0.1:{}", port),
        &fast_config(TransportMode::Auto),
    )
    .await;

    match result {
        Err(TransportError::BindError { protocol, .. }) => assert_eq!(protocol, Protocol::Tcp),
        other => panic!("unexpected result: {:?}", other.map(|l| l.mode())),
    }
    drop(tcp);
}
