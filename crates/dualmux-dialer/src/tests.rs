//! Orchestrator tests against instrumented in-memory transports

use async_trait::async_trait;
use dualmux_transport::{
    MuxSession, MuxStream, Protocol, Session, TransportConnector, TransportError,
    TransportFactory, TransportListener, TransportMode, TransportResult,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::{Dialer, Listener};

/// Session that only records how often it was closed
#[derive(Debug)]
struct MockSession {
    protocol: Protocol,
    closes: Arc<AtomicUsize>,
}

impl MockSession {
    fn boxed(protocol: Protocol) -> Session {
        Box::new(Self {
            protocol,
            closes: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn tracked(protocol: Protocol) -> (Session, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let session = Box::new(Self {
            protocol,
            closes: closes.clone(),
        });
        (session, closes)
    }
}

#[async_trait]
impl MuxSession for MockSession {
    async fn accept_stream(&self) -> TransportResult<MuxStream> {
        Err(TransportError::SessionClosed)
    }

    async fn open_stream(&self) -> TransportResult<MuxStream> {
        let (local, _remote) = tokio::io::duplex(64);
        Ok(MuxStream::new(local, 1, self.protocol))
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn close(&self) -> TransportResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Connector counting its dial attempts
#[derive(Debug)]
struct CountingConnector {
    protocol: Protocol,
    reachable: bool,
    calls: AtomicUsize,
}

impl CountingConnector {
    fn new(protocol: Protocol, reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            reachable,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for CountingConnector {
    async fn dial(&self, target: &str) -> TransportResult<Session> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reachable {
            Ok(MockSession::boxed(self.protocol))
        } else {
            Err(TransportError::DialError {
                protocol: self.protocol,
                target: target.to_string(),
                reason: format!("{} unreachable", self.protocol),
            })
        }
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }
}

/// Listener whose accepted sessions are fed by the test through a channel
#[derive(Debug)]
struct ChannelListener {
    protocol: Protocol,
    local_addr: SocketAddr,
    incoming: Mutex<mpsc::UnboundedReceiver<TransportResult<Session>>>,
    shutdown: CancellationToken,
    accept_calls: AtomicUsize,
    closes: AtomicUsize,
}

impl ChannelListener {
    fn new(
        protocol: Protocol,
        port: u16,
    ) -> (Arc<Self>, mpsc::UnboundedSender<TransportResult<Session>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Self {
            protocol,
            local_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            incoming: Mutex::new(rx),
            shutdown: CancellationToken::new(),
            accept_calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        (listener, tx)
    }
}

#[async_trait]
impl TransportListener for ChannelListener {
    async fn accept(&self) -> TransportResult<Session> {
        self.accept_calls.fetch_add(1, Ordering::SeqCst);
        if self.shutdown.is_cancelled() {
            return Err(TransportError::ListenerClosed);
        }
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::ListenerClosed),
            next = incoming.recv() => next.unwrap_or(Err(TransportError::ListenerClosed)),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(&self) -> TransportResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.shutdown.cancel();
        Ok(())
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }
}

/// Factory handing out a prepared listener, or failing to bind
#[derive(Debug)]
struct MockFactory {
    protocol: Protocol,
    listener: Option<Arc<ChannelListener>>,
    bind_addrs: std::sync::Mutex<Vec<String>>,
}

impl MockFactory {
    fn serving(listener: Arc<ChannelListener>) -> Self {
        Self {
            protocol: listener.protocol,
            listener: Some(listener),
            bind_addrs: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn failing(protocol: Protocol) -> Self {
        Self {
            protocol,
            listener: None,
            bind_addrs: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn bind_addrs(&self) -> Vec<String> {
        self.bind_addrs.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    fn create_connector(&self) -> TransportResult<Arc<dyn TransportConnector>> {
        Ok(CountingConnector::new(self.protocol, true))
    }

    async fn create_listener(
        &self,
        bind_addr: &str,
    ) -> TransportResult<Arc<dyn TransportListener>> {
        self.bind_addrs.lock().unwrap().push(bind_addr.to_string());
        match &self.listener {
            Some(listener) => Ok(listener.clone()),
            None => Err(TransportError::BindError {
                protocol: self.protocol,
                address: bind_addr.to_string(),
                reason: "address in use".to_string(),
            }),
        }
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }
}

async fn dual_listener() -> (
    Listener,
    mpsc::UnboundedSender<TransportResult<Session>>,
    mpsc::UnboundedSender<TransportResult<Session>>,
    Arc<ChannelListener>,
    Arc<ChannelListener>,
) {
    let (quic, quic_tx) = ChannelListener::new(Protocol::Quic, 4433);
    let (tcp, tcp_tx) = ChannelListener::new(Protocol::Tcp, 4433);
    let listener = Listener::bind_with_factories(
        "127.0.0.1:4433",
        TransportMode::Auto,
        &MockFactory::serving(quic.clone()),
        &MockFactory::serving(tcp.clone()),
    )
    .await
    .unwrap();
    (listener, quic_tx, tcp_tx, quic, tcp)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// Dialer

#[tokio::test]
async fn test_forced_modes_never_touch_other_transport() {
    for mode in [TransportMode::Quic, TransportMode::Tcp] {
        let quic = CountingConnector::new(Protocol::Quic, true);
        let tcp = CountingConnector::new(Protocol::Tcp, true);
        let dialer = Dialer::with_connectors(mode, quic.clone(), tcp.clone());

        let session = dialer.dial("server:7443").await.unwrap();

        match mode {
            TransportMode::Quic => {
                assert_eq!(session.protocol(), Protocol::Quic);
                assert_eq!((quic.calls(), tcp.calls()), (1, 0));
            }
            _ => {
                assert_eq!(session.protocol(), Protocol::Tcp);
                assert_eq!((quic.calls(), tcp.calls()), (0, 1));
            }
        }
    }
}

#[tokio::test]
async fn test_forced_mode_error_propagates_unchanged() {
    let quic = CountingConnector::new(Protocol::Quic, false);
    let tcp = CountingConnector::new(Protocol::Tcp, true);
    let dialer = Dialer::with_connectors(TransportMode::Quic, quic.clone(), tcp.clone());

    match dialer.dial("server:7443").await {
        Err(TransportError::DialError { protocol, .. }) => assert_eq!(protocol, Protocol::Quic),
        other => panic!("unexpected result: {:?}", other.map(|s| s.protocol())),
    }
    assert_eq!(tcp.calls(), 0);
}

#[tokio::test]
async fn test_auto_prefers_quic() {
    let quic = CountingConnector::new(Protocol::Quic, true);
    let tcp = CountingConnector::new(Protocol::Tcp, true);
    let dialer = Dialer::with_connectors(TransportMode::Auto, quic.clone(), tcp.clone());

    let session = dialer.dial("server:7443").await.unwrap();
    assert_eq!(session.protocol(), Protocol::Quic);
    assert_eq!((quic.calls(), tcp.calls()), (1, 0));
}

#[tokio::test]
async fn test_auto_falls_back_to_tcp() {
    let quic = CountingConnector::new(Protocol::Quic, false);
    let tcp = CountingConnector::new(Protocol::Tcp, true);
    let dialer = Dialer::with_connectors(TransportMode::Auto, quic.clone(), tcp.clone());

    let session = dialer.dial("server:7443").await.unwrap();
    assert_eq!(session.protocol(), Protocol::Tcp);
    assert_eq!((quic.calls(), tcp.calls()), (1, 1));
}

#[tokio::test]
async fn test_auto_returns_last_error() {
    let quic = CountingConnector::new(Protocol::Quic, false);
    let tcp = CountingConnector::new(Protocol::Tcp, false);
    let dialer = Dialer::with_connectors(TransportMode::Auto, quic, tcp);

    match dialer.dial("server:7443").await {
        Err(TransportError::DialError { protocol, .. }) => assert_eq!(protocol, Protocol::Tcp),
        other => panic!("unexpected result: {:?}", other.map(|s| s.protocol())),
    }
}

#[tokio::test]
async fn test_dialer_shared_between_tasks() {
    let quic = CountingConnector::new(Protocol::Quic, false);
    let tcp = CountingConnector::new(Protocol::Tcp, true);
    let dialer = Dialer::with_connectors(TransportMode::Auto, quic.clone(), tcp.clone());

    let mut tasks = Vec::new();
    for i in 0..8 {
        let dialer = dialer.clone();
        tasks.push(tokio::spawn(async move {
            dialer.dial(&format!("server-{}:7443", i)).await.map(|s| s.protocol())
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), Protocol::Tcp);
    }
    assert_eq!((quic.calls(), tcp.calls()), (8, 8));
}

// Listener construction

#[tokio::test]
async fn test_single_mode_starts_no_workers() {
    let (tcp, tcp_tx) = ChannelListener::new(Protocol::Tcp, 9000);
    let listener = Listener::bind_with_factories(
        "127.0.0.1:9000",
        TransportMode::Tcp,
        &MockFactory::failing(Protocol::Quic),
        &MockFactory::serving(tcp.clone()),
    )
    .await
    .unwrap();

    assert!(!listener.is_dual());
    assert_eq!(listener.worker_count(), 0);
    assert_eq!(listener.addr(), tcp.local_addr());
    assert!(listener.quic_addr().is_none());

    tcp_tx.send(Ok(MockSession::boxed(Protocol::Tcp))).unwrap();
    let session = listener.accept().await.unwrap();
    assert_eq!(session.protocol(), Protocol::Tcp);
}

#[tokio::test]
async fn test_forced_mode_bind_failure_is_fatal() {
    let (tcp, _tcp_tx) = ChannelListener::new(Protocol::Tcp, 9000);
    let result = Listener::bind_with_factories(
        "127.0.0.1:9000",
        TransportMode::Quic,
        &MockFactory::failing(Protocol::Quic),
        &MockFactory::serving(tcp),
    )
    .await;

    match result {
        Err(TransportError::BindError { protocol, .. }) => assert_eq!(protocol, Protocol::Quic),
        other => panic!("unexpected result: {:?}", other.map(|l| l.mode())),
    }
}

#[tokio::test]
async fn test_auto_degrades_to_tcp_when_quic_bind_fails() {
    let (tcp, _tcp_tx) = ChannelListener::new(Protocol::Tcp, 9001);
    let listener = Listener::bind_with_factories(
        "127.0.0.1:9001",
        TransportMode::Auto,
        &MockFactory::failing(Protocol::Quic),
        &MockFactory::serving(tcp.clone()),
    )
    .await
    .unwrap();

    assert!(!listener.is_dual());
    assert_eq!(listener.addr(), tcp.local_addr());
    assert_eq!(listener.worker_count(), 0);
}

#[tokio::test]
async fn test_auto_tcp_bind_failure_closes_quic() {
    let (quic, _quic_tx) = ChannelListener::new(Protocol::Quic, 9002);
    let result = Listener::bind_with_factories(
        "127.0.0.1:9002",
        TransportMode::Auto,
        &MockFactory::serving(quic.clone()),
        &MockFactory::failing(Protocol::Tcp),
    )
    .await;

    match result {
        Err(TransportError::BindError { protocol, .. }) => assert_eq!(protocol, Protocol::Tcp),
        other => panic!("unexpected result: {:?}", other.map(|l| l.mode())),
    }
    assert_eq!(quic.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_auto_ephemeral_port_tries_quic_port_for_tcp() {
    let (quic, _quic_tx) = ChannelListener::new(Protocol::Quic, 45123);
    let (tcp, _tcp_tx) = ChannelListener::new(Protocol::Tcp, 45123);
    let tcp_factory = MockFactory::serving(tcp);

    let listener = Listener::bind_with_factories(
        "127.0.0.1:0",
        TransportMode::Auto,
        &MockFactory::serving(quic),
        &tcp_factory,
    )
    .await
    .unwrap();

    assert_eq!(tcp_factory.bind_addrs(), vec!["127.0.0.1:45123".to_string()]);
    assert_eq!(listener.addr().port(), 45123);
    listener.close().await.unwrap();
}

// Listener arbitration

#[tokio::test]
async fn test_dual_accept_returns_quic_only_sessions() {
    let (listener, quic_tx, _tcp_tx, _quic, _tcp) = dual_listener().await;
    assert!(listener.is_dual());
    assert_eq!(listener.worker_count(), 2);

    for _ in 0..5 {
        quic_tx.send(Ok(MockSession::boxed(Protocol::Quic))).unwrap();
        let session = timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("accept starved")
            .unwrap();
        assert_eq!(session.protocol(), Protocol::Quic);
    }

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_dual_accept_takes_either_transport() {
    let (listener, quic_tx, tcp_tx, _quic, _tcp) = dual_listener().await;

    tcp_tx.send(Ok(MockSession::boxed(Protocol::Tcp))).unwrap();
    quic_tx.send(Ok(MockSession::boxed(Protocol::Quic))).unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let session = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        seen.push(session.protocol());
    }
    seen.sort_by_key(|p| p.as_str());
    assert_eq!(seen, vec![Protocol::Quic, Protocol::Tcp]);

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_quic_error_falls_back_to_tcp_accept() {
    let (listener, quic_tx, tcp_tx, _quic, tcp) = dual_listener().await;
    let listener = Arc::new(listener);

    quic_tx
        .send(Err(TransportError::ConnectionError("udp socket gone".into())))
        .unwrap();

    let accept = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.accept().await })
    };

    // The TCP loop and the fallback call are both waiting on the TCP listener
    wait_for(|| tcp.accept_calls.load(Ordering::SeqCst) >= 2).await;
    tcp_tx.send(Ok(MockSession::boxed(Protocol::Tcp))).unwrap();
    tcp_tx.send(Ok(MockSession::boxed(Protocol::Tcp))).unwrap();

    let session = timeout(Duration::from_secs(5), accept)
        .await
        .expect("fallback accept hung")
        .unwrap()
        .unwrap();
    assert_eq!(session.protocol(), Protocol::Tcp);

    // The fallback is one-shot: the session buffered by the TCP loop is still served
    let buffered = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("buffered session lost")
        .unwrap();
    assert_eq!(buffered.protocol(), Protocol::Tcp);

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_accept_does_not_hang_when_both_loops_fail() {
    let (listener, quic_tx, tcp_tx, quic, tcp) = dual_listener().await;

    quic_tx
        .send(Err(TransportError::ConnectionError("quic down".into())))
        .unwrap();
    tcp_tx
        .send(Err(TransportError::ConnectionError("tcp down".into())))
        .unwrap();
    wait_for(|| listener.worker_count() == 0).await;

    // Nothing left to accept on either side
    quic.close().await.unwrap();
    tcp.close().await.unwrap();

    let result = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept hung");
    assert!(result.is_err());

    listener.close().await.unwrap();
}

// Listener close

#[tokio::test]
async fn test_close_stops_workers_and_releases_buffers() {
    let (listener, _quic_tx, _tcp_tx, quic, tcp) = dual_listener().await;
    assert_eq!(listener.worker_count(), 2);

    listener.close().await.unwrap();

    assert_eq!(listener.worker_count(), 0);
    assert!(listener.buffers_released().await);
    assert_eq!(quic.closes.load(Ordering::SeqCst), 1);
    assert_eq!(tcp.closes.load(Ordering::SeqCst), 1);

    let result = timeout(Duration::from_secs(1), listener.accept())
        .await
        .expect("accept after close hung");
    assert!(matches!(result, Err(TransportError::ListenerClosed)));

    // Second close is a no-op
    assert!(listener.close().await.is_ok());
    assert_eq!(quic.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_unblocks_pending_accept() {
    let (listener, _quic_tx, _tcp_tx, _quic, _tcp) = dual_listener().await;
    let listener = Arc::new(listener);

    let pending = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.accept().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    listener.close().await.unwrap();

    let result = timeout(Duration::from_secs(5), pending)
        .await
        .expect("pending accept hung")
        .unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_close_closes_unaccepted_sessions() {
    let (listener, quic_tx, _tcp_tx, quic, _tcp) = dual_listener().await;

    let (session, closes) = MockSession::tracked(Protocol::Quic);
    quic_tx.send(Ok(session)).unwrap();

    // Buffered once the QUIC loop is back waiting on its listener
    wait_for(|| quic.accept_calls.load(Ordering::SeqCst) >= 2).await;
    listener.close().await.unwrap();

    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_with_full_buffer_does_not_hang() {
    let (listener, quic_tx, _tcp_tx, _quic, _tcp) = dual_listener().await;

    // One more than the buffer holds, so the QUIC loop blocks on send
    let mut trackers = Vec::new();
    for _ in 0..crate::listener::SESSION_BUFFER + 1 {
        let (session, closes) = MockSession::tracked(Protocol::Quic);
        quic_tx.send(Ok(session)).unwrap();
        trackers.push(closes);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    timeout(Duration::from_secs(5), listener.close())
        .await
        .expect("close hung on a full buffer")
        .unwrap();
    assert_eq!(listener.worker_count(), 0);

    let closed = trackers
        .iter()
        .filter(|c| c.load(Ordering::SeqCst) == 1)
        .count();
    assert_eq!(closed, crate::listener::SESSION_BUFFER + 1);
}

#[tokio::test]
async fn test_drop_cancels_workers() {
    let (listener, _quic_tx, _tcp_tx, quic, tcp) = dual_listener().await;
    drop(listener);

    // Once the loops exit nothing else references the transport listeners
    wait_for(|| Arc::strong_count(&quic) == 1 && Arc::strong_count(&tcp) == 1).await;
}
