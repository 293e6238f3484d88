//! Listener orchestrator
//!
//! A dual-mode listener runs one accept loop per transport. Each loop feeds
//! a bounded session buffer and, when its transport listener fails, a
//! single-slot error buffer. `accept` waits on all four buffers at once and
//! takes whichever is ready first.

use dualmux_transport::{
    addr, first_failure, Session, TransportError, TransportFactory, TransportListener,
    TransportMode, TransportResult,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Capacity of each per-transport session buffer
pub const SESSION_BUFFER: usize = 10;
/// Capacity of each per-transport error buffer
pub const ERROR_BUFFER: usize = 1;

struct Buffers {
    quic_sessions: mpsc::Receiver<Session>,
    tcp_sessions: mpsc::Receiver<Session>,
    quic_errors: mpsc::Receiver<TransportError>,
    tcp_errors: mpsc::Receiver<TransportError>,
    quic_live: bool,
    tcp_live: bool,
    quic_errors_live: bool,
    tcp_errors_live: bool,
}

enum Bound {
    Quic(Arc<dyn TransportListener>),
    Tcp(Arc<dyn TransportListener>),
    Dual {
        quic: Arc<dyn TransportListener>,
        tcp: Arc<dyn TransportListener>,
        buffers: Mutex<Buffers>,
    },
}

/// Which way a single `accept` call is routed after arbitration
enum Route {
    Ready(Session),
    Quic,
    Tcp,
}

/// Accepts sessions over QUIC, TCP, or both
pub struct Listener {
    mode: TransportMode,
    bound: Bound,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("mode", &self.mode)
            .field("quic_addr", &self.quic_addr())
            .field("tcp_addr", &self.tcp_addr())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Listener {
    /// Bind on `bind_addr` according to `config.mode`
    pub async fn bind(bind_addr: &str, config: &Config) -> TransportResult<Self> {
        let quic = config.quic_factory();
        let tcp = config.tcp_factory();
        Self::bind_with_factories(bind_addr, config.mode, &quic, &tcp).await
    }

    /// Bind using the given transport factories
    ///
    /// In forced modes a bind failure is returned as is. In auto mode a QUIC
    /// bind failure only degrades the listener to TCP, while a TCP bind
    /// failure closes the QUIC listener and is returned.
    pub async fn bind_with_factories(
        bind_addr: &str,
        mode: TransportMode,
        quic: &dyn TransportFactory,
        tcp: &dyn TransportFactory,
    ) -> TransportResult<Self> {
        match mode {
            TransportMode::Quic => {
                let listener = quic.create_listener(bind_addr).await?;
                Ok(Self::single(mode, Bound::Quic(listener)))
            }
            TransportMode::Tcp => {
                let listener = tcp.create_listener(bind_addr).await?;
                Ok(Self::single(mode, Bound::Tcp(listener)))
            }
            TransportMode::Auto => {
                let quic_listener = match quic.create_listener(bind_addr).await {
                    Ok(listener) => Some(listener),
                    Err(e) => {
                        warn!("QUIC listen on {} failed: {}, serving TCP only", bind_addr, e);
                        None
                    }
                };

                let tcp_listener =
                    match bind_tcp(bind_addr, quic_listener.as_deref(), tcp).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            if let Some(quic_listener) = &quic_listener {
                                if let Err(close_err) = quic_listener.close().await {
                                    debug!("Closing QUIC listener failed: {}", close_err);
                                }
                            }
                            return Err(e);
                        }
                    };

                match quic_listener {
                    Some(quic_listener) => Ok(Self::dual(quic_listener, tcp_listener)),
                    None => Ok(Self::single(mode, Bound::Tcp(tcp_listener))),
                }
            }
        }
    }

    fn single(mode: TransportMode, bound: Bound) -> Self {
        Self {
            mode,
            bound,
            workers: std::sync::Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    fn dual(quic: Arc<dyn TransportListener>, tcp: Arc<dyn TransportListener>) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let (quic_session_tx, quic_sessions) = mpsc::channel(SESSION_BUFFER);
        let (tcp_session_tx, tcp_sessions) = mpsc::channel(SESSION_BUFFER);
        let (quic_error_tx, quic_errors) = mpsc::channel(ERROR_BUFFER);
        let (tcp_error_tx, tcp_errors) = mpsc::channel(ERROR_BUFFER);

        let workers = vec![
            tokio::spawn(accept_loop(
                quic.clone(),
                quic_session_tx,
                quic_error_tx,
                closed.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(accept_loop(
                tcp.clone(),
                tcp_session_tx,
                tcp_error_tx,
                closed.clone(),
                shutdown.clone(),
            )),
        ];

        info!(
            "Listening on {} (QUIC) and {} (TCP)",
            quic.local_addr(),
            tcp.local_addr()
        );

        Self {
            mode: TransportMode::Auto,
            bound: Bound::Dual {
                quic,
                tcp,
                buffers: Mutex::new(Buffers {
                    quic_sessions,
                    tcp_sessions,
                    quic_errors,
                    tcp_errors,
                    quic_live: true,
                    tcp_live: true,
                    quic_errors_live: true,
                    tcp_errors_live: true,
                }),
            },
            workers: std::sync::Mutex::new(workers),
            closed,
            shutdown,
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Whether both transports are being served
    pub fn is_dual(&self) -> bool {
        matches!(self.bound, Bound::Dual { .. })
    }

    /// The QUIC listener's address if there is one, else the TCP listener's
    pub fn addr(&self) -> SocketAddr {
        match &self.bound {
            Bound::Quic(listener) | Bound::Tcp(listener) => listener.local_addr(),
            Bound::Dual { quic, .. } => quic.local_addr(),
        }
    }

    pub fn quic_addr(&self) -> Option<SocketAddr> {
        match &self.bound {
            Bound::Quic(listener) | Bound::Dual { quic: listener, .. } => {
                Some(listener.local_addr())
            }
            Bound::Tcp(_) => None,
        }
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        match &self.bound {
            Bound::Tcp(listener) | Bound::Dual { tcp: listener, .. } => {
                Some(listener.local_addr())
            }
            Bound::Quic(_) => None,
        }
    }

    /// Number of accept loops still running
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .map(|workers| workers.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Wait for the next session from any bound transport
    pub async fn accept(&self) -> TransportResult<Session> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ListenerClosed);
        }

        match &self.bound {
            Bound::Quic(listener) | Bound::Tcp(listener) => listener.accept().await,
            Bound::Dual { quic, tcp, buffers } => {
                match self.arbitrate(buffers).await? {
                    Route::Ready(session) => Ok(session),
                    Route::Quic => quic.accept().await,
                    Route::Tcp => tcp.accept().await,
                }
            }
        }
    }

    async fn arbitrate(&self, buffers: &Mutex<Buffers>) -> TransportResult<Route> {
        let mut guard = buffers.lock().await;
        let b = &mut *guard;

        loop {
            // Both loops are gone; hand the call to TCP as the safety net
            if !b.quic_live && !b.tcp_live {
                return Ok(Route::Tcp);
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(TransportError::ListenerClosed),
                session = b.quic_sessions.recv(), if b.quic_live => match session {
                    Some(session) => return Ok(Route::Ready(session)),
                    None => {
                        debug!("QUIC accept loop finished, continuing with TCP");
                        b.quic_live = false;
                    }
                },
                session = b.tcp_sessions.recv(), if b.tcp_live => match session {
                    Some(session) => return Ok(Route::Ready(session)),
                    None => {
                        debug!("TCP accept loop finished, continuing with QUIC");
                        b.tcp_live = false;
                    }
                },
                err = b.quic_errors.recv(), if b.quic_errors_live => match err {
                    Some(e) => {
                        warn!("QUIC accept failed: {}, falling back to TCP", e);
                        return Ok(Route::Tcp);
                    }
                    None => b.quic_errors_live = false,
                },
                err = b.tcp_errors.recv(), if b.tcp_errors_live => match err {
                    Some(e) => {
                        warn!("TCP accept failed: {}, falling back to QUIC", e);
                        return Ok(Route::Quic);
                    }
                    None => b.tcp_errors_live = false,
                },
            }
        }
    }

    /// Stop accepting and release every resource
    ///
    /// Closes the transport listeners, waits for the accept loops to exit,
    /// closes sessions nobody accepted, then closes the buffers. Only the
    /// first listener close error is returned. Calling `close` again returns
    /// `Ok(())` immediately.
    pub async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        let result = match &self.bound {
            Bound::Quic(listener) | Bound::Tcp(listener) => listener.close().await,
            Bound::Dual { quic, tcp, .. } => {
                let quic_result = quic.close().await;
                let tcp_result = tcp.close().await;
                first_failure([quic_result, tcp_result])
            }
        };

        let workers: Vec<_> = self
            .workers
            .lock()
            .map(|mut workers| workers.drain(..).collect())
            .unwrap_or_default();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }

        if let Bound::Dual { buffers, .. } = &self.bound {
            let mut b = buffers.lock().await;
            b.quic_sessions.close();
            b.tcp_sessions.close();
            b.quic_errors.close();
            b.tcp_errors.close();

            let mut leftovers = Vec::new();
            while let Ok(session) = b.quic_sessions.try_recv() {
                leftovers.push(session);
            }
            while let Ok(session) = b.tcp_sessions.try_recv() {
                leftovers.push(session);
            }
            while let Ok(e) = b.quic_errors.try_recv() {
                debug!("Discarding QUIC accept error after close: {}", e);
            }
            while let Ok(e) = b.tcp_errors.try_recv() {
                debug!("Discarding TCP accept error after close: {}", e);
            }
            b.quic_live = false;
            b.tcp_live = false;
            b.quic_errors_live = false;
            b.tcp_errors_live = false;
            drop(b);

            for session in leftovers {
                debug!("Closing unaccepted {} session", session.protocol());
                if let Err(e) = session.close().await {
                    debug!("Closing unaccepted session failed: {}", e);
                }
            }
        }

        info!("Listener on {} closed", self.addr());
        result
    }

    /// Whether every internal buffer is closed and empty
    #[cfg(test)]
    pub(crate) async fn buffers_released(&self) -> bool {
        use tokio::sync::mpsc::error::TryRecvError;

        match &self.bound {
            Bound::Dual { buffers, .. } => {
                let mut b = buffers.lock().await;
                matches!(b.quic_sessions.try_recv(), Err(TryRecvError::Disconnected))
                    && matches!(b.tcp_sessions.try_recv(), Err(TryRecvError::Disconnected))
                    && matches!(b.quic_errors.try_recv(), Err(TryRecvError::Disconnected))
                    && matches!(b.tcp_errors.try_recv(), Err(TryRecvError::Disconnected))
            }
            _ => true,
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Bind TCP, preferring QUIC's port when the caller asked for an ephemeral one
async fn bind_tcp(
    bind_addr: &str,
    quic: Option<&dyn TransportListener>,
    tcp: &dyn TransportFactory,
) -> TransportResult<Arc<dyn TransportListener>> {
    let same_port = quic
        .filter(|_| addr::is_ephemeral(bind_addr))
        .and_then(|quic| addr::with_port(bind_addr, quic.local_addr().port()));

    if let Some(same_port) = same_port {
        match tcp.create_listener(&same_port).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!("TCP bind on {} failed: {}, using {}", same_port, e, bind_addr),
        }
    }
    tcp.create_listener(bind_addr).await
}

async fn accept_loop(
    listener: Arc<dyn TransportListener>,
    sessions: mpsc::Sender<Session>,
    errors: mpsc::Sender<TransportError>,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let protocol = listener.protocol();

    while !closed.load(Ordering::SeqCst) {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let session = match accepted {
            Ok(session) => session,
            Err(e) => {
                debug!("{} accept loop stopping: {}", protocol, e);
                let _ = errors.send(e).await;
                break;
            }
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => None,
            permit = sessions.reserve() => permit.ok(),
        };
        match permit {
            Some(permit) => permit.send(session),
            None => {
                if let Err(e) = session.close().await {
                    debug!("Closing undelivered {} session failed: {}", protocol, e);
                }
                break;
            }
        }
    }
}
