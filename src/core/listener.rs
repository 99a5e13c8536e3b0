//! Client-facing TCP listener.
//!
//! Accepts connections and runs one detached [`ProxySession`] per client.
//! An accept failure closes the socket but leaves established sessions running.
//! Shutdown stops accepting, asks every session to stop at its next frame
//! boundary, waits up to the drain timeout and then closes the backend pools.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use crate::core::backend::Upstreams;
use crate::core::connection::configure_client_stream;
use crate::core::pool::Dialer;
use crate::core::session::{ProxySession, SessionSettings};
use crate::error::{ErrorSeverity, ProxyError, ProxyResult};

/// Default time granted to sessions to finish after shutdown is requested.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Settings handed to every session.
    pub session: SessionSettings,
    /// Log every n-th accepted connection; 0 logs all of them.
    pub log_access_every: u64,
    /// Upper bound on waiting for sessions during shutdown.
    pub drain_timeout: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            log_access_every: 0,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Sessions currently running.
    pub connections_active: AtomicU64,
    /// Total sessions finished, cleanly or not.
    pub connections_closed: AtomicU64,
    /// Sessions ended by an error.
    pub sessions_failed: AtomicU64,
    /// Requests answered, counted as each response is relayed.
    pub requests_proxied: AtomicU64,
}

/// TCP listener feeding proxy sessions.
pub struct Listener<D: Dialer> {
    socket: TcpListener,
    sessions: Sessions<D>,
}

/// Everything the accept loop needs besides the socket itself.
struct Sessions<D: Dialer> {
    local_addr: SocketAddr,
    upstreams: Arc<Upstreams<D>>,
    settings: ListenerSettings,
    stats: Arc<ListenerStats>,
    drained: Arc<Notify>,
}

impl<D> Listener<D>
where
    D: Dialer,
    D::Conn: AsyncRead + AsyncWrite + Unpin,
{
    /// Bind the client-facing socket.
    ///
    /// # Errors
    ///
    /// `ProxyError::Bind` when the address cannot be bound.
    pub async fn bind(
        addr: &str,
        upstreams: Arc<Upstreams<D>>,
        settings: ListenerSettings,
    ) -> ProxyResult<Self> {
        let bind_error = |source: std::io::Error| ProxyError::Bind {
            addr: addr.to_string(),
            source,
        };
        let socket = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = socket.local_addr().map_err(bind_error)?;

        info!(
            bind_addr = %local_addr,
            backends = upstreams.ring().len(),
            "Listener bound"
        );

        Ok(Self {
            socket,
            sessions: Sessions {
                local_addr,
                upstreams,
                settings,
                stats: Arc::new(ListenerStats::default()),
                drained: Arc::new(Notify::new()),
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.sessions.local_addr
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.sessions.stats)
    }

    pub fn upstreams(&self) -> Arc<Upstreams<D>> {
        Arc::clone(&self.sessions.upstreams)
    }

    /// Accept connections until `shutdown` resolves, then drain.
    ///
    /// If accepting fails the socket is closed, so new clients are refused,
    /// but running sessions are left alone until `shutdown` resolves. The
    /// accept error is returned after the drain.
    pub async fn run<F>(self, shutdown: F) -> ProxyResult<()>
    where
        F: Future<Output = ()>,
    {
        let Self { socket, sessions } = self;
        let incoming = stream::unfold(socket, |socket| async move {
            let accepted = socket.accept().await;
            Some((accepted, socket))
        });
        sessions.serve(incoming, shutdown).await
    }
}

impl<D> Sessions<D>
where
    D: Dialer,
    D::Conn: AsyncRead + AsyncWrite + Unpin,
{
    async fn serve<I, F>(&self, incoming: I, shutdown: F) -> ProxyResult<()>
    where
        I: Stream<Item = io::Result<(TcpStream, SocketAddr)>>,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let (stop, _) = watch::channel(false);
        info!(bind_addr = %self.local_addr, "Listener started");

        // The socket lives inside `incoming` and is closed when this block ends
        let accept_error = {
            tokio::pin!(incoming);
            let mut next_id: u64 = 0;
            loop {
                tokio::select! {
                    _ = &mut shutdown => break None,
                    accepted = incoming.next() => match accepted {
                        Some(Ok((stream, peer))) => {
                            self.spawn_session(stream, peer, next_id, stop.subscribe());
                            next_id += 1;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Accept failed, no longer accepting connections");
                            break Some(e);
                        }
                        None => {
                            error!("Listener socket closed, no longer accepting connections");
                            break Some(io::Error::new(io::ErrorKind::Other, "listener closed"));
                        }
                    },
                }
            }
        };

        if accept_error.is_some() {
            (&mut shutdown).await;
        }

        self.drain(&stop).await;
        accept_error.map_or(Ok(()), |e| Err(ProxyError::Io(e)))
    }

    fn spawn_session(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        id: u64,
        shutdown: watch::Receiver<bool>,
    ) {
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);

        if should_log_access(id, self.settings.log_access_every) {
            info!(id, peer = %peer, local = %self.local_addr, "Accepted connection");
        }

        if let Err(e) = configure_client_stream(&stream) {
            debug!(peer = %peer, error = %e, "Failed to configure client stream");
        }

        let active = ActiveSession::enter(Arc::clone(&self.stats), Arc::clone(&self.drained));
        let session = ProxySession::new(
            stream,
            Arc::clone(&self.upstreams),
            self.settings.session.clone(),
        )
        .with_shutdown(shutdown)
        .with_listener_stats(Arc::clone(&self.stats));
        let stats = Arc::clone(&self.stats);

        tokio::spawn(
            async move {
                match session.run().await {
                    Ok(summary) => debug!(requests = summary.requests, "Session finished"),
                    Err(e) => {
                        stats.sessions_failed.fetch_add(1, Ordering::Relaxed);
                        log_session_error(&e);
                    }
                }
                drop(active);
            }
            .instrument(tracing::info_span!("session", id, peer = %peer)),
        );
    }

    async fn drain(&self, stop: &watch::Sender<bool>) {
        stop.send_replace(true);

        let active = self.stats.connections_active.load(Ordering::SeqCst);
        if active > 0 {
            info!(active, timeout_ms = self.settings.drain_timeout.as_millis() as u64, "Draining sessions");
        }

        if timeout(self.settings.drain_timeout, self.wait_drained())
            .await
            .is_err()
        {
            warn!(
                remaining = self.stats.connections_active.load(Ordering::SeqCst),
                "Drain timeout elapsed with sessions still running"
            );
        }

        self.upstreams.close();
        info!("Listener stopped");
    }

    async fn wait_drained(&self) {
        loop {
            let drained = self.drained.notified();
            if self.stats.connections_active.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// Counts a running session; dropping it wakes the drain once none are left.
struct ActiveSession {
    stats: Arc<ListenerStats>,
    drained: Arc<Notify>,
}

impl ActiveSession {
    fn enter(stats: Arc<ListenerStats>, drained: Arc<Notify>) -> Self {
        stats.connections_active.fetch_add(1, Ordering::SeqCst);
        Self { stats, drained }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.stats
            .connections_closed
            .fetch_add(1, Ordering::Relaxed);
        if self.stats.connections_active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

fn should_log_access(id: u64, every: u64) -> bool {
    every == 0 || id % every == 0
}

fn log_session_error(err: &ProxyError) {
    match err.severity() {
        ErrorSeverity::Critical | ErrorSeverity::Error => {
            error!(error = %err, "Session terminated")
        }
        ErrorSeverity::Warning => warn!(error = %err, "Session terminated"),
        ErrorSeverity::Info => debug!(error = %err, "Session terminated"),
    }
}
