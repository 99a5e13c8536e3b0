/// Per-client-connection proxy loop
///
/// A session alternates between reading one client request and proxying it:
/// select the backend from the routing key, check out a pooled connection,
/// forward the payload, read the reply, hand the connection back, and relay
/// the reply. Any failure ends the session and closes the client. A backend
/// connection that saw a failure is evicted, never returned.
///
/// The client socket is read unbuffered, so the next request is not touched
/// until the previous response has been fully written.
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::core::backend::Upstreams;
use crate::core::codec::{ClientFrame, FrameCodec};
use crate::core::listener::ListenerStats;
use crate::core::pool::Dialer;
use crate::error::{ProxyError, ProxyResult};

/// Settings shared by every session of a listener
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub codec: FrameCodec,
    /// Deadline for the next client request and for writing a response
    pub client_idle_timeout: Option<Duration>,
    /// Deadline for forwarding a request and reading its response
    pub backend_io_timeout: Option<Duration>,
}

/// Counters for one finished session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub requests: u64,
    pub bytes_from_client: u64,
    pub bytes_to_client: u64,
}

pub struct ProxySession<S, D: Dialer> {
    client: S,
    upstreams: Arc<Upstreams<D>>,
    settings: SessionSettings,
    shutdown: Option<watch::Receiver<bool>>,
    listener_stats: Option<Arc<ListenerStats>>,
    stats: SessionStats,
}

impl<S, D> ProxySession<S, D>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: Dialer,
    D::Conn: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(client: S, upstreams: Arc<Upstreams<D>>, settings: SessionSettings) -> Self {
        Self {
            client,
            upstreams,
            settings,
            shutdown: None,
            listener_stats: None,
            stats: SessionStats::default(),
        }
    }

    /// Stop at the next frame boundary once `shutdown` turns true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Count every answered request in `stats` as soon as it is relayed
    pub fn with_listener_stats(mut self, stats: Arc<ListenerStats>) -> Self {
        self.listener_stats = Some(stats);
        self
    }

    /// Run until the client disconnects, shutdown is requested, or an error
    /// ends the session. The client connection is closed on return.
    pub async fn run(mut self) -> ProxyResult<SessionStats> {
        loop {
            let frame = match self.read_request().await? {
                Some(frame) => frame,
                None => return Ok(self.stats),
            };
            self.stats.bytes_from_client += frame.payload.len() as u64;

            let response = round_trip(&self.upstreams, &self.settings, frame).await?;
            self.write_response(&response).await?;

            self.stats.requests += 1;
            self.stats.bytes_to_client += response.len() as u64;
            if let Some(stats) = &self.listener_stats {
                stats.requests_proxied.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn read_request(&mut self) -> ProxyResult<Option<ClientFrame>> {
        let codec = self.settings.codec;
        let read = with_deadline(
            self.settings.client_idle_timeout,
            "client read",
            codec.decode_client_frame(&mut self.client),
        );

        let frame = match self.shutdown.as_mut() {
            Some(shutdown) => {
                tokio::select! {
                    frame = read => frame?,
                    _ = shutdown_requested(shutdown) => {
                        debug!("Shutdown requested, closing client connection");
                        return Ok(None);
                    }
                }
            }
            None => read.await?,
        };

        if frame.is_none() {
            debug!("Client closed connection");
        }
        Ok(frame)
    }

    async fn write_response(&mut self, response: &[u8]) -> ProxyResult<()> {
        let codec = self.settings.codec;
        with_deadline(
            self.settings.client_idle_timeout,
            "client write",
            codec.encode_frame(&mut self.client, response),
        )
        .await
    }
}

/// Forward one request to the backend owning its routing key and read the reply
async fn round_trip<D>(
    upstreams: &Upstreams<D>,
    settings: &SessionSettings,
    frame: ClientFrame,
) -> ProxyResult<Bytes>
where
    D: Dialer,
    D::Conn: AsyncRead + AsyncWrite + Unpin,
{
    let pool = upstreams.select(frame.routing_key)?;
    let mut conn = pool.acquire().await?;
    trace!(
        backend = %pool.backend(),
        key = frame.routing_key,
        len = frame.payload.len(),
        reused = conn.is_reused(),
        "Forwarding request"
    );

    let codec = settings.codec;
    let exchange = async {
        codec.encode_frame(conn.get_mut(), &frame.payload).await?;
        codec.decode_backend_frame(conn.get_mut()).await
    };

    match with_deadline(settings.backend_io_timeout, "backend round trip", exchange).await {
        Ok(response) => {
            conn.release();
            Ok(response)
        }
        Err(e) => {
            debug!(backend = %pool.backend(), error = %e, "Backend round trip failed, evicting connection");
            conn.evict();
            Err(e)
        }
    }
}

async fn with_deadline<F, T, E>(
    limit: Option<Duration>,
    operation: &'static str,
    fut: F,
) -> ProxyResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ProxyError>,
{
    match limit {
        Some(limit) => match timeout(limit, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(ProxyError::timeout(operation)),
        },
        None => fut.await.map_err(Into::into),
    }
}

/// Resolves once shutdown is signalled. A dropped sender is not a shutdown:
/// sessions outlive a listener whose accept loop failed.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::PoolSettings;
    use crate::core::{Backend, BackendRing};
    use crate::error::{FrameError, PoolError, RoutingError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_test::io::{Builder, Mock};

    const BACKEND: &str = "127.0.0.1:9090";

    struct MockDialer {
        conns: Mutex<VecDeque<Mock>>,
        dials: AtomicUsize,
    }

    impl MockDialer {
        fn new(conns: Vec<Mock>) -> Arc<Self> {
            Arc::new(Self {
                conns: Mutex::new(conns.into()),
                dials: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Dialer for MockDialer {
        type Conn = Mock;

        async fn dial(&self, _backend: &Backend) -> io::Result<Mock> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            self.conns
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    fn upstreams(dialer: Arc<MockDialer>, backends: &[&str]) -> Arc<Upstreams<MockDialer>> {
        let ring = BackendRing::new(backends.iter().map(|b| Backend::new(*b)));
        let settings = PoolSettings {
            max_connections: 1,
            ..PoolSettings::default()
        };
        Arc::new(Upstreams::new(ring, dialer, settings))
    }

    fn request(payload: &[u8], key: u32) -> Vec<u8> {
        FrameCodec::default()
            .client_request_frame(payload, key)
            .unwrap()
            .to_vec()
    }

    fn plain(payload: &[u8]) -> Vec<u8> {
        FrameCodec::default().frame(payload).unwrap().to_vec()
    }

    fn pool_stats(upstreams: &Upstreams<MockDialer>) -> crate::core::PoolStats {
        upstreams.pool(&Backend::new(BACKEND)).unwrap().stats()
    }

    async fn run_session(
        client: Mock,
        upstreams: Arc<Upstreams<MockDialer>>,
        settings: SessionSettings,
    ) -> ProxyResult<SessionStats> {
        let session = ProxySession::new(client, upstreams, settings);
        timeout(Duration::from_secs(5), session.run())
            .await
            .expect("session hung")
    }

    #[tokio::test]
    async fn test_requests_are_strictly_sequential() {
        // The client mock only yields the second request after the first
        // response was written; reading ahead would stall the session.
        let client = Builder::new()
            .read(&request(b"abc", 1234))
            .write(&plain(b"cba"))
            .read(&request(b"hello", 2345))
            .write(&plain(b"olleh"))
            .build();
        let backend = Builder::new()
            .write(&plain(b"abc"))
            .read(&plain(b"cba"))
            .write(&plain(b"hello"))
            .read(&plain(b"olleh"))
            .build();
        let dialer = MockDialer::new(vec![backend]);
        let upstreams = upstreams(Arc::clone(&dialer), &[BACKEND]);

        let stats = run_session(client, Arc::clone(&upstreams), SessionSettings::default())
            .await
            .unwrap();

        assert_eq!(stats.requests, 2);
        assert_eq!(stats.bytes_from_client, 8);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

        let pool = pool_stats(&upstreams);
        assert_eq!(pool.reused, 1);
        assert_eq!(pool.idle, 1);
    }

    #[tokio::test]
    async fn test_backend_write_failure_evicts() {
        let client = Builder::new().read(&request(b"abc", 1)).build();
        let backend = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let upstreams = upstreams(MockDialer::new(vec![backend]), &[BACKEND]);

        let err = run_session(client, Arc::clone(&upstreams), SessionSettings::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::Frame(FrameError::Io(_))));
        let pool = pool_stats(&upstreams);
        assert_eq!(pool.evicted, 1);
        assert_eq!(pool.live, 0);
    }

    #[tokio::test]
    async fn test_backend_close_mid_response_evicts() {
        let client = Builder::new().read(&request(b"abc", 1)).build();
        let mut partial = plain(b"cba");
        partial.truncate(5);
        let backend = Builder::new().write(&plain(b"abc")).read(&partial).build();
        let upstreams = upstreams(MockDialer::new(vec![backend]), &[BACKEND]);

        let err = run_session(client, Arc::clone(&upstreams), SessionSettings::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProxyError::Frame(FrameError::Truncated { expected: 3 })
        ));
        let pool = pool_stats(&upstreams);
        assert_eq!(pool.evicted, 1);
        assert_eq!(pool.idle, 0);
    }

    #[tokio::test]
    async fn test_oversized_backend_response_evicts() {
        let client = Builder::new().read(&request(b"abc", 1)).build();
        let backend = Builder::new()
            .write(&plain(b"abc"))
            .read(&64u32.to_be_bytes())
            .build();
        let upstreams = upstreams(MockDialer::new(vec![backend]), &[BACKEND]);
        let settings = SessionSettings {
            codec: FrameCodec::new(32),
            ..SessionSettings::default()
        };

        let err = run_session(client, Arc::clone(&upstreams), settings)
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::Frame(FrameError::TooLarge { .. })));
        assert_eq!(pool_stats(&upstreams).evicted, 1);
    }

    #[tokio::test]
    async fn test_client_write_failure_keeps_backend_connection() {
        let client = Builder::new()
            .read(&request(b"abc", 1))
            .write_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let backend = Builder::new()
            .write(&plain(b"abc"))
            .read(&plain(b"cba"))
            .build();
        let upstreams = upstreams(MockDialer::new(vec![backend]), &[BACKEND]);

        let err = run_session(client, Arc::clone(&upstreams), SessionSettings::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::Frame(FrameError::Io(_))));
        let pool = pool_stats(&upstreams);
        assert_eq!(pool.evicted, 0);
        assert_eq!(pool.idle, 1);
    }

    #[tokio::test]
    async fn test_answered_requests_count_before_client_reset() {
        let client = Builder::new()
            .read(&request(b"abc", 1))
            .write(&plain(b"cba"))
            .read(&request(b"hello", 1))
            .write(&plain(b"olleh"))
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let backend = Builder::new()
            .write(&plain(b"abc"))
            .read(&plain(b"cba"))
            .write(&plain(b"hello"))
            .read(&plain(b"olleh"))
            .build();
        let upstreams = upstreams(MockDialer::new(vec![backend]), &[BACKEND]);
        let listener_stats = Arc::new(ListenerStats::default());

        let session = ProxySession::new(client, upstreams, SessionSettings::default())
            .with_listener_stats(Arc::clone(&listener_stats));
        let err = timeout(Duration::from_secs(5), session.run())
            .await
            .expect("session hung")
            .unwrap_err();

        assert!(matches!(err, ProxyError::Frame(FrameError::Io(_))));
        assert_eq!(listener_stats.requests_proxied.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_no_backend_ends_session() {
        let client = Builder::new().read(&request(b"abc", 77)).build();
        let upstreams = upstreams(MockDialer::new(Vec::new()), &[]);

        let err = run_session(client, upstreams, SessionSettings::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProxyError::Routing(RoutingError::NoBackend { key: 77 })
        ));
    }

    #[tokio::test]
    async fn test_dial_failure_ends_session() {
        let client = Builder::new().read(&request(b"abc", 1)).build();
        let dialer = MockDialer::new(Vec::new());
        let upstreams = upstreams(Arc::clone(&dialer), &[BACKEND]);

        let err = run_session(client, upstreams, SessionSettings::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::Pool(PoolError::DialFailed { .. })));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_frame_never_reaches_backend() {
        let client = Builder::new().read(&[0, 0, 0, 2]).build();
        let dialer = MockDialer::new(Vec::new());
        let upstreams = upstreams(Arc::clone(&dialer), &[BACKEND]);

        let err = run_session(client, upstreams, SessionSettings::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::Frame(FrameError::TooShort { len: 2 })));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backend_timeout_evicts() {
        let client = Builder::new().read(&request(b"abc", 1)).build();
        let backend = Builder::new()
            .write(&plain(b"abc"))
            .wait(Duration::from_secs(2))
            .build();
        let upstreams = upstreams(MockDialer::new(vec![backend]), &[BACKEND]);
        let settings = SessionSettings {
            backend_io_timeout: Some(Duration::from_millis(50)),
            ..SessionSettings::default()
        };

        let err = run_session(client, Arc::clone(&upstreams), settings)
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::Timeout { .. }));
        assert_eq!(pool_stats(&upstreams).evicted, 1);
    }

    #[tokio::test]
    async fn test_idle_client_times_out() {
        let client = Builder::new().wait(Duration::from_secs(2)).build();
        let upstreams = upstreams(MockDialer::new(Vec::new()), &[BACKEND]);
        let settings = SessionSettings {
            client_idle_timeout: Some(Duration::from_millis(50)),
            ..SessionSettings::default()
        };

        let err = run_session(client, upstreams, settings).await.unwrap_err();
        assert!(matches!(err, ProxyError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_stops_at_frame_boundary() {
        let client = Builder::new()
            .read(&request(b"abc", 1))
            .write(&plain(b"cba"))
            .wait(Duration::from_secs(2))
            .build();
        let backend = Builder::new()
            .write(&plain(b"abc"))
            .read(&plain(b"cba"))
            .build();
        let upstreams = upstreams(MockDialer::new(vec![backend]), &[BACKEND]);
        let (tx, rx) = watch::channel(false);

        let session = ProxySession::new(client, upstreams, SessionSettings::default())
            .with_shutdown(rx);
        let handle = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let stats = timeout(Duration::from_secs(1), handle)
            .await
            .expect("session ignored shutdown")
            .unwrap()
            .unwrap();
        assert_eq!(stats.requests, 1);
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_is_not_shutdown() {
        let client = Builder::new()
            .read(&request(b"abc", 1))
            .write(&plain(b"cba"))
            .build();
        let backend = Builder::new()
            .write(&plain(b"abc"))
            .read(&plain(b"cba"))
            .build();
        let upstreams = upstreams(MockDialer::new(vec![backend]), &[BACKEND]);
        let (tx, rx) = watch::channel(false);
        drop(tx);

        let session = ProxySession::new(client, upstreams, SessionSettings::default())
            .with_shutdown(rx);
        let stats = timeout(Duration::from_secs(5), session.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.requests, 1);
    }
}
