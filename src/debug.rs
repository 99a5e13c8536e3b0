//! Plain-text stats endpoint
//!
//! Every connection receives one snapshot of listener counters and
//! per-backend pool statistics as `key value` lines, then is closed.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::core::{Dialer, ListenerStats, Upstreams};
use crate::error::{ProxyError, ProxyResult};

pub struct DebugServer<D: Dialer> {
    listener: TcpListener,
    local_addr: SocketAddr,
    stats: Arc<ListenerStats>,
    upstreams: Arc<Upstreams<D>>,
}

impl<D: Dialer> DebugServer<D> {
    pub async fn bind(
        addr: &str,
        stats: Arc<ListenerStats>,
        upstreams: Arc<Upstreams<D>>,
    ) -> ProxyResult<Self> {
        let bind_error = |source: std::io::Error| ProxyError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        info!(bind_addr = %local_addr, "Debug endpoint bound");

        Ok(Self {
            listener,
            local_addr,
            stats,
            upstreams,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve snapshots until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> ProxyResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let (mut stream, peer) = tokio::select! {
                _ = &mut shutdown => return Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Debug endpoint accept failed");
                        return Err(ProxyError::Io(e));
                    }
                },
            };

            let body = render_stats(&self.stats, &self.upstreams);
            tokio::spawn(async move {
                if let Err(e) = stream.write_all(body.as_bytes()).await {
                    debug!(peer = %peer, error = %e, "Failed to write stats");
                }
                let _ = stream.shutdown().await;
            });
        }
    }
}

/// Render a stats snapshot as `key value` lines
pub fn render_stats<D: Dialer>(stats: &ListenerStats, upstreams: &Upstreams<D>) -> String {
    let mut lines = vec![
        format!("connections_accepted {}", stats.connections_accepted.load(Ordering::Relaxed)),
        format!("connections_active {}", stats.connections_active.load(Ordering::Relaxed)),
        format!("connections_closed {}", stats.connections_closed.load(Ordering::Relaxed)),
        format!("sessions_failed {}", stats.sessions_failed.load(Ordering::Relaxed)),
        format!("requests_proxied {}", stats.requests_proxied.load(Ordering::Relaxed)),
        format!("backends {}", upstreams.ring().len()),
    ];

    for (backend, pool) in upstreams.stats() {
        let counters: [(&str, u64); 7] = [
            ("live", pool.live as u64),
            ("idle", pool.idle as u64),
            ("created", pool.created),
            ("reused", pool.reused),
            ("evicted", pool.evicted),
            ("dial_failures", pool.dial_failures),
            ("waits", pool.waits),
        ];
        for (name, value) in counters {
            lines.push(format!("pool_{}{{backend=\"{}\"}} {}", name, backend, value));
        }
    }

    let mut body = lines.join("\n");
    body.push('\n');
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Backend, BackendRing, PoolSettings, TcpDialer};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn upstreams(addrs: &[&str]) -> Arc<Upstreams<TcpDialer>> {
        let ring = BackendRing::new(addrs.iter().map(|a| Backend::new(*a)));
        Arc::new(Upstreams::new(
            ring,
            Arc::new(TcpDialer::default()),
            PoolSettings::default(),
        ))
    }

    #[test]
    fn test_render_stats() {
        let stats = ListenerStats::default();
        stats.connections_accepted.store(3, Ordering::Relaxed);
        stats.requests_proxied.store(12, Ordering::Relaxed);

        let body = render_stats(&stats, &upstreams(&["127.0.0.1:9001", "127.0.0.1:9002"]));

        assert!(body.contains("connections_accepted 3\n"));
        assert!(body.contains("requests_proxied 12\n"));
        assert!(body.contains("backends 2\n"));
        assert!(body.contains("pool_live{backend=\"127.0.0.1:9001\"} 0\n"));
        assert!(body.contains("pool_evicted{backend=\"127.0.0.1:9002\"} 0\n"));
        assert!(body
            .lines()
            .all(|line| line.split(' ').count() == 2));
    }

    #[tokio::test]
    async fn test_serves_snapshot_and_closes() {
        let stats = Arc::new(ListenerStats::default());
        stats.sessions_failed.store(2, Ordering::Relaxed);
        let server = DebugServer::bind("127.0.0.1:0", stats, upstreams(&["127.0.0.1:9001"]))
            .await
            .unwrap();
        let addr = server.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async {
            let _ = rx.await;
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut body = String::new();
        client.read_to_string(&mut body).await.unwrap();
        assert!(body.contains("sessions_failed 2\n"));

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
