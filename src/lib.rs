//! Framegate - routing proxy for length-prefixed RPC traffic
//!
//! Clients append a 32-bit routing key to each framed request. The proxy
//! strips the key, picks a backend from a consistent-hash ring, forwards the
//! plain frame over a pooled connection and relays the response back.
pub mod client;
pub mod config;
pub mod core;
pub mod debug;
pub mod error;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::{Listener, ListenerStats, PoolStats, TcpDialer, Upstreams};
use crate::debug::DebugServer;
use crate::error::ProxyResult;

pub use crate::error::ProxyError;

/// Snapshot of proxy-wide statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub sessions_failed: u64,
    pub requests_proxied: u64,
    /// Pool statistics per backend address, in ring order
    pub backends: Vec<(String, PoolStats)>,
}

/// Cheap handle for reading statistics while the proxy runs
#[derive(Clone)]
pub struct StatsHandle {
    listener: Arc<ListenerStats>,
    upstreams: Arc<Upstreams<TcpDialer>>,
}

impl StatsHandle {
    pub fn snapshot(&self) -> ProxyStats {
        ProxyStats {
            connections_accepted: self.listener.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.listener.connections_active.load(Ordering::Relaxed),
            connections_closed: self.listener.connections_closed.load(Ordering::Relaxed),
            sessions_failed: self.listener.sessions_failed.load(Ordering::Relaxed),
            requests_proxied: self.listener.requests_proxied.load(Ordering::Relaxed),
            backends: self
                .upstreams
                .stats()
                .into_iter()
                .map(|(backend, stats)| (backend.to_string(), stats))
                .collect(),
        }
    }
}

/// A bound proxy instance
pub struct Framegate {
    config: Config,
    listener: Listener<TcpDialer>,
    debug: Option<DebugServer<TcpDialer>>,
}

impl Framegate {
    /// Validate `config`, build the ring and pools, and bind the listening
    /// sockets.
    ///
    /// # Errors
    ///
    /// A configuration error (including an empty backend list) or a bind
    /// failure; both are fatal to the process.
    pub async fn bind(config: Config) -> ProxyResult<Self> {
        let listen_addr = config.listen_addr();
        Self::bind_at(config, &listen_addr).await
    }

    async fn bind_at(config: Config, listen_addr: &str) -> ProxyResult<Self> {
        config.validate()?;

        let ring = config.ring();
        let dialer = Arc::new(TcpDialer::new(config.tcp_keepalive()));
        let upstreams = Arc::new(Upstreams::new(ring, dialer, config.pool_settings()));

        let listener =
            Listener::bind(listen_addr, Arc::clone(&upstreams), config.listener_settings())
                .await?;

        let debug = match config.debug_addr() {
            Some(addr) => Some(DebugServer::bind(&addr, listener.stats(), upstreams).await?),
            None => None,
        };

        info!(
            listen_addr = %listener.local_addr(),
            backends = ?config.proxy.backends,
            server_connection = config.proxy.server_connection,
            "Framegate ready"
        );

        Ok(Self {
            config,
            listener,
            debug,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn debug_addr(&self) -> Option<SocketAddr> {
        self.debug.as_ref().map(DebugServer::local_addr)
    }

    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle {
            listener: self.listener.stats(),
            upstreams: self.listener.upstreams(),
        }
    }

    /// Serve until `shutdown` resolves, then drain sessions and close pools
    pub async fn run<F>(self, shutdown: F) -> ProxyResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = shutdown.shared();

        let debug = self
            .debug
            .map(|server| tokio::spawn(server.run(shutdown.clone())));

        let result = self.listener.run(shutdown).await;

        if let Some(handle) = debug {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Debug endpoint stopped"),
                Err(e) => warn!(error = %e, "Debug endpoint task failed"),
            }
        }

        result
    }
}
