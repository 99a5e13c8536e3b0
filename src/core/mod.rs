//! Core data path: framing, routing, pooling and the per-connection session

pub mod backend;
pub mod codec;
pub mod connection;
pub mod listener;
pub mod pool;
pub mod ring;
pub mod session;

pub use backend::Upstreams;
pub use codec::{ClientFrame, FrameCodec};
pub use connection::TcpDialer;
pub use listener::{Listener, ListenerSettings, ListenerStats};
pub use pool::{BackendPool, Dialer, PoolSettings, PoolStats, PooledConnection};
pub use ring::BackendRing;
pub use session::{ProxySession, SessionSettings, SessionStats};

use std::fmt;

/// A backend RPC server. Identity is its configured address string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Backend {
    addr: String,
}

impl Backend {
    pub fn new<S: Into<String>>(addr: S) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

impl From<&str> for Backend {
    fn from(addr: &str) -> Self {
        Backend::new(addr)
    }
}
