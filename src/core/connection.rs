/// TCP socket setup for client and backend connections
///
/// Backend connections are dialed through [`TcpDialer`], the production
/// [`Dialer`] for [`BackendPool`](crate::core::BackendPool).
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::core::pool::Dialer;
use crate::core::Backend;

/// Dialer producing TCP connections to backends
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    /// TCP keepalive idle time for backend sockets; `None` leaves the OS default
    keepalive: Option<Duration>,
}

impl TcpDialer {
    pub fn new(keepalive: Option<Duration>) -> Self {
        Self { keepalive }
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self, backend: &Backend) -> io::Result<TcpStream> {
        debug!(backend = %backend, "Connecting to backend");
        let stream = TcpStream::connect(backend.addr()).await?;

        // Tuning failures are not worth losing a working connection over
        if let Err(e) = configure_backend_stream(&stream, self.keepalive) {
            warn!(backend = %backend, error = %e, "Failed to configure backend stream");
        }

        Ok(stream)
    }
}

/// Configure an accepted client stream for request/response latency
pub fn configure_client_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}

/// Configure a backend stream: TCP_NODELAY plus optional keepalive
pub fn configure_backend_stream(stream: &TcpStream, keepalive: Option<Duration>) -> io::Result<()> {
    stream.set_nodelay(true)?;

    if let Some(idle) = keepalive {
        let params = TcpKeepalive::new().with_time(idle).with_interval(idle);
        SockRef::from(stream).set_tcp_keepalive(&params)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let dialer = TcpDialer::new(Some(Duration::from_secs(30)));
        let stream = dialer.dial(&Backend::new(addr.to_string())).await.unwrap();

        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port with nothing listening
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let dialer = TcpDialer::default();
        let err = dialer.dial(&Backend::new(addr.to_string())).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_configure_client_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        configure_client_stream(&server_side).unwrap();
        assert!(server_side.nodelay().unwrap());
        drop(client);
    }
}
