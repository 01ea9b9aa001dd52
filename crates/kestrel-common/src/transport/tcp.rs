use std::net::ToSocketAddrs;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::protocol::error::{Result, RpcError};
use crate::transport::codec::RpcCodec;

/// Default timeout for establishing a TCP connection (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP transport for kestrel.
///
/// Establishes connections and wraps them in the frame codec. Connections are
/// long-lived and multiplexed: many requests share one stream and replies are
/// matched by request id.
///
/// # Example
///
/// ```no_run
/// use kestrel_common::transport::TcpTransport;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::new();
/// let framed = transport.connect_framed("127.0.0.1:27880").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    max_frame_len: usize,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_len: crate::transport::codec::DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Connects to a remote endpoint.
    ///
    /// The address may resolve to several socket addresses; each is tried in
    /// turn until one accepts within the connect timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The address cannot be resolved
    /// - Connection fails to all resolved addresses
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let socket_addrs = addr
            .to_socket_addrs()
            .map_err(|e| RpcError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&socket_addr)).await {
                Ok(Ok(stream)) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| RpcError::Connection(format!("Failed to set TCP_NODELAY: {}", e)))?;
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => {
                    last_err = Some(format!(
                        "timed out after {}ms",
                        self.connect_timeout.as_millis()
                    ))
                }
            }
        }

        Err(RpcError::Connection(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err.unwrap_or_else(|| "Unknown error".to_string())
        )))
    }

    /// Connects and wraps the stream in the frame codec.
    pub async fn connect_framed(&self, addr: &str) -> Result<Framed<TcpStream, RpcCodec>> {
        let stream = self.connect(addr).await?;
        Ok(Framed::new(stream, self.codec()))
    }

    pub fn codec(&self) -> RpcCodec {
        RpcCodec::with_max_frame_len(self.max_frame_len)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps IO errors to the transport-facing error variants.
///
/// - Reset/aborted/not-connected -> `Connection`
/// - Other IO errors -> `Io`
pub fn map_io_error(err: std::io::Error, context: &str) -> RpcError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected => {
            RpcError::Connection(format!("{}: Connection lost", context))
        }
        _ => RpcError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let transport = TcpTransport::new();
        assert!(transport.connect(&addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = TcpTransport::new().connect(&addr).await.unwrap_err();
        assert!(matches!(err, RpcError::Connection(_)));
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let err = TcpTransport::new().connect("not an address").await.unwrap_err();
        assert!(matches!(err, RpcError::Connection(_)));
    }

    #[test]
    fn test_map_io_error() {
        let err = map_io_error(
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
            "writing frame",
        );
        assert!(matches!(err, RpcError::Connection(ref m) if m.contains("writing frame")));

        let err = map_io_error(std::io::Error::other("boom"), "reading");
        assert!(matches!(err, RpcError::Io(_)));
    }
}
