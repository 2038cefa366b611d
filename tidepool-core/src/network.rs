//! Outbound connection provider.
//!
//! The tidepool client is a pure dialer: it opens connections to storage
//! nodes and never accepts any. The provider trait therefore exposes exactly
//! one operation, `connect`. Connection deadlines are the caller's business
//! (channels wrap `connect` in [`TimeProvider::timeout`]); what belongs here
//! is only what must touch the socket itself.
//!
//! [`TimeProvider::timeout`]: crate::TimeProvider::timeout

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Socket options applied while establishing an outbound connection.
///
/// Carried per call rather than baked into the provider, so the client's
/// `tcp-nodelay` configuration key reaches the socket without every test
/// provider having to thread it through construction.
#[derive(Debug, Clone, Default)]
pub struct TcpOptions {
    /// Disable Nagle's algorithm on the connection.
    pub nodelay: bool,
}

/// Provider trait for dialing storage nodes.
///
/// Single-core design - no Send bounds needed.
/// Clone allows sharing one provider across every channel in a client.
#[async_trait(?Send)]
pub trait NetworkProvider: Clone {
    /// The byte stream a successful dial yields.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + 'static;

    /// Dial a remote address ("host:port"), applying the given socket
    /// options before handing the stream back.
    async fn connect(&self, addr: &str, options: &TcpOptions) -> io::Result<Self::TcpStream>;
}

/// Production dialer backed by `tokio::net::TcpStream`.
#[derive(Debug, Clone, Default)]
pub struct TokioNetworkProvider;

impl TokioNetworkProvider {
    /// Create a new Tokio network provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl NetworkProvider for TokioNetworkProvider {
    type TcpStream = tokio::net::TcpStream;

    async fn connect(&self, addr: &str, options: &TcpOptions) -> io::Result<Self::TcpStream> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(options.nodelay)?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_applies_nodelay() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let target = listener.local_addr().expect("local addr").to_string();

        let provider = TokioNetworkProvider::new();
        let stream = provider
            .connect(&target, &TcpOptions { nodelay: true })
            .await
            .expect("connect");
        assert!(stream.nodelay().expect("query nodelay"));
    }

    #[tokio::test]
    async fn test_connect_refused_surfaces_io_error() {
        // bind then drop, so the port is very likely unoccupied
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let target = listener.local_addr().expect("local addr").to_string();
        drop(listener);

        let provider = TokioNetworkProvider::new();
        let result = provider.connect(&target, &TcpOptions::default()).await;
        assert!(result.is_err());
    }
}
