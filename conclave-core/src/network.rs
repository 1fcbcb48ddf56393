//! Network provider abstraction.
//!
//! Trait-based networking so the engine's connection handling can be driven
//! by real TCP sockets or by an in-memory pair in tests.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Provider trait for creating network connections and listeners.
///
/// Single-threaded design, so no `Send` bounds. `Clone` allows sharing one
/// provider across all peer tasks.
#[async_trait(?Send)]
pub trait NetworkProvider: Clone {
    /// The stream type produced by this provider.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + 'static;
    /// The listener type produced by this provider.
    type TcpListener: TcpListenerTrait<TcpStream = Self::TcpStream> + 'static;

    /// Create a listener bound to the given address.
    async fn bind(&self, addr: &str) -> io::Result<Self::TcpListener>;

    /// Connect to a remote address.
    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream>;
}

/// Trait for listeners that can accept connections.
#[async_trait(?Send)]
pub trait TcpListenerTrait {
    /// The stream type this listener produces.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + 'static;

    /// Accept a single incoming connection, returning the stream and the
    /// peer's address.
    async fn accept(&self) -> io::Result<(Self::TcpStream, String)>;

    /// The local address this listener is bound to.
    fn local_addr(&self) -> io::Result<String>;
}

/// Real tokio networking implementation.
#[derive(Debug, Clone, Default)]
pub struct TokioNetworkProvider;

impl TokioNetworkProvider {
    /// Create a new tokio network provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl NetworkProvider for TokioNetworkProvider {
    type TcpStream = tokio::net::TcpStream;
    type TcpListener = TokioTcpListener;

    async fn bind(&self, addr: &str) -> io::Result<Self::TcpListener> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(TokioTcpListener { inner: listener })
    }

    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream> {
        tokio::net::TcpStream::connect(addr).await
    }
}

/// Wrapper for the tokio listener to implement our trait.
#[derive(Debug)]
pub struct TokioTcpListener {
    inner: tokio::net::TcpListener,
}

#[async_trait(?Send)]
impl TcpListenerTrait for TokioTcpListener {
    type TcpStream = tokio::net::TcpStream;

    async fn accept(&self) -> io::Result<(Self::TcpStream, String)> {
        let (stream, addr) = self.inner.accept().await?;
        Ok((stream, addr.to_string()))
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}
