//! # Stream Transports
//!
//! Two [`Transport`] implementations:
//!
//! - [`TcpTransport`]: plain TCP, uris of the form `tcp:HOST:PORT`
//! - [`MemoryTransport`]: in-process duplex streams registered on a shared
//!   [`MemoryNetwork`], used to run multi-node scenarios without sockets
//!
//! Both hand back boxed [`PeerStream`]s; the session layer does its own
//! framing on top.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::protocols::{PeerStream, Transport};

/// Scheme prefix of TCP uris.
pub const TCP_SCHEME: &str = "tcp:";

/// Default timeout for establishing a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer size of in-memory duplex streams.
const MEMORY_STREAM_BUFFER: usize = 256 * 1024;

/// Pending inbound streams per in-memory listener.
const MEMORY_ACCEPT_BACKLOG: usize = 64;

/// Socket address part of a `tcp:` uri.
pub fn parse_tcp_uri(uri: &str) -> Option<&str> {
    uri.strip_prefix(TCP_SCHEME).filter(|addr| !addr.is_empty())
}

// ============================================================================
// TCP
// ============================================================================

pub struct TcpTransport {
    listener: TcpListener,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        Ok(Self {
            listener,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Uri of the bound listener. Not dialable when bound to a wildcard address.
    pub fn local_uri(&self) -> Result<String> {
        Ok(format!("{}{}", TCP_SCHEME, self.local_addr()?))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn create_connection(&self, uri: &str) -> Result<Option<Box<dyn PeerStream>>> {
        let Some(addr) = parse_tcp_uri(uri) else {
            return Ok(None);
        };
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("connect to {} timed out", addr))?
            .with_context(|| format!("connect to {} failed", addr))?;
        stream.set_nodelay(true)?;
        debug!(uri = %uri, "tcp connection established");
        Ok(Some(Box::new(stream)))
    }

    async fn accept_connection(&self) -> Result<(Box<dyn PeerStream>, String)> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let stream: Box<dyn PeerStream> = Box::new(stream);
        Ok((stream, format!("{}{}", TCP_SCHEME, remote)))
    }
}

// ============================================================================
// In-memory
// ============================================================================

type Incoming = (DuplexStream, String);

/// Registry of in-memory listeners keyed by uri.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<Incoming>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener at `uri` and return a transport bound to it.
    pub async fn bind(&self, uri: impl Into<String>) -> MemoryTransport {
        let uri = uri.into();
        let (tx, rx) = mpsc::channel(MEMORY_ACCEPT_BACKLOG);
        self.listeners.lock().await.insert(uri.clone(), tx);
        MemoryTransport {
            network: self.clone(),
            uri,
            incoming: Mutex::new(rx),
        }
    }

    /// Remove the listener at `uri`; later connects to it fail.
    pub async fn unbind(&self, uri: &str) {
        self.listeners.lock().await.remove(uri);
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    uri: String,
    incoming: Mutex<mpsc::Receiver<Incoming>>,
}

impl MemoryTransport {
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn create_connection(&self, uri: &str) -> Result<Option<Box<dyn PeerStream>>> {
        let listener = self.network.listeners.lock().await.get(uri).cloned();
        let Some(listener) = listener else {
            bail!("connection refused: {}", uri);
        };
        let (local, remote) = tokio::io::duplex(MEMORY_STREAM_BUFFER);
        listener
            .send((remote, self.uri.clone()))
            .await
            .map_err(|_| anyhow!("listener at {} closed", uri))?;
        Ok(Some(Box::new(local)))
    }

    async fn accept_connection(&self) -> Result<(Box<dyn PeerStream>, String)> {
        let (stream, uri) = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow!("memory transport {} closed", self.uri))?;
        let stream: Box<dyn PeerStream> = Box::new(stream);
        Ok((stream, uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_tcp_uri() {
        assert_eq!(parse_tcp_uri("tcp:1.2.3.4:80"), Some("1.2.3.4:80"));
        assert_eq!(parse_tcp_uri("tcp:"), None);
        assert_eq!(parse_tcp_uri("i2p:abc"), None);
    }

    #[tokio::test]
    async fn test_memory_transport_connects() {
        let network = MemoryNetwork::new();
        let a = network.bind("mem:a").await;
        let b = network.bind("mem:b").await;

        let mut outbound = a.create_connection("mem:b").await.unwrap().unwrap();
        let (mut inbound, from) = b.accept_connection().await.unwrap();
        assert_eq!(from, "mem:a");

        outbound.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_memory_transport_refuses_unknown_uri() {
        let network = MemoryNetwork::new();
        let a = network.bind("mem:a").await;
        assert!(a.create_connection("mem:missing").await.is_err());

        network.bind("mem:gone").await;
        network.unbind("mem:gone").await;
        assert!(a.create_connection("mem:gone").await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_transport_ignores_other_schemes() {
        let transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        assert!(transport.create_connection("mem:x").await.unwrap().is_none());
        assert!(transport.local_uri().unwrap().starts_with(TCP_SCHEME));
    }

    #[tokio::test]
    async fn test_tcp_transport_round_trip() {
        let server = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let client = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let uri = server.local_uri().unwrap();

        let accept = tokio::spawn(async move { server.accept_connection().await });
        let mut stream = client.create_connection(&uri).await.unwrap().unwrap();
        stream.write_all(b"hi").await.unwrap();

        let (mut inbound, from) = accept.await.unwrap().unwrap();
        assert!(from.starts_with(TCP_SCHEME));
        let mut buf = [0u8; 2];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
