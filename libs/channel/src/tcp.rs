//! TCP channel implementation.
//!
//! One channel owns one `TcpStream`. Connect timeouts are enforced with
//! `tokio::time::timeout`; interrupted-call retries are handled by the
//! runtime's I/O primitives.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::error::{ChannelError, Result};
use crate::registry::parse_connection_info;
use crate::{Channel, ServerChannel, FRAME_PREFIX_LEN};

/// TCP channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpChannelConfig {
    /// Default timeout for `open` when the caller passes zero.
    pub connect_timeout: Duration,
    /// Hard ceiling on a single frame.
    pub max_frame_len: usize,
    /// Set TCP_NODELAY on connected sockets.
    pub nodelay: bool,
    /// Host name advertised in `connection_info` for listening sockets.
    /// Deployments set this to the externally reachable name; the default
    /// suffices for single-host runs.
    pub advertise_host: String,
}

impl Default for TcpChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_frame_len: 16 * 1024 * 1024, // 16MB
            nodelay: true,
            advertise_host: "127.0.0.1".to_string(),
        }
    }
}

/// A TCP byte-stream channel.
pub struct TcpChannel {
    config: TcpChannelConfig,
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    peer_addr: Option<SocketAddr>,
    tag: u32,
}

impl TcpChannel {
    /// Create an unconnected channel from a `"host;port"` string.
    pub fn from_conninfo(conninfo: &str, config: TcpChannelConfig) -> Result<Self> {
        let (host, port) = parse_connection_info(conninfo)?;
        Ok(Self {
            config,
            host,
            port,
            stream: None,
            peer_addr: None,
            tag: 0,
        })
    }

    /// Wrap an already-connected stream produced by an accept.
    pub fn from_stream(stream: TcpStream, config: TcpChannelConfig) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let (host, port) = match peer_addr {
            Some(addr) => (addr.ip().to_string(), addr.port()),
            None => (String::new(), 0),
        };
        Self {
            config,
            host,
            port,
            stream: Some(stream),
            peer_addr,
            tag: 0,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(ChannelError::Closed)
    }

    /// Close the channel and surface the original failure.
    fn fail(&mut self, err: ChannelError) -> ChannelError {
        self.close();
        err
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn open(&mut self, timeout: Duration) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let timeout = if timeout.is_zero() {
            self.config.connect_timeout
        } else {
            timeout
        };
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match tokio::time::timeout(timeout, connect).await {
            Err(_) => return Err(ChannelError::timeout("connect", timeout)),
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(stream)) => stream,
        };
        if self.config.nodelay {
            if let Err(err) = stream.set_nodelay(true) {
                warn!(%err, "failed to set TCP_NODELAY");
            }
        }
        self.peer_addr = stream.peer_addr().ok();
        self.stream = Some(stream);
        debug!(peer = %self.connection_info(), "channel opened");
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the stream closes the socket exactly once.
        self.stream = None;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn tag(&self) -> u32 {
        self.tag
    }

    fn set_tag(&mut self, tag: u32) {
        self.tag = tag;
    }

    async fn readable(&self, timeout: Duration) -> Result<bool> {
        let stream = self.stream.as_ref().ok_or(ChannelError::Closed)?;
        match tokio::time::timeout(timeout, stream.ready(Interest::READABLE)).await {
            Err(_) => Ok(false),
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok(ready)) => Ok(ready.is_readable() || ready.is_read_closed()),
        }
    }

    async fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream_mut()?;
        match stream.write_all(data).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let stream = self.stream_mut()?;
        match stream.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    async fn recv_at_most(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream_mut()?;
        match stream.read(buf).await {
            Ok(0) if !buf.is_empty() => Err(self.fail(ChannelError::Closed)),
            Ok(n) => Ok(n),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    async fn send_frame(&mut self, packed: &[u8]) -> Result<()> {
        // Single buffered write so prefix and body hit the wire together.
        let mut buf = BytesMut::with_capacity(FRAME_PREFIX_LEN + packed.len());
        buf.put_u64_le(packed.len() as u64);
        buf.put_slice(packed);
        self.send_bytes(&buf).await?;
        let stream = self.stream_mut()?;
        match stream.flush().await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    async fn recv_frame(&mut self) -> Result<Bytes> {
        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        self.recv_exact(&mut prefix).await?;
        let len = u64::from_le_bytes(prefix);
        // A length this small is an error marker from the peer, never a
        // payload.
        if len <= 2 {
            return Err(self.fail(ChannelError::Protocol(format!(
                "frame length {len} signals a peer error"
            ))));
        }
        if len > self.config.max_frame_len as u64 {
            return Err(self.fail(ChannelError::Protocol(format!(
                "frame length {} exceeds maximum {}",
                len, self.config.max_frame_len
            ))));
        }
        let mut body = vec![0u8; len as usize];
        self.recv_exact(&mut body).await?;
        Ok(Bytes::from(body))
    }

    fn class_name(&self) -> &'static str {
        crate::registry::TCP_CHANNEL_CLASS
    }

    fn connection_info(&self) -> String {
        format!("{};{}", self.host, self.port)
    }
}

/// A TCP listener wrapped in the [`ServerChannel`] contract.
pub struct TcpServerChannel {
    config: TcpChannelConfig,
    requested_port: u16,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
}

impl TcpServerChannel {
    /// Request a specific port, or 0 for an ephemeral one.
    pub fn new(port: u16, config: TcpChannelConfig) -> Self {
        Self {
            config,
            requested_port: port,
            listener: None,
            local_addr: None,
        }
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr.map(|addr| addr.port())
    }
}

#[async_trait]
impl ServerChannel for TcpServerChannel {
    async fn setup_to_accept(&mut self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.requested_port)).await?;
        // Read back the resolved port when an ephemeral one was requested.
        self.local_addr = Some(listener.local_addr()?);
        self.listener = Some(listener);
        debug!(info = %self.connection_info(), "listening for connections");
        Ok(())
    }

    async fn accept(&mut self, timeout: Option<Duration>) -> Result<Box<dyn Channel>> {
        let listener = self.listener.as_ref().ok_or(ChannelError::Closed)?;
        let accepted = match timeout {
            Some(t) => match tokio::time::timeout(t, listener.accept()).await {
                Err(_) => return Err(ChannelError::timeout("accept", t)),
                Ok(res) => res,
            },
            None => listener.accept().await,
        };
        let (stream, peer) = accepted?;
        if self.config.nodelay {
            if let Err(err) = stream.set_nodelay(true) {
                warn!(%err, "failed to set TCP_NODELAY on accepted socket");
            }
        }
        debug!(%peer, "accepted connection");
        Ok(Box::new(TcpChannel::from_stream(
            stream,
            self.config.clone(),
        )))
    }

    fn close(&mut self) {
        self.listener = None;
    }

    fn class_name(&self) -> &'static str {
        crate::registry::TCP_CHANNEL_CLASS
    }

    fn connection_info(&self) -> String {
        let port = self.local_port().unwrap_or(self.requested_port);
        format!("{};{}", self.config.advertise_host, port)
    }
}
