//! Byte-Stream Transport Abstraction
//!
//! A channel owns one connection and moves bytes and framed wire messages
//! over it. Topology code creates peer channels through the name-keyed
//! [`ChannelRegistry`] from a `"host;port"` connection string, so it never
//! depends on a concrete transport.
//!
//! The TCP implementation lives in [`tcp`]; the framing contract (8-byte
//! length prefix, length <= 2 is an error marker) is shared by all
//! implementations.

pub mod error;
pub mod registry;
pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use wire::Message;

pub use error::{ChannelError, Result};
pub use registry::{parse_connection_info, ChannelConstructor, ChannelRegistry, TCP_CHANNEL_CLASS};
pub use tcp::{TcpChannel, TcpChannelConfig, TcpServerChannel};

/// Length of the frame prefix preceding every packed message.
pub const FRAME_PREFIX_LEN: usize = 8;

/// A connected (or connectable) byte-stream transport.
///
/// Created unconnected from a connection string, then [`Channel::open`]ed,
/// or produced already-connected by an accept. Closing is idempotent; any
/// transport-level failure closes the channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Connect, enforcing `timeout`. On failure or timeout the channel is
    /// left closed.
    async fn open(&mut self, timeout: Duration) -> Result<()>;

    /// Close the underlying socket. Safe to call repeatedly.
    fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// Peer id assigned by the accepting side (0 = unassigned).
    fn tag(&self) -> u32;

    fn set_tag(&mut self, tag: u32);

    /// Probe for readable data, waiting at most `timeout`.
    async fn readable(&self, timeout: Duration) -> Result<bool>;

    /// Send all of `data`, looping until done or a fatal error.
    async fn send_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Receive exactly `buf.len()` bytes, looping until done.
    async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Single partial read for best-effort draining; returns bytes read.
    async fn recv_at_most(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Send a packed message behind the frame-length prefix.
    async fn send_frame(&mut self, packed: &[u8]) -> Result<()>;

    /// Receive one length-prefixed frame.
    async fn recv_frame(&mut self) -> Result<Bytes>;

    async fn send_message(&mut self, msg: &Message) -> Result<()> {
        let packed = msg.pack();
        self.send_frame(&packed).await
    }

    async fn recv_message(&mut self) -> Result<Message> {
        let frame = self.recv_frame().await?;
        Ok(Message::unpack(&frame)?)
    }

    /// Registry key of the concrete implementation.
    fn class_name(&self) -> &'static str;

    /// `"host;port"` string a peer can use to reach the other end.
    fn connection_info(&self) -> String;
}

/// A transport capable of accepting inbound connections.
#[async_trait]
pub trait ServerChannel: Send + Sync {
    /// Bind and listen. A requested port of 0 resolves to an ephemeral port
    /// readable afterwards through [`ServerChannel::connection_info`].
    async fn setup_to_accept(&mut self) -> Result<()>;

    /// Accept one connection, optionally bounded by `timeout`.
    async fn accept(&mut self, timeout: Option<Duration>) -> Result<Box<dyn Channel>>;

    fn close(&mut self);

    fn class_name(&self) -> &'static str;

    /// `"host;port"` string for the listening socket.
    fn connection_info(&self) -> String;
}
