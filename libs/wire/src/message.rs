//! Envelope codec.
//!
//! Packed layout, little-endian, in this fixed order:
//!
//! ```text
//! class:u8  routing:u8  command:u8
//! destination:u32  destination_client:u32  source:u32  relay:u32  client:u32
//! payload_len:u64  payload[payload_len]
//! ```
//!
//! The five-word control block is always present. `payload_len` is
//! authoritative; the transport frame length is never used to infer it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, WireError};

/// Offset of the control block inside a packed message.
const CONTROL_OFFSET: usize = 3;
/// Offset of the payload length field.
const PAYLOAD_LEN_OFFSET: usize = CONTROL_OFFSET + 5 * 4;
/// Total header size preceding the payload bytes.
pub const HEADER_LEN: usize = PAYLOAD_LEN_OFFSET + 8;

/// Payload sizes above this are logged as suspicious but still accepted.
/// Control-plane traffic is small; anything near this is worth a look.
pub const PAYLOAD_WARN_CEILING: u64 = 100_000;

/// Payloads above this are rejected outright so a corrupt length field can
/// never drive allocation.
pub const PAYLOAD_HARD_CEILING: u64 = 64 * 1024 * 1024;

/// Message class: network-administrative or user traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageClass {
    Network = 0,
    User = 1,
}

impl TryFrom<u8> for MessageClass {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageClass::Network),
            1 => Ok(MessageClass::User),
            other => Err(WireError::BadClass(other)),
        }
    }
}

/// How the overlay routes a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RoutingKind {
    /// Bootstrap-only: propagates the topology from a single seed message.
    Linkup = 0,
    Broadcast = 1,
    Scatter = 2,
    Scatterv = 3,
    /// Deliver directly to the receiving process; never forwarded.
    Local = 4,
    PointToPoint = 5,
}

impl TryFrom<u8> for RoutingKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RoutingKind::Linkup),
            1 => Ok(RoutingKind::Broadcast),
            2 => Ok(RoutingKind::Scatter),
            3 => Ok(RoutingKind::Scatterv),
            4 => Ok(RoutingKind::Local),
            5 => Ok(RoutingKind::PointToPoint),
            other => Err(WireError::BadRoutingKind(other)),
        }
    }
}

/// The five-word routing control block.
///
/// `relay` is the node that most recently forwarded the message; it is
/// rewritten on every hop and is only meaningful during linkup and relay
/// diagnostics. `client` is non-zero when the message originated from an
/// attached client endpoint rather than a server node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlBlock {
    pub destination: u32,
    pub destination_client: u32,
    pub source: u32,
    pub relay: u32,
    pub client: u32,
}

/// A control-plane message.
///
/// The payload is a [`Bytes`] handle, so sharing a message across delivery
/// queues is a refcount bump, never a copy. Construct with an owned `Bytes`
/// to lend an existing buffer, or with [`Message::network_copied`] /
/// [`Message::user_copied`] to duplicate caller memory.
#[derive(Debug, Clone)]
pub struct Message {
    class: MessageClass,
    routing: RoutingKind,
    command: u8,
    control: ControlBlock,
    payload: Bytes,
}

impl Message {
    pub fn new(class: MessageClass, payload: Bytes) -> Self {
        Self {
            class,
            routing: RoutingKind::PointToPoint,
            command: 0,
            control: ControlBlock::default(),
            payload,
        }
    }

    pub fn network(payload: Bytes) -> Self {
        Self::new(MessageClass::Network, payload)
    }

    pub fn user(payload: Bytes) -> Self {
        Self::new(MessageClass::User, payload)
    }

    pub fn network_copied(payload: &[u8]) -> Self {
        Self::network(Bytes::copy_from_slice(payload))
    }

    pub fn user_copied(payload: &[u8]) -> Self {
        Self::user(Bytes::copy_from_slice(payload))
    }

    pub fn class(&self) -> MessageClass {
        self.class
    }

    pub fn routing(&self) -> RoutingKind {
        self.routing
    }

    pub fn set_routing(&mut self, routing: RoutingKind) {
        self.routing = routing;
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn set_command(&mut self, command: u8) {
        self.command = command;
    }

    pub fn control(&self) -> &ControlBlock {
        &self.control
    }

    pub fn destination(&self) -> u32 {
        self.control.destination
    }

    pub fn set_destination(&mut self, label: u32) {
        self.control.destination = label;
    }

    pub fn destination_client(&self) -> u32 {
        self.control.destination_client
    }

    pub fn set_destination_client(&mut self, client_id: u32) {
        self.control.destination_client = client_id;
    }

    pub fn source(&self) -> u32 {
        self.control.source
    }

    pub fn set_source(&mut self, label: u32) {
        self.control.source = label;
    }

    pub fn relay(&self) -> u32 {
        self.control.relay
    }

    pub fn set_relay(&mut self, label: u32) {
        self.control.relay = label;
    }

    pub fn client(&self) -> u32 {
        self.control.client
    }

    pub fn set_client(&mut self, client_id: u32) {
        self.control.client = client_id;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Shared handle to the payload; cloning is a refcount bump.
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Serialize into a freshly allocated packed buffer.
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.class as u8);
        buf.put_u8(self.routing as u8);
        buf.put_u8(self.command);
        buf.put_u32_le(self.control.destination);
        buf.put_u32_le(self.control.destination_client);
        buf.put_u32_le(self.control.source);
        buf.put_u32_le(self.control.relay);
        buf.put_u32_le(self.control.client);
        buf.put_u64_le(self.payload.len() as u64);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Exact inverse of [`Message::pack`].
    pub fn unpack(buf: &[u8]) -> Result<Message> {
        check_len(buf, HEADER_LEN)?;
        let mut cur = buf;
        let class = MessageClass::try_from(cur.get_u8())?;
        let routing = RoutingKind::try_from(cur.get_u8())?;
        let command = cur.get_u8();
        let control = ControlBlock {
            destination: cur.get_u32_le(),
            destination_client: cur.get_u32_le(),
            source: cur.get_u32_le(),
            relay: cur.get_u32_le(),
            client: cur.get_u32_le(),
        };
        let payload_len = cur.get_u64_le();
        if payload_len > PAYLOAD_HARD_CEILING {
            return Err(WireError::PayloadTooLarge {
                len: payload_len,
                max: PAYLOAD_HARD_CEILING,
            });
        }
        if payload_len > PAYLOAD_WARN_CEILING {
            warn!(
                len = payload_len,
                source = control.source,
                destination = control.destination,
                "unpacking unusually large control message"
            );
        }
        let payload_len = payload_len as usize;
        check_len(buf, HEADER_LEN + payload_len)?;
        let payload = Bytes::copy_from_slice(&cur[..payload_len]);
        Ok(Message {
            class,
            routing,
            command,
            control,
            payload,
        })
    }
}

fn check_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(WireError::Truncated {
            needed,
            got: buf.len(),
        });
    }
    Ok(())
}

fn peek_u32(buf: &[u8], offset: usize) -> Result<u32> {
    check_len(buf, offset + 4)?;
    Ok(u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

/// Message class of a packed message, without a full unpack.
pub fn peek_class(buf: &[u8]) -> Result<MessageClass> {
    check_len(buf, 1)?;
    MessageClass::try_from(buf[0])
}

/// Routing kind of a packed message, without a full unpack. The routing
/// layer inspects this on every hop before deciding whether to materialize
/// the message.
pub fn peek_routing(buf: &[u8]) -> Result<RoutingKind> {
    check_len(buf, 2)?;
    RoutingKind::try_from(buf[1])
}

/// Admin command byte of a packed message.
pub fn peek_command(buf: &[u8]) -> Result<u8> {
    check_len(buf, 3)?;
    Ok(buf[2])
}

/// Destination label of a packed message. Only point-to-point messages carry
/// a meaningful destination; everything else yields `None`.
pub fn peek_destination(buf: &[u8]) -> Result<Option<u32>> {
    if peek_routing(buf)? != RoutingKind::PointToPoint {
        return Ok(None);
    }
    peek_u32(buf, CONTROL_OFFSET).map(Some)
}

/// Originating node label of a packed message.
pub fn peek_source(buf: &[u8]) -> Result<u32> {
    peek_u32(buf, CONTROL_OFFSET + 8)
}

/// Label of the node that most recently relayed a packed message.
pub fn peek_relay(buf: &[u8]) -> Result<u32> {
    peek_u32(buf, CONTROL_OFFSET + 12)
}

/// Rewrite the relay field of a packed message in place. Forwarding rewrites
/// this on every hop without unpacking the envelope.
pub fn set_relay(buf: &mut [u8], label: u32) -> Result<()> {
    let offset = CONTROL_OFFSET + 12;
    check_len(buf, offset + 4)?;
    buf[offset..offset + 4].copy_from_slice(&label.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_message() -> Message {
        let mut msg = Message::user_copied(b"hello overlay");
        msg.set_routing(RoutingKind::Broadcast);
        msg.set_command(5);
        msg.set_destination(7);
        msg.set_destination_client(2);
        msg.set_source(3);
        msg.set_relay(1);
        msg.set_client(9);
        msg
    }

    #[test]
    fn round_trip_preserves_all_fields() {
        let msg = sample_message();
        let packed = msg.pack();
        let back = Message::unpack(&packed).unwrap();

        assert_eq!(back.class(), msg.class());
        assert_eq!(back.routing(), msg.routing());
        assert_eq!(back.command(), msg.command());
        assert_eq!(back.control(), msg.control());
        assert_eq!(back.payload(), msg.payload());
    }

    #[test]
    fn empty_payload_round_trips() {
        let msg = Message::network(Bytes::new());
        let back = Message::unpack(&msg.pack()).unwrap();
        assert_eq!(back.payload_len(), 0);
        assert_eq!(back.class(), MessageClass::Network);
    }

    #[test]
    fn peeks_match_full_unpack() {
        let mut msg = sample_message();
        msg.set_routing(RoutingKind::PointToPoint);
        let packed = msg.pack();

        assert_eq!(peek_class(&packed).unwrap(), msg.class());
        assert_eq!(peek_routing(&packed).unwrap(), msg.routing());
        assert_eq!(peek_command(&packed).unwrap(), msg.command());
        assert_eq!(peek_destination(&packed).unwrap(), Some(msg.destination()));
        assert_eq!(peek_source(&packed).unwrap(), msg.source());
        assert_eq!(peek_relay(&packed).unwrap(), msg.relay());
    }

    #[test]
    fn destination_is_header_only_for_point_to_point() {
        let mut msg = sample_message();
        msg.set_routing(RoutingKind::Broadcast);
        assert_eq!(peek_destination(&msg.pack()).unwrap(), None);
    }

    #[test]
    fn relay_rewrite_in_place() {
        let msg = sample_message();
        let packed = msg.pack();
        let mut buf = packed.to_vec();
        set_relay(&mut buf, 42).unwrap();

        assert_eq!(peek_relay(&buf).unwrap(), 42);
        let back = Message::unpack(&buf).unwrap();
        assert_eq!(back.relay(), 42);
        // everything else untouched
        assert_eq!(back.payload(), msg.payload());
        assert_eq!(back.destination(), msg.destination());
    }

    #[test]
    fn truncated_buffers_are_rejected() {
        let packed = sample_message().pack();
        for cut in [0usize, 1, 2, HEADER_LEN - 1, packed.len() - 1] {
            assert!(Message::unpack(&packed[..cut]).is_err());
        }
    }

    #[test]
    fn oversized_payload_length_is_rejected() {
        let mut buf = sample_message().pack().to_vec();
        let bogus = (PAYLOAD_HARD_CEILING + 1).to_le_bytes();
        buf[HEADER_LEN - 8..HEADER_LEN].copy_from_slice(&bogus);
        assert!(matches!(
            Message::unpack(&buf),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn bad_class_and_routing_bytes_are_rejected() {
        let mut buf = sample_message().pack().to_vec();
        buf[0] = 9;
        assert!(matches!(Message::unpack(&buf), Err(WireError::BadClass(9))));
        buf[0] = 0;
        buf[1] = 200;
        assert!(matches!(
            Message::unpack(&buf),
            Err(WireError::BadRoutingKind(200))
        ));
    }

    proptest! {
        #[test]
        fn round_trip_any_message(
            class in 0u8..=1,
            routing in 0u8..=5,
            command in any::<u8>(),
            dest in any::<u32>(),
            dest_client in any::<u32>(),
            source in any::<u32>(),
            relay in any::<u32>(),
            client in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let mut msg = Message::new(
                MessageClass::try_from(class).unwrap(),
                Bytes::from(payload.clone()),
            );
            msg.set_routing(RoutingKind::try_from(routing).unwrap());
            msg.set_command(command);
            msg.set_destination(dest);
            msg.set_destination_client(dest_client);
            msg.set_source(source);
            msg.set_relay(relay);
            msg.set_client(client);

            let back = Message::unpack(&msg.pack()).unwrap();
            prop_assert_eq!(back.class(), msg.class());
            prop_assert_eq!(back.routing(), msg.routing());
            prop_assert_eq!(back.command(), msg.command());
            prop_assert_eq!(back.control(), msg.control());
            prop_assert_eq!(back.payload(), &payload[..]);
        }
    }
}
