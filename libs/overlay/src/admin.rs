//! Network admin commands and their message builders.
//!
//! Opcodes are dense small integers used directly on the wire; they must
//! stay contiguous. Dispatch is an exhaustive `match` in the server node.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{OverlayError, Result};
use wire::{Message, RoutingKind};

/// Number of collective slots a server node carries (allgather, allgatherv,
/// synchronize).
pub const COLLECTIVE_SLOTS: usize = 3;

/// One-byte network admin command carried in the wire message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdminCommand {
    Unknown = 0,
    /// Perform network linkup.
    LinkNetwork = 1,
    /// Message carries link info.
    LinkData = 2,
    /// Handshake query from an attached client endpoint (synchronous).
    GetServerInfo = 3,
    /// Determine whether a node is alive.
    VerifyNode = 4,
    // collectives (keep contiguous - slot index is derived from the opcode)
    Allgather = 5,
    Allgatherv = 6,
    Synchronize = 7,
}

impl From<u8> for AdminCommand {
    fn from(value: u8) -> Self {
        match value {
            1 => AdminCommand::LinkNetwork,
            2 => AdminCommand::LinkData,
            3 => AdminCommand::GetServerInfo,
            4 => AdminCommand::VerifyNode,
            5 => AdminCommand::Allgather,
            6 => AdminCommand::Allgatherv,
            7 => AdminCommand::Synchronize,
            _ => AdminCommand::Unknown,
        }
    }
}

impl AdminCommand {
    /// Collective slot index for the collective opcodes.
    pub fn slot(self) -> Option<usize> {
        match self {
            AdminCommand::Allgather => Some(0),
            AdminCommand::Allgatherv => Some(1),
            AdminCommand::Synchronize => Some(2),
            _ => None,
        }
    }
}

/// Build the linkup message seeded at label 0.
///
/// Payload layout: `num_nodes:u32`, the label array, then one nul-terminated
/// `"host;port"` string per node, where `conninfo[i]` belongs to
/// `labels[i]`.
pub fn linkup_message(num_nodes: u32, labels: &[u32], conninfo: &[String]) -> Message {
    debug_assert_eq!(labels.len(), conninfo.len());
    let strings: usize = conninfo.iter().map(|s| s.len() + 1).sum();
    let mut payload = BytesMut::with_capacity(4 + labels.len() * 4 + strings);
    payload.put_u32_le(num_nodes);
    for &label in labels {
        payload.put_u32_le(label);
    }
    for info in conninfo {
        payload.put_slice(info.as_bytes());
        payload.put_u8(0);
    }
    let mut msg = Message::network(payload.freeze());
    msg.set_routing(RoutingKind::Linkup);
    msg.set_command(AdminCommand::LinkNetwork as u8);
    msg
}

/// Parse a linkup payload back into labels and connection strings.
pub fn parse_linkup(payload: &[u8]) -> Result<(u32, Vec<u32>, Vec<String>)> {
    let mut cur = payload;
    if cur.len() < 4 {
        return Err(OverlayError::Protocol("linkup payload truncated".into()));
    }
    let num_nodes = cur.get_u32_le();
    if cur.len() < num_nodes as usize * 4 {
        return Err(OverlayError::Protocol(
            "linkup payload missing label array".into(),
        ));
    }
    let labels: Vec<u32> = (0..num_nodes).map(|_| cur.get_u32_le()).collect();
    let mut infos = Vec::with_capacity(num_nodes as usize);
    for _ in 0..num_nodes {
        let end = cur
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| OverlayError::Protocol("linkup conninfo not terminated".into()))?;
        let info = String::from_utf8_lossy(&cur[..end]).into_owned();
        infos.push(info);
        cur.advance(end + 1);
    }
    Ok((num_nodes, labels, infos))
}

/// Build the synchronous server-info query a client endpoint sends right
/// after attaching.
pub fn server_info_message() -> Message {
    let mut msg = Message::network(Bytes::new());
    msg.set_routing(RoutingKind::Local);
    msg.set_command(AdminCommand::GetServerInfo as u8);
    msg
}

/// Server-side identity reported to attached clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub label: u32,
    pub network: u32,
    pub num_nodes: u32,
}

impl ServerInfo {
    pub fn render(&self) -> String {
        format!(
            "Label={};Network={};NumNodes={}",
            self.label, self.network, self.num_nodes
        )
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut label = None;
        let mut network = None;
        let mut num_nodes = None;
        for part in text.trim_end_matches('\0').split(';') {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| OverlayError::Protocol(format!("bad server info {text:?}")))?;
            let value: u32 = value
                .parse()
                .map_err(|_| OverlayError::Protocol(format!("bad server info {text:?}")))?;
            match key {
                "Label" => label = Some(value),
                "Network" => network = Some(value),
                "NumNodes" => num_nodes = Some(value),
                _ => {}
            }
        }
        match (label, network, num_nodes) {
            (Some(label), Some(network), Some(num_nodes)) => Ok(ServerInfo {
                label,
                network,
                num_nodes,
            }),
            _ => Err(OverlayError::Protocol(format!("bad server info {text:?}"))),
        }
    }
}
