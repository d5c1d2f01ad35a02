//! Client endpoint: a thin attachment point for processes that are not
//! overlay nodes but ride the same collectives.
//!
//! A client owns one channel to the server node it is attached to. Its
//! collective calls send a Local-routed admin message stamped with its
//! client id, then block on the response frame the server hands back when
//! the collective completes. Clients contribute no data to allgather; they
//! only receive the aggregate.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use channel::Channel;
use topology::Hypercube;
use wire::{Message, MessageClass, RoutingKind};

use crate::admin::{self, AdminCommand, ServerInfo};
use crate::controller;
use crate::error::{OverlayError, Result};

pub struct ClientEndpoint {
    chan: Box<dyn Channel>,
    info: Option<ServerInfo>,
    /// Mirror of the server's topology node, built on demand for scatterv.
    node: Option<Hypercube>,
}

impl ClientEndpoint {
    pub fn new(chan: Box<dyn Channel>) -> Self {
        Self {
            chan,
            info: None,
            node: None,
        }
    }

    /// Open the channel and read the client id the server assigns.
    pub async fn connect(&mut self, timeout: Duration) -> Result<()> {
        if let Err(err) = self.chan.open(timeout).await {
            self.chan.close();
            return Err(err.into());
        }
        let mut id = [0u8; 4];
        match self.chan.recv_exact(&mut id).await {
            Ok(()) => {
                let id = u32::from_le_bytes(id);
                self.chan.set_tag(id);
                debug!(client_id = id, "attached to server node");
                Ok(())
            }
            Err(err) => {
                self.chan.close();
                Err(err.into())
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.chan.close();
    }

    pub fn client_id(&self) -> u32 {
        self.chan.tag()
    }

    pub fn server_label(&self) -> Option<u32> {
        self.info.map(|i| i.label)
    }

    pub async fn send_message(&mut self, msg: &Message, control: Option<u32>) -> Result<()> {
        controller::send_with_control(self.chan.as_mut(), control, msg).await?;
        Ok(())
    }

    /// Synchronous query for the attached server's identity.
    pub async fn get_server_info(&mut self) -> Result<ServerInfo> {
        let msg = admin::server_info_message();
        self.send_message(&msg, None).await?;
        let reply = self.chan.recv_message().await?;
        let text = String::from_utf8_lossy(reply.payload()).into_owned();
        let info = ServerInfo::parse(&text)?;
        self.info = Some(info);
        Ok(info)
    }

    /// Receive the aggregate of an allgather ride-along into `recv`.
    pub async fn allgather(&mut self, recv: &mut [u8]) -> Result<()> {
        self.collective_ride(AdminCommand::Allgather, Some(recv)).await
    }

    /// Variable-length flavor; `recv` must already be sized for the total.
    pub async fn allgatherv(&mut self, recv: &mut [u8]) -> Result<()> {
        self.collective_ride(AdminCommand::Allgatherv, Some(recv)).await
    }

    /// Barrier ride-along: returns once the GO frame arrives.
    pub async fn synchronize(&mut self) -> Result<()> {
        self.collective_ride(AdminCommand::Synchronize, None).await
    }

    async fn collective_ride(&mut self, cmd: AdminCommand, recv: Option<&mut [u8]>) -> Result<()> {
        let mut msg = Message::network(Bytes::new());
        msg.set_routing(RoutingKind::Local);
        msg.set_command(cmd as u8);
        msg.set_client(self.chan.tag());
        self.send_message(&msg, None).await?;

        let response = self.chan.recv_message().await?;
        if let Some(recv) = recv {
            let data = response.payload();
            let n = recv.len().min(data.len());
            recv[..n].copy_from_slice(&data[..n]);
        }
        Ok(())
    }

    /// Hand the full scatter payload to the attached server for routing;
    /// `chunks[i]` goes to the node with label `i`.
    pub async fn scatterv(&mut self, class: MessageClass, chunks: &[Bytes]) -> Result<()> {
        if self.node.is_none() {
            let info = match self.info {
                Some(info) => info,
                None => self.get_server_info().await?,
            };
            if info.network != topology::NETWORK_HYPERCUBE || info.num_nodes == 0 {
                return Err(OverlayError::NotLinked);
            }
            self.node = Some(Hypercube::new(info.label, info.num_nodes));
        }
        let node = self.node.as_ref().ok_or(OverlayError::NotLinked)?;
        let num_nodes = node.num_nodes();
        if chunks.len() < num_nodes as usize {
            return Err(OverlayError::Protocol(
                "scatterv chunk array shorter than node count".into(),
            ));
        }

        let total: usize = chunks.iter().take(num_nodes as usize).map(|c| c.len()).sum();
        let mut payload = BytesMut::with_capacity(4 + num_nodes as usize * 8 + total);
        payload.put_u32_le(num_nodes);
        for label in 0..num_nodes {
            payload.put_u32_le(label);
        }
        for label in 0..num_nodes {
            payload.put_u32_le(chunks[label as usize].len() as u32);
        }
        for label in 0..num_nodes {
            payload.put_slice(&chunks[label as usize]);
        }

        let mut msg = Message::new(class, payload.freeze());
        msg.set_routing(RoutingKind::Scatterv);
        msg.set_source(node.label());
        let control = Hypercube::initial_control(num_nodes);
        self.send_message(&msg, Some(control)).await
    }
}
