//! Server node: the routing state machine and collective coordination.
//!
//! A server node owns one listening channel, the topology node created at
//! linkup, and one outbound channel per neighbor. Every overlay edge is two
//! one-directional connections: the dial-out channel in the neighbor map is
//! send-only, and the matching inbound connection arrives through accept and
//! is read by the scan task along with attached client endpoints.
//!
//! Two background tasks run per node: an accept task that tags new
//! connections with a process-unique id, and a scan task that sweeps
//! accepted connections for readable data and routes whatever arrives - the
//! only place inbound messages are dequeued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use channel::{Channel, ChannelError, ChannelRegistry, ServerChannel};
use topology::{ceil_log2, linkup_label, Hypercube};
use wire::{Message, MessageClass, RoutingKind};

use crate::admin::{self, AdminCommand, ServerInfo, COLLECTIVE_SLOTS};
use crate::controller;
use crate::error::{OverlayError, Result};

const ACCEPT_POLL: Duration = Duration::from_millis(200);
const SCAN_IDLE: Duration = Duration::from_millis(2);
const COLLECTIVE_POLL: Duration = Duration::from_millis(1);
const NEIGHBOR_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const ALLGATHER_SLOT: usize = 0;
const ALLGATHERV_SLOT: usize = 1;
const SYNCHRONIZE_SLOT: usize = 2;

/// A channel shared between the scan task and senders.
pub type SharedChannel = Arc<tokio::sync::Mutex<Box<dyn Channel>>>;

/// One accepted connection: an attached client endpoint or an inbound
/// neighbor link. Both are routed identically.
#[derive(Clone)]
struct Connection {
    id: u32,
    chan: SharedChannel,
}

/// Per-collective-kind state. The aggregate buffer is allocated lazily on
/// the first contribution and taken once the result has been handed out.
#[derive(Default)]
struct CollSlot {
    ready: bool,
    child_count: u32,
    client_count: u32,
    buffer: Option<Vec<u8>>,
    waiting_clients: Vec<u32>,
}

/// Write `data` into the slot buffer at `offset`, growing as needed.
fn store(buffer: &mut Option<Vec<u8>>, offset: usize, data: &[u8], total: usize) {
    let buf = buffer.get_or_insert_with(|| vec![0u8; total.max(offset + data.len())]);
    if buf.len() < offset + data.len() {
        buf.resize(offset + data.len(), 0);
    }
    buf[offset..offset + data.len()].copy_from_slice(data);
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

struct ServerInner {
    registry: Arc<ChannelRegistry>,
    channel_class: &'static str,
    server: tokio::sync::Mutex<Box<dyn ServerChannel>>,
    conninfo: RwLock<String>,
    node: RwLock<Option<Hypercube>>,
    /// Outbound, send-only channels to neighbors, keyed by label.
    peers: RwLock<HashMap<u32, SharedChannel>>,
    /// Accepted connections, read by the scan task.
    connections: RwLock<Vec<Connection>>,
    next_id: AtomicU32,
    running: AtomicBool,
    linked: AtomicBool,
    slots: [Mutex<CollSlot>; COLLECTIVE_SLOTS],
    delegate: RwLock<Option<mpsc::UnboundedSender<Message>>>,
}

impl ServerInner {
    fn node_info(&self) -> Option<(u32, u32)> {
        self.node.read().as_ref().map(|n| (n.label(), n.num_nodes()))
    }

    async fn accept_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let accepted = {
                let mut server = self.server.lock().await;
                server.accept(Some(ACCEPT_POLL)).await
            };
            match accepted {
                Ok(mut chan) => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    chan.set_tag(id);
                    if let Err(err) = chan.send_bytes(&id.to_le_bytes()).await {
                        warn!(%err, "failed to hand id to new connection");
                        continue;
                    }
                    debug!(id, "accepted connection");
                    self.connections.write().push(Connection {
                        id,
                        chan: Arc::new(tokio::sync::Mutex::new(chan)),
                    });
                }
                Err(ChannelError::TimedOut { .. }) => {}
                Err(ChannelError::Closed) => break,
                Err(err) => {
                    if self.running.load(Ordering::SeqCst) {
                        warn!(%err, "accept failed");
                    }
                    tokio::time::sleep(ACCEPT_POLL).await;
                }
            }
        }
    }

    async fn scan_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let connections: Vec<Connection> = self.connections.read().clone();
            let mut activity = false;
            for conn in connections {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                let outcome = {
                    let mut chan = conn.chan.lock().await;
                    match chan.readable(Duration::ZERO).await {
                        Ok(false) => None,
                        Ok(true) => Some(controller::recv_routed(chan.as_mut()).await),
                        Err(err) => Some(Err(err)),
                    }
                };
                match outcome {
                    None => {}
                    Some(Ok((control, frame))) => {
                        activity = true;
                        if let Err(err) = self.route_packed(frame, control, Some(&conn)).await {
                            warn!(connection = conn.id, %err, "failed to route inbound message");
                        }
                    }
                    Some(Err(err)) => self.drop_connection(conn.id, &err),
                }
            }
            if !activity {
                tokio::time::sleep(SCAN_IDLE).await;
            }
        }
    }

    fn drop_connection(&self, id: u32, err: &ChannelError) {
        warn!(connection = id, %err, "dropping connection from routing");
        self.connections.write().retain(|c| c.id != id);
        for slot in &self.slots {
            slot.lock().waiting_clients.retain(|&c| c != id);
        }
    }

    fn drop_peer(&self, label: u32, err: &ChannelError) {
        warn!(neighbor = label, %err, "dropping neighbor from routing");
        self.peers.write().remove(&label);
        if let Some(node) = self.node.write().as_mut() {
            node.remove_neighbor(label);
        }
    }

    /// Dispatch one packed message on its routing kind.
    async fn route_packed(
        &self,
        packed: Bytes,
        control: Option<u32>,
        via: Option<&Connection>,
    ) -> Result<()> {
        match wire::peek_routing(&packed)? {
            RoutingKind::Local => self.handle_packed(&packed, control, via).await,
            RoutingKind::PointToPoint => {
                let destination = wire::peek_destination(&packed)?.ok_or_else(|| {
                    OverlayError::Protocol("point-to-point message without destination".into())
                })?;
                let Some((label, _)) = self.node_info() else {
                    warn!(destination, "dropping message: no topology node yet");
                    return Ok(());
                };
                if destination == label {
                    self.handle_packed(&packed, control, via).await
                } else {
                    self.forward_to(destination, &packed, label).await;
                    Ok(())
                }
            }
            RoutingKind::Broadcast => {
                if let Some(ctrl) = control {
                    self.forward_broadcast(&packed, ctrl).await;
                }
                self.handle_packed(&packed, control, via).await
            }
            RoutingKind::Scatterv => self.scatterv_packed(&packed, control).await,
            RoutingKind::Scatter => {
                warn!("dropping message with unrouted scatter kind");
                Ok(())
            }
            RoutingKind::Linkup => {
                let msg = Message::unpack(&packed)?;
                self.link_network(&msg, control.unwrap_or(0)).await
            }
        }
    }

    /// Forward a packed point-to-point message one hop toward `destination`.
    async fn forward_to(&self, destination: u32, packed: &[u8], label: u32) {
        let hop = {
            let node = self.node.read();
            match node.as_ref().and_then(|n| n.next_hop(destination)) {
                Some(next) => self.peers.read().get(&next).cloned().map(|c| (next, c)),
                None => None,
            }
        };
        match hop {
            Some((next, chan)) => {
                let mut buf = packed.to_vec();
                if wire::set_relay(&mut buf, label).is_err() {
                    warn!(destination, "malformed message; not forwarding");
                    return;
                }
                let sent = {
                    let mut ch = chan.lock().await;
                    controller::send_packed_with_control(ch.as_mut(), None, &buf).await
                };
                if let Err(err) = sent {
                    warn!(
                        source = wire::peek_source(packed).unwrap_or(0),
                        next, "unable to forward message to next neighbor"
                    );
                    self.drop_peer(next, &err);
                }
            }
            None => warn!(destination, "dropping message: no channel toward destination"),
        }
    }

    /// Forward a packed broadcast along the pruned link list.
    async fn forward_broadcast(&self, packed: &[u8], control: u32) {
        let (label, hops) = {
            let mut node_guard = self.node.write();
            let Some(node) = node_guard.as_mut() else {
                return;
            };
            let label = node.label();
            let links = node.broadcast_links(control);
            let peers = self.peers.read();
            let hops: Vec<(u32, u32, SharedChannel)> = links
                .into_iter()
                .filter_map(|link| {
                    let neighbor = node.label_for_link(link);
                    let pruned = node.control_for_link(control, link);
                    match peers.get(&neighbor) {
                        Some(chan) => Some((neighbor, pruned, chan.clone())),
                        None => {
                            warn!(neighbor, "neighbor channel missing during broadcast");
                            None
                        }
                    }
                })
                .collect();
            (label, hops)
        };
        if hops.is_empty() {
            return;
        }
        let mut buf = packed.to_vec();
        if wire::set_relay(&mut buf, label).is_err() {
            return;
        }
        for (neighbor, pruned, chan) in hops {
            let sent = {
                let mut ch = chan.lock().await;
                controller::send_packed_with_control(ch.as_mut(), Some(pruned), &buf).await
            };
            if let Err(err) = sent {
                warn!(
                    neighbor,
                    command = wire::peek_command(&buf).unwrap_or(0),
                    "failed to forward broadcast"
                );
                self.drop_peer(neighbor, &err);
            }
        }
    }

    /// Deliver a packed message to this process.
    async fn handle_packed(
        &self,
        packed: &[u8],
        control: Option<u32>,
        via: Option<&Connection>,
    ) -> Result<()> {
        let msg = Message::unpack(packed)?;
        if msg.class() == MessageClass::User {
            if msg.destination_client() != 0 {
                let target = self
                    .connections
                    .read()
                    .iter()
                    .find(|c| c.id == msg.destination_client())
                    .map(|c| c.chan.clone());
                match target {
                    Some(chan) => {
                        let sent = {
                            let mut ch = chan.lock().await;
                            ch.send_frame(packed).await
                        };
                        if let Err(err) = sent {
                            self.drop_connection(msg.destination_client(), &err);
                        }
                    }
                    None => warn!(
                        client = msg.destination_client(),
                        "no such client for user message"
                    ),
                }
            } else {
                self.deliver_to_delegate(msg);
            }
            Ok(())
        } else {
            self.handle_admin(msg, control, via).await
        }
    }

    fn deliver_to_delegate(&self, msg: Message) {
        match self.delegate.read().as_ref() {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    warn!("user-message delegate receiver dropped");
                }
            }
            None => debug!("user message arrived with no delegate attached"),
        }
    }

    /// Dispatch a network-administrative message on its opcode.
    async fn handle_admin(
        &self,
        msg: Message,
        control: Option<u32>,
        via: Option<&Connection>,
    ) -> Result<()> {
        match AdminCommand::from(msg.command()) {
            AdminCommand::LinkNetwork => self.link_network(&msg, control.unwrap_or(0)).await,
            AdminCommand::GetServerInfo => {
                self.reply_server_info(via).await;
                Ok(())
            }
            AdminCommand::Allgather => {
                self.collective_contribution(AdminCommand::Allgather, ALLGATHER_SLOT, msg, via)
                    .await
            }
            AdminCommand::Allgatherv => {
                self.collective_contribution(AdminCommand::Allgatherv, ALLGATHERV_SLOT, msg, via)
                    .await
            }
            AdminCommand::Synchronize => self.sync_contribution(msg, via).await,
            cmd @ (AdminCommand::LinkData | AdminCommand::VerifyNode | AdminCommand::Unknown) => {
                warn!(?cmd, opcode = msg.command(), "net command is not available");
                Ok(())
            }
        }
    }

    async fn reply_server_info(&self, via: Option<&Connection>) {
        let Some(conn) = via else {
            return;
        };
        let info = match self.node_info() {
            Some((label, num_nodes)) => ServerInfo {
                label,
                network: topology::NETWORK_HYPERCUBE,
                num_nodes,
            },
            None => ServerInfo {
                label: 0,
                network: 0,
                num_nodes: 0,
            },
        };
        let mut reply = Message::user(Bytes::from(info.render().into_bytes()));
        reply.set_routing(RoutingKind::Local);
        let sent = {
            let mut ch = conn.chan.lock().await;
            ch.send_message(&reply).await
        };
        if let Err(err) = sent {
            self.drop_connection(conn.id, &err);
        }
    }

    /// Fold an allgather/allgatherv message into its slot, or relay it.
    async fn collective_contribution(
        &self,
        cmd: AdminCommand,
        slot: usize,
        msg: Message,
        via: Option<&Connection>,
    ) -> Result<()> {
        let Some((label, num_nodes)) = self.node_info() else {
            return Err(OverlayError::NotLinked);
        };
        if msg.client() != 0 {
            // contribution from an attached client endpoint
            if let Some(conn) = via {
                if conn.id == msg.client() {
                    self.slots[slot].lock().waiting_clients.push(conn.id);
                }
            }
            if label == 0 {
                self.slots[slot].lock().client_count += 1;
            } else {
                let mut forward = msg.clone();
                forward.set_destination(0);
                forward.set_routing(RoutingKind::PointToPoint);
                forward.set_source(label);
                self.forward_to(0, &forward.pack(), label).await;
            }
            return Ok(());
        }
        if msg.source() == 0 {
            // the aggregate has arrived
            let waiting = {
                let mut s = self.slots[slot].lock();
                let data = msg.payload();
                store(&mut s.buffer, 0, data, data.len());
                s.ready = true;
                std::mem::take(&mut s.waiting_clients)
            };
            self.distribute_to_clients(&waiting, &msg).await;
            Ok(())
        } else {
            // this node is label 0: aggregate at the contributor's offset
            let payload = msg.payload();
            let (offset, data, total) = if cmd == AdminCommand::Allgatherv {
                if payload.len() < 8 {
                    return Err(OverlayError::Protocol(
                        "allgatherv contribution truncated".into(),
                    ));
                }
                let total = read_u32(payload, 0) as usize;
                let offset = read_u32(payload, 4) as usize;
                (offset, &payload[8..], total)
            } else {
                let datalen = payload.len();
                (msg.source() as usize * datalen, payload, datalen * num_nodes as usize)
            };
            let mut s = self.slots[slot].lock();
            store(&mut s.buffer, offset, data, total);
            s.child_count += 1;
            Ok(())
        }
    }

    /// Count a synchronize message, or relay/complete it.
    async fn sync_contribution(&self, msg: Message, via: Option<&Connection>) -> Result<()> {
        let Some((label, _)) = self.node_info() else {
            return Err(OverlayError::NotLinked);
        };
        if msg.client() != 0 {
            if let Some(conn) = via {
                if conn.id == msg.client() {
                    debug!(client = conn.id, "queueing client for sync response");
                    self.slots[SYNCHRONIZE_SLOT].lock().waiting_clients.push(conn.id);
                }
            }
            if label == 0 {
                self.slots[SYNCHRONIZE_SLOT].lock().client_count += 1;
            } else {
                let mut forward = msg.clone();
                forward.set_destination(0);
                forward.set_routing(RoutingKind::PointToPoint);
                forward.set_source(label);
                self.forward_to(0, &forward.pack(), label).await;
            }
            return Ok(());
        }
        if msg.source() == 0 {
            // the GO message; the broadcast path already relayed it onward
            let waiting = {
                let mut s = self.slots[SYNCHRONIZE_SLOT].lock();
                s.ready = true;
                s.child_count = 0;
                s.client_count = 0;
                std::mem::take(&mut s.waiting_clients)
            };
            self.distribute_to_clients(&waiting, &msg).await;
        } else {
            self.slots[SYNCHRONIZE_SLOT].lock().child_count += 1;
        }
        Ok(())
    }

    /// Send a collective result to waiting client endpoints (bare frames).
    async fn distribute_to_clients(&self, ids: &[u32], msg: &Message) {
        if ids.is_empty() {
            return;
        }
        let packed = msg.pack();
        for &id in ids {
            let target = self
                .connections
                .read()
                .iter()
                .find(|c| c.id == id)
                .map(|c| c.chan.clone());
            let Some(chan) = target else {
                continue;
            };
            let sent = {
                let mut ch = chan.lock().await;
                ch.send_frame(&packed).await
            };
            if let Err(err) = sent {
                self.drop_connection(id, &err);
            }
        }
    }

    /// Re-partition and forward a packed scatterv message, delivering the
    /// local slice if present.
    async fn scatterv_packed(&self, packed: &[u8], control: Option<u32>) -> Result<()> {
        let msg = Message::unpack(packed)?;
        let payload = msg.payload();
        if payload.len() < 4 {
            return Err(OverlayError::Protocol("scatterv payload truncated".into()));
        }
        let count = read_u32(payload, 0) as usize;
        if count == 0 {
            return Ok(());
        }
        let header = 4 + count * 8;
        if payload.len() < header {
            return Err(OverlayError::Protocol("scatterv payload truncated".into()));
        }
        let full = msg.payload_bytes();
        let mut entries = Vec::with_capacity(count);
        let mut data_offset = header;
        for i in 0..count {
            let label = read_u32(payload, 4 + i * 4);
            let len = read_u32(payload, 4 + count * 4 + i * 4) as usize;
            if payload.len() < data_offset + len {
                return Err(OverlayError::Protocol("scatterv payload truncated".into()));
            }
            entries.push((label, full.slice(data_offset..data_offset + len)));
            data_offset += len;
        }
        self.scatterv_internal(msg.source(), msg.class(), &entries, control.unwrap_or(0))
            .await
    }

    /// The scatter engine shared by the routed path and the public call.
    async fn scatterv_internal(
        &self,
        source: u32,
        class: MessageClass,
        entries: &[(u32, Bytes)],
        control: u32,
    ) -> Result<()> {
        let Some((label, _)) = self.node_info() else {
            return Err(OverlayError::NotLinked);
        };
        if let Some((_, data)) = entries.iter().find(|(l, _)| *l == label) {
            let mut own = Message::new(class, data.clone());
            own.set_routing(RoutingKind::Scatterv);
            own.set_source(source);
            if class == MessageClass::User {
                self.deliver_to_delegate(own);
            } else {
                self.handle_admin(own, Some(control), None).await?;
            }
        }

        let labels: Vec<u32> = entries.iter().map(|(l, _)| *l).collect();
        let routes = {
            let mut node_guard = self.node.write();
            let Some(node) = node_guard.as_mut() else {
                return Err(OverlayError::NotLinked);
            };
            let peers = self.peers.read();
            node.scatter_partition(control, &labels)
                .into_iter()
                .filter(|route| !route.labels.is_empty())
                .map(|route| {
                    let neighbor = node.label_for_link(route.link);
                    let pruned = node.control_for_link(control, route.link);
                    (route, neighbor, pruned, peers.get(&neighbor).cloned())
                })
                .collect::<Vec<_>>()
        };

        let by_label: HashMap<u32, &Bytes> = entries.iter().map(|(l, d)| (*l, d)).collect();
        for (route, neighbor, pruned, chan) in routes {
            let Some(chan) = chan else {
                warn!(neighbor, "unable to relay scatterv: channel does not exist");
                continue;
            };
            let mut payload = BytesMut::new();
            payload.put_u32_le(route.labels.len() as u32);
            for &l in &route.labels {
                payload.put_u32_le(l);
            }
            for &l in &route.labels {
                let len = by_label.get(&l).map(|d| d.len()).unwrap_or(0);
                payload.put_u32_le(len as u32);
            }
            for &l in &route.labels {
                match by_label.get(&l) {
                    Some(data) => payload.put_slice(data),
                    None => warn!(label = l, "label missing from scatterv data"),
                }
            }
            let mut fwd = Message::new(class, payload.freeze());
            fwd.set_routing(RoutingKind::Scatterv);
            fwd.set_source(source);
            fwd.set_relay(label);
            let sent = {
                let mut ch = chan.lock().await;
                controller::send_with_control(ch.as_mut(), Some(pruned), &fwd).await
            };
            if let Err(err) = sent {
                self.drop_peer(neighbor, &err);
            }
        }
        Ok(())
    }

    /// Handle a linkup message: assign our label, dial the neighbors whose
    /// connection info is embedded in the payload, and re-broadcast so the
    /// whole graph converges from a single seed sent to label 0.
    async fn link_network(&self, msg: &Message, control: u32) -> Result<()> {
        let (num_nodes, labels, infos) = admin::parse_linkup(msg.payload())?;
        if num_nodes == 0 {
            return Err(OverlayError::Protocol("linkup with zero nodes".into()));
        }
        let dims = ceil_log2(num_nodes);
        let my_label = linkup_label(msg.relay(), control, dims);
        info!(label = my_label, num_nodes, "linking overlay network");

        let mut node = Hypercube::new(my_label, num_nodes);
        let mut new_peers: Vec<(u32, SharedChannel)> = Vec::new();
        for (neighbor, conninfo) in labels.iter().copied().zip(&infos) {
            if !node.is_neighbor_label(neighbor) {
                continue;
            }
            match self.connect_neighbor(neighbor, conninfo).await {
                Ok(chan) => {
                    node.add_neighbor(neighbor);
                    new_peers.push((neighbor, chan));
                }
                Err(err) => warn!(neighbor, %err, "unable to connect to neighbor"),
            }
        }

        let mut forwards: Vec<(u32, u32, SharedChannel)> = Vec::new();
        for link in node.broadcast_links(control) {
            let neighbor = node.label_for_link(link);
            let pruned = node.control_for_linkup(control, link);
            match new_peers.iter().find(|(l, _)| *l == neighbor) {
                Some((_, chan)) => forwards.push((neighbor, pruned, chan.clone())),
                None => warn!(neighbor, "neighbor does not exist for linkup forward"),
            }
        }

        *self.node.write() = Some(node);
        {
            let mut peers = self.peers.write();
            for (label, chan) in new_peers {
                peers.insert(label, chan);
            }
        }

        let mut buf = msg.pack().to_vec();
        wire::set_relay(&mut buf, my_label)?;
        for (neighbor, pruned, chan) in forwards {
            debug!(neighbor, "forwarding linkup message");
            let sent = {
                let mut ch = chan.lock().await;
                controller::send_packed_with_control(ch.as_mut(), Some(pruned), &buf).await
            };
            if let Err(err) = sent {
                self.drop_peer(neighbor, &err);
            }
        }
        self.linked.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Dial one neighbor and read the connection id its accept loop assigns.
    async fn connect_neighbor(&self, label: u32, conninfo: &str) -> Result<SharedChannel> {
        let mut chan = self.registry.create(self.channel_class, conninfo)?;
        chan.open(NEIGHBOR_CONNECT_TIMEOUT).await?;
        let mut tag = [0u8; 4];
        chan.recv_exact(&mut tag).await?;
        chan.set_tag(u32::from_le_bytes(tag));
        debug!(neighbor = label, conninfo, "added neighbor");
        Ok(Arc::new(tokio::sync::Mutex::new(chan)))
    }

    async fn await_contributions(&self, slot: usize, participants: u32) {
        let expected = participants.saturating_sub(1);
        loop {
            let count = {
                let s = self.slots[slot].lock();
                s.child_count + s.client_count
            };
            if count >= expected {
                break;
            }
            tokio::time::sleep(COLLECTIVE_POLL).await;
        }
    }

    async fn await_ready(&self, slot: usize) {
        loop {
            if self.slots[slot].lock().ready {
                break;
            }
            tokio::time::sleep(COLLECTIVE_POLL).await;
        }
    }
}

/// The protocol layer of one overlay process.
pub struct ServerNode {
    inner: Arc<ServerInner>,
}

impl ServerNode {
    pub fn new(server: Box<dyn ServerChannel>, registry: Arc<ChannelRegistry>) -> Self {
        let channel_class = server.class_name();
        Self {
            inner: Arc::new(ServerInner {
                registry,
                channel_class,
                server: tokio::sync::Mutex::new(server),
                conninfo: RwLock::new(String::new()),
                node: RwLock::new(None),
                peers: RwLock::new(HashMap::new()),
                connections: RwLock::new(Vec::new()),
                next_id: AtomicU32::new(1),
                running: AtomicBool::new(false),
                linked: AtomicBool::new(false),
                slots: [
                    Mutex::new(CollSlot::default()),
                    Mutex::new(CollSlot::default()),
                    Mutex::new(CollSlot::default()),
                ],
                delegate: RwLock::new(None),
            }),
        }
    }

    /// Open the listening channel and spawn the accept and scan tasks.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut server = self.inner.server.lock().await;
            server.setup_to_accept().await?;
            *self.inner.conninfo.write() = server.connection_info();
        }
        let accept = Arc::clone(&self.inner);
        tokio::spawn(accept.accept_loop());
        let scan = Arc::clone(&self.inner);
        tokio::spawn(scan.scan_loop());
        info!(info = %self.connection_info(), "server node started");
        Ok(())
    }

    /// Stop the background tasks and close the listener.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut server = self.inner.server.lock().await;
        server.close();
    }

    /// `"host;port"` of the listening channel, once started.
    pub fn connection_info(&self) -> String {
        self.inner.conninfo.read().clone()
    }

    pub fn network_linked(&self) -> bool {
        self.inner.linked.load(Ordering::SeqCst)
    }

    pub fn label(&self) -> Option<u32> {
        self.inner.node_info().map(|(label, _)| label)
    }

    pub fn num_nodes(&self) -> Option<u32> {
        self.inner.node_info().map(|(_, n)| n)
    }

    /// Install a topology node directly (bypassing linkup).
    pub fn set_node(&self, node: Hypercube) {
        *self.inner.node.write() = Some(node);
        self.inner.linked.store(true, Ordering::SeqCst);
    }

    /// Attach the user-message delegate; inbound user messages without a
    /// destination client queue here.
    pub fn user_messages(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.delegate.write() = Some(tx);
        rx
    }

    /// Send a point-to-point message to the destination set in `msg`.
    pub async fn send_message(&self, mut msg: Message) -> Result<()> {
        let Some((label, _)) = self.inner.node_info() else {
            return Err(OverlayError::NotLinked);
        };
        msg.set_source(label);
        msg.set_routing(RoutingKind::PointToPoint);
        let destination = msg.destination();
        let packed = msg.pack();
        if destination == label {
            self.inner.handle_packed(&packed, None, None).await
        } else {
            self.inner.forward_to(destination, &packed, label).await;
            Ok(())
        }
    }

    /// Broadcast `msg` to every node (excluding local delivery, which the
    /// caller already has in hand).
    pub async fn broadcast(&self, mut msg: Message) -> Result<()> {
        let Some((label, num_nodes)) = self.inner.node_info() else {
            return Err(OverlayError::NotLinked);
        };
        msg.set_source(label);
        msg.set_routing(RoutingKind::Broadcast);
        let control = Hypercube::initial_control(num_nodes);
        let packed = msg.pack();
        self.inner.forward_broadcast(&packed, control).await;
        Ok(())
    }

    /// Gather fixed-size contributions to label 0, then broadcast the
    /// aggregate. `recv` ends up holding node i's data at `i * send.len()`.
    pub async fn allgather(&self, participants: u32, send: &[u8], recv: &mut [u8]) -> Result<()> {
        let Some((label, num_nodes)) = self.inner.node_info() else {
            return Err(OverlayError::NotLinked);
        };
        if label != 0 {
            let mut msg = Message::network(Bytes::copy_from_slice(send));
            msg.set_destination(0);
            msg.set_command(AdminCommand::Allgather as u8);
            self.send_message(msg).await?;
        } else {
            self.inner.await_contributions(ALLGATHER_SLOT, participants).await;
            let (aggregate, waiting) = {
                let mut s = self.inner.slots[ALLGATHER_SLOT].lock();
                let total = send.len() * num_nodes as usize;
                store(&mut s.buffer, 0, send, total);
                s.child_count = 0;
                s.client_count = 0;
                s.ready = true;
                let aggregate = Bytes::copy_from_slice(s.buffer.as_deref().unwrap_or_default());
                (aggregate, std::mem::take(&mut s.waiting_clients))
            };
            let mut msg = Message::network(aggregate);
            msg.set_command(AdminCommand::Allgather as u8);
            self.inner.distribute_to_clients(&waiting, &msg).await;
            self.broadcast(msg).await?;
        }

        self.inner.await_ready(ALLGATHER_SLOT).await;
        let mut s = self.inner.slots[ALLGATHER_SLOT].lock();
        s.ready = false;
        if let Some(buffer) = s.buffer.take() {
            let n = recv.len().min(buffer.len());
            recv[..n].copy_from_slice(&buffer[..n]);
        }
        Ok(())
    }

    /// Variable-size allgather: node i's data lands at the offset implied by
    /// `recv_lens[..i]`.
    pub async fn allgatherv(
        &self,
        participants: u32,
        send: &[u8],
        recv_lens: &[u32],
        recv: &mut [u8],
    ) -> Result<()> {
        let Some((label, num_nodes)) = self.inner.node_info() else {
            return Err(OverlayError::NotLinked);
        };
        if recv_lens.len() < num_nodes as usize {
            return Err(OverlayError::Protocol(
                "allgatherv length array shorter than node count".into(),
            ));
        }
        let offset: usize = recv_lens[..label as usize].iter().map(|&l| l as usize).sum();
        let total: usize = recv_lens[..num_nodes as usize].iter().map(|&l| l as usize).sum();

        if label != 0 {
            let mut payload = BytesMut::with_capacity(8 + send.len());
            payload.put_u32_le(total as u32);
            payload.put_u32_le(offset as u32);
            payload.put_slice(send);
            let mut msg = Message::network(payload.freeze());
            msg.set_destination(0);
            msg.set_command(AdminCommand::Allgatherv as u8);
            self.send_message(msg).await?;
        } else {
            self.inner.await_contributions(ALLGATHERV_SLOT, participants).await;
            let (aggregate, waiting) = {
                let mut s = self.inner.slots[ALLGATHERV_SLOT].lock();
                store(&mut s.buffer, offset, send, total);
                s.child_count = 0;
                s.client_count = 0;
                s.ready = true;
                let aggregate = Bytes::copy_from_slice(s.buffer.as_deref().unwrap_or_default());
                (aggregate, std::mem::take(&mut s.waiting_clients))
            };
            let mut msg = Message::network(aggregate);
            msg.set_command(AdminCommand::Allgatherv as u8);
            self.inner.distribute_to_clients(&waiting, &msg).await;
            self.broadcast(msg).await?;
        }

        self.inner.await_ready(ALLGATHERV_SLOT).await;
        let mut s = self.inner.slots[ALLGATHERV_SLOT].lock();
        s.ready = false;
        if let Some(buffer) = s.buffer.take() {
            let n = recv.len().min(buffer.len());
            recv[..n].copy_from_slice(&buffer[..n]);
        }
        Ok(())
    }

    /// Barrier across `participants` nodes and attached clients.
    pub async fn synchronize(&self, participants: u32) -> Result<()> {
        let Some((label, _)) = self.inner.node_info() else {
            return Err(OverlayError::NotLinked);
        };
        self.inner.slots[SYNCHRONIZE_SLOT].lock().ready = false;

        if label != 0 {
            let mut msg = Message::network(Bytes::new());
            msg.set_destination(0);
            msg.set_command(AdminCommand::Synchronize as u8);
            self.send_message(msg).await?;
        } else {
            self.inner.await_contributions(SYNCHRONIZE_SLOT, participants).await;
            let waiting = {
                let mut s = self.inner.slots[SYNCHRONIZE_SLOT].lock();
                s.ready = true;
                s.child_count = 0;
                s.client_count = 0;
                std::mem::take(&mut s.waiting_clients)
            };
            let mut msg = Message::network(Bytes::new());
            msg.set_command(AdminCommand::Synchronize as u8);
            self.inner.distribute_to_clients(&waiting, &msg).await;
            self.broadcast(msg).await?;
        }

        self.inner.await_ready(SYNCHRONIZE_SLOT).await;
        self.inner.slots[SYNCHRONIZE_SLOT].lock().ready = false;
        Ok(())
    }

    /// Distribute `chunks[i]` to the node with label `i`.
    pub async fn scatterv(&self, class: MessageClass, chunks: &[Bytes]) -> Result<()> {
        let Some((label, num_nodes)) = self.inner.node_info() else {
            return Err(OverlayError::NotLinked);
        };
        if chunks.len() < num_nodes as usize {
            return Err(OverlayError::Protocol(
                "scatterv chunk array shorter than node count".into(),
            ));
        }
        let entries: Vec<(u32, Bytes)> = (0..num_nodes)
            .map(|l| (l, chunks[l as usize].clone()))
            .collect();
        let control = Hypercube::initial_control(num_nodes);
        self.inner
            .scatterv_internal(label, class, &entries, control)
            .await
    }
}
