//! Session and bootstrap manager.
//!
//! One `Session` per process drives a job launch. The daemon side connects
//! to the root (staggered, retried, deadline-bounded), authenticates with
//! the three-word auth triple, and reports its overlay listener address.
//! The root side accepts on a dedicated task, resolves host ranks, and once
//! every expected process has checked in, seeds the overlay linkup at host
//! rank 0. Afterwards both sides use the tagged session services
//! (send/receive/broadcast, allgather, barrier) over the same connections.
//!
//! Handshake wire format (little-endian, fixed order): `tag:i32,
//! auth:3*i32, host_rank:i32, process_count:i32, pid:u32,
//! conninfo_len:u32, conninfo`. Reply: `tag:i32, echoed auth:3*i32,
//! ok:i32`. Session messages are `tag:i32, len:u32, payload`.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use channel::{
    Channel, ChannelError, ChannelRegistry, ServerChannel, TcpChannel, TcpChannelConfig,
    TcpServerChannel, TCP_CHANNEL_CLASS,
};
use overlay::ServerNode;
use topology::Hypercube;

use crate::buffer::{PackBuffer, UnpackBuffer};
use crate::error::{PeerDiag, Result, SessionError};

/// Session message tags.
pub mod tags {
    /// Daemon -> root: auth triple, host rank, process count, pid.
    pub const INITMSG: i32 = 0;
    /// Root -> daemon: echoed auth triple plus go-ahead flag.
    pub const INITOK: i32 = 1;
    /// Socket barrier across the handshake connections.
    pub const BARRIER: i32 = 10;
    /// Query answered by the root with the total number of hosts.
    pub const NHOSTS: i32 = 11;
    /// Simple root-gathered allgather.
    pub const ALLGATHER: i32 = 13;
}

/// Host rank sent by a daemon that wants the root to assign one.
pub const UNKNOWN_HOST_RANK: i32 = -1;
/// Process count sent by a daemon that expects the root's host list to know.
pub const UNKNOWN_PROCESS_COUNT: i32 = -1;

const MAX_SESSION_FRAME: usize = 16 * 1024 * 1024;
const MAX_HOSTS: usize = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(200);
const CONNECT_RETRY_PAUSE: Duration = Duration::from_millis(10);
const CONNECT_ATTEMPT_CAP: Duration = Duration::from_secs(5);
const SCAN_PAUSE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Daemon side.
    Client,
    /// Root side.
    Server,
}

/// Knobs for the bootstrap handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// The three-word authentication triple shared by the launch.
    pub auth: [i32; 3],
    /// Stagger daemon connects by `host_rank % 1000` milliseconds to avoid
    /// a connection storm at the root.
    pub stagger_connects: bool,
    /// Retries for transient connect failures (refused, timed out).
    pub connect_retries: u32,
    /// Transport configuration for session connections.
    pub channel: TcpChannelConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth: [0, 0, 0],
            stagger_connects: true,
            connect_retries: 100,
            channel: TcpChannelConfig::default(),
        }
    }
}

struct Peer {
    chan: Box<dyn Channel>,
    host: String,
    process_count: i32,
    pid: u32,
    conninfo: Option<String>,
}

/// Per-process bootstrap state for one job launch.
pub struct Session {
    role: Role,
    config: SessionConfig,
    root_host: String,
    root_port: u16,
    host_rank: i32,
    total_procs: i32,
    nhosts: i32,
    to_root: Option<Box<dyn Channel>>,
    listener: Option<TcpServerChannel>,
    peers: Vec<Option<Peer>>,
    send_buf: PackBuffer,
    recv_buf: UnpackBuffer,
    overlay: Option<Arc<ServerNode>>,
}

impl Session {
    /// Daemon-side session targeting the root at `root_host:root_port`.
    pub fn client(config: SessionConfig, root_host: &str, root_port: u16) -> Self {
        Self {
            role: Role::Client,
            config,
            root_host: root_host.to_string(),
            root_port,
            host_rank: UNKNOWN_HOST_RANK,
            total_procs: UNKNOWN_PROCESS_COUNT,
            nhosts: 0,
            to_root: None,
            listener: None,
            peers: Vec::new(),
            send_buf: PackBuffer::new(),
            recv_buf: UnpackBuffer::new(),
            overlay: None,
        }
    }

    /// Root-side session expecting `total_procs` processes in aggregate.
    pub fn server(config: SessionConfig, total_procs: i32) -> Self {
        Self {
            role: Role::Server,
            config,
            root_host: String::new(),
            root_port: 0,
            host_rank: 0,
            total_procs,
            nhosts: 0,
            to_root: None,
            listener: None,
            peers: Vec::new(),
            send_buf: PackBuffer::new(),
            recv_buf: UnpackBuffer::new(),
            overlay: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn host_rank(&self) -> i32 {
        self.host_rank
    }

    pub fn total_processes(&self) -> i32 {
        self.total_procs
    }

    /// Number of connected hosts (root side, after `server_connect`).
    pub fn nhosts(&self) -> i32 {
        self.nhosts
    }

    pub fn send_buffer(&mut self) -> &mut PackBuffer {
        &mut self.send_buf
    }

    pub fn recv_buffer(&mut self) -> &mut UnpackBuffer {
        &mut self.recv_buf
    }

    /// Hand the session the overlay node it owns, for teardown.
    pub fn attach_overlay(&mut self, node: Arc<ServerNode>) {
        self.overlay = Some(node);
    }

    pub fn overlay(&self) -> Option<&Arc<ServerNode>> {
        self.overlay.as_ref()
    }

    pub fn peer_name(&self, rank: i32) -> Option<String> {
        self.peer(rank).map(|p| p.host.clone())
    }

    pub fn process_count_for(&self, rank: i32) -> Option<i32> {
        self.peer(rank).map(|p| p.process_count)
    }

    pub fn daemon_pid_for(&self, rank: i32) -> Option<u32> {
        self.peer(rank).map(|p| p.pid)
    }

    fn peer(&self, rank: i32) -> Option<&Peer> {
        self.peers.get(rank as usize).and_then(|p| p.as_ref())
    }

    /// Everything connected so far, for diagnostics.
    pub fn connected_roster(&self) -> Vec<PeerDiag> {
        self.peers
            .iter()
            .enumerate()
            .filter_map(|(rank, peer)| {
                peer.as_ref().map(|p| PeerDiag {
                    rank: rank as i32,
                    host: p.host.clone(),
                    process_count: p.process_count,
                    pid: p.pid,
                })
            })
            .collect()
    }

    /// Bind the root's listening socket; returns the resolved port.
    pub async fn server_initialize(&mut self, port: u16) -> Result<u16> {
        let mut listener = TcpServerChannel::new(port, self.config.channel.clone());
        listener
            .setup_to_accept()
            .await
            .map_err(|err| SessionError::Fatal(format!("cannot create listen socket: {err}")))?;
        let port = listener.local_port().unwrap_or(port);
        self.listener = Some(listener);
        Ok(port)
    }

    /// Root side: wait for every expected process to connect and
    /// authenticate. On deadline expiry the error carries the roster of
    /// daemons that did connect.
    pub async fn server_connect(
        &mut self,
        proc_list: &[i32],
        host_list: &[String],
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut listener = self.listener.take().ok_or_else(|| {
            SessionError::Fatal("server_initialize must run before server_connect".into())
        })?;
        let deadline = timeout.map(|t| Instant::now() + t);

        // accept on a dedicated task so handshakes never block the listen
        // socket
        let stop = Arc::new(AtomicBool::new(false));
        let accept_stop = Arc::clone(&stop);
        let (tx, mut rx) = mpsc::channel::<Box<dyn Channel>>(64);
        let accept_task = tokio::spawn(async move {
            while !accept_stop.load(Ordering::SeqCst) {
                match listener.accept(Some(ACCEPT_POLL)).await {
                    Ok(chan) => {
                        if tx.send(chan).await.is_err() {
                            break;
                        }
                    }
                    Err(ChannelError::TimedOut { .. }) => {}
                    Err(err) => {
                        warn!(%err, "accept failed during handshake");
                        break;
                    }
                }
            }
            listener
        });

        let mut resolved = Vec::with_capacity(host_list.len());
        for host in host_list {
            resolved.push(resolve_host(host).await);
        }
        let mut assigned = vec![false; host_list.len()];

        let mut accounted: i64 = 0;
        let outcome = loop {
            if accounted >= self.total_procs as i64 {
                break Ok(());
            }
            let chan = match next_connection(&mut rx, deadline).await {
                Ok(chan) => chan,
                Err(err) => break Err(err),
            };
            let handshake = self.handshake_one(chan, proc_list, &resolved, &mut assigned);
            match timed(deadline, "handshake", handshake).await {
                Ok(nprocs) => accounted += nprocs as i64,
                Err(SessionError::AuthMismatch) => break Err(SessionError::AuthMismatch),
                Err(err) => warn!(%err, "rejected handshake candidate"),
            }
        };

        stop.store(true, Ordering::SeqCst);
        drop(rx);
        match accept_task.await {
            Ok(listener) => self.listener = Some(listener),
            Err(err) => warn!(%err, "accept task did not shut down cleanly"),
        }

        match outcome {
            Ok(()) => {
                self.nhosts = self.peers.iter().flatten().count() as i32;
                info!(
                    nhosts = self.nhosts,
                    processes = accounted,
                    "all expected processes checked in"
                );
                Ok(())
            }
            Err(SessionError::Channel(ChannelError::TimedOut { .. })) => {
                Err(self.handshake_timeout_error())
            }
            Err(err) => Err(err),
        }
    }

    fn handshake_timeout_error(&self) -> SessionError {
        let connected = self.connected_roster();
        error!(
            expected_processes = self.total_procs,
            connected_daemons = connected.len(),
            "handshake wall clock elapsed before every process checked in"
        );
        for peer in &connected {
            error!(
                rank = peer.rank,
                host = %peer.host,
                process_count = peer.process_count,
                pid = peer.pid,
                "daemon that did connect"
            );
        }
        SessionError::HandshakeTimeout { connected }
    }

    /// Authenticate one inbound connection. Rejection closes only that
    /// candidate; an auth-triple mismatch is fatal for the launch attempt.
    async fn handshake_one(
        &mut self,
        mut chan: Box<dyn Channel>,
        proc_list: &[i32],
        resolved: &[Vec<IpAddr>],
        assigned: &mut [bool],
    ) -> Result<i32> {
        let mut head = [0u8; 28];
        chan.recv_exact(&mut head).await?;
        let tag = read_i32(&head, 0);
        let peer_auth = [read_i32(&head, 4), read_i32(&head, 8), read_i32(&head, 12)];
        let mut rank = read_i32(&head, 16);
        let mut nprocs = read_i32(&head, 20);
        let pid = read_i32(&head, 24) as u32;

        let mut info_len = [0u8; 4];
        chan.recv_exact(&mut info_len).await?;
        let info_len = u32::from_le_bytes(info_len) as usize;
        if info_len > 512 {
            return Err(SessionError::Protocol(format!(
                "daemon connection info length {info_len} out of range"
            )));
        }
        let conninfo = if info_len > 0 {
            let mut buf = vec![0u8; info_len];
            chan.recv_exact(&mut buf).await?;
            Some(
                String::from_utf8_lossy(&buf)
                    .trim_end_matches('\0')
                    .to_string(),
            )
        } else {
            None
        };

        let peer_host = chan
            .connection_info()
            .split(';')
            .next()
            .unwrap_or_default()
            .to_string();

        if tag != tags::INITMSG {
            let _ = reply_initok(chan.as_mut(), &self.config.auth, 0).await;
            return Err(SessionError::Protocol(format!(
                "expected INITMSG, got tag {tag}"
            )));
        }
        if peer_auth != self.config.auth {
            let _ = reply_initok(chan.as_mut(), &self.config.auth, 0).await;
            return Err(SessionError::AuthMismatch);
        }
        if rank == UNKNOWN_HOST_RANK {
            rank = match resolve_rank(&peer_host, resolved, assigned) {
                Some(found) => found as i32,
                None => {
                    let _ = reply_initok(chan.as_mut(), &self.config.auth, 0).await;
                    return Err(SessionError::UnknownHost(peer_host));
                }
            };
        }
        if rank < 0 || rank as usize >= MAX_HOSTS {
            let _ = reply_initok(chan.as_mut(), &self.config.auth, 0).await;
            return Err(SessionError::Protocol(format!("host rank {rank} out of range")));
        }
        if self
            .peers
            .get(rank as usize)
            .map(|p| p.is_some())
            .unwrap_or(false)
        {
            let _ = reply_initok(chan.as_mut(), &self.config.auth, 0).await;
            return Err(SessionError::DuplicateRank(rank));
        }
        if (rank as usize) < assigned.len() {
            assigned[rank as usize] = true;
        }
        if nprocs == UNKNOWN_PROCESS_COUNT {
            nprocs = proc_list.get(rank as usize).copied().unwrap_or(1);
        }

        reply_initok(chan.as_mut(), &self.config.auth, 1).await?;

        if self.peers.len() <= rank as usize {
            self.peers.resize_with(rank as usize + 1, || None);
        }
        info!(rank, host = %peer_host, process_count = nprocs, pid, "daemon authenticated");
        self.peers[rank as usize] = Some(Peer {
            chan,
            host: peer_host,
            process_count: nprocs,
            pid,
            conninfo,
        });
        Ok(nprocs)
    }

    /// Daemon side: connect to the root and authenticate. `conninfo` is the
    /// overlay listener address to report for linkup.
    pub async fn client_connect(
        &mut self,
        nprocesses: i32,
        host_rank: i32,
        timeout: Option<Duration>,
        conninfo: Option<&str>,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        if self.config.stagger_connects && host_rank > 0 {
            tokio::time::sleep(Duration::from_millis((host_rank % 1000) as u64)).await;
        }

        let target = format!("{};{}", self.root_host, self.root_port);
        let mut chan = TcpChannel::from_conninfo(&target, self.config.channel.clone())
            .map_err(SessionError::from)?;

        let mut attempts = 0u32;
        loop {
            let attempt_timeout = match deadline {
                None => CONNECT_ATTEMPT_CAP,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        error!(host = %self.root_host, port = self.root_port,
                               "connect deadline exceeded");
                        return Err(SessionError::Channel(ChannelError::timeout(
                            "connect",
                            timeout.unwrap_or_default(),
                        )));
                    }
                    left.min(CONNECT_ATTEMPT_CAP)
                }
            };
            match chan.open(attempt_timeout).await {
                Ok(()) => break,
                Err(err) if retryable_connect(&err) && attempts < self.config.connect_retries => {
                    attempts += 1;
                    debug!(attempts, %err, "retrying connect to root");
                    tokio::time::sleep(CONNECT_RETRY_PAUSE).await;
                }
                Err(err) => {
                    error!(host = %self.root_host, port = self.root_port, %err,
                           "connect to root failed");
                    return Err(err.into());
                }
            }
        }

        // authenticate
        let info_bytes = conninfo.map(str::as_bytes).unwrap_or_default();
        let mut hello = Vec::with_capacity(32 + info_bytes.len());
        hello.extend_from_slice(&tags::INITMSG.to_le_bytes());
        for word in self.config.auth {
            hello.extend_from_slice(&word.to_le_bytes());
        }
        hello.extend_from_slice(&host_rank.to_le_bytes());
        hello.extend_from_slice(&nprocesses.to_le_bytes());
        hello.extend_from_slice(&std::process::id().to_le_bytes());
        hello.extend_from_slice(&(info_bytes.len() as u32).to_le_bytes());
        hello.extend_from_slice(info_bytes);

        let handshake = async {
            chan.send_bytes(&hello).await?;
            let mut reply = [0u8; 20];
            chan.recv_exact(&mut reply).await?;
            Ok::<_, SessionError>(reply)
        };
        let reply = timed(deadline, "handshake", handshake).await?;

        let tag = read_i32(&reply, 0);
        let echoed = [read_i32(&reply, 4), read_i32(&reply, 8), read_i32(&reply, 12)];
        let ok = read_i32(&reply, 16);
        if tag != tags::INITOK {
            return Err(SessionError::Protocol(format!(
                "expected INITOK, got tag {tag}"
            )));
        }
        if echoed != self.config.auth {
            return Err(SessionError::AuthMismatch);
        }
        if ok != 1 {
            return Err(SessionError::Protocol(
                "root did not give the go-ahead".into(),
            ));
        }

        self.host_rank = host_rank;
        self.to_root = Some(Box::new(chan));
        info!(host_rank, "authenticated with root");
        Ok(())
    }

    fn channel_for(&mut self, rank: i32) -> Result<&mut dyn Channel> {
        if rank < 0 {
            match self.to_root.as_mut() {
                Some(chan) => Ok(chan.as_mut()),
                None => Err(SessionError::Fatal("not connected to root".into())),
            }
        } else {
            match self.peers.get_mut(rank as usize).and_then(|p| p.as_mut()) {
                Some(peer) => Ok(peer.chan.as_mut()),
                None => Err(SessionError::Protocol(format!(
                    "no connection for rank {rank}"
                ))),
            }
        }
    }

    fn connected_ranks(&self) -> Vec<i32> {
        self.peers
            .iter()
            .enumerate()
            .filter_map(|(rank, p)| p.as_ref().map(|_| rank as i32))
            .collect()
    }

    /// Send the packed send buffer to `rank` (-1 = the root) under `tag`.
    pub async fn send(&mut self, rank: i32, tag: i32) -> Result<()> {
        let payload = self.send_buf.as_slice().to_vec();
        let chan = self.channel_for(rank)?;
        write_frame(chan, tag, &payload).await
    }

    /// Receive one message from `rank` (-1 = the root) into the receive
    /// buffer; returns its tag. On the root, NHOSTS queries are answered
    /// transparently.
    pub async fn receive(&mut self, rank: i32, timeout: Option<Duration>) -> Result<i32> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let (tag, data) = {
                let chan = self.channel_for(rank)?;
                timed(deadline, "receive", read_frame(chan)).await?
            };
            if self.role == Role::Server && tag == tags::NHOSTS {
                self.answer_nhosts(rank).await?;
                continue;
            }
            self.recv_buf.reset();
            self.recv_buf.load(&data)?;
            return Ok(tag);
        }
    }

    /// Root side: receive from whichever daemon sends next.
    pub async fn receive_from_any(&mut self, timeout: Option<Duration>) -> Result<(i32, i32)> {
        if self.role == Role::Client {
            let tag = self.receive(-1, timeout).await?;
            return Ok((-1, tag));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(SessionError::Channel(ChannelError::timeout(
                        "receive",
                        timeout.unwrap_or_default(),
                    )));
                }
            }
            for rank in self.connected_ranks() {
                let ready = {
                    let chan = self.channel_for(rank)?;
                    chan.readable(Duration::ZERO).await?
                };
                if !ready {
                    continue;
                }
                let (tag, data) = {
                    let chan = self.channel_for(rank)?;
                    read_frame(chan).await?
                };
                if tag == tags::NHOSTS {
                    self.answer_nhosts(rank).await?;
                    continue;
                }
                self.recv_buf.reset();
                self.recv_buf.load(&data)?;
                return Ok((rank, tag));
            }
            tokio::time::sleep(SCAN_PAUSE).await;
        }
    }

    async fn answer_nhosts(&mut self, rank: i32) -> Result<()> {
        debug!(rank, nhosts = self.nhosts, "answering NHOSTS query");
        let count = self.nhosts;
        let chan = self.channel_for(rank)?;
        write_frame(chan, tags::NHOSTS, &count.to_le_bytes()).await
    }

    /// Daemon side: ask the root for the number of hosts in the job.
    pub async fn query_nhosts(&mut self, timeout: Option<Duration>) -> Result<i32> {
        {
            let chan = self.channel_for(-1)?;
            write_frame(chan, tags::NHOSTS, &[]).await?;
        }
        let tag = self.receive(-1, timeout).await?;
        if tag != tags::NHOSTS {
            return Err(SessionError::Protocol(format!(
                "expected NHOSTS reply, got tag {tag}"
            )));
        }
        self.recv_buf.unpack_one_i32()
    }

    /// Send the packed send buffer to every connection under `tag`.
    pub async fn broadcast(&mut self, tag: i32) -> Result<()> {
        let payload = self.send_buf.as_slice().to_vec();
        match self.role {
            Role::Client => {
                let chan = self.channel_for(-1)?;
                write_frame(chan, tag, &payload).await
            }
            Role::Server => {
                for rank in self.connected_ranks() {
                    let chan = self.channel_for(rank)?;
                    write_frame(chan, tag, &payload).await?;
                }
                Ok(())
            }
        }
    }

    /// Simple root-gathered allgather over the handshake connections:
    /// daemon rank i's bytes land at `i * send.len()` in every `recv`.
    /// The root contributes nothing and calls this with an empty `send`.
    pub async fn allgather(
        &mut self,
        send: &[u8],
        recv: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        match self.role {
            Role::Client => {
                {
                    let chan = self.channel_for(-1)?;
                    write_frame(chan, tags::ALLGATHER, send).await?;
                }
                let tag = self.receive(-1, remaining(deadline)).await?;
                if tag != tags::ALLGATHER {
                    return Err(SessionError::Protocol(format!(
                        "expected ALLGATHER aggregate, got tag {tag}"
                    )));
                }
                let n = recv.len().min(self.recv_buf.remaining());
                self.recv_buf.unpack_bytes(&mut recv[..n])
            }
            Role::Server => {
                let nhosts = self.nhosts as usize;
                let mut seen = vec![false; self.peers.len()];
                let mut aggregate: Vec<u8> = Vec::new();
                let mut stride = 0usize;
                let mut outstanding = nhosts;
                while outstanding > 0 {
                    let (rank, tag) = self.receive_from_any(remaining(deadline)).await?;
                    if tag != tags::ALLGATHER {
                        warn!(rank, tag, "unexpected message during allgather");
                        continue;
                    }
                    let rank = rank as usize;
                    if seen[rank] {
                        warn!(rank, "duplicate allgather contribution");
                        continue;
                    }
                    let len = self.recv_buf.remaining();
                    if stride == 0 {
                        stride = len;
                        aggregate = vec![0u8; stride * nhosts];
                    }
                    if len != stride {
                        return Err(SessionError::Protocol(format!(
                            "allgather contribution of {len} bytes, expected {stride}"
                        )));
                    }
                    let mut slice = vec![0u8; len];
                    self.recv_buf.unpack_bytes(&mut slice)?;
                    aggregate[rank * stride..rank * stride + len].copy_from_slice(&slice);
                    seen[rank] = true;
                    outstanding -= 1;
                }
                for rank in self.connected_ranks() {
                    let chan = self.channel_for(rank)?;
                    write_frame(chan, tags::ALLGATHER, &aggregate).await?;
                }
                let n = recv.len().min(aggregate.len());
                recv[..n].copy_from_slice(&aggregate[..n]);
                Ok(())
            }
        }
    }

    /// Socket barrier across the handshake connections.
    pub async fn barrier(&mut self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        match self.role {
            Role::Client => {
                {
                    let chan = self.channel_for(-1)?;
                    write_frame(chan, tags::BARRIER, &1i32.to_le_bytes()).await?;
                }
                let tag = self.receive(-1, remaining(deadline)).await?;
                if tag != tags::BARRIER {
                    return Err(SessionError::Protocol(format!(
                        "expected BARRIER go-ahead, got tag {tag}"
                    )));
                }
                Ok(())
            }
            Role::Server => {
                let mut seen = vec![false; self.peers.len()];
                let mut outstanding = self.nhosts as usize;
                while outstanding > 0 {
                    let (rank, tag) = self.receive_from_any(remaining(deadline)).await?;
                    if tag != tags::BARRIER {
                        warn!(rank, tag, "unexpected message during barrier");
                        continue;
                    }
                    if !seen[rank as usize] {
                        seen[rank as usize] = true;
                        outstanding -= 1;
                    }
                }
                for rank in self.connected_ranks() {
                    let chan = self.channel_for(rank)?;
                    write_frame(chan, tags::BARRIER, &1i32.to_le_bytes()).await?;
                }
                Ok(())
            }
        }
    }

    /// Root side: seed the overlay linkup at host rank 0 with every host's
    /// reported connection info.
    pub async fn linkup(&mut self, registry: &ChannelRegistry) -> Result<()> {
        if self.role != Role::Server {
            return Err(SessionError::Fatal("only the root initiates linkup".into()));
        }
        let nhosts = self.nhosts;
        if nhosts <= 0 {
            return Err(SessionError::Fatal("no hosts connected to link".into()));
        }
        let mut infos = Vec::with_capacity(nhosts as usize);
        for rank in 0..nhosts {
            let info = self
                .peer(rank)
                .ok_or_else(|| SessionError::Protocol(format!("no daemon for rank {rank}")))?
                .conninfo
                .clone()
                .ok_or_else(|| {
                    SessionError::Protocol(format!(
                        "daemon {rank} did not report overlay connection info"
                    ))
                })?;
            infos.push(info);
        }
        let labels: Vec<u32> = (0..nhosts as u32).collect();
        let msg = overlay::linkup_message(nhosts as u32, &labels, &infos);
        let control = Hypercube::initial_control(nhosts as u32);

        let mut chan = registry.create(TCP_CHANNEL_CLASS, &infos[0])?;
        chan.open(Duration::from_secs(10)).await?;
        let mut id = [0u8; 4];
        chan.recv_exact(&mut id).await?;
        overlay::controller::send_with_control(chan.as_mut(), Some(control), &msg).await?;
        chan.close();
        info!(nhosts, seed = %infos[0], "linkup seeded at host rank 0");
        Ok(())
    }

    /// Close every session connection. Overlay teardown goes through
    /// [`Session::shutdown`].
    pub fn terminate(&mut self) {
        if let Some(chan) = self.to_root.as_mut() {
            chan.close();
        }
        for peer in self.peers.iter_mut().flatten() {
            peer.chan.close();
        }
        if let Some(listener) = self.listener.as_mut() {
            listener.close();
        }
    }

    /// Stop the owned overlay node (if any) and close all connections.
    pub async fn shutdown(&mut self) {
        if let Some(node) = self.overlay.take() {
            node.stop().await;
        }
        self.terminate();
    }
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

/// Transient connect failures worth retrying: refused (root not listening
/// yet) and timed out.
fn retryable_connect(err: &ChannelError) -> bool {
    match err {
        ChannelError::TimedOut { .. } | ChannelError::ConnectionLost(_) => true,
        ChannelError::Io(io) => io.kind() == std::io::ErrorKind::ConnectionRefused,
        _ => false,
    }
}

async fn resolve_host(host: &str) -> Vec<IpAddr> {
    match tokio::net::lookup_host((host, 0u16)).await {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(err) => {
            warn!(host, %err, "unable to resolve host list entry");
            Vec::new()
        }
    }
}

/// Match a connecting peer's address against the first unassigned host-list
/// entry that resolves to it.
fn resolve_rank(peer_host: &str, resolved: &[Vec<IpAddr>], assigned: &[bool]) -> Option<usize> {
    let peer_ip: IpAddr = peer_host.parse().ok()?;
    resolved
        .iter()
        .enumerate()
        .find(|(i, ips)| !assigned[*i] && ips.contains(&peer_ip))
        .map(|(i, _)| i)
}

async fn next_connection(
    rx: &mut mpsc::Receiver<Box<dyn Channel>>,
    deadline: Option<Instant>,
) -> Result<Box<dyn Channel>> {
    let accepted = match deadline {
        None => rx.recv().await,
        Some(d) => {
            let left = d.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(SessionError::Channel(ChannelError::timeout(
                    "handshake",
                    Duration::ZERO,
                )));
            }
            match tokio::time::timeout(left, rx.recv()).await {
                Ok(accepted) => accepted,
                Err(_) => {
                    return Err(SessionError::Channel(ChannelError::timeout(
                        "handshake", left,
                    )))
                }
            }
        }
    };
    accepted.ok_or_else(|| SessionError::Fatal("accept task ended unexpectedly".into()))
}

async fn timed<T, F>(deadline: Option<Instant>, operation: &'static str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match deadline {
        None => fut.await,
        Some(d) => {
            let left = d.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(SessionError::Channel(ChannelError::timeout(
                    operation,
                    Duration::ZERO,
                )));
            }
            match tokio::time::timeout(left, fut).await {
                Ok(result) => result,
                Err(_) => Err(SessionError::Channel(ChannelError::timeout(operation, left))),
            }
        }
    }
}

async fn read_frame(chan: &mut dyn Channel) -> Result<(i32, Vec<u8>)> {
    let mut head = [0u8; 8];
    chan.recv_exact(&mut head).await?;
    let tag = read_i32(&head, 0);
    let len = u32::from_le_bytes([head[4], head[5], head[6], head[7]]) as usize;
    if len > MAX_SESSION_FRAME {
        return Err(SessionError::Protocol(format!(
            "session frame of {len} bytes exceeds maximum"
        )));
    }
    let mut data = vec![0u8; len];
    if len > 0 {
        chan.recv_exact(&mut data).await?;
    }
    Ok((tag, data))
}

async fn write_frame(chan: &mut dyn Channel, tag: i32, payload: &[u8]) -> Result<()> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&tag.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    chan.send_bytes(&buf).await?;
    Ok(())
}

async fn reply_initok(chan: &mut dyn Channel, auth: &[i32; 3], ok: i32) -> Result<()> {
    let mut buf = [0u8; 20];
    buf[0..4].copy_from_slice(&tags::INITOK.to_le_bytes());
    buf[4..8].copy_from_slice(&auth[0].to_le_bytes());
    buf[8..12].copy_from_slice(&auth[1].to_le_bytes());
    buf[12..16].copy_from_slice(&auth[2].to_le_bytes());
    buf[16..20].copy_from_slice(&ok.to_le_bytes());
    chan.send_bytes(&buf).await?;
    Ok(())
}
