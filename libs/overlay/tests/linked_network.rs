//! Overlay integration: linkup from a single seed, collectives across a
//! live multi-node network, and client ride-alongs.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use channel::{ChannelRegistry, TcpChannelConfig, TcpServerChannel, TCP_CHANNEL_CLASS};
use overlay::{controller, linkup_message, ClientEndpoint, ServerNode};
use topology::Hypercube;
use wire::MessageClass;

const LINK_TIMEOUT: Duration = Duration::from_secs(15);

async fn start_nodes(count: usize) -> (Arc<ChannelRegistry>, Vec<Arc<ServerNode>>) {
    let registry = Arc::new(ChannelRegistry::with_defaults());
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        let server = Box::new(TcpServerChannel::new(0, TcpChannelConfig::default()));
        let node = Arc::new(ServerNode::new(server, Arc::clone(&registry)));
        node.start().await.expect("server node failed to start");
        nodes.push(node);
    }
    (registry, nodes)
}

/// Send the linkup seed to the node that should become label 0.
async fn seed_linkup(registry: &ChannelRegistry, nodes: &[Arc<ServerNode>]) {
    let conninfo: Vec<String> = nodes.iter().map(|n| n.connection_info()).collect();
    let labels: Vec<u32> = (0..nodes.len() as u32).collect();
    let msg = linkup_message(nodes.len() as u32, &labels, &conninfo);
    let control = Hypercube::initial_control(nodes.len() as u32);

    let mut chan = registry
        .create(TCP_CHANNEL_CLASS, &conninfo[0])
        .expect("create seed channel");
    chan.open(Duration::from_secs(5)).await.expect("open seed channel");
    let mut id = [0u8; 4];
    chan.recv_exact(&mut id).await.expect("read assigned id");
    controller::send_with_control(chan.as_mut(), Some(control), &msg)
        .await
        .expect("send linkup seed");
}

async fn wait_linked(nodes: &[Arc<ServerNode>]) {
    tokio::time::timeout(LINK_TIMEOUT, async {
        for node in nodes {
            while !node.network_linked() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    })
    .await
    .expect("linkup did not converge in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn linkup_assigns_labels_from_a_single_seed() {
    let (registry, nodes) = start_nodes(4).await;
    seed_linkup(&registry, &nodes).await;
    wait_linked(&nodes).await;

    for (expect, node) in nodes.iter().enumerate() {
        assert_eq!(node.label(), Some(expect as u32));
        assert_eq!(node.num_nodes(), Some(4));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn synchronize_returns_on_every_node() {
    let (registry, nodes) = start_nodes(4).await;
    seed_linkup(&registry, &nodes).await;
    wait_linked(&nodes).await;

    let mut tasks = Vec::new();
    for node in &nodes {
        let node = Arc::clone(node);
        tasks.push(tokio::spawn(async move { node.synchronize(4).await }));
    }
    let all = futures_join(tasks).await;
    for result in all {
        result.expect("synchronize failed");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn allgather_orders_contributions_by_label() {
    let (registry, nodes) = start_nodes(4).await;
    seed_linkup(&registry, &nodes).await;
    wait_linked(&nodes).await;

    let mut tasks = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        let node = Arc::clone(node);
        tasks.push(tokio::spawn(async move {
            let send = [i as u8; 8];
            let mut recv = [0u8; 32];
            node.allgather(4, &send, &mut recv).await?;
            Ok::<_, overlay::OverlayError>(recv)
        }));
    }
    for result in futures_join(tasks).await {
        let recv = result.expect("allgather failed");
        let expected: Vec<u8> = (0..4u8).flat_map(|i| [i; 8]).collect();
        assert_eq!(&recv[..], &expected[..]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn allgatherv_honors_explicit_offsets() {
    let (registry, nodes) = start_nodes(2).await;
    seed_linkup(&registry, &nodes).await;
    wait_linked(&nodes).await;

    let lens = [3u32, 5u32];
    let mut tasks = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        let node = Arc::clone(node);
        tasks.push(tokio::spawn(async move {
            let send = vec![(i + 1) as u8; lens[i] as usize];
            let mut recv = vec![0u8; 8];
            node.allgatherv(2, &send, &lens, &mut recv).await?;
            Ok::<_, overlay::OverlayError>(recv)
        }));
    }
    for result in futures_join(tasks).await {
        let recv = result.expect("allgatherv failed");
        assert_eq!(recv, vec![1, 1, 1, 2, 2, 2, 2, 2]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn client_endpoint_rides_collectives() {
    let (registry, nodes) = start_nodes(2).await;
    seed_linkup(&registry, &nodes).await;
    wait_linked(&nodes).await;

    // attach a client to the non-root node
    let chan = registry
        .create(TCP_CHANNEL_CLASS, &nodes[1].connection_info())
        .expect("create client channel");
    let mut client = ClientEndpoint::new(chan);
    client.connect(Duration::from_secs(5)).await.expect("client connect");
    assert!(client.client_id() > 0);

    let info = client.get_server_info().await.expect("server info");
    assert_eq!(info.label, 1);
    assert_eq!(info.num_nodes, 2);

    // 2 nodes + 1 client = 3 participants
    let mut tasks = Vec::new();
    for node in &nodes {
        let node = Arc::clone(node);
        tasks.push(tokio::spawn(async move { node.synchronize(3).await }));
    }
    let client_task = tokio::spawn(async move {
        client.synchronize().await.expect("client synchronize");
        client
    });
    for result in futures_join(tasks).await {
        result.expect("node synchronize failed");
    }
    client_task.await.expect("client task panicked");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn scatterv_delivers_each_slice_once() {
    let (registry, nodes) = start_nodes(4).await;
    seed_linkup(&registry, &nodes).await;
    wait_linked(&nodes).await;

    let mut inboxes = Vec::new();
    for node in &nodes {
        inboxes.push(node.user_messages());
    }

    let chunks: Vec<Bytes> = (0..4u8)
        .map(|i| Bytes::from(vec![i; (i as usize + 1) * 2]))
        .collect();
    nodes[0]
        .scatterv(MessageClass::User, &chunks)
        .await
        .expect("scatterv failed");

    // every node's delegate sees exactly its own slice, the source included
    for (i, inbox) in inboxes.iter_mut().enumerate() {
        let msg = tokio::time::timeout(Duration::from_secs(10), inbox.recv())
            .await
            .expect("scatterv slice did not arrive")
            .expect("delegate channel closed");
        assert_eq!(msg.payload(), &chunks[i][..]);
    }
}

/// Await a batch of spawned tasks, panicking on join errors.
async fn futures_join<T>(tasks: Vec<tokio::task::JoinHandle<T>>) -> Vec<T> {
    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(task.await.expect("task panicked"));
    }
    results
}
