//! The full launch scenario: 8 daemons and one root authenticate, link the
//! overlay from a single seed, and run session- and overlay-level
//! collectives.

use std::sync::Arc;
use std::time::Duration;

use channel::ChannelRegistry;
use bootstrap::{Session, SessionConfig};
use lattice_e2e_tests::{init_logging, start_overlay_node, wait_linked};

const NHOSTS: usize = 8;
const AUTH: [i32; 3] = [1, 2, 3];
const STEP_TIMEOUT: Duration = Duration::from_secs(30);

fn test_config() -> SessionConfig {
    SessionConfig {
        auth: AUTH,
        // all daemons share one host here; the storm the stagger guards
        // against cannot happen
        stagger_connects: false,
        ..SessionConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn eight_daemons_launch_link_and_synchronize() {
    init_logging();

    let registry = Arc::new(ChannelRegistry::with_defaults());
    let mut root = Session::server(test_config(), NHOSTS as i32);
    let root_port = root.server_initialize(0).await.expect("root listen socket");

    // daemons: authenticate, wait for linkup, then run the collectives
    let mut daemons = Vec::new();
    for rank in 0..NHOSTS as i32 {
        let registry = Arc::clone(&registry);
        daemons.push(tokio::spawn(async move {
            let node = start_overlay_node(&registry).await;
            let mut session = Session::client(test_config(), "127.0.0.1", root_port);
            session
                .client_connect(1, rank, Some(STEP_TIMEOUT), Some(&node.connection_info()))
                .await
                .expect("daemon handshake failed");
            session.attach_overlay(Arc::clone(&node));

            wait_linked(&node, STEP_TIMEOUT).await;
            assert_eq!(node.label(), Some(rank as u32));
            assert_eq!(node.num_nodes(), Some(NHOSTS as u32));

            // session services over the handshake connection
            let reported = session
                .query_nhosts(Some(STEP_TIMEOUT))
                .await
                .expect("nhosts query failed");
            assert_eq!(reported, NHOSTS as i32);
            session.barrier(Some(STEP_TIMEOUT)).await.expect("session barrier failed");

            let send = [rank as u8; 4];
            let mut recv = [0u8; 4 * NHOSTS];
            session
                .allgather(&send, &mut recv, Some(STEP_TIMEOUT))
                .await
                .expect("session allgather failed");
            let expected: Vec<u8> = (0..NHOSTS as u8).flat_map(|r| [r; 4]).collect();
            assert_eq!(&recv[..], &expected[..]);

            // overlay collectives across the linked hypercube
            node.synchronize(NHOSTS as u32)
                .await
                .expect("overlay synchronize failed");

            let send = [0x40 + rank as u8; 8];
            let mut recv = [0u8; 8 * NHOSTS];
            node.allgather(NHOSTS as u32, &send, &mut recv)
                .await
                .expect("overlay allgather failed");
            let expected: Vec<u8> = (0..NHOSTS as u8).flat_map(|r| [0x40 + r; 8]).collect();
            assert_eq!(&recv[..], &expected[..]);

            session.shutdown().await;
        }));
    }

    // root: collect every handshake, seed linkup, join the session steps
    let proc_list = vec![1i32; NHOSTS];
    let host_list = vec!["127.0.0.1".to_string(); NHOSTS];
    root.server_connect(&proc_list, &host_list, Some(STEP_TIMEOUT))
        .await
        .expect("root handshake failed");
    assert_eq!(root.nhosts(), NHOSTS as i32);
    for rank in 0..NHOSTS as i32 {
        assert_eq!(root.process_count_for(rank), Some(1));
        assert_eq!(root.daemon_pid_for(rank), Some(std::process::id()));
    }

    root.linkup(&registry).await.expect("linkup seed failed");
    root.barrier(Some(STEP_TIMEOUT)).await.expect("root barrier failed");

    let mut root_recv = [0u8; 4 * NHOSTS];
    root.allgather(&[], &mut root_recv, Some(STEP_TIMEOUT))
        .await
        .expect("root allgather failed");
    let expected: Vec<u8> = (0..NHOSTS as u8).flat_map(|r| [r; 4]).collect();
    assert_eq!(&root_recv[..], &expected[..]);

    for daemon in daemons {
        daemon.await.expect("daemon task panicked");
    }
    root.terminate();
}
