//! Failure-path scenarios: a daemon that never connects, and a daemon with
//! the wrong credentials.

use std::time::Duration;

use bootstrap::{Session, SessionConfig, SessionError};
use lattice_e2e_tests::init_logging;

const AUTH: [i32; 3] = [1, 2, 3];

fn test_config(auth: [i32; 3]) -> SessionConfig {
    SessionConfig {
        auth,
        stagger_connects: false,
        ..SessionConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn missing_daemon_times_out_with_roster_of_the_connected() {
    init_logging();

    const NHOSTS: usize = 8;
    const ABSENT_RANK: i32 = 5;

    let mut root = Session::server(test_config(AUTH), NHOSTS as i32);
    let root_port = root.server_initialize(0).await.expect("root listen socket");

    let mut daemons = Vec::new();
    for rank in (0..NHOSTS as i32).filter(|&r| r != ABSENT_RANK) {
        daemons.push(tokio::spawn(async move {
            let mut session = Session::client(test_config(AUTH), "127.0.0.1", root_port);
            session
                .client_connect(1, rank, Some(Duration::from_secs(20)), None)
                .await
                .expect("present daemon should authenticate");
            session
        }));
    }

    let proc_list = vec![1i32; NHOSTS];
    let host_list = vec!["127.0.0.1".to_string(); NHOSTS];
    let result = root
        .server_connect(&proc_list, &host_list, Some(Duration::from_secs(3)))
        .await;

    match result {
        Err(SessionError::HandshakeTimeout { connected }) => {
            // exactly the seven daemons that did connect, with correct
            // host/process-count/pid
            assert_eq!(connected.len(), NHOSTS - 1);
            let mut ranks: Vec<i32> = connected.iter().map(|p| p.rank).collect();
            ranks.sort_unstable();
            let expected: Vec<i32> =
                (0..NHOSTS as i32).filter(|&r| r != ABSENT_RANK).collect();
            assert_eq!(ranks, expected);
            for peer in &connected {
                assert_eq!(peer.host, "127.0.0.1");
                assert_eq!(peer.process_count, 1);
                assert_eq!(peer.pid, std::process::id());
            }
        }
        other => panic!("expected handshake timeout, got {other:?}"),
    }

    for daemon in daemons {
        let mut session = daemon.await.expect("daemon task panicked");
        session.terminate();
    }
    root.terminate();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_auth_triple_never_gets_the_go_ahead() {
    init_logging();

    let mut root = Session::server(test_config(AUTH), 1);
    let root_port = root.server_initialize(0).await.expect("root listen socket");

    let daemon = tokio::spawn(async move {
        let mut session = Session::client(test_config([1, 2, 999]), "127.0.0.1", root_port);
        session
            .client_connect(1, 0, Some(Duration::from_secs(10)), None)
            .await
    });

    // a hard auth mismatch is a misconfigured launch, not a wait state
    let root_result = root
        .server_connect(&[1], &["127.0.0.1".to_string()], Some(Duration::from_secs(10)))
        .await;
    assert!(
        matches!(root_result, Err(SessionError::AuthMismatch)),
        "root should fail the launch attempt"
    );

    let daemon_result = daemon.await.expect("daemon task panicked");
    assert!(daemon_result.is_err(), "daemon must never receive ok=1");
    root.terminate();
}
