//! Shared scaffolding for the end-to-end launch scenarios.

use std::sync::Arc;
use std::time::Duration;

use channel::{ChannelRegistry, TcpChannelConfig, TcpServerChannel};
use overlay::ServerNode;

/// Install the test log subscriber once.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Start a daemon-side overlay node on an ephemeral port.
pub async fn start_overlay_node(registry: &Arc<ChannelRegistry>) -> Arc<ServerNode> {
    let server = Box::new(TcpServerChannel::new(0, TcpChannelConfig::default()));
    let node = Arc::new(ServerNode::new(server, Arc::clone(registry)));
    node.start().await.expect("overlay node failed to start");
    node
}

/// Poll until the node reports a linked network.
pub async fn wait_linked(node: &ServerNode, timeout: Duration) {
    tokio::time::timeout(timeout, async {
        while !node.network_linked() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("overlay linkup did not converge in time");
}
