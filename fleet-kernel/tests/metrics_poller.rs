use fleet_devkit::TestHarness;
use fleet_kernel::poller::{poll_once, spawn_metrics_poller};
use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn poll_folds_agent_metrics_into_state() {
    let h = TestHarness::new().await.unwrap().with_agent("node-w1").await.unwrap();
    h.register("w1", true).await.unwrap();
    h.agent.as_ref().unwrap().set_metrics(json!({
        "nodeId": "node-w1",
        "running": true,
        "system": {
            "cpu": { "used_percent": 41.5, "cores": 8 },
            "memory": { "total_gb": 16.0, "used_percent": 62.0 }
        }
    }));

    poll_once(&h.fleet, &reqwest::Client::new(), Duration::from_secs(2)).await;

    let node = h.fleet.state().snapshot().node_data["w1"].clone();
    assert_eq!(node.status, "active");
    assert_eq!(node.cpu, 41.5);
    assert_eq!(node.memory, 62.0);
    assert_eq!(node.total_cpu, 8.0);
    assert_eq!(node.total_memory, 16.0);
}

#[tokio::test]
async fn unreachable_agent_marks_node() {
    let h = TestHarness::new().await.unwrap();
    h.register("w1", true).await.unwrap();
    h.register("w2", false).await.unwrap();

    poll_once(&h.fleet, &reqwest::Client::new(), Duration::from_secs(2)).await;

    let snap = h.fleet.state().snapshot();
    assert_eq!(snap.node_data["w1"].status, "unreachable");
    assert_eq!(snap.node_data["w2"].status, "registered");
}

#[tokio::test]
async fn poller_stops_on_shutdown() {
    let h = TestHarness::new().await.unwrap();
    let (tx, rx) = watch::channel(false);
    let handle = spawn_metrics_poller(h.fleet.clone(), Duration::from_millis(20), Duration::from_secs(1), rx);

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
}
