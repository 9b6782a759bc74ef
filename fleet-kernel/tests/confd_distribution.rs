//! Diffusion de conf.d vers les nœuds activés (archive locale réelle, transport scripté).

use fleet_devkit::{MockCall, TestHarness};
use fleet_kernel::ErrorKind;

async fn harness_with(nodes: &[(&str, bool)]) -> TestHarness {
    let h = TestHarness::new().await.unwrap();
    for (name, enabled) in nodes {
        h.register(name, *enabled).await.unwrap();
    }
    h
}

#[tokio::test]
async fn empty_fleet_is_a_trivial_success() {
    let h = harness_with(&[("w1", false)]).await;

    let resp = h.fleet.distribute_confd().await;
    assert!(resp.success);
    assert_eq!(resp.message, "No enabled nodes found to distribute conf.d to");
    let data = resp.data.unwrap();
    assert_eq!(data["successRate"], "0/0");
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn replaces_tree_on_every_enabled_node() {
    let h = harness_with(&[("w1", true), ("w2", true), ("w3", false)]).await;

    let resp = h.fleet.distribute_confd().await;
    assert!(resp.success, "{}", resp.message);
    let data = resp.data.unwrap();
    assert_eq!(data["successRate"], "2/2");
    assert!(data["failedNodes"].as_array().unwrap().is_empty());
    assert!(h.executor.commands_for("w3").is_empty());

    let w1 = h.executor.commands_for("w1");
    assert_eq!(w1.len(), 6);
    assert!(w1[0].starts_with("rm -rf ") && w1[0].contains("/srv/w1/conf.d"));
    assert!(w1[1].starts_with("mkdir -p "));
    assert!(w1[2].starts_with("copy ") && w1[2].contains("confd_backup_w1.tar.gz"));
    assert!(w1[3].contains("tar -xzf"));
    assert!(w1[4].starts_with("test -d "));
    assert!(w1[5].starts_with("rm -f "));

    // archive locale supprimée après la diffusion
    assert!(!h.fixture.path().join("tmp/confd_backup.tar.gz").exists());
}

#[tokio::test]
async fn partial_failure_lists_exactly_the_failed_nodes() {
    let h = harness_with(&[("w1", true), ("w2", true), ("w3", true), ("w4", true)]).await;
    h.executor
        .fail_on_node("w2", "tar -xzf", "gzip: stdin: unexpected end of file")
        .fail_on_node("w4", "copy", "scp: /tmp: No space left on device");

    let resp = h.fleet.distribute_confd().await;
    assert!(!resp.success);
    assert!(resp.partial);
    let data = resp.data.unwrap();
    assert_eq!(data["successRate"], "2/4");
    assert_eq!(data["failedNodes"], serde_json::json!(["w2", "w4"]));
    assert!(data["nodes"]["w2"]["message"].as_str().unwrap().contains("extract-archive"));
    assert!(data["nodes"]["w4"]["message"].as_str().unwrap().contains("transfer-archive"));

    // nettoyage distant tenté partout, même après échec
    assert_eq!(h.executor.count_matching("rm -f "), 4);

    let snap = h.fleet.state().snapshot();
    assert_eq!(snap.node_data["w2"].status, "config-sync-failed");
    assert_eq!(snap.node_data["w1"].status, "registered");
}

#[tokio::test]
async fn total_failure_is_not_partial() {
    let h = harness_with(&[("w1", true), ("w2", true)]).await;
    h.executor.fail_on("rm -rf", "ssh: connect to host 127.0.0.1 port 22: Connection refused");

    let resp = h.fleet.distribute_confd().await;
    assert!(!resp.success);
    assert!(!resp.partial);
    assert_eq!(resp.data.unwrap()["distributedNodes"], 0);
    // aucune copie après l'échec de la première étape
    assert!(!h.executor.calls().iter().any(|c| matches!(c, MockCall::Copy { .. })));
}

#[tokio::test]
async fn missing_local_tree_is_reported() {
    let h = harness_with(&[("w1", true)]).await;
    std::fs::remove_dir_all(h.fixture.confd_dir()).unwrap();

    let resp = h.fleet.distribute_confd().await;
    assert_eq!(resp.error_kind, Some(ErrorKind::MissingArtifact));
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn propagation_failure_after_distribution_is_partial() {
    let h = harness_with(&[("w1", true)]).await;
    h.executor.fail_on("tar -xzf", "tar: Error is not recoverable");

    let names = vec!["MongoDB".to_string()];
    let resp = h.fleet.distribute_eps(&names, 4000, true).await;
    assert!(!resp.success);
    assert!(resp.partial);
    let data = resp.data.unwrap();
    assert_eq!(data["updatedConfigs"]["MongoDB"], 1000);
    assert_eq!(data["confd"]["failedNodes"], serde_json::json!(["w1"]));
    // la configuration locale reste écrite
    assert!(h.fixture.source_conf("MongoDB").unwrap().contains("NumUniqKey: 1000"));
}
