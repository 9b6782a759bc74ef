//! Statut / démarrage / arrêt du binaire de simulation via l'exécuteur distant scripté.

use fleet_devkit::TestHarness;
use fleet_kernel::ErrorKind;

#[tokio::test]
async fn status_reports_running_pid() {
    let h = TestHarness::new().await.unwrap();
    h.register("w1", true).await.unwrap();
    h.executor
        .respond("pgrep", "4242\n")
        .respond("lstart", "Mon Oct 12 10:00:00 2026\n");

    let resp = h.fleet.process_status("w1").await;
    assert!(resp.success);
    let data = resp.data.unwrap();
    assert_eq!(data["status"], "running");
    assert_eq!(data["pid"], 4242);
    assert_eq!(data["startTime"], "Mon Oct 12 10:00:00 2026");
}

#[tokio::test]
async fn status_of_disabled_node_makes_no_remote_call() {
    let h = TestHarness::new().await.unwrap();
    h.register("w1", false).await.unwrap();

    let resp = h.fleet.process_status("w1").await;
    assert_eq!(resp.data.unwrap()["status"], "disabled");
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn status_all_isolates_unreachable_nodes() {
    let h = TestHarness::new().await.unwrap();
    h.register("w1", true).await.unwrap();
    h.register("w2", true).await.unwrap();
    h.executor.fail_on_node("w2", "pgrep", "ssh: connect to host 127.0.0.1 port 22: Connection refused");

    let resp = h.fleet.process_status_all().await;
    assert!(resp.success);
    let statuses = resp.data.unwrap();
    let statuses = statuses.as_array().unwrap();
    assert_eq!(statuses.len(), 2);
    let w1 = statuses.iter().find(|s| s["nodeName"] == "w1").unwrap();
    let w2 = statuses.iter().find(|s| s["nodeName"] == "w2").unwrap();
    assert_eq!(w1["status"], "stopped");
    assert_eq!(w2["status"], "error");
    assert!(w2["error"].as_str().unwrap().contains("Connection refused"));
}

#[tokio::test]
async fn start_returns_pid_and_verifies() {
    let h = TestHarness::new().await.unwrap();
    h.register("w1", true).await.unwrap();
    // premier pgrep : arrêté ; après le démarrage : en cours
    h.executor
        .respond("pgrep", "4242\n")
        .respond_once("pgrep", "")
        .respond("nohup", "4242\n");

    let resp = h.fleet.start_process("w1", None).await;
    assert!(resp.success, "{}", resp.message);
    let data = resp.data.unwrap();
    assert_eq!(data["pid"], 4242);
    assert!(data.get("warning").is_none());
    assert_eq!(data["status"]["status"], "running");
    assert_eq!(h.fleet.state().snapshot().node_data["w1"].status, "active");
    assert_eq!(h.executor.count_matching("sleep"), 0);
}

#[tokio::test]
async fn start_with_timeout_schedules_auto_stop() {
    let h = TestHarness::new().await.unwrap();
    h.register("w1", true).await.unwrap();
    h.executor
        .respond("pgrep", "4242\n")
        .respond_once("pgrep", "")
        .respond("nohup", "4242\n");

    let resp = h.fleet.start_process("w1", Some(5)).await;
    assert!(resp.success);
    assert!(resp.message.contains("timeout 5 min"));
    assert_eq!(h.executor.count_matching("(sleep 300; kill 4242)"), 1);
}

#[tokio::test]
async fn start_with_inconclusive_check_is_success_with_warning() {
    let h = TestHarness::new().await.unwrap();
    h.register("w1", true).await.unwrap();
    h.executor.respond("nohup", "4242\n");

    let resp = h.fleet.start_process("w1", None).await;
    assert!(resp.success);
    let data = resp.data.unwrap();
    assert_eq!(data["pid"], 4242);
    assert!(data["warning"].is_string());
    assert!(resp.message.contains("inconclusive"));
}

#[tokio::test]
async fn start_refuses_when_already_running() {
    let h = TestHarness::new().await.unwrap();
    h.register("w1", true).await.unwrap();
    h.executor.respond("pgrep", "4242\n");

    let resp = h.fleet.start_process("w1", None).await;
    assert_eq!(resp.error_kind, Some(ErrorKind::AlreadyRunning));
    assert!(resp.message.contains("4242"));
    assert_eq!(h.executor.count_matching("nohup"), 0);
}

#[tokio::test]
async fn start_on_disabled_node_is_rejected() {
    let h = TestHarness::new().await.unwrap();
    h.register("w1", false).await.unwrap();

    let resp = h.fleet.start_process("w1", None).await;
    assert_eq!(resp.error_kind, Some(ErrorKind::NodeDisabled));
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn stop_requires_running_process() {
    let h = TestHarness::new().await.unwrap();
    h.register("w1", true).await.unwrap();

    let resp = h.fleet.stop_process("w1", None).await;
    assert_eq!(resp.error_kind, Some(ErrorKind::NotRunning));
    assert_eq!(h.executor.count_matching("kill"), 0);
}

#[tokio::test]
async fn stop_sends_signal_then_verifies() {
    let h = TestHarness::new().await.unwrap();
    h.register("w1", true).await.unwrap();
    h.executor.respond("pgrep", "").respond_once("pgrep", "4242\n");

    let resp = h.fleet.stop_process("w1", Some(30)).await;
    assert!(resp.success, "{}", resp.message);
    assert_eq!(resp.message, "Binary stopped on node w1");
    assert_eq!(h.executor.count_matching("kill 4242"), 1);
    assert_eq!(h.executor.count_matching("kill -9"), 0);
    assert_eq!(h.fleet.state().snapshot().node_data["w1"].status, "idle");
}

#[tokio::test]
async fn stop_escalates_to_forced_kill() {
    let h = TestHarness::new().await.unwrap();
    h.register("w1", true).await.unwrap();
    h.executor
        .respond("pgrep", "")
        .respond_once("pgrep", "4242\n")
        .fail_on("kill 4242", "Operation not permitted");

    let resp = h.fleet.stop_process("w1", None).await;
    assert!(resp.success, "{}", resp.message);
    assert_eq!(h.executor.count_matching("kill -9 4242"), 1);
}

#[tokio::test]
async fn metrics_agent_start_checks_binary_first() {
    let h = TestHarness::new().await.unwrap();
    h.register("w1", true).await.unwrap();
    h.executor.fail_on("test -x", "exit status 1");

    let resp = h.fleet.start_metrics_agent("w1").await;
    assert_eq!(resp.error_kind, Some(ErrorKind::TransportFailure));
    assert!(resp.message.contains("metrics-agent-check"));
    assert_eq!(h.executor.count_matching("nohup"), 0);

    h.executor.clear_rules();
    h.executor.respond("nohup", "5151\n");
    let resp = h.fleet.start_metrics_agent("w1").await;
    assert!(resp.success, "{}", resp.message);
    assert_eq!(resp.data.unwrap()["pid"], 5151);
}

#[tokio::test]
async fn unknown_node_is_not_found() {
    let h = TestHarness::new().await.unwrap();
    assert_eq!(h.fleet.process_status("ghost").await.error_kind, Some(ErrorKind::NotFound));
    assert_eq!(h.fleet.start_process("ghost", None).await.error_kind, Some(ErrorKind::NotFound));
    assert_eq!(h.fleet.stop_process("ghost", None).await.error_kind, Some(ErrorKind::NotFound));
}
