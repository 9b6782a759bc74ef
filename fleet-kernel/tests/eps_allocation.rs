//! Répartition EPS de bout en bout sur une arborescence conf.d temporaire.

use fleet_devkit::{ConfdFixture, SourceSpec, TestHarness};
use fleet_kernel::ErrorKind;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

async fn current_eps(h: &TestHarness) -> u64 {
    let resp = h.fleet.current_eps().await;
    assert!(resp.success, "{}", resp.message);
    resp.data.unwrap()["currentEps"].as_u64().unwrap()
}

#[tokio::test]
async fn initial_breakdown_counts_enabled_sources() {
    let h = TestHarness::new().await.unwrap();
    // MongoDB : 10 × (3 + 1 pour le sous-module absent) ; Redis : 2 × 1
    assert_eq!(current_eps(&h).await, 42);

    let resp = h.fleet.source_details("MongoDB").await;
    let info = resp.data.unwrap();
    assert_eq!(info["totalSubKeys"], 4);
    assert_eq!(info["subModuleKeys"]["replset"], 30);
    assert_eq!(info["subModuleKeys"]["oplog"], 10);
}

#[tokio::test]
async fn distribute_splits_by_capacity_and_rewrites_configs() {
    let h = TestHarness::new().await.unwrap();

    let resp = h
        .fleet
        .distribute_eps(&names(&["MongoDB", "LinuxMonitor"]), 10_000, false)
        .await;
    assert!(resp.success, "{}", resp.message);
    let data = resp.data.unwrap();
    assert_eq!(data["allocation"]["MongoDB"], 7500);
    assert_eq!(data["allocation"]["LinuxMonitor"], 2500);
    assert_eq!(data["updatedConfigs"]["MongoDB"], 1875);
    assert_eq!(data["updatedConfigs"]["LinuxMonitor"], 2500);
    assert_eq!(data["newTotalEps"], 10_000);
    assert!(data.get("confd").is_none());

    let mongo = h.fixture.source_conf("MongoDB").unwrap();
    assert!(mongo.contains("NumUniqKey: 1875 # cardinality"), "{mongo}");
    assert!(mongo.starts_with("# MongoDB generator, maintained by hand\n"));
    assert!(h.fixture.source_conf("LinuxMonitor").unwrap().contains("enabled: true"));
    assert!(h.fixture.source_conf("Redis").unwrap().contains("enabled: false"));

    let main = h.fixture.read("conf.d/conf.yml").unwrap();
    assert!(main.contains("output: kafka"));

    let resp = h.fleet.list_sources().await;
    let enabled = resp.data.unwrap()["enabledSources"].clone();
    assert_eq!(enabled, serde_json::json!(["LinuxMonitor", "MongoDB"]));
    assert_eq!(current_eps(&h).await, 10_000);
}

#[tokio::test]
async fn rounding_remainder_goes_to_last_selected_source() {
    let mut fixture = ConfdFixture::empty().unwrap();
    fixture.add_source(SourceSpec::new("A", 1).keys(1)).unwrap();
    fixture.add_source(SourceSpec::new("B", 1).keys(1)).unwrap();
    fixture.add_source(SourceSpec::new("C", 1).keys(1)).unwrap();
    let h = TestHarness::with_fixture(fixture).await.unwrap();

    let resp = h.fleet.distribute_eps(&names(&["A", "B", "C"]), 1000, false).await;
    let data = resp.data.unwrap();
    assert_eq!(data["allocation"]["A"], 333);
    assert_eq!(data["allocation"]["B"], 333);
    assert_eq!(data["allocation"]["C"], 334);
    assert_eq!(current_eps(&h).await, 1000);
}

#[tokio::test]
async fn current_eps_is_monotonic_and_order_insensitive() {
    let h = TestHarness::new().await.unwrap();

    h.fleet.distribute_eps(&names(&["MongoDB", "LinuxMonitor"]), 10_000, false).await;
    let first = current_eps(&h).await;
    h.fleet.distribute_eps(&names(&["LinuxMonitor", "MongoDB"]), 10_000, false).await;
    assert_eq!(current_eps(&h).await, first);

    h.fleet.distribute_eps(&names(&["MongoDB", "LinuxMonitor"]), 20_000, false).await;
    assert!(current_eps(&h).await > first);
}

#[tokio::test]
async fn small_totals_keep_at_least_one_key() {
    let h = TestHarness::new().await.unwrap();

    let resp = h.fleet.distribute_eps(&names(&["MongoDB"]), 2, false).await;
    assert!(resp.success);
    assert_eq!(resp.data.unwrap()["updatedConfigs"]["MongoDB"], 1);
    assert!(h.fixture.source_conf("MongoDB").unwrap().contains("NumUniqKey: 1 "));
}

#[tokio::test]
async fn invalid_requests_write_nothing() {
    let h = TestHarness::new().await.unwrap();
    let before = h.fixture.source_conf("MongoDB").unwrap();
    let main_before = h.fixture.read("conf.d/conf.yml").unwrap();

    let resp = h.fleet.distribute_eps(&names(&["MongoDB"]), 0, false).await;
    assert_eq!(resp.error_kind, Some(ErrorKind::InvalidRequest));
    let resp = h.fleet.distribute_eps(&[], 1000, false).await;
    assert_eq!(resp.error_kind, Some(ErrorKind::InvalidRequest));
    let resp = h.fleet.distribute_eps(&names(&["MongoDB", "Kafka"]), 1000, false).await;
    assert_eq!(resp.error_kind, Some(ErrorKind::UnknownSource));
    assert!(resp.message.contains("Kafka"));

    assert_eq!(h.fixture.source_conf("MongoDB").unwrap(), before);
    assert_eq!(h.fixture.read("conf.d/conf.yml").unwrap(), main_before);
}

#[tokio::test]
async fn enable_and_disable_single_source() {
    let h = TestHarness::new().await.unwrap();

    let resp = h.fleet.enable_source("LinuxMonitor").await;
    assert!(resp.success, "{}", resp.message);
    // 42 + 5
    assert_eq!(current_eps(&h).await, 47);
    assert!(h.fixture.source_conf("LinuxMonitor").unwrap().contains("enabled: true"));

    let resp = h.fleet.disable_source("MongoDB").await;
    assert!(resp.success);
    assert_eq!(current_eps(&h).await, 7);

    let resp = h.fleet.enable_source("Kafka").await;
    assert_eq!(resp.error_kind, Some(ErrorKind::UnknownSource));
}

#[tokio::test]
async fn distribute_with_propagation_and_no_nodes_succeeds() {
    let h = TestHarness::new().await.unwrap();

    let resp = h.fleet.distribute_eps(&names(&["Redis"]), 500, true).await;
    assert!(resp.success, "{}", resp.message);
    let data = resp.data.unwrap();
    assert_eq!(data["updatedConfigs"]["Redis"], 500);
    assert_eq!(data["confd"]["totalNodes"], 0);
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn source_without_key_field_fails_before_any_write() {
    let h = TestHarness::new().await.unwrap();
    h.fixture
        .write(
            "conf.d/LinuxMonitor/conf.yml",
            "enabled: false\nuniquekey:\n  name: host\nInclude_sub_modules: []\n",
        )
        .unwrap();
    let files = [
        "conf.d/conf.yml",
        "conf.d/MongoDB/conf.yml",
        "conf.d/LinuxMonitor/conf.yml",
        "conf.d/Redis/conf.yml",
    ];
    let before: Vec<String> = files.iter().map(|f| h.fixture.read(f).unwrap()).collect();

    let resp = h
        .fleet
        .distribute_eps(&names(&["MongoDB", "LinuxMonitor"]), 10_000, false)
        .await;
    assert!(!resp.success);
    assert_eq!(resp.error_kind, Some(ErrorKind::Config));
    assert!(resp.message.contains("NumUniqKey"), "{}", resp.message);

    let after: Vec<String> = files.iter().map(|f| h.fixture.read(f).unwrap()).collect();
    assert_eq!(before, after);
    let enabled = h.fleet.list_sources().await.data.unwrap()["enabledSources"].clone();
    assert_eq!(enabled, serde_json::json!(["MongoDB", "Redis"]));
    assert_eq!(current_eps(&h).await, 42);
}

#[tokio::test]
async fn keyless_or_zero_sub_modules_weigh_one() {
    let mut fixture = ConfdFixture::empty().unwrap();
    fixture
        .add_source(
            SourceSpec::new("Nginx", 100)
                .keys(7)
                .sub("nokey", None)
                .sub("zero", Some(0))
                .sub("bare", None),
        )
        .unwrap();
    fixture.write("conf.d/Nginx/nokey.yml", "uniquekey:\n  name: x\n").unwrap();
    fixture.write("conf.d/Nginx/bare.yml", "generator: burst\n").unwrap();
    let h = TestHarness::with_fixture(fixture).await.unwrap();

    let resp = h.fleet.distribute_eps(&names(&["Nginx"]), 300, false).await;
    assert!(resp.success, "{}", resp.message);
    assert_eq!(resp.data.unwrap()["updatedConfigs"]["Nginx"], 100);

    let info = h.fleet.source_details("Nginx").await.data.unwrap();
    assert_eq!(info["totalSubKeys"], 3);
    assert_eq!(info["subModuleKeys"]["nokey"], 100);
    assert_eq!(info["subModuleKeys"]["zero"], 100);
    assert_eq!(current_eps(&h).await, 300);
}
