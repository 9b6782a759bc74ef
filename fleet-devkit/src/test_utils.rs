/*!
Test Harness pour le kernel fleet

Assemble une `Fleet` complète sur :
- une fixture disque (conf.d, max-EPS, artefacts)
- un `MockExecutor` scripté à la place de ssh/scp
- optionnellement un `StubAgent` HTTP pour les vérifications health
*/

use crate::agent_stub::StubAgent;
use crate::fixtures::ConfdFixture;
use crate::remote_stub::MockExecutor;
use anyhow::Result;
use fleet_kernel::broadcast::spawn_broadcaster;
use fleet_kernel::registry::NodeRecord;
use fleet_kernel::sources::MaxEpsTable;
use fleet_kernel::state::FleetStateHandle;
use fleet_kernel::Fleet;
use std::sync::Arc;

// port sans agent : connexion refusée immédiatement
const DEAD_PORT: u16 = 1;

pub struct TestHarness {
    pub fixture: ConfdFixture,
    pub executor: MockExecutor,
    pub fleet: Arc<Fleet>,
    pub agent: Option<StubAgent>,
}

impl TestHarness {
    /// Harness sur la fixture standard (MongoDB, LinuxMonitor, Redis)
    pub async fn new() -> Result<Self> {
        Self::with_fixture(ConfdFixture::standard()?).await
    }

    pub async fn with_fixture(fixture: ConfdFixture) -> Result<Self> {
        let cfg = fixture.config();
        let executor = MockExecutor::new();
        let table = MaxEpsTable::load(&cfg.max_eps_file).await?;
        let state = FleetStateHandle::new(spawn_broadcaster());
        let fleet = Arc::new(Fleet::with_executor(&cfg, Arc::new(executor.clone()), table, state));
        Ok(Self {
            fixture,
            executor,
            fleet,
            agent: None,
        })
    }

    /// Démarre un agent stub ; les nœuds créés ensuite pointent dessus
    pub async fn with_agent(mut self, node_id: &str) -> Result<Self> {
        self.agent = Some(StubAgent::start(node_id).await?);
        Ok(self)
    }

    pub fn node(&self, name: &str, enabled: bool) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            host: "127.0.0.1".into(),
            user: "sim".into(),
            key_path: String::new(),
            conf_dir: format!("/srv/{name}"),
            binary_dir: format!("/srv/{name}/bin"),
            metrics_port: self.agent.as_ref().map_or(DEAD_PORT, StubAgent::port),
            description: String::new(),
            enabled,
        }
    }

    /// Enregistre directement dans le registre, sans déploiement
    pub async fn register(&self, name: &str, enabled: bool) -> Result<NodeRecord> {
        let record = self.node(name, enabled);
        self.fleet.registry().insert(record.clone()).await?;
        self.fleet.state().track_node(name);
        Ok(record)
    }

    pub async fn registered_names(&self) -> Result<Vec<String>> {
        Ok(self.fleet.registry().list().await?.into_iter().map(|n| n.name).collect())
    }
}
