/*!
# Fleet DevKit - Stubs et fixtures pour tester le kernel sans nœuds réels

- `MockExecutor` : RemoteExecutor scripté, enregistre chaque appel
- `StubAgent`    : agent de métriques HTTP factice
- `ConfdFixture` : arbre conf.d, table max-EPS et artefacts dans un répertoire temporaire
- `TestHarness`  : `Fleet` complète assemblée sur les éléments ci-dessus
*/

pub mod agent_stub;
pub mod fixtures;
pub mod remote_stub;
pub mod test_utils;

pub use agent_stub::StubAgent;
pub use fixtures::{ConfdFixture, SourceSpec};
pub use remote_stub::{MockCall, MockExecutor};
pub use test_utils::TestHarness;
